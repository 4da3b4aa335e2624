//! Anti-automation challenge detection and solving
//!
//! Detection is pure: [`detect_challenge`] inspects a page body for the
//! markers of known challenge widgets and extracts the site key when one is
//! present. Solving goes through a paid provider behind the
//! [`providers::SolverApi`] trait (2Captcha first, Anti-Captcha as the
//! fallback), polled until a token arrives or the deadline passes.
//!
//! Challenges with no automated solver are reported as unsolvable so the
//! registry can park the target for manual intervention instead of burning
//! the error budget.

pub mod providers;

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CaptchaConfig;
use crate::error::{CreneauErrorTrait, ErrorCategory};
use providers::{AntiCaptchaApi, SolverApi, TwoCaptchaApi};

/// Known challenge widget families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Turnstile,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecaptchaV2 => "recaptcha_v2",
            Self::RecaptchaV3 => "recaptcha_v3",
            Self::HCaptcha => "hcaptcha",
            Self::Turnstile => "turnstile",
        }
    }

    /// Whether any configured provider can solve this kind
    pub fn is_solvable(&self) -> bool {
        matches!(self, Self::RecaptchaV2 | Self::RecaptchaV3 | Self::HCaptcha)
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A detected challenge on a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    /// Site key extracted from the widget markup, when present
    pub site_key: Option<String>,
}

fn site_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"data-sitekey\s*=\s*["']([\w-]+)["']"#).unwrap())
}

fn render_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"recaptcha/api\.js\?render=([\w-]+)"#).unwrap())
}

/// Inspect a page body for challenge widget markers
///
/// Checks in fixed order so a page carrying several markers reports the
/// most specific one.
pub fn detect_challenge(html: &str) -> Option<Challenge> {
    let lower = html.to_lowercase();

    let kind = if lower.contains("challenges.cloudflare.com/turnstile")
        || lower.contains("cf-turnstile")
    {
        ChallengeKind::Turnstile
    } else if lower.contains("hcaptcha.com/1/api.js") || lower.contains("h-captcha") {
        ChallengeKind::HCaptcha
    } else if lower.contains("recaptcha/api.js?render=") || lower.contains("grecaptcha.execute") {
        ChallengeKind::RecaptchaV3
    } else if lower.contains("google.com/recaptcha") || lower.contains("g-recaptcha") {
        ChallengeKind::RecaptchaV2
    } else {
        return None;
    };

    let site_key = match kind {
        ChallengeKind::RecaptchaV3 => render_key_regex()
            .captures(html)
            .or_else(|| site_key_regex().captures(html))
            .map(|c| c[1].to_string()),
        _ => site_key_regex().captures(html).map(|c| c[1].to_string()),
    };

    Some(Challenge { kind, site_key })
}

// ============================================================================
// Errors
// ============================================================================

/// Challenge solving errors
#[derive(Error, Debug)]
pub enum CaptchaError {
    /// No solver provider key is configured
    #[error("no captcha solver configured")]
    NotConfigured,

    /// Challenge kind has no automated solver; manual intervention needed
    #[error("challenge kind {0} has no automated solver")]
    Unsolvable(ChallengeKind),

    /// Widget found but no site key could be extracted
    #[error("challenge detected without a site key")]
    MissingSiteKey,

    /// Provider rejected the submission
    #[error("solver rejected submission: {0}")]
    Rejected(String),

    /// No token arrived before the deadline
    #[error("solve timed out after {0}s")]
    Timeout(u64),

    /// Transport failure talking to the provider
    #[error("solver request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl CreneauErrorTrait for CaptchaError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::NotConfigured | Self::Unsolvable(_) | Self::MissingSiteKey => false,
            Self::Rejected(_) | Self::Timeout(_) | Self::Http(_) => true,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Challenge
    }
}

// ============================================================================
// Solver
// ============================================================================

/// Provider-backed challenge solver with polling
pub struct CaptchaSolver {
    api: Box<dyn SolverApi>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl CaptchaSolver {
    pub fn new(api: Box<dyn SolverApi>, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            api,
            poll_interval,
            max_wait,
        }
    }

    /// Build a solver from configuration, 2Captcha preferred
    ///
    /// Returns `None` when no provider key is set; the worker then treats
    /// every challenge as unsolvable.
    pub fn from_config(config: &CaptchaConfig) -> Option<Self> {
        let api: Box<dyn SolverApi> = if let Some(key) = &config.two_captcha_key {
            Box::new(TwoCaptchaApi::new(key))
        } else if let Some(key) = &config.anti_captcha_key {
            Box::new(AntiCaptchaApi::new(key))
        } else {
            return None;
        };

        Some(Self::new(
            api,
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_secs(config.max_wait_secs),
        ))
    }

    /// Solve a challenge, returning the response token
    pub async fn solve(&self, challenge: &Challenge, page_url: &str) -> Result<String, CaptchaError> {
        if !challenge.kind.is_solvable() {
            return Err(CaptchaError::Unsolvable(challenge.kind));
        }
        let site_key = challenge
            .site_key
            .as_deref()
            .ok_or(CaptchaError::MissingSiteKey)?;

        let task_id = self.api.submit(challenge.kind, site_key, page_url).await?;
        tracing::debug!(
            provider = self.api.name(),
            task = %task_id,
            kind = %challenge.kind,
            "Challenge submitted to solver"
        );

        let deadline = tokio::time::Instant::now() + self.max_wait;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(token) = self.api.fetch_result(&task_id).await? {
                tracing::info!(provider = self.api.name(), task = %task_id, "Challenge solved");
                return Ok(token);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CaptchaError::Timeout(self.max_wait.as_secs()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_recaptcha_with_site_key() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LeIxAcTAAAAAJcZVRqyHh71UMIEGNQ_MXjiZKhI"></div>
            <script src="https://www.google.com/recaptcha/api.js"></script>"#;
        let challenge = detect_challenge(html).unwrap();
        assert_eq!(challenge.kind, ChallengeKind::RecaptchaV2);
        assert_eq!(
            challenge.site_key.as_deref(),
            Some("6LeIxAcTAAAAAJcZVRqyHh71UMIEGNQ_MXjiZKhI")
        );
    }

    #[test]
    fn test_detect_hcaptcha() {
        let html = r#"<div class="h-captcha" data-sitekey="10000000-ffff-ffff-ffff-000000000001"></div>"#;
        let challenge = detect_challenge(html).unwrap();
        assert_eq!(challenge.kind, ChallengeKind::HCaptcha);
    }

    #[test]
    fn test_detect_turnstile_wins_over_generic_markers() {
        let html = r#"<script src="https://challenges.cloudflare.com/turnstile/v0/api.js"></script>
            <div class="cf-turnstile" data-sitekey="0x4AAA"></div>"#;
        let challenge = detect_challenge(html).unwrap();
        assert_eq!(challenge.kind, ChallengeKind::Turnstile);
        assert!(!challenge.kind.is_solvable());
    }

    #[test]
    fn test_detect_recaptcha_v3_render_key() {
        let html = r#"<script src="https://www.google.com/recaptcha/api.js?render=6LcKeyV3"></script>
            <script>grecaptcha.execute('6LcKeyV3', {action: 'verify'});</script>"#;
        let challenge = detect_challenge(html).unwrap();
        assert_eq!(challenge.kind, ChallengeKind::RecaptchaV3);
        assert_eq!(challenge.site_key.as_deref(), Some("6LcKeyV3"));
        assert!(challenge.kind.is_solvable());
    }

    #[test]
    fn test_plain_page_has_no_challenge() {
        assert!(detect_challenge("<html><body>Prendre rendez-vous</body></html>").is_none());
    }

    #[test]
    fn test_solver_unconfigured() {
        assert!(CaptchaSolver::from_config(&CaptchaConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_solve_refuses_unsolvable_kind() {
        struct NeverApi;
        #[async_trait::async_trait]
        impl SolverApi for NeverApi {
            fn name(&self) -> &'static str {
                "never"
            }
            async fn submit(
                &self,
                _kind: ChallengeKind,
                _site_key: &str,
                _page_url: &str,
            ) -> Result<String, CaptchaError> {
                unreachable!()
            }
            async fn fetch_result(&self, _task_id: &str) -> Result<Option<String>, CaptchaError> {
                unreachable!()
            }
        }

        let solver = CaptchaSolver::new(
            Box::new(NeverApi),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        let challenge = Challenge {
            kind: ChallengeKind::Turnstile,
            site_key: Some("k".to_string()),
        };
        let err = solver.solve(&challenge, "https://x.example").await.unwrap_err();
        assert!(matches!(err, CaptchaError::Unsolvable(ChallengeKind::Turnstile)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_solve_times_out() {
        struct StuckApi;
        #[async_trait::async_trait]
        impl SolverApi for StuckApi {
            fn name(&self) -> &'static str {
                "stuck"
            }
            async fn submit(
                &self,
                _kind: ChallengeKind,
                _site_key: &str,
                _page_url: &str,
            ) -> Result<String, CaptchaError> {
                Ok("task-1".to_string())
            }
            async fn fetch_result(&self, _task_id: &str) -> Result<Option<String>, CaptchaError> {
                Ok(None)
            }
        }

        let solver = CaptchaSolver::new(
            Box::new(StuckApi),
            Duration::from_secs(5),
            Duration::from_secs(120),
        );
        let challenge = Challenge {
            kind: ChallengeKind::RecaptchaV2,
            site_key: Some("k".to_string()),
        };
        let err = solver.solve(&challenge, "https://x.example").await.unwrap_err();
        assert!(matches!(err, CaptchaError::Timeout(120)));
    }

    #[tokio::test]
    async fn test_solve_polls_until_ready() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct SlowApi {
            polls: AtomicU32,
        }
        #[async_trait::async_trait]
        impl SolverApi for SlowApi {
            fn name(&self) -> &'static str {
                "slow"
            }
            async fn submit(
                &self,
                _kind: ChallengeKind,
                _site_key: &str,
                _page_url: &str,
            ) -> Result<String, CaptchaError> {
                Ok("task-1".to_string())
            }
            async fn fetch_result(&self, _task_id: &str) -> Result<Option<String>, CaptchaError> {
                if self.polls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(None)
                } else {
                    Ok(Some("token-xyz".to_string()))
                }
            }
        }

        let solver = CaptchaSolver::new(
            Box::new(SlowApi {
                polls: AtomicU32::new(0),
            }),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        let challenge = Challenge {
            kind: ChallengeKind::RecaptchaV2,
            site_key: Some("k".to_string()),
        };
        let token = solver.solve(&challenge, "https://x.example").await.unwrap();
        assert_eq!(token, "token-xyz");
    }
}
