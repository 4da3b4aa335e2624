//! Configuration management for the creneau monitor
//!
//! All configuration is loaded from environment variables with sensible
//! defaults, so the binary runs out of the box against an in-memory stack
//! and picks up Redis, solver, and proxy credentials when they are set.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::TargetClass;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// Core pipeline tuning
    pub monitor: MonitorConfig,

    /// Bootstrap-mode overrides
    pub bootstrap: BootstrapConfig,

    /// CAPTCHA solver credentials and polling
    pub captcha: CaptchaConfig,

    /// Proxy pool credentials and cooldowns
    pub proxy: ProxySettings,

    /// Redis connection for shared stores
    pub redis: RedisConfig,

    /// Deduplication gate tuning
    pub dedup: DedupConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            monitor: MonitorConfig::from_env(),
            bootstrap: BootstrapConfig::from_env(),
            captcha: CaptchaConfig::from_env(),
            proxy: ProxySettings::from_env(),
            redis: RedisConfig::from_env(),
            dedup: DedupConfig::from_env(),
            logging: LoggingConfig::from_env(),
        })
    }
}

/// Core pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Consecutive error/timeout results before a target parks in ERROR
    pub max_consecutive_errors: u32,

    /// Hard wall-clock timeout for one check, in seconds
    pub check_timeout_secs: u64,

    /// Session TTL in seconds (default 10 minutes)
    pub session_ttl_secs: u64,

    /// Cadence of the reconciliation loop, in seconds
    pub reconcile_interval_secs: u64,

    /// Worker concurrency per prefecture pool (browser-heavy, keep small)
    pub prefecture_concurrency: usize,

    /// Worker concurrency per consulate pool (plain HTTP)
    pub consulate_concurrency: usize,

    /// Worker concurrency per visa-center pool
    pub visa_center_concurrency: usize,

    /// Size of the in-memory check log ring
    pub check_log_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            check_timeout_secs: 60,
            session_ttl_secs: 600,
            reconcile_interval_secs: 180,
            prefecture_concurrency: 3,
            consulate_concurrency: 2,
            visa_center_concurrency: 1,
            check_log_size: 500,
        }
    }
}

impl MonitorConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_consecutive_errors: env_parse("MAX_CONSECUTIVE_ERRORS", d.max_consecutive_errors),
            check_timeout_secs: env_parse("CHECK_TIMEOUT_SECS", d.check_timeout_secs),
            session_ttl_secs: env_parse("SESSION_TTL_SECS", d.session_ttl_secs),
            reconcile_interval_secs: env_parse("RECONCILE_INTERVAL_SECS", d.reconcile_interval_secs),
            prefecture_concurrency: env_parse("PREFECTURE_CONCURRENCY", d.prefecture_concurrency),
            consulate_concurrency: env_parse("CONSULATE_CONCURRENCY", d.consulate_concurrency),
            visa_center_concurrency: env_parse("VISA_CENTER_CONCURRENCY", d.visa_center_concurrency),
            check_log_size: d.check_log_size,
        }
    }

    /// Concurrency bound for a worker pool class
    pub fn concurrency_for(&self, class: TargetClass) -> usize {
        match class {
            TargetClass::Prefecture => self.prefecture_concurrency,
            TargetClass::Consulate => self.consulate_concurrency,
            TargetClass::VisaCenter => self.visa_center_concurrency,
        }
    }

    /// Check timeout as a `Duration`
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

/// Bootstrap-mode configuration
///
/// When enabled, monitoring is restricted to a priority allowlist of
/// targets, pool concurrency is clamped, and the interval floor keeps the
/// compressed schedule from hammering any one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub enabled: bool,

    /// Multiplier applied to every base interval (1.0 = unchanged)
    pub interval_multiplier: f64,

    /// Floor below which no effective interval may drop, in seconds
    pub min_interval_secs: u64,

    /// Concurrency clamp applied to every pool while bootstrapping
    pub max_workers: usize,

    /// Targets allowed to run while bootstrapping; empty means all
    pub priority_targets: Vec<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_multiplier: 1.0,
            min_interval_secs: 30,
            max_workers: 2,
            priority_targets: Vec::new(),
        }
    }
}

impl BootstrapConfig {
    /// Create config from environment variables
    ///
    /// `BOOTSTRAP_PRIORITY_TARGETS` is a comma-separated id list.
    pub fn from_env() -> Self {
        let d = Self::default();
        let priority_targets = std::env::var("BOOTSTRAP_PRIORITY_TARGETS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            enabled: std::env::var("BOOTSTRAP_MODE").as_deref() == Ok("true"),
            interval_multiplier: env_parse("BOOTSTRAP_INTERVAL_MULTIPLIER", d.interval_multiplier),
            min_interval_secs: env_parse("BOOTSTRAP_MIN_INTERVAL_SECS", d.min_interval_secs),
            max_workers: env_parse("BOOTSTRAP_MAX_WORKERS", d.max_workers),
            priority_targets,
        }
    }

    /// Effective check interval after multiplier and floor
    pub fn effective_interval_secs(&self, base_secs: u64) -> u64 {
        let scaled = if self.enabled {
            (base_secs as f64 * self.interval_multiplier).round() as u64
        } else {
            base_secs
        };
        scaled.max(self.min_interval_secs)
    }

    /// Whether this target may be scheduled at all
    pub fn allows(&self, target_id: &str) -> bool {
        if !self.enabled || self.priority_targets.is_empty() {
            return true;
        }
        self.priority_targets.iter().any(|id| id == target_id)
    }
}

/// CAPTCHA solver configuration
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    /// 2Captcha API key (`TWOCAPTCHA_API_KEY`)
    pub two_captcha_key: Option<String>,

    /// Anti-Captcha API key (`ANTICAPTCHA_API_KEY`), used when no
    /// 2Captcha key is present
    pub anti_captcha_key: Option<String>,

    /// Interval between result polls, in seconds
    pub poll_interval_secs: u64,

    /// Hard ceiling on one solve attempt, in seconds
    pub max_wait_secs: u64,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            two_captcha_key: None,
            anti_captcha_key: None,
            poll_interval_secs: 5,
            max_wait_secs: 120,
        }
    }
}

impl CaptchaConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            two_captcha_key: std::env::var("TWOCAPTCHA_API_KEY").ok(),
            anti_captcha_key: std::env::var("ANTICAPTCHA_API_KEY").ok(),
            poll_interval_secs: env_parse("CAPTCHA_POLL_INTERVAL_SECS", d.poll_interval_secs),
            max_wait_secs: env_parse("CAPTCHA_MAX_WAIT_SECS", d.max_wait_secs),
        }
    }

    /// Whether any solver provider is configured
    pub fn solver_configured(&self) -> bool {
        self.two_captcha_key.is_some() || self.anti_captcha_key.is_some()
    }
}

/// Proxy pool configuration
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Static list: `host:port[:user[:pass]]`, comma-separated (`PROXY_LIST`)
    pub static_list: Option<String>,

    /// ScraperAPI key (`SCRAPERAPI_KEY`)
    pub scraperapi_key: Option<String>,

    /// Bright Data credentials
    pub brightdata_username: Option<String>,
    pub brightdata_password: Option<String>,
    pub brightdata_host: String,
    pub brightdata_port: u16,

    /// Failures on one domain before a proxy cools down there
    pub max_failures: u32,

    /// Cooldown window per (proxy, domain), in seconds (default 6h)
    pub cooldown_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            static_list: None,
            scraperapi_key: None,
            brightdata_username: None,
            brightdata_password: None,
            brightdata_host: "brd.superproxy.io".to_string(),
            brightdata_port: 22225,
            max_failures: 3,
            cooldown_secs: 6 * 60 * 60,
        }
    }
}

impl ProxySettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            static_list: std::env::var("PROXY_LIST").ok(),
            scraperapi_key: std::env::var("SCRAPERAPI_KEY").ok(),
            brightdata_username: std::env::var("BRIGHTDATA_USERNAME").ok(),
            brightdata_password: std::env::var("BRIGHTDATA_PASSWORD").ok(),
            brightdata_host: std::env::var("BRIGHTDATA_HOST")
                .unwrap_or_else(|_| d.brightdata_host),
            brightdata_port: env_parse("BRIGHTDATA_PORT", d.brightdata_port),
            max_failures: env_parse("PROXY_MAX_FAILURES", d.max_failures),
            cooldown_secs: env_parse("PROXY_COOLDOWN_SECS", d.cooldown_secs),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

impl RedisConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            url: std::env::var("REDIS_URL").unwrap_or(d.url),
            pool_size: env_parse("REDIS_POOL_SIZE", d.pool_size),
        }
    }
}

/// Deduplication gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Marker TTL in seconds (default 1 hour)
    pub ttl_secs: u64,

    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            key_prefix: "dedup".to_string(),
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ttl_secs: env_parse("DEDUP_TTL_SECONDS", d.ttl_secs),
            key_prefix: std::env::var("DEDUP_KEY_PREFIX").unwrap_or(d.key_prefix),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or(d.level),
            format: std::env::var("LOG_FORMAT").unwrap_or(d.format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.max_consecutive_errors, 5);
        assert_eq!(config.check_timeout_secs, 60);
        assert_eq!(config.concurrency_for(TargetClass::Prefecture), 3);
        assert_eq!(config.concurrency_for(TargetClass::VisaCenter), 1);
    }

    #[test]
    fn test_bootstrap_interval_floor() {
        let config = BootstrapConfig {
            enabled: true,
            interval_multiplier: 0.5,
            min_interval_secs: 30,
            ..Default::default()
        };
        // 60 * 0.5 = 30, at the floor
        assert_eq!(config.effective_interval_secs(60), 30);
        // 30 * 0.5 = 15, clamped up
        assert_eq!(config.effective_interval_secs(30), 30);
        // Large intervals pass through the multiplier
        assert_eq!(config.effective_interval_secs(240), 120);
    }

    #[test]
    fn test_bootstrap_disabled_keeps_floor() {
        let config = BootstrapConfig::default();
        assert!(!config.enabled);
        // Floor still applies: never hammer a site below 30s
        assert_eq!(config.effective_interval_secs(10), 30);
        assert_eq!(config.effective_interval_secs(120), 120);
    }

    #[test]
    fn test_bootstrap_allowlist() {
        let config = BootstrapConfig {
            enabled: true,
            priority_targets: vec!["paris_75".to_string(), "lyon_69".to_string()],
            ..Default::default()
        };
        assert!(config.allows("paris_75"));
        assert!(!config.allows("melun_77"));

        let open = BootstrapConfig::default();
        assert!(open.allows("melun_77"));
    }

    #[test]
    fn test_dedup_defaults() {
        let config = DedupConfig::default();
        assert_eq!(config.ttl_secs, 3600);
        assert_eq!(config.key_prefix, "dedup");
    }

    #[test]
    fn test_proxy_defaults() {
        let config = ProxySettings::default();
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.cooldown_secs, 6 * 60 * 60);
    }
}
