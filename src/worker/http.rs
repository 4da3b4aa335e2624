//! HTTP availability probe
//!
//! Default [`ScrapeExecutor`] for targets exposing a JSON availability
//! endpoint. Requests carry the session token and cookies, go out through
//! the assigned proxy, and are throttled per domain so several targets on
//! one site never exceed the polite request rate.
//!
//! Two payload shapes are understood: per-date (`{"dates": [{"date": ...,
//! "times": [...]}]}`) and count-only (`{"available": n}`). A challenge
//! page in the response is solved inline when a solver is configured and
//! the request retried once with the token; otherwise the check reports a
//! challenge outcome and the target parks.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::Value;

use super::{ExecutionError, ScrapeExecutor};
use crate::captcha::{detect_challenge, CaptchaSolver};
use crate::models::{ScrapeResult, Session, SlotDay, Target};
use crate::proxy::ProxyEndpoint;

pub struct HttpProbeExecutor {
    timeout: Duration,
    limiter: DefaultKeyedRateLimiter<String>,
    solver: Option<Arc<CaptchaSolver>>,
}

impl HttpProbeExecutor {
    /// `requests_per_second` bounds each domain independently
    pub fn new(timeout: Duration, requests_per_second: u32, solver: Option<Arc<CaptchaSolver>>) -> Self {
        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            timeout,
            limiter: RateLimiter::keyed(Quota::per_second(rps)),
            solver,
        }
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client, ExecutionError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout).gzip(true);
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(&endpoint.url)
                .map_err(|e| ExecutionError::Failed(format!("bad proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| ExecutionError::Failed(format!("client build: {e}")))
    }

    async fn probe(
        &self,
        client: &reqwest::Client,
        target: &Target,
        session: &Session,
        challenge_token: Option<&str>,
    ) -> Result<reqwest::Response, ExecutionError> {
        let mut request = client
            .get(&target.booking_url)
            .header("Accept", "application/json, text/html")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-CSRF-Token", &session.token);
        if !session.cookies.is_empty() {
            request = request.header(reqwest::header::COOKIE, &session.cookies);
        }
        if let Some(token) = challenge_token {
            request = request.header("X-Captcha-Token", token);
        }
        request
            .send()
            .await
            .map_err(|e| ExecutionError::Failed(format!("request: {e}")))
    }

    /// Map a response body to a result, handling challenge pages
    async fn interpret(
        &self,
        client: &reqwest::Client,
        target: &Target,
        session: &Session,
        response: reqwest::Response,
        already_retried: bool,
    ) -> Result<ScrapeResult, ExecutionError> {
        let status = response.status().as_u16();
        match status {
            419 | 422 => return Err(ExecutionError::AuthExpired),
            429 => return Ok(ScrapeResult::blocked()),
            s if s >= 500 => return Err(ExecutionError::Failed(format!("HTTP {s}"))),
            _ => {}
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutionError::Failed(format!("body: {e}")))?;

        if let Some(challenge) = detect_challenge(&body) {
            crate::metrics::record_captcha_detected(challenge.kind.as_str());
            if !already_retried {
                if let Some(solver) = &self.solver {
                    if challenge.kind.is_solvable() {
                        match solver.solve(&challenge, &target.booking_url).await {
                            Ok(token) => {
                                crate::metrics::record_captcha_solve("solved");
                                let retry =
                                    self.probe(client, target, session, Some(&token)).await?;
                                return Box::pin(self.interpret(
                                    client, target, session, retry, true,
                                ))
                                .await;
                            }
                            Err(e) => {
                                crate::metrics::record_captcha_solve("failed");
                                tracing::warn!(
                                    target = %target.id,
                                    error = %e,
                                    "Challenge solve failed"
                                );
                            }
                        }
                    }
                }
            }
            return Ok(ScrapeResult::captcha(Some(challenge.kind)));
        }

        if status == 403 {
            return Ok(ScrapeResult::blocked());
        }

        let payload: Value = serde_json::from_str(&body)
            .map_err(|_| ExecutionError::Failed("unrecognized response body".to_string()))?;
        Ok(parse_availability(&payload).with_booking_url(&final_url))
    }
}

/// Parse an availability payload into a result
pub fn parse_availability(payload: &Value) -> ScrapeResult {
    if let Some(dates) = payload["dates"].as_array() {
        let mut days: Vec<SlotDay> = dates
            .iter()
            .filter_map(|entry| {
                let date = entry["date"]
                    .as_str()
                    .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())?;
                let mut times: Vec<String> = entry["times"]
                    .as_array()
                    .map(|ts| {
                        ts.iter()
                            .filter_map(|t| t.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                times.sort();
                Some(SlotDay { date, times })
            })
            .collect();
        days.sort_by_key(|d| d.date);

        return if days.is_empty() {
            ScrapeResult::no_slots()
        } else {
            ScrapeResult::slots_found(days)
        };
    }

    if let Some(count) = payload["available"].as_u64() {
        return if count > 0 {
            let mut result = ScrapeResult::slots_found(vec![]);
            result.slots_available = count as u32;
            result
        } else {
            ScrapeResult::no_slots()
        };
    }

    ScrapeResult::error("availability payload in unknown shape")
}

#[async_trait]
impl ScrapeExecutor for HttpProbeExecutor {
    async fn execute(
        &self,
        target: &Target,
        session: &Session,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<ScrapeResult, ExecutionError> {
        self.limiter.until_key_ready(&target.domain).await;
        let client = self.client_for(proxy)?;
        let response = self.probe(&client, target, session, None).await?;
        self.interpret(&client, target, session, response, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScrapeStatus, TargetClass, TargetTier};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn executor() -> HttpProbeExecutor {
        HttpProbeExecutor::new(Duration::from_secs(5), 100, None)
    }

    fn target_at(uri: &str) -> Target {
        Target::new("t1", "T1", TargetClass::Consulate, TargetTier::High)
            .with_domain("test.local")
            .with_booking_url(&format!("{uri}/slots"))
    }

    #[tokio::test]
    async fn test_per_date_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slots"))
            .and(header("X-CSRF-Token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dates": [
                    {"date": "2024-03-10", "times": ["11:00"]},
                    {"date": "2024-03-05", "times": ["14:00", "09:00"]}
                ]
            })))
            .mount(&server)
            .await;

        let result = executor()
            .execute(&target_at(&server.uri()), &Session::new("tok", "s=1"), None)
            .await
            .unwrap();
        assert_eq!(result.status, ScrapeStatus::SlotsFound);
        assert_eq!(result.slots_available, 3);
        // Dates and times come back sorted
        assert_eq!(result.slot_signature(), "2024-03-05|09:00");
    }

    #[tokio::test]
    async fn test_count_only_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"available": 4})))
            .mount(&server)
            .await;

        let result = executor()
            .execute(&target_at(&server.uri()), &Session::new("tok", ""), None)
            .await
            .unwrap();
        assert_eq!(result.status, ScrapeStatus::SlotsFound);
        assert_eq!(result.slots_available, 4);
        assert!(result.available_dates.is_empty());
    }

    #[tokio::test]
    async fn test_empty_dates_is_no_slots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"dates": []})))
            .mount(&server)
            .await;

        let result = executor()
            .execute(&target_at(&server.uri()), &Session::new("tok", ""), None)
            .await
            .unwrap();
        assert_eq!(result.status, ScrapeStatus::NoSlots);
    }

    #[tokio::test]
    async fn test_auth_expiry_statuses() {
        for status in [419u16, 422] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let err = executor()
                .execute(&target_at(&server.uri()), &Session::new("tok", ""), None)
                .await
                .unwrap_err();
            assert!(matches!(err, ExecutionError::AuthExpired));
        }
    }

    #[tokio::test]
    async fn test_challenge_page_reports_captcha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"<div class="g-recaptcha" data-sitekey="6LeKey"></div>"#,
            ))
            .mount(&server)
            .await;

        let result = executor()
            .execute(&target_at(&server.uri()), &Session::new("tok", ""), None)
            .await
            .unwrap();
        assert_eq!(result.status, ScrapeStatus::Captcha);
        assert_eq!(
            result.challenge_kind,
            Some(crate::captcha::ChallengeKind::RecaptchaV2)
        );
    }

    #[tokio::test]
    async fn test_plain_403_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
            .mount(&server)
            .await;

        let result = executor()
            .execute(&target_at(&server.uri()), &Session::new("tok", ""), None)
            .await
            .unwrap();
        assert_eq!(result.status, ScrapeStatus::Blocked);
    }

    #[tokio::test]
    async fn test_rate_limited_status_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let result = executor()
            .execute(&target_at(&server.uri()), &Session::new("tok", ""), None)
            .await
            .unwrap();
        assert_eq!(result.status, ScrapeStatus::Blocked);
    }

    #[tokio::test]
    async fn test_server_error_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = executor()
            .execute(&target_at(&server.uri()), &Session::new("tok", ""), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Failed(msg) if msg.contains("503")));
    }

    #[test]
    fn test_unknown_payload_shape() {
        let result = parse_availability(&json!({"unexpected": true}));
        assert_eq!(result.status, ScrapeStatus::Error);
    }
}
