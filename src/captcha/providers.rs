//! Solver provider backends
//!
//! Both providers follow the same submit-then-poll shape behind
//! [`SolverApi`]: submit a task, receive an id, poll for the token. Base
//! URLs are overridable for tests.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{CaptchaError, ChallengeKind};

/// Provider backend: submit a task, poll for the token
#[async_trait]
pub trait SolverApi: Send + Sync {
    /// Provider name, for logs
    fn name(&self) -> &'static str;

    /// Submit a challenge, returning a provider task id
    async fn submit(
        &self,
        kind: ChallengeKind,
        site_key: &str,
        page_url: &str,
    ) -> Result<String, CaptchaError>;

    /// Poll for the token; `None` while still processing
    async fn fetch_result(&self, task_id: &str) -> Result<Option<String>, CaptchaError>;
}

// ============================================================================
// 2Captcha
// ============================================================================

/// 2Captcha legacy HTTP API (`in.php` / `res.php`)
pub struct TwoCaptchaApi {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl TwoCaptchaApi {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, "https://2captcha.com")
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn method_for(kind: ChallengeKind) -> &'static str {
        match kind {
            ChallengeKind::HCaptcha => "hcaptcha",
            _ => "userrecaptcha",
        }
    }
}

/// Score floor and page action sent for v3 solves
const V3_MIN_SCORE: &str = "0.3";
const V3_ACTION: &str = "verify";

#[async_trait]
impl SolverApi for TwoCaptchaApi {
    fn name(&self) -> &'static str {
        "2captcha"
    }

    async fn submit(
        &self,
        kind: ChallengeKind,
        site_key: &str,
        page_url: &str,
    ) -> Result<String, CaptchaError> {
        let mut params = vec![
            ("key", self.api_key.as_str()),
            ("method", Self::method_for(kind)),
            ("googlekey", site_key),
            ("sitekey", site_key),
            ("pageurl", page_url),
            ("json", "1"),
        ];
        if kind == ChallengeKind::RecaptchaV3 {
            params.extend([
                ("version", "v3"),
                ("min_score", V3_MIN_SCORE),
                ("action", V3_ACTION),
            ]);
        }

        let body: Value = self
            .client
            .get(format!("{}/in.php", self.base_url))
            .query(&params)
            .send()
            .await?
            .json()
            .await?;

        if body["status"] == 1 {
            Ok(body["request"].as_str().unwrap_or_default().to_string())
        } else {
            Err(CaptchaError::Rejected(
                body["request"].as_str().unwrap_or("unknown error").to_string(),
            ))
        }
    }

    async fn fetch_result(&self, task_id: &str) -> Result<Option<String>, CaptchaError> {
        let body: Value = self
            .client
            .get(format!("{}/res.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", task_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        let request = body["request"].as_str().unwrap_or_default();
        if body["status"] == 1 {
            Ok(Some(request.to_string()))
        } else if request == "CAPCHA_NOT_READY" {
            Ok(None)
        } else {
            Err(CaptchaError::Rejected(request.to_string()))
        }
    }
}

// ============================================================================
// Anti-Captcha
// ============================================================================

/// Anti-Captcha JSON API (`createTask` / `getTaskResult`)
pub struct AntiCaptchaApi {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AntiCaptchaApi {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, "https://api.anti-captcha.com")
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn task_type(kind: ChallengeKind) -> &'static str {
        match kind {
            ChallengeKind::HCaptcha => "HCaptchaTaskProxyless",
            ChallengeKind::RecaptchaV3 => "RecaptchaV3TaskProxyless",
            _ => "RecaptchaV2TaskProxyless",
        }
    }

    fn check_error(body: &Value) -> Result<(), CaptchaError> {
        if body["errorId"].as_i64().unwrap_or(0) != 0 {
            return Err(CaptchaError::Rejected(
                body["errorDescription"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SolverApi for AntiCaptchaApi {
    fn name(&self) -> &'static str {
        "anticaptcha"
    }

    async fn submit(
        &self,
        kind: ChallengeKind,
        site_key: &str,
        page_url: &str,
    ) -> Result<String, CaptchaError> {
        let mut task = json!({
            "type": Self::task_type(kind),
            "websiteURL": page_url,
            "websiteKey": site_key,
        });
        if kind == ChallengeKind::RecaptchaV3 {
            task["minScore"] = json!(0.3);
            task["pageAction"] = json!(V3_ACTION);
        }

        let body: Value = self
            .client
            .post(format!("{}/createTask", self.base_url))
            .json(&json!({
                "clientKey": self.api_key,
                "task": task,
            }))
            .send()
            .await?
            .json()
            .await?;

        Self::check_error(&body)?;
        Ok(body["taskId"]
            .as_i64()
            .map(|id| id.to_string())
            .unwrap_or_default())
    }

    async fn fetch_result(&self, task_id: &str) -> Result<Option<String>, CaptchaError> {
        let body: Value = self
            .client
            .post(format!("{}/getTaskResult", self.base_url))
            .json(&json!({
                "clientKey": self.api_key,
                "taskId": task_id.parse::<i64>().unwrap_or_default(),
            }))
            .send()
            .await?
            .json()
            .await?;

        Self::check_error(&body)?;
        match body["status"].as_str() {
            Some("ready") => Ok(Some(
                body["solution"]["gRecaptchaResponse"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            )),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_two_captcha_submit_and_result() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/in.php"))
            .and(query_param("method", "userrecaptcha"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "42"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("id", "42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 1, "request": "token-abc"})),
            )
            .mount(&server)
            .await;

        let api = TwoCaptchaApi::with_base_url("key", &server.uri());
        let task = api
            .submit(ChallengeKind::RecaptchaV2, "sitekey", "https://x.example")
            .await
            .unwrap();
        assert_eq!(task, "42");
        let token = api.fetch_result(&task).await.unwrap();
        assert_eq!(token.as_deref(), Some("token-abc"));
    }

    #[tokio::test]
    async fn test_two_captcha_v3_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/in.php"))
            .and(query_param("version", "v3"))
            .and(query_param("min_score", "0.3"))
            .and(query_param("action", "verify"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "99"})),
            )
            .mount(&server)
            .await;

        let api = TwoCaptchaApi::with_base_url("key", &server.uri());
        let task = api
            .submit(ChallengeKind::RecaptchaV3, "sitekey", "https://x.example")
            .await
            .unwrap();
        assert_eq!(task, "99");
    }

    #[tokio::test]
    async fn test_two_captcha_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
            )
            .mount(&server)
            .await;

        let api = TwoCaptchaApi::with_base_url("key", &server.uri());
        assert!(api.fetch_result("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_captcha_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/in.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "ERROR_WRONG_USER_KEY"})),
            )
            .mount(&server)
            .await;

        let api = TwoCaptchaApi::with_base_url("bad", &server.uri());
        let err = api
            .submit(ChallengeKind::RecaptchaV2, "sitekey", "https://x.example")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Rejected(msg) if msg == "ERROR_WRONG_USER_KEY"));
    }

    #[tokio::test]
    async fn test_anti_captcha_submit_and_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/createTask"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"errorId": 0, "taskId": 7})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "status": "ready",
                "solution": {"gRecaptchaResponse": "token-def"}
            })))
            .mount(&server)
            .await;

        let api = AntiCaptchaApi::with_base_url("key", &server.uri());
        let task = api
            .submit(ChallengeKind::RecaptchaV2, "sitekey", "https://x.example")
            .await
            .unwrap();
        assert_eq!(task, "7");
        let token = api.fetch_result(&task).await.unwrap();
        assert_eq!(token.as_deref(), Some("token-def"));
    }

    #[tokio::test]
    async fn test_anti_captcha_processing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"errorId": 0, "status": "processing"})),
            )
            .mount(&server)
            .await;

        let api = AntiCaptchaApi::with_base_url("key", &server.uri());
        assert!(api.fetch_result("7").await.unwrap().is_none());
    }
}
