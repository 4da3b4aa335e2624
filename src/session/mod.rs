//! Per-target session cache with TTL-based invalidation
//!
//! Booking sites hand out short-lived CSRF tokens and cookies on their
//! landing page. This module caches one [`Session`] per target, refuses to
//! hand out anything past its TTL, and supports forced invalidation when
//! the scrape executor signals an authentication expiry mid-check.
//!
//! The [`SessionSource`] trait abstracts the site-specific handshake;
//! [`CsrfPageSource`] covers the common shape (hidden `_token` input plus
//! response cookies).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::{CreneauErrorTrait, ErrorCategory};
use crate::models::{Session, Target};

/// Session acquisition errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Landing page fetched but no token input found
    #[error("session token not found in page")]
    TokenNotFound,

    /// Landing page returned a non-success status
    #[error("landing page returned HTTP {0}")]
    BadStatus(u16),

    /// Transport failure during the handshake
    #[error("session fetch failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl CreneauErrorTrait for SessionError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::TokenNotFound => false,
            Self::BadStatus(_) | Self::Http(_) => true,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Session
    }
}

/// Strategy for performing the site-specific session handshake
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Fetch a fresh session for a target
    async fn fetch(&self, target: &Target) -> Result<Session, SessionError>;
}

// ============================================================================
// Cache
// ============================================================================

/// In-process session cache, shared across all workers
pub struct SessionCache {
    inner: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get the cached session for a target if it is still fresh
    pub async fn get(&self, target_id: &str) -> Option<Session> {
        let inner = self.inner.read().await;
        inner
            .get(target_id)
            .filter(|s| s.age() < self.ttl)
            .cloned()
    }

    /// Store a session for a target
    pub async fn insert(&self, target_id: &str, session: Session) {
        let mut inner = self.inner.write().await;
        inner.insert(target_id.to_string(), session);
    }

    /// Drop the cached session for a target
    pub async fn invalidate(&self, target_id: &str) {
        let mut inner = self.inner.write().await;
        if inner.remove(target_id).is_some() {
            tracing::debug!(target = %target_id, "Session invalidated");
        }
    }

    /// Drop every expired session; returns the number removed
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, s| s.age() < self.ttl);
        before - inner.len()
    }

    /// Number of cached sessions, fresh or not
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Cache plus source: the worker-facing session API
///
/// `acquire` serves from cache when fresh; `refresh` drops the cached
/// session unconditionally and performs a new handshake. The worker calls
/// `refresh` at most once per check, on an auth-expiry signal.
pub struct SessionManager {
    cache: SessionCache,
    source: Arc<dyn SessionSource>,
}

impl SessionManager {
    pub fn new(ttl: Duration, source: Arc<dyn SessionSource>) -> Self {
        Self {
            cache: SessionCache::new(ttl),
            source,
        }
    }

    /// Get a fresh session, performing the handshake on cache miss
    pub async fn acquire(&self, target: &Target) -> Result<Session, SessionError> {
        if let Some(session) = self.cache.get(&target.id).await {
            return Ok(session);
        }

        tracing::debug!(target = %target.id, "Fetching fresh session");
        let session = self.source.fetch(target).await?;
        self.cache.insert(&target.id, session.clone()).await;
        Ok(session)
    }

    /// Invalidate and re-fetch, used after an auth-expiry signal
    pub async fn refresh(&self, target: &Target) -> Result<Session, SessionError> {
        self.cache.invalidate(&target.id).await;
        let session = self.source.fetch(target).await?;
        self.cache.insert(&target.id, session.clone()).await;
        Ok(session)
    }

    /// Access the underlying cache (maintenance, tests)
    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }
}

// ============================================================================
// CSRF landing-page source
// ============================================================================

/// Session handshake for sites that embed a CSRF token in the landing page
///
/// Fetches the booking URL, extracts the hidden `_token` input, and
/// collects response cookies into a `Cookie` header value.
pub struct CsrfPageSource {
    client: reqwest::Client,
}

impl CsrfPageSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }

    /// Extract the token from a landing page body
    pub fn extract_token(html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        let selector = Selector::parse(r#"input[name="_token"]"#).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("value"))
            .map(String::from)
    }
}

#[async_trait]
impl SessionSource for CsrfPageSource {
    async fn fetch(&self, target: &Target) -> Result<Session, SessionError> {
        let response = self.client.get(&target.booking_url).send().await?;

        if !response.status().is_success() {
            return Err(SessionError::BadStatus(response.status().as_u16()));
        }

        let cookies: String = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ");

        let html = response.text().await?;
        let token = Self::extract_token(&html).ok_or(SessionError::TokenNotFound)?;

        Ok(Session::new(&token, &cookies))
    }
}
