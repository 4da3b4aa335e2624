//! Unified error handling for the creneau crate
//!
//! Domain-specific errors live next to the code that raises them
//! ([`SessionError`], [`CaptchaError`], [`SchedulerError`]); this module
//! consolidates them into a single [`Error`] enum usable across module
//! boundaries, with an [`ErrorCategory`] classification driving retry
//! decisions.

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::captcha::CaptchaError;
pub use crate::scheduler::SchedulerError;
pub use crate::session::SessionError;

/// Common interface implemented by all creneau error types
pub trait CreneauErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried on the next tick)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, rate limit)
    Network,
    /// Anti-automation challenges (CAPTCHA, blocks)
    Challenge,
    /// Session/token acquisition errors
    Session,
    /// Backing-store errors (Redis, pools)
    Store,
    /// Scheduler and job-board errors
    Scheduler,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the creneau crate
#[derive(Error, Debug)]
pub enum Error {
    /// Session acquisition and refresh errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// CAPTCHA detection/solving errors
    #[error("Captcha error: {0}")]
    Captcha(#[from] CaptchaError),

    /// Scheduler and job-board errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis command errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool errors
    #[error("Redis pool error: {0}")]
    RedisPool(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CreneauErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Session(e) => e.is_recoverable(),
            Self::Captcha(e) => e.is_recoverable(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Http(_) => true, // HTTP errors are often transient
            Self::Redis(_) | Self::RedisPool(_) => true,
            Self::Json(_) => false,
            Self::Io(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Session(_) => ErrorCategory::Session,
            Self::Captcha(_) => ErrorCategory::Challenge,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Http(_) => ErrorCategory::Network,
            Self::Redis(_) | Self::RedisPool(_) => ErrorCategory::Store,
            Self::Json(_) => ErrorCategory::Other,
            Self::Io(_) => ErrorCategory::Store,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::RedisPool(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let session_err = Error::Session(SessionError::TokenNotFound);
        assert_eq!(session_err.category(), ErrorCategory::Session);

        let config_err = Error::config("missing REDIS_URL");
        assert_eq!(config_err.category(), ErrorCategory::Config);
    }

    #[test]
    fn test_is_recoverable() {
        let store_err = Error::RedisPool("pool exhausted".to_string());
        assert!(store_err.is_recoverable());

        let config_err = Error::config("bad value");
        assert!(!config_err.is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let session_err = SessionError::TokenNotFound;
        let unified: Error = session_err.into();
        assert!(matches!(unified, Error::Session(_)));
    }

    #[test]
    fn test_other_error() {
        let err = Error::other("something went wrong");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert!(!err.is_recoverable());
    }
}
