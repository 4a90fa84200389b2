//! Error types for the dispatch engine and generation client.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the dispatch engine and the generation endpoint client.
///
/// `Clone` is required so a single in-flight result can be fanned out to every
/// deduplicated waiter through a broadcast channel.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("rate limit circuit breaker is open, try again in {0}s")]
    BreakerOpen(u64),

    #[error("rate limit exceeded: {0}")]
    QuotaExhausted(String),

    #[error("rate limit exceeded (429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("generation API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request queue cleared")]
    Cleared,

    #[error("dispatch channel closed: {0}")]
    Channel(String),
}

impl DispatchError {
    /// True when the error came from provider throttling. These are the only
    /// failures that count against the circuit breaker.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            DispatchError::RateLimited { .. } => true,
            DispatchError::Api { status, message } => {
                *status == 429 || message.to_lowercase().contains("rate limit")
            }
            _ => false,
        }
    }

    /// Provider-supplied retry delay hint, when one was present on the response.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            DispatchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_shapes() {
        assert!(DispatchError::RateLimited { retry_after: None }.is_rate_limit());
        assert!(DispatchError::Api {
            status: 429,
            message: "too many requests".into()
        }
        .is_rate_limit());
        assert!(DispatchError::Api {
            status: 503,
            message: "Rate limit reached for model".into()
        }
        .is_rate_limit());
        assert!(!DispatchError::Network("connection refused".into()).is_rate_limit());
    }

    #[test]
    fn retry_hint_only_from_throttle() {
        let e = DispatchError::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
        };
        assert_eq!(e.retry_hint(), Some(Duration::from_secs(12)));
        assert_eq!(DispatchError::Cleared.retry_hint(), None);
    }
}
