use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes for a single crawl attempt. The scheduler dispatches on
/// these to decide between retry, pipeline pause and terminal job states.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("provider throttled or blocked the crawler (HTTP {status})")]
    RateLimit { status: u16 },

    #[error("no caption track available in any configured language")]
    NotFound,

    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("index write failed: {0}")]
    IndexWrite(String),
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Auth(_) => ErrorKind::Auth,
            CrawlError::RateLimit { .. } => ErrorKind::RateLimit,
            CrawlError::NotFound => ErrorKind::NotFound,
            CrawlError::Transient(_) => ErrorKind::Transient,
            CrawlError::IndexWrite(_) => ErrorKind::IndexWrite,
        }
    }

    /// Classify a provider HTTP status. 401 means our token is bad; 403 and
    /// 429 are throttle/ban signals that must pause the whole pipeline.
    pub fn from_provider_status(status: u16, context: &str) -> CrawlError {
        match status {
            401 => CrawlError::Auth(format!("provider rejected token ({context})")),
            403 | 429 => CrawlError::RateLimit { status },
            404 => CrawlError::NotFound,
            _ => CrawlError::Transient(format!("unexpected HTTP {status} ({context})")),
        }
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            CrawlError::Transient(format!("network: {e}"))
        } else if let Some(status) = e.status() {
            CrawlError::from_provider_status(status.as_u16(), "reqwest")
        } else {
            CrawlError::Transient(format!("request failed: {e}"))
        }
    }
}

/// Serializable error class persisted on a job record for operator
/// inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    RateLimit,
    NotFound,
    Transient,
    IndexWrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_classification() {
        assert_eq!(
            CrawlError::from_provider_status(401, "captions.list").kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            CrawlError::from_provider_status(429, "captions.list").kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            CrawlError::from_provider_status(403, "captions.download").kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            CrawlError::from_provider_status(404, "captions.list").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CrawlError::from_provider_status(502, "captions.list").kind(),
            ErrorKind::Transient
        );
    }
}
