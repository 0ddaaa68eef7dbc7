//! Client side of the remote detection API.
//!
//! The capture pipeline only depends on [`SubmissionClient`]; the HTTP
//! implementation lives in [`http`].

pub mod http;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use stream_gate_common::frame::Frame;

pub use http::HttpSubmissionClient;

/// Identifier of an image query accepted by the detection API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryHandle {
    pub id: String,
}

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by the API")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("detector not found: {0}")]
    DetectorNotFound(String),
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl SubmissionError {
    /// Transient errors may succeed on retry; everything else will fail the
    /// same way every time and should end the session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubmissionError::Network(_)
                | SubmissionError::Timeout
                | SubmissionError::RateLimited { .. }
                | SubmissionError::Server { .. }
        )
    }

    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SubmissionError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Sends processed frames to the detection API.
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    async fn submit(&self, frame: &Frame) -> Result<QueryHandle, SubmissionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SubmissionError::Network("reset".into()).is_transient());
        assert!(SubmissionError::Timeout.is_transient());
        assert!(SubmissionError::RateLimited { retry_after: None }.is_transient());
        assert!(SubmissionError::Server {
            status: 502,
            body: String::new()
        }
        .is_transient());

        assert!(!SubmissionError::Auth("bad token".into()).is_transient());
        assert!(!SubmissionError::DetectorNotFound("det_x".into()).is_transient());
        assert!(!SubmissionError::Rejected {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!SubmissionError::Encode("empty".into()).is_transient());
    }

    #[test]
    fn retry_after_only_for_rate_limit() {
        let err = SubmissionError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(SubmissionError::Timeout.retry_after(), None);
    }
}
