pub mod acrcloud;
#[cfg(test)]
pub(crate) mod mock;
pub mod retry;
pub mod router;
pub mod shazam;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use retry::{RetryPolicy, RetryStats};
pub use router::{BackendRouter, RouterStats};

/// Which backend produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Primary,
    Fallback,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Primary => write!(f, "primary"),
            Source::Fallback => write!(f, "fallback"),
        }
    }
}

/// A backend's answer for one segment, already mapped into the canonical shape.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionMatch {
    /// External identifier used to group hits across segments.
    pub track_key: String,
    pub title: String,
    pub artist: String,
    /// Normalized to [0, 1].
    pub confidence: f64,
    pub source: Source,
    /// Album, genres, external ids and whatever else the service returned.
    pub metadata: serde_json::Value,
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("connection error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("service returned HTTP {0}")]
    Status(u16),
    #[error("proxy authentication required (HTTP 407)")]
    ProxyAuth,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RecognitionError>,
    },
}

impl RecognitionError {
    /// Whether another attempt against the same backend may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::Timeout
            | Self::Status(_)
            | Self::ProxyAuth
            | Self::Malformed(_) => true,
            Self::Authentication(_) | Self::RetriesExhausted { .. } => false,
        }
    }

    /// Map an HTTP status that is not a success into the error taxonomy.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Authentication(format!("HTTP {}", status.as_u16())),
            407 => Self::ProxyAuth,
            code => Self::Status(code),
        }
    }
}

impl From<reqwest::Error> for RecognitionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::from_status(status)
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// An audio fingerprinting service reached over the network.
///
/// `Ok(None)` is a definitive "no match" from the service. An `Err` is only
/// returned once the backend's own retry budget is spent, or immediately for
/// non-retriable failures such as bad credentials.
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// Short name used in log lines and stats.
    fn name(&self) -> &'static str;

    async fn recognize(
        &self,
        audio: &[u8],
        segment: usize,
    ) -> Result<Option<RecognitionMatch>, RecognitionError>;

    /// Retry counters recorded by this backend instance.
    fn retry_stats(&self) -> RetryStats {
        RetryStats::default()
    }
}

/// Convert a 0-100 service score into a [0, 1] confidence.
pub fn normalize_score(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    score.clamp(0.0, 100.0) / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(RecognitionError::Timeout.is_retriable());
        assert!(RecognitionError::Transport("reset".into()).is_retriable());
        assert!(RecognitionError::Status(502).is_retriable());
        assert!(RecognitionError::ProxyAuth.is_retriable());
        assert!(RecognitionError::Malformed("eof".into()).is_retriable());

        assert!(!RecognitionError::Authentication("bad key".into()).is_retriable());
        let exhausted = RecognitionError::RetriesExhausted {
            attempts: 3,
            last: Box::new(RecognitionError::Timeout),
        };
        assert!(!exhausted.is_retriable());
    }

    #[test]
    fn test_from_status() {
        use reqwest::StatusCode;
        assert!(matches!(
            RecognitionError::from_status(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            RecognitionError::ProxyAuth
        ));
        assert!(matches!(
            RecognitionError::from_status(StatusCode::UNAUTHORIZED),
            RecognitionError::Authentication(_)
        ));
        assert!(matches!(
            RecognitionError::from_status(StatusCode::TOO_MANY_REQUESTS),
            RecognitionError::Status(429)
        ));
    }

    #[test]
    fn test_normalize_score() {
        assert_eq!(normalize_score(100.0), 1.0);
        assert_eq!(normalize_score(85.0), 0.85);
        assert_eq!(normalize_score(250.0), 1.0);
        assert_eq!(normalize_score(-3.0), 0.0);
        assert_eq!(normalize_score(f64::NAN), 0.0);
    }

    #[test]
    fn test_source_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Source::Fallback).unwrap(), "\"fallback\"");
        assert_eq!(Source::Primary.to_string(), "primary");
    }
}
