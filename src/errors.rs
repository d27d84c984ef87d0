use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

pub type Result<T> = std::result::Result<T, ServiceGraphError>;

/// Reason attached to a request that timed out waiting on a cache population.
pub const CACHE_TIMEOUT_REASON: &str = "background query is taking a long time";

/// Service graph error types.
///
/// Errors are `Clone` because a single population result is shared by every request waiting on the same cache entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceGraphError {
    #[error("Backend query failed: {message}")]
    Backend { message: String },

    /// The backend hit its record cap. Data gathered so far is still usable.
    #[error("Data truncated: the query exceeded the maximum number of records")]
    DataTruncated,

    #[error("Timed out after {elapsed:?}: {reason}")]
    CacheTimeout { elapsed: Duration, reason: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("{message}")]
    InvalidNodeId { message: String },

    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Error response rendered for API callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    pub data: Option<Value>,
}

impl ServiceGraphError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into() }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Node ID parse failure. `detail` is appended after a colon when present.
    pub fn invalid_node_id(id: &str, detail: Option<&str>) -> Self {
        let message = match detail {
            Some(detail) => format!("unexpected format of node ID {}: {}", id, detail),
            None => format!("unexpected format of node ID {}", id),
        };
        Self::InvalidNodeId { message }
    }

    pub fn cache_timeout(elapsed: Duration) -> Self {
        Self::CacheTimeout { elapsed, reason: CACHE_TIMEOUT_REASON.to_string() }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::DataTruncated)
    }

    /// HTTP-style status for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidNodeId { .. } | Self::InvalidRequest { .. } => 400,
            Self::Cancelled => 499,
            Self::CacheTimeout { .. } => 504,
            Self::Backend { .. } | Self::DataTruncated | Self::Internal { .. } => 500,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let data = match self {
            Self::CacheTimeout { elapsed, reason } => Some(json!({
                "duration": elapsed.as_secs_f64(),
                "reason": reason,
            })),
            _ => None,
        };

        let code = self.status_code();
        if code >= 500 {
            error!("Service graph request failed: {}", self);
        } else {
            warn!("Service graph request rejected: {}", self);
        }

        ErrorResponse { code, message: self.to_string(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_response_carries_reason() {
        let err = ServiceGraphError::cache_timeout(Duration::from_millis(1500));
        let resp = err.to_response();
        assert_eq!(resp.code, 504);
        assert_eq!(resp.data, Some(json!({"duration": 1.5, "reason": CACHE_TIMEOUT_REASON})));
    }

    #[test]
    fn test_node_id_messages() {
        assert_eq!(
            ServiceGraphError::invalid_node_id("a/b", Some("badly formatted segment")).to_string(),
            "unexpected format of node ID a/b: badly formatted segment"
        );
        assert_eq!(ServiceGraphError::invalid_node_id("a/b", None).to_string(), "unexpected format of node ID a/b");
        assert_eq!(ServiceGraphError::invalid_node_id("a/b", None).status_code(), 400);
    }
}
