//! Error types for Colloquy
//!
//! This module defines all error types used throughout the application,
//! using `thiserror` for ergonomic error handling. Every error carries a
//! stable classification code so the HTTP layer can report a category to
//! the client without leaking internal detail.

use thiserror::Error;

/// Main error type for Colloquy operations
///
/// This enum encompasses all possible errors that can occur during
/// message handling, file ingestion, knowledge store management,
/// provider interactions, and persistence.
#[derive(Error, Debug)]
pub enum ColloquyError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed input, rejected before any external call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Account/session mismatch, inactive subscription, or plan gating
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// A record the caller referenced does not exist or is not theirs
    #[error("Not found: {0}")]
    NotFound(String),

    /// Usage ledger check failed for one tracked dimension
    #[error("Quota exceeded for {dimension}: used {used} of {limit}")]
    QuotaExceeded {
        /// Which ledger dimension was exhausted (input, output, cached)
        dimension: String,
        /// Units consumed so far plus the projected cost
        used: u64,
        /// The plan allotment for this dimension
        limit: u64,
    },

    /// Provider call failed for a retryable reason (timeout, 5xx)
    #[error("Upstream error: {0}")]
    UpstreamTransient(String),

    /// A knowledge store the operation referenced has expired upstream
    #[error("Knowledge store expired: {0}")]
    ResourceExpired(String),

    /// File ingestion batch failed; names every file that failed
    #[error("File ingestion failed for: {}", failed.join(", "))]
    Ingestion {
        /// Original filenames of the uploads that failed
        failed: Vec<String>,
    },

    /// Provider-related errors that are not retryable (auth, bad request)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Storage errors (database operations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ColloquyError {
    /// Stable classification code reported to clients
    ///
    /// Recoverable categories keep their own code; everything internal
    /// collapses to `SYSTEM`.
    pub fn code(&self) -> &'static str {
        match self {
            ColloquyError::Validation(_) => "VALIDATION",
            ColloquyError::Authorization(_) => "AUTHORIZATION",
            ColloquyError::NotFound(_) => "NOT_FOUND",
            ColloquyError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ColloquyError::UpstreamTransient(_) => "UPSTREAM_TRANSIENT",
            ColloquyError::ResourceExpired(_) => "RESOURCE_EXPIRED",
            ColloquyError::Ingestion { .. } => "INGESTION",
            _ => "SYSTEM",
        }
    }

    /// Message that is safe to return to a client
    ///
    /// Caller-recoverable errors are surfaced verbatim. Internal errors
    /// (storage, IO, provider plumbing) are replaced with a generic
    /// message; the full detail only ever reaches the logs.
    pub fn client_message(&self) -> String {
        match self {
            ColloquyError::Validation(_)
            | ColloquyError::Authorization(_)
            | ColloquyError::NotFound(_)
            | ColloquyError::QuotaExceeded { .. }
            | ColloquyError::Ingestion { .. } => self.to_string(),
            ColloquyError::ResourceExpired(_) => "Attachment context unavailable".to_string(),
            ColloquyError::UpstreamTransient(_) => {
                "The assistant is temporarily unavailable, please retry".to_string()
            }
            _ => "Internal server error".to_string(),
        }
    }
}

/// Result type alias for Colloquy operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let error = ColloquyError::Validation("content is required".to_string());
        assert_eq!(error.to_string(), "Validation error: content is required");
    }

    #[test]
    fn test_authorization_error_display() {
        let error = ColloquyError::Authorization("plan lacks access".to_string());
        assert_eq!(error.to_string(), "Authorization error: plan lacks access");
    }

    #[test]
    fn test_quota_exceeded_display() {
        let error = ColloquyError::QuotaExceeded {
            dimension: "output".to_string(),
            used: 1200,
            limit: 1000,
        };
        let s = error.to_string();
        assert!(s.contains("output"));
        assert!(s.contains("1200"));
        assert!(s.contains("1000"));
    }

    #[test]
    fn test_ingestion_error_names_every_file() {
        let error = ColloquyError::Ingestion {
            failed: vec!["report.pdf".to_string(), "notes.txt".to_string()],
        };
        let s = error.to_string();
        assert!(s.contains("report.pdf"));
        assert!(s.contains("notes.txt"));
    }

    #[test]
    fn test_resource_expired_display() {
        let error = ColloquyError::ResourceExpired("ks_123".to_string());
        assert_eq!(error.to_string(), "Knowledge store expired: ks_123");
    }

    #[test]
    fn test_code_classification() {
        assert_eq!(ColloquyError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(
            ColloquyError::ResourceExpired("x".into()).code(),
            "RESOURCE_EXPIRED"
        );
        assert_eq!(ColloquyError::Storage("x".into()).code(), "SYSTEM");
        let io = ColloquyError::Io(std::io::Error::other("disk"));
        assert_eq!(io.code(), "SYSTEM");
    }

    #[test]
    fn test_client_message_sanitizes_internal_detail() {
        let error = ColloquyError::Storage("/var/lib/colloquy/history.db is locked".to_string());
        let msg = error.client_message();
        assert_eq!(msg, "Internal server error");
        assert!(!msg.contains("/var/lib"));
    }

    #[test]
    fn test_client_message_keeps_recoverable_detail() {
        let error = ColloquyError::Validation("agent_slug is required".to_string());
        assert!(error.client_message().contains("agent_slug"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ColloquyError = io_error.into();
        assert!(matches!(error, ColloquyError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_str = "{invalid json}";
        let json_error = serde_json::from_str::<serde_json::Value>(json_str).unwrap_err();
        let error: ColloquyError = json_error.into();
        assert!(matches!(error, ColloquyError::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ColloquyError>();
    }
}
