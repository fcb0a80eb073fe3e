//! Error types for Strata

use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// Object does not exist in the bucket
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Network or object store hiccup, retried next cycle
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Store rejected the request (permissions, malformed bucket)
    #[error("Permanent store error: {0}")]
    Permanent(String),

    /// A store call exceeded its deadline
    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Tenant index is present but older than the configured threshold
    #[error("Tenant index for {tenant} created at {created_at} is stale")]
    StaleIndex {
        tenant: String,
        created_at: chrono::DateTime<chrono::Utc>,
    },

    /// Corrupt meta.json or tenant index payload
    #[error("Decode error in {key}: {reason}")]
    Decode { key: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation was cancelled by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    pub fn decode(key: impl Into<String>, reason: impl ToString) -> Self {
        StrataError::Decode {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrataError::Transient(_) | StrataError::Timeout { .. } | StrataError::Io(_)
        )
    }

    /// Check if error means the object is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::NotFound(_))
    }

    /// Check if error indicates a corrupt payload
    pub fn is_decode(&self) -> bool {
        matches!(self, StrataError::Decode { .. })
    }

    /// Check if error should be alerted on loudly
    pub fn is_permanent(&self) -> bool {
        matches!(self, StrataError::Permanent(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StrataError::Transient("reset".into()).is_retryable());
        assert!(StrataError::Timeout {
            operation: "get".into(),
            millis: 10
        }
        .is_retryable());
        assert!(!StrataError::Permanent("denied".into()).is_retryable());
        assert!(StrataError::Permanent("denied".into()).is_permanent());
        assert!(StrataError::NotFound("t/index".into()).is_not_found());
        assert!(StrataError::decode("t/b/meta.json", "eof").is_decode());
    }
}
