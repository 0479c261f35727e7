use thiserror::Error;

/// Result type for volley operations.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Errors that can occur in the rate-limiting and batching core.
///
/// Every variant is `Clone` because a failed batch dispatch fans the same
/// error out to every ticket in the batch. Quota exhaustion is deliberately
/// absent: admission decisions are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VolleyError {
    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The grouped backend call failed wholesale; every entry of the batch
    /// carries this error and may be resubmitted by its caller
    #[error("Batch dispatch failed: {0}")]
    BatchDispatchFailure(String),

    /// A single-dispatch backend call failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// The request was canceled before a result could be delivered
    #[error("Request canceled")]
    Canceled,
}

impl VolleyError {
    /// Check if the caller may retry the operation that produced this error.
    ///
    /// The aggregator never resubmits on the caller's behalf, so retryable
    /// errors surface here and the caller decides.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VolleyError::BatchDispatchFailure(_) | VolleyError::Backend(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(VolleyError::BatchDispatchFailure("boom".to_string()).is_retryable());
        assert!(VolleyError::Backend("timeout".to_string()).is_retryable());
        assert!(!VolleyError::InvalidConfiguration("bad".to_string()).is_retryable());
        assert!(!VolleyError::Canceled.is_retryable());
    }
}
