//! Error types for the correlation subsystem

use thiserror::Error;

/// Errors that can occur while tracking and syncing correlations
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Backend returned a retryable status (429, 5xx)
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Backend rejected the request permanently (4xx other than 429)
    #[error("Request rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Request timed out
    #[error("Operation timed out")]
    Timeout,

    /// Internal request queue is at capacity
    #[error("Correlation queue full, update dropped")]
    QueueFull,

    /// Client no longer accepts submissions
    #[error("Correlation client is shutting down")]
    ShuttingDown,

    /// Shutdown deadline passed with work still outstanding
    #[error("Shutdown deadline exceeded, {cancelled} request(s) cancelled")]
    ShutdownTimeout { cancelled: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CorrelationError {
    /// Whether the error is transient and the request worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CorrelationError::Network(_)
                | CorrelationError::Server { .. }
                | CorrelationError::Timeout
        )
    }

    /// Create a retryable server error from status and message
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        CorrelationError::Server {
            status,
            message: message.into(),
        }
    }

    /// Create a permanent rejection from status and message
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        CorrelationError::Rejected {
            status,
            message: message.into(),
        }
    }
}

/// Result type for correlation operations
pub type CorrelationResult<T> = Result<T, CorrelationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(CorrelationError::server(503, "unavailable").is_retryable());
        assert!(CorrelationError::Timeout.is_retryable());
        assert!(!CorrelationError::rejected(400, "bad dimension").is_retryable());
        assert!(!CorrelationError::QueueFull.is_retryable());
        assert!(!CorrelationError::ShuttingDown.is_retryable());
    }
}
