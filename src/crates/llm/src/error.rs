//! Error types for LLM provider implementations.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when working with LLM providers.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to serialize/deserialize data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// API authentication failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// API key not found in environment.
    #[error("API key not found: set {0}")]
    ApiKeyNotFound(String),

    /// Provider service unavailable (5xx or server not running).
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Invalid request parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid response from provider.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request timeout.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Unknown provider name.
    #[error("Unknown provider '{name}'. Available: {available}")]
    UnknownProvider { name: String, available: String },

    /// The model never produced output matching the requested schema.
    #[error("Structured output did not match the requested schema: {0}")]
    SchemaViolation(String),

    /// Tool execution inside the agent loop failed.
    #[error("Tool call failed: {0}")]
    Tool(#[from] tooling::ToolError),

    /// The agent loop exceeded the per-node tool-call budget.
    #[error("Tool-call limit of {limit} reached without a final response")]
    ToolLoopLimit { limit: usize },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Check if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::ServiceUnavailable(_)
            | LlmError::Timeout(_)
            | LlmError::RateLimitExceeded(_) => true,
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Check if this error is due to authentication.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            LlmError::Authentication(_) | LlmError::ApiKeyNotFound(_)
        )
    }

    /// Map an HTTP status + body to the matching error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => LlmError::Authentication(body),
            429 => LlmError::RateLimitExceeded(body),
            408 => LlmError::Timeout(body),
            500..=599 => LlmError::ServiceUnavailable(format!("{status}: {body}")),
            _ => LlmError::InvalidRequest(format!("{status}: {body}")),
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::ServiceUnavailable("503".into()).is_retryable());
        assert!(LlmError::RateLimitExceeded("slow down".into()).is_retryable());
        assert!(LlmError::Timeout("deadline".into()).is_retryable());
        assert!(!LlmError::Authentication("bad key".into()).is_retryable());
        assert!(!LlmError::InvalidRequest("bad body".into()).is_retryable());
        assert!(!LlmError::SchemaViolation("not json".into()).is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            LlmError::from_status(503, "oops".into()),
            LlmError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            LlmError::from_status(429, "rl".into()),
            LlmError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            LlmError::from_status(401, "denied".into()),
            LlmError::Authentication(_)
        ));
        assert!(matches!(
            LlmError::from_status(400, "bad".into()),
            LlmError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_auth_predicate() {
        assert!(LlmError::ApiKeyNotFound("OPENAI_API_KEY".into()).is_auth_error());
        assert!(!LlmError::Timeout("t".into()).is_auth_error());
    }
}
