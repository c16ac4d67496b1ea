//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. The fallback
//! chain decides whether to advance by asking the error itself
//! (`is_rate_limited`), so provider-specific status/code quirks live here.

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// No usable API key is configured for the provider.
    #[error("no credentials configured for provider '{provider}'")]
    MissingCredentials { provider: String },

    /// The response body could not be decoded as a chat completion.
    #[error("response parse error: {reason}")]
    ResponseParse { reason: String },

    /// Every backend in the fallback chain was unavailable.
    #[error("all models unavailable (tried: {})", attempted.join(", "))]
    AllModelsUnavailable { attempted: Vec<String> },

    /// The local runtime was reachable but the request against it failed.
    #[error("local fallback failed: {reason}")]
    LocalFallbackFailed { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether the provider signalled quota exhaustion.
    ///
    /// Matches HTTP 429, HTTP 413 paired with a `rate_limit_exceeded` code,
    /// and any response carrying a `tokens_exceeded` code. Missing credentials
    /// are treated the same way so the chain moves on to the next tier.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            InferenceError::MissingCredentials { .. } => true,
            InferenceError::HttpError { status: 429, .. } => true,
            InferenceError::HttpError { status, .. } => {
                let code = self.error_code();
                match code.as_deref() {
                    Some("tokens_exceeded") => true,
                    Some("rate_limit_exceeded") => *status == 413,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Whether the failure is a missing or malformed API key.
    pub fn is_missing_credentials(&self) -> bool {
        matches!(self, InferenceError::MissingCredentials { .. })
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// The provider's `error.code` field, if the body is a JSON error object.
    pub fn error_code(&self) -> Option<String> {
        let error = self.error_object()?;
        match error.get("code")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The `error.failed_generation` diagnostic some providers attach when
    /// they reject a response that still contains the model's raw output.
    pub fn failed_generation(&self) -> Option<String> {
        let error = self.error_object()?;
        error
            .get("failed_generation")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    }

    fn error_object(&self) -> Option<Value> {
        let body = self.error_body()?;
        let parsed: Value = serde_json::from_str(body).ok()?;
        match parsed.get("error") {
            Some(obj @ Value::Object(_)) => Some(obj.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, body: &str) -> InferenceError {
        InferenceError::HttpError {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_429_is_rate_limited() {
        assert!(http(429, "slow down").is_rate_limited());
    }

    #[test]
    fn test_413_with_rate_limit_code_is_rate_limited() {
        let err = http(
            413,
            r#"{"error":{"message":"Request too large","code":"rate_limit_exceeded"}}"#,
        );
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_413_without_code_is_not_rate_limited() {
        let err = http(413, r#"{"error":{"message":"payload too large"}}"#);
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_tokens_exceeded_code_is_rate_limited() {
        let err = http(400, r#"{"error":{"code":"tokens_exceeded"}}"#);
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_missing_credentials_counts_as_rate_limited() {
        let err = InferenceError::MissingCredentials {
            provider: "groq".into(),
        };
        assert!(err.is_rate_limited());
        assert!(err.is_missing_credentials());
    }

    #[test]
    fn test_server_error_is_not_rate_limited() {
        assert!(!http(500, "internal").is_rate_limited());
        assert!(!InferenceError::Timeout { duration_secs: 5 }.is_rate_limited());
    }

    #[test]
    fn test_failed_generation_extracted() {
        let err = http(
            400,
            r#"{"error":{"code":"tool_use_failed","failed_generation":"<function=x>{}</function>"}}"#,
        );
        assert_eq!(err.error_code().as_deref(), Some("tool_use_failed"));
        assert_eq!(
            err.failed_generation().as_deref(),
            Some("<function=x>{}</function>")
        );
    }

    #[test]
    fn test_failed_generation_absent_for_plain_body() {
        assert!(http(400, "bad request").failed_generation().is_none());
        assert!(InferenceError::Timeout { duration_secs: 1 }
            .failed_generation()
            .is_none());
    }

    #[test]
    fn test_error_body_non_http() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(err.error_body().is_none());
    }
}
