//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model backend (after fallback) failed for this turn.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Tool arguments did not match the tool's schema.
    #[error(transparent)]
    InvalidArguments(#[from] ArgumentError),

    /// A tool call is already awaiting approval.
    #[error("tool call '{invocation_id}' is already awaiting approval")]
    ApprovalPending { invocation_id: String },

    /// Settings file could not be read or written.
    #[error("settings error: {reason}")]
    SettingsError { reason: String },

    /// A value was rejected before being stored.
    #[error("invalid setting '{field}': {reason}")]
    InvalidSetting { field: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

/// Why a proposed tool call could not be turned into typed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    #[error("arguments for '{tool}' are not a JSON object: {reason}")]
    InvalidJson { tool: String, reason: String },

    #[error("'{tool}' requires field '{field}'")]
    MissingField { tool: String, field: String },

    #[error("invalid '{field}' for '{tool}': {reason}")]
    InvalidValue {
        tool: String,
        field: String,
        reason: String,
    },
}
