//! Session lifecycle notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One-way notifications emitted by the orchestrator.
///
/// Emitted synchronously through the `OnEvent` callback; handlers should be
/// fast (forward to a channel) so they don't stall the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A session began with the given primary model.
    Started { session_id: String, model: String },

    /// A model call is in flight.
    Thinking { session_id: String },

    /// Final assistant text for the turn (or a notice from the loop itself).
    Message { session_id: String, text: String },

    /// The loop is suspended until `invocation_id` is approved or denied.
    RequestApproval {
        session_id: String,
        invocation_id: String,
        tool_name: String,
        tool_args: Value,
    },

    /// Progress text, e.g. `Executing execute_terminal_command...`.
    Status { session_id: String, text: String },

    /// History grew; carries the new length.
    FeedUpdate { session_id: String, message_count: usize },

    /// The session ended because of an unrecoverable error.
    Error { session_id: String, message: String },

    /// The session is no longer running.
    Stopped { session_id: String },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            AgentEvent::Started { session_id, .. }
            | AgentEvent::Thinking { session_id }
            | AgentEvent::Message { session_id, .. }
            | AgentEvent::RequestApproval { session_id, .. }
            | AgentEvent::Status { session_id, .. }
            | AgentEvent::FeedUpdate { session_id, .. }
            | AgentEvent::Error { session_id, .. }
            | AgentEvent::Stopped { session_id } => session_id,
        }
    }
}

/// Event callback.
pub type OnEvent = dyn Fn(AgentEvent) + Send + Sync;
