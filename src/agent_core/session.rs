//! Agent session state.
//!
//! A session is owned by the orchestrator's loop for its whole life. The only
//! piece shared with the outside is the `running` flag, which `stop` clears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::inference::fallback::ProviderAttempt;
use crate::inference::types::{Message, ToolInvocation};

/// Where the loop is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Thinking,
    /// Suspended until the carried invocation is approved or denied.
    AwaitingApproval(ToolInvocation),
    ExecutingTool,
    Done,
    Error(String),
    /// Ended by an external stop; results in flight were discarded.
    Stopped,
}

/// Per-session options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct SessionFlags {
    pub smart: bool,
    pub premium: bool,
    /// Overrides the configured agentic mode for this session.
    pub agentic: Option<bool>,
    /// Transcript text merged into the new user turn.
    pub ambient_context: Option<String>,
}

/// One run of the agent loop.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: String,
    pub history: Vec<Message>,
    /// Tool calls actually executed in this session.
    pub action_count: u32,
    pub action_limit: u32,
    pub active_model: String,
    pub pending_approval: Option<ToolInvocation>,
    pub state: SessionState,
    /// Backend attempts made for the most recent model turn.
    pub last_attempts: Vec<ProviderAttempt>,
    running: Arc<AtomicBool>,
}

impl AgentSession {
    pub fn new(
        id: String,
        history: Vec<Message>,
        action_limit: u32,
        active_model: String,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            history,
            action_count: 0,
            action_limit,
            active_model,
            pending_approval: None,
            state: SessionState::Idle,
            last_attempts: Vec::new(),
            running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn transition(&mut self, next: SessionState) {
        tracing::debug!(session_id = %self.id, from = ?self.state, to = ?next, "session state");
        self.pending_approval = match &next {
            SessionState::AwaitingApproval(call) => Some(call.clone()),
            _ => None,
        };
        self.state = next;
    }

    /// Append to history. History is never edited in place.
    pub fn push(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Whether another tool call may be executed.
    pub fn has_action_budget(&self) -> bool {
        self.action_count < self.action_limit
    }

    /// Final assistant text, if the session ended with one.
    pub fn final_reply(&self) -> Option<&Message> {
        self.history
            .last()
            .filter(|m| m.role == crate::inference::types::Role::Assistant && m.tool_calls.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(limit: u32) -> AgentSession {
        AgentSession::new(
            "s1".into(),
            vec![Message::user("hi")],
            limit,
            "model".into(),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn test_pending_approval_tracks_state() {
        let mut s = session(3);
        let call = ToolInvocation::new("c1", "execute_terminal_command", r#"{"command":"ls"}"#);
        s.transition(SessionState::AwaitingApproval(call.clone()));
        assert_eq!(s.pending_approval.as_ref(), Some(&call));

        s.transition(SessionState::ExecutingTool);
        assert!(s.pending_approval.is_none());
    }

    #[test]
    fn test_action_budget() {
        let mut s = session(1);
        assert!(s.has_action_budget());
        s.action_count = 1;
        assert!(!s.has_action_budget());
    }

    #[test]
    fn test_final_reply() {
        let mut s = session(1);
        assert!(s.final_reply().is_none());
        s.push(Message::assistant("done"));
        assert_eq!(s.final_reply(), Some(&Message::assistant("done")));
    }

    #[test]
    fn test_mark_finished_clears_running() {
        let s = session(1);
        assert!(s.is_running());
        s.mark_finished();
        assert!(!s.is_running());
    }
}
