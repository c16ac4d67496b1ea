//! Approval gate: a single-slot register for the tool call awaiting the user.
//!
//! The orchestrator parks a oneshot sender here and awaits the receiver.
//! `approve`/`deny` match on the invocation id, so a late or duplicate
//! signal for an already-resolved call does nothing.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::errors::AgentError;

/// The user's answer to a proposed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

impl From<bool> for ApprovalDecision {
    fn from(approved: bool) -> Self {
        if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Denied
        }
    }
}

struct PendingApproval {
    invocation_id: String,
    sender: oneshot::Sender<ApprovalDecision>,
}

/// At most one outstanding approval at a time.
#[derive(Default)]
pub struct ApprovalGate {
    slot: Mutex<Option<PendingApproval>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request for `invocation_id`.
    ///
    /// The receiver resolves with the decision, or errors if the request is
    /// cancelled (session stopped) before anyone answers.
    pub fn request(
        &self,
        invocation_id: &str,
    ) -> Result<oneshot::Receiver<ApprovalDecision>, AgentError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(pending) = slot.as_ref() {
            // A dropped receiver means the previous waiter is gone; the slot is reusable.
            if !pending.sender.is_closed() {
                return Err(AgentError::ApprovalPending {
                    invocation_id: pending.invocation_id.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingApproval {
            invocation_id: invocation_id.to_string(),
            sender: tx,
        });
        Ok(rx)
    }

    /// Resolve the pending request if `invocation_id` matches it.
    ///
    /// Returns `false` (and changes nothing) for a stale or unknown id.
    pub fn resolve(&self, invocation_id: &str, decision: ApprovalDecision) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        match slot.as_ref() {
            Some(pending) if pending.invocation_id == invocation_id => {}
            Some(pending) => {
                tracing::warn!(
                    requested = %invocation_id,
                    pending = %pending.invocation_id,
                    "approval for a call that is not pending, ignoring"
                );
                return false;
            }
            None => {
                tracing::warn!(requested = %invocation_id, "no approval pending, ignoring");
                return false;
            }
        }

        let Some(pending) = slot.take() else {
            return false;
        };
        if pending.sender.send(decision).is_err() {
            tracing::warn!(invocation = %invocation_id, "approval waiter already gone");
            return false;
        }
        tracing::info!(invocation = %invocation_id, decision = ?decision, "approval resolved");
        true
    }

    pub fn approve(&self, invocation_id: &str) -> bool {
        self.resolve(invocation_id, ApprovalDecision::Approved)
    }

    pub fn deny(&self, invocation_id: &str) -> bool {
        self.resolve(invocation_id, ApprovalDecision::Denied)
    }

    /// Drop any pending request, waking its waiter with a cancellation.
    pub fn cancel(&self) -> Option<String> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.take().map(|pending| pending.invocation_id)
    }

    /// Id of the call currently awaiting a decision.
    pub fn pending_id(&self) -> Option<String> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|p| !p.sender.is_closed())
            .map(|p| p.invocation_id.clone())
    }
}
