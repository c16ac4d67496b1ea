//! Agent Core: the approval-gated agent loop.
//!
//! Submodules:
//! - `context`: System prompt and outbound message assembly, ambient transcript merge
//! - `tools`: The four tool schemas, typed argument parsing, the executor seam
//! - `approval`: Single-slot register for the call awaiting the user
//! - `session`: Session record and state machine
//! - `orchestrator`: The think / approve / execute loop
//! - `events`: Lifecycle events pushed to the UI
//! - `errors`: Agent-level error types

pub mod approval;
pub mod context;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod session;
pub mod tools;

pub use approval::{ApprovalDecision, ApprovalGate};
pub use context::ContextAssembler;
pub use errors::{AgentError, ArgumentError};
pub use events::{AgentEvent, OnEvent};
pub use orchestrator::AgentOrchestrator;
pub use session::{AgentSession, SessionFlags, SessionState};
pub use tools::{ToolArguments, ToolExecutor, ToolName};
