//! The agent loop.
//!
//! ```text
//! Idle → Thinking → ┬─ content ───────────────────────────────→ Done
//!                   └─ tool call → AwaitingApproval ┬─ denied ──→ Thinking
//!                                                   └─ approved → ExecutingTool → Thinking
//! ```
//!
//! Any inference failure that survives the fallback chain ends the session
//! in `Error`. Tool failures never do: they are folded into history as the
//! tool's result so the model can react.
//!
//! One session runs at a time. Starting a new one force-stops the previous
//! one; a stopped loop discards whatever it was waiting on and exits without
//! emitting anything further.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use super::approval::{ApprovalDecision, ApprovalGate};
use super::context::ContextAssembler;
use super::events::{AgentEvent, OnEvent};
use super::session::{AgentSession, SessionFlags, SessionState};
use super::tools::{ToolArguments, ToolExecutor};
use crate::inference::backend::{BackendReply, ModelFlags};
use crate::inference::config::AgentConfig;
use crate::inference::fallback::{FallbackChain, ProviderRegistry};
use crate::inference::types::{history_has_image, Message, ToolInvocation};

/// Tool result recorded when the user rejects a call.
pub const DENIAL_TEXT: &str = "User denied this action.";

/// Notice emitted when an approved call would exceed the action limit.
pub const MAX_ACTIONS_NOTICE: &str = "⚠️ Maximum consecutive actions reached. Stopping.";

/// Assistant text used when the model returns an empty reply.
pub const EMPTY_REPLY: &str = "No response.";

/// Prefix that marks a tool result as a failure.
pub const TOOL_ERROR_PREFIX: &str = "Error: ";

/// Handle on the session currently running, for stop/approve calls.
struct ActiveSession {
    id: String,
    running: Arc<AtomicBool>,
    gate: Arc<ApprovalGate>,
}

/// Drives sessions against the provider registry and the tool executor.
///
/// Shared behind an `Arc`: `start_session` runs the loop to completion on
/// the caller's task while `stop_session` / `resolve_approval` are called
/// from elsewhere.
pub struct AgentOrchestrator {
    registry: ProviderRegistry,
    executor: Arc<dyn ToolExecutor>,
    config: AgentConfig,
    on_event: Arc<OnEvent>,
    current: Mutex<Option<ActiveSession>>,
}

impl AgentOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        executor: Arc<dyn ToolExecutor>,
        config: AgentConfig,
        on_event: Arc<OnEvent>,
    ) -> Self {
        Self {
            registry,
            executor,
            config,
            on_event,
            current: Mutex::new(None),
        }
    }

    // ─── Boundary calls ──────────────────────────────────────────────────

    /// Run a session to completion and return its final state.
    ///
    /// The trailing user message in `initial` is the new turn. Any session
    /// still running is stopped first.
    pub async fn start_session(&self, initial: Vec<Message>, flags: SessionFlags) -> AgentSession {
        let agentic = flags.agentic.unwrap_or(self.config.agentic_mode);
        let assembler = ContextAssembler::new(agentic, self.config.custom_prompt.clone());
        let history = assembler.prepare_session(initial, flags.ambient_context.as_deref());

        let primary = self.registry.select(
            &history,
            ModelFlags {
                smart: flags.smart,
                premium: flags.premium,
            },
        );
        let chain = self.registry.chain_for(&primary, history_has_image(&history));

        let id = format!("session_{}", Uuid::new_v4());
        let running = Arc::new(AtomicBool::new(true));
        let gate = Arc::new(ApprovalGate::new());
        // Swap under one lock so concurrent starts always see each other.
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            current.replace(ActiveSession {
                id: id.clone(),
                running: running.clone(),
                gate: gate.clone(),
            })
        };
        if let Some(previous) = previous {
            self.retire(previous);
        }

        let mut session = AgentSession::new(
            id.clone(),
            history,
            self.config.action_limit,
            primary.model.clone(),
            running,
        );

        tracing::info!(
            session_id = %id,
            provider = %primary.provider,
            model = %primary.model,
            agentic,
            action_limit = session.action_limit,
            "agent session started"
        );
        self.emit(AgentEvent::Started {
            session_id: id.clone(),
            model: primary.model.clone(),
        });

        self.run_loop(&mut session, &assembler, &chain, &gate).await;

        session.mark_finished();
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_ref().is_some_and(|a| a.id == id) {
                *current = None;
            }
        }

        // An external stop already announced itself.
        if session.state != SessionState::Stopped {
            self.emit(AgentEvent::Stopped { session_id: id.clone() });
        }

        tracing::info!(
            session_id = %id,
            state = ?session.state,
            actions = session.action_count,
            messages = session.history.len(),
            "agent session finished"
        );
        session
    }

    /// Stop the running session, if any. In-flight results are discarded.
    pub fn stop_session(&self) -> bool {
        let active = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            current.take()
        };
        match active {
            Some(active) => {
                self.retire(active);
                true
            }
            None => false,
        }
    }

    /// Clear a session's running flag, wake its approval waiter and announce the stop.
    fn retire(&self, active: ActiveSession) {
        active.running.store(false, Ordering::SeqCst);
        if let Some(pending) = active.gate.cancel() {
            tracing::info!(session_id = %active.id, invocation = %pending, "discarded pending approval");
        }
        tracing::info!(session_id = %active.id, "agent session stopped");
        self.emit(AgentEvent::Stopped {
            session_id: active.id,
        });
    }

    /// Approve or deny the pending call. Stale or unknown ids are ignored.
    pub fn resolve_approval(&self, invocation_id: &str, approved: bool) -> bool {
        let gate = {
            let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            current.as_ref().map(|a| a.gate.clone())
        };
        match gate {
            Some(gate) => gate.resolve(invocation_id, ApprovalDecision::from(approved)),
            None => {
                tracing::warn!(invocation = %invocation_id, "approval with no running session, ignoring");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current
            .as_ref()
            .is_some_and(|a| a.running.load(Ordering::SeqCst))
    }

    /// Id of the tool call awaiting approval in the running session.
    pub fn pending_approval(&self) -> Option<String> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().and_then(|a| a.gate.pending_id())
    }

    // ─── Loop ────────────────────────────────────────────────────────────

    async fn run_loop(
        &self,
        session: &mut AgentSession,
        assembler: &ContextAssembler,
        chain: &FallbackChain,
        gate: &ApprovalGate,
    ) {
        let tools = assembler.tool_schemas();

        loop {
            if !session.is_running() {
                session.transition(SessionState::Stopped);
                return;
            }

            session.transition(SessionState::Thinking);
            self.emit(AgentEvent::Thinking {
                session_id: session.id.clone(),
            });

            let outcome = chain.complete(&session.history, tools.as_deref()).await;

            if !session.is_running() {
                tracing::info!(session_id = %session.id, "session stopped while thinking, discarding reply");
                session.transition(SessionState::Stopped);
                return;
            }

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "inference failed");
                    self.emit(AgentEvent::Error {
                        session_id: session.id.clone(),
                        message: e.to_string(),
                    });
                    session.transition(SessionState::Error(e.to_string()));
                    return;
                }
            };
            session.last_attempts = outcome.attempts;

            let flow = match outcome.reply {
                BackendReply::Content(text) => {
                    self.finish_with_reply(session, text);
                    ControlFlow::Break(())
                }
                BackendReply::ToolCall(invocation) if !assembler.is_agentic() => {
                    tracing::warn!(tool = %invocation.name, "tool call in chat mode, not executing");
                    self.record_tool_result(
                        session,
                        invocation,
                        format!("{TOOL_ERROR_PREFIX}tools are disabled in chat mode. Answer in plain text."),
                    );
                    ControlFlow::Continue(())
                }
                BackendReply::ToolCall(invocation) => {
                    self.handle_tool_call(session, gate, invocation).await
                }
            };

            if flow.is_break() {
                return;
            }
        }
    }

    fn finish_with_reply(&self, session: &mut AgentSession, text: String) {
        let text = if text.trim().is_empty() {
            EMPTY_REPLY.to_string()
        } else {
            text
        };
        session.push(Message::assistant(text.clone()));
        self.emit_feed_update(session);
        self.emit(AgentEvent::Message {
            session_id: session.id.clone(),
            text,
        });
        session.transition(SessionState::Done);
    }

    async fn handle_tool_call(
        &self,
        session: &mut AgentSession,
        gate: &ApprovalGate,
        invocation: ToolInvocation,
    ) -> ControlFlow<()> {
        let arguments = match ToolArguments::from_invocation(&invocation) {
            Ok(arguments) => arguments,
            Err(e) => {
                tracing::warn!(tool = %invocation.name, error = %e, "malformed tool call, not executing");
                self.record_tool_result(
                    session,
                    invocation,
                    format!("{TOOL_ERROR_PREFIX}invalid arguments: {e}"),
                );
                return ControlFlow::Continue(());
            }
        };

        let receiver = match gate.request(&invocation.id) {
            Ok(receiver) => receiver,
            Err(e) => {
                self.emit(AgentEvent::Error {
                    session_id: session.id.clone(),
                    message: e.to_string(),
                });
                session.transition(SessionState::Error(e.to_string()));
                return ControlFlow::Break(());
            }
        };

        session.transition(SessionState::AwaitingApproval(invocation.clone()));
        self.emit(AgentEvent::RequestApproval {
            session_id: session.id.clone(),
            invocation_id: invocation.id.clone(),
            tool_name: invocation.name.clone(),
            tool_args: invocation.parsed_arguments.clone().unwrap_or(Value::Null),
        });

        let decision = receiver.await;

        if !session.is_running() {
            session.transition(SessionState::Stopped);
            return ControlFlow::Break(());
        }

        match decision {
            Err(_) => {
                session.transition(SessionState::Stopped);
                ControlFlow::Break(())
            }
            Ok(ApprovalDecision::Denied) => {
                tracing::info!(tool = %invocation.name, "tool call denied by user");
                self.record_tool_result(session, invocation, DENIAL_TEXT.to_string());
                ControlFlow::Continue(())
            }
            Ok(ApprovalDecision::Approved) => self.execute(session, invocation, arguments).await,
        }
    }

    async fn execute(
        &self,
        session: &mut AgentSession,
        invocation: ToolInvocation,
        arguments: ToolArguments,
    ) -> ControlFlow<()> {
        if !session.has_action_budget() {
            tracing::warn!(
                session_id = %session.id,
                limit = session.action_limit,
                "action limit reached, not executing"
            );
            self.emit(AgentEvent::Message {
                session_id: session.id.clone(),
                text: MAX_ACTIONS_NOTICE.to_string(),
            });
            session.transition(SessionState::Done);
            return ControlFlow::Break(());
        }

        session.action_count += 1;
        session.transition(SessionState::ExecutingTool);
        self.emit(AgentEvent::Status {
            session_id: session.id.clone(),
            text: format!("Executing {}...", invocation.name),
        });

        let result = self.executor.run(&arguments).await;

        if !session.is_running() {
            tracing::info!(session_id = %session.id, "session stopped during tool execution, discarding result");
            session.transition(SessionState::Stopped);
            return ControlFlow::Break(());
        }

        let text = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = %invocation.name, error = %e, "tool execution failed");
                format!("{TOOL_ERROR_PREFIX}{e:#}")
            }
        };
        self.record_tool_result(session, invocation, text);
        ControlFlow::Continue(())
    }

    /// Append the call and its single result message.
    fn record_tool_result(&self, session: &mut AgentSession, invocation: ToolInvocation, text: String) {
        let id = invocation.id.clone();
        session.push(Message::assistant_tool_call(invocation));
        session.push(Message::tool_result(id, text));
        self.emit_feed_update(session);
    }

    fn emit_feed_update(&self, session: &AgentSession) {
        self.emit(AgentEvent::FeedUpdate {
            session_id: session.id.clone(),
            message_count: session.history.len(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        (self.on_event)(event);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::{mpsc, Barrier, Notify, Semaphore};

    use super::*;
    use crate::agent_core::tools::testing::RecordingExecutor;
    use crate::inference::backend::testing::ScriptedBackend;
    use crate::inference::backend::{Completion, ModelBackend};
    use crate::inference::config::ModelsConfig;
    use crate::inference::errors::InferenceError;
    use crate::inference::types::{Role, ToolDefinition};

    struct Harness {
        orchestrator: Arc<AgentOrchestrator>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        executor: Arc<RecordingExecutor>,
    }

    fn harness(backend: Arc<dyn ModelBackend>, executor: RecordingExecutor, action_limit: u32) -> Harness {
        let mut backends: HashMap<String, Arc<dyn ModelBackend>> = HashMap::new();
        backends.insert("groq".into(), backend);
        let mut selection = ModelsConfig::builtin().models;
        selection.secondary = None;
        selection.premium = selection.default.clone();
        let registry = ProviderRegistry::new(backends, selection, None);

        let (tx, rx) = mpsc::unbounded_channel();
        let on_event: Arc<OnEvent> = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let executor = Arc::new(executor);
        let config = AgentConfig {
            action_limit,
            agentic_mode: true,
            custom_prompt: None,
        };
        Harness {
            orchestrator: Arc::new(AgentOrchestrator::new(registry, executor.clone(), config, on_event)),
            events: rx,
            executor,
        }
    }

    /// Run a session, answering approval requests from `decisions` in order.
    async fn run(h: &mut Harness, prompt: &str, decisions: Vec<bool>) -> (AgentSession, Vec<AgentEvent>) {
        let orchestrator = h.orchestrator.clone();
        let initial = vec![Message::user(prompt)];
        let task = tokio::spawn(async move {
            orchestrator
                .start_session(initial, SessionFlags::default())
                .await
        });

        let mut decisions = decisions.into_iter();
        let mut events = Vec::new();
        while let Some(event) = h.events.recv().await {
            if let AgentEvent::RequestApproval { invocation_id, .. } = &event {
                let approved = decisions.next().unwrap_or(false);
                assert!(h.orchestrator.resolve_approval(invocation_id, approved));
            }
            let stopped = matches!(event, AgentEvent::Stopped { .. });
            events.push(event);
            if stopped {
                break;
            }
        }
        (task.await.unwrap(), events)
    }

    fn approvals(events: &[AgentEvent]) -> Vec<(String, Value)> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::RequestApproval { tool_name, tool_args, .. } => {
                    Some((tool_name.clone(), tool_args.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_list_files_end_to_end() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_tool("call_1", "execute_terminal_command", r#"{"command":"ls"}"#)
                .then_text("The folder has a.txt and b.txt."),
        );
        let executor = RecordingExecutor::returning(vec![Ok("a.txt\nb.txt".into())]);
        let mut h = harness(backend.clone(), executor, 10);

        let (session, events) = run(&mut h, "list files in this folder", vec![true]).await;

        assert_eq!(session.state, SessionState::Done);
        assert_eq!(session.action_count, 1);
        assert_eq!(
            approvals(&events),
            vec![("execute_terminal_command".to_string(), serde_json::json!({"command": "ls"}))]
        );
        assert_eq!(
            *h.executor.calls.lock().unwrap(),
            vec![ToolArguments::ExecuteTerminalCommand { command: "ls".into() }]
        );

        // system, user, assistant(tool call), tool result, assistant text
        let roles: Vec<Role> = session.history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(session.history[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(session.history[3].content.text(), "a.txt\nb.txt");

        // The second model turn saw the tool result.
        let second = backend.messages_at(1);
        assert_eq!(second.last().map(|m| m.content.text()), Some("a.txt\nb.txt".to_string()));

        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Status { text, .. } if text == "Executing execute_terminal_command..."
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Message { text, .. } if text == "The folder has a.txt and b.txt."
        )));
        assert!(matches!(events.first(), Some(AgentEvent::Started { .. })));
        assert!(matches!(events.last(), Some(AgentEvent::Stopped { .. })));
    }

    #[tokio::test]
    async fn test_denied_navigation_is_fed_back() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_tool("call_nav", "browser_action", r#"{"action":"navigate","url":"https://example.com"}"#)
                .then_text("Understood, I won't open that page."),
        );
        let mut h = harness(backend.clone(), RecordingExecutor::default(), 10);

        let (session, _) = run(&mut h, "open example.com", vec![false]).await;

        assert_eq!(session.state, SessionState::Done);
        assert_eq!(session.action_count, 0);
        assert_eq!(h.executor.call_count(), 0);
        assert_eq!(session.history[2].tool_calls.as_ref().map(Vec::len), Some(1));
        assert_eq!(session.history[3], Message::tool_result("call_nav", DENIAL_TEXT));

        // The system prompt the model saw tells it not to repeat a denied action.
        let second = backend.messages_at(1);
        assert!(second[0].content.text().contains("do not propose the same action again"));
        assert_eq!(second.last().map(|m| m.content.text()), Some(DENIAL_TEXT.to_string()));
    }

    #[tokio::test]
    async fn test_action_limit_stops_before_executing() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_tool("c1", "execute_terminal_command", r#"{"command":"echo 1"}"#)
                .then_tool("c2", "execute_terminal_command", r#"{"command":"echo 2"}"#)
                .then_tool("c3", "execute_terminal_command", r#"{"command":"echo 3"}"#),
        );
        let mut h = harness(backend, RecordingExecutor::default(), 2);

        let (session, events) = run(&mut h, "count", vec![true, true, true]).await;

        assert_eq!(session.state, SessionState::Done);
        assert_eq!(session.action_count, 2);
        assert_eq!(h.executor.call_count(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Message { text, .. } if text == MAX_ACTIONS_NOTICE
        )));
        // The over-budget call is never recorded, so every call in history has a result.
        let calls = session.history.iter().filter(|m| m.tool_calls.is_some()).count();
        let results = session.history.iter().filter(|m| m.role == Role::Tool).count();
        assert_eq!((calls, results), (2, 2));
    }

    #[tokio::test]
    async fn test_execution_failure_becomes_tool_result() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_tool("c1", "execute_terminal_command", r#"{"command":"false"}"#)
                .then_text("The command failed."),
        );
        let executor = RecordingExecutor::returning(vec![Err(anyhow::anyhow!("exit status 1"))]);
        let mut h = harness(backend, executor, 10);

        let (session, _) = run(&mut h, "run false", vec![true]).await;

        assert_eq!(session.state, SessionState::Done);
        assert_eq!(session.history[3].content.text(), "Error: exit status 1");
    }

    #[tokio::test]
    async fn test_malformed_arguments_not_executed_or_proposed() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_tool("c1", "execute_terminal_command", r#"{"command": "#)
                .then_text("Sorry, let me answer directly."),
        );
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let (session, events) = run(&mut h, "do it", vec![]).await;

        assert!(approvals(&events).is_empty());
        assert_eq!(h.executor.call_count(), 0);
        assert!(session.history[3].content.text().starts_with("Error: invalid arguments"));
        assert_eq!(session.state, SessionState::Done);
    }

    #[tokio::test]
    async fn test_recovered_text_tool_call_goes_through_approval() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_text(r#"<function=execute_terminal_command>{"command":"pwd"}</function>"#)
                .then_text("You are in /home."),
        );
        let executor = RecordingExecutor::returning(vec![Ok("/home".into())]);
        let mut h = harness(backend, executor, 10);

        let (session, events) = run(&mut h, "where am I", vec![true]).await;

        assert_eq!(approvals(&events)[0].0, "execute_terminal_command");
        assert!(session.history[2].tool_calls.as_ref().unwrap()[0].id.starts_with("call_rec_tag_"));
        assert_eq!(session.state, SessionState::Done);
    }

    #[tokio::test]
    async fn test_empty_reply_becomes_placeholder() {
        let backend = Arc::new(ScriptedBackend::new("groq").then(Ok(Completion::default())));
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let (session, _) = run(&mut h, "hello", vec![]).await;
        assert_eq!(session.final_reply(), Some(&Message::assistant(EMPTY_REPLY)));
    }

    #[tokio::test]
    async fn test_transport_failure_ends_session_with_error() {
        let backend = Arc::new(ScriptedBackend::new("groq").then_status(500));
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let (session, events) = run(&mut h, "hello", vec![]).await;

        assert!(matches!(session.state, SessionState::Error(_)));
        let errors = events.iter().filter(|e| matches!(e, AgentEvent::Error { .. })).count();
        assert_eq!(errors, 1);
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_stale_deny_after_session_advanced_is_noop() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_tool("c1", "execute_terminal_command", r#"{"command":"ls"}"#)
                .then_text("done"),
        );
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let (session, _) = run(&mut h, "ls", vec![false]).await;
        let len = session.history.len();

        assert!(!h.orchestrator.resolve_approval("c1", false));
        assert!(!h.orchestrator.resolve_approval("c1", false));
        assert_eq!(session.history.len(), len);
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_approval() {
        let backend = Arc::new(
            ScriptedBackend::new("groq").then_tool("c1", "execute_terminal_command", r#"{"command":"ls"}"#),
        );
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .start_session(vec![Message::user("ls")], SessionFlags::default())
                .await
        });

        let mut stops = 0;
        while let Some(event) = h.events.recv().await {
            match event {
                AgentEvent::RequestApproval { .. } => {
                    assert_eq!(h.orchestrator.pending_approval().as_deref(), Some("c1"));
                    assert!(h.orchestrator.stop_session());
                }
                AgentEvent::Stopped { .. } => {
                    stops += 1;
                    break;
                }
                AgentEvent::Message { .. } => panic!("stopped session must not emit messages"),
                _ => {}
            }
        }

        let session = task.await.unwrap();
        assert_eq!(stops, 1);
        assert_eq!(session.state, SessionState::Stopped);
        assert_eq!(session.history.len(), 2, "nothing appended after the stop");
        assert_eq!(h.executor.call_count(), 0);
        assert!(!h.orchestrator.resolve_approval("c1", true));
        assert!(h.events.try_recv().is_err(), "no events after the stop");
    }

    /// Blocks every call until released.
    struct HeldBackend {
        release: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl ModelBackend for HeldBackend {
        fn provider(&self) -> &str {
            "groq"
        }

        async fn send(
            &self,
            _messages: &[Message],
            _model: &str,
            _tools: Option<&[ToolDefinition]>,
        ) -> Result<Completion, InferenceError> {
            self.release.notified().await;
            Ok(Completion::text("late reply"))
        }
    }

    /// Holds every call until permits are added.
    struct PermitBackend {
        permits: Arc<Semaphore>,
    }

    #[async_trait::async_trait]
    impl ModelBackend for PermitBackend {
        fn provider(&self) -> &str {
            "groq"
        }

        async fn send(
            &self,
            _messages: &[Message],
            _model: &str,
            _tools: Option<&[ToolDefinition]>,
        ) -> Result<Completion, InferenceError> {
            let _permit = self.permits.acquire().await.map_err(|e| InferenceError::ConnectionFailed {
                endpoint: "test".into(),
                reason: e.to_string(),
            })?;
            Ok(Completion::text("late reply"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_leave_no_orphaned_session() {
        const STARTS: usize = 8;
        let permits = Arc::new(Semaphore::new(0));
        let backend = Arc::new(PermitBackend {
            permits: permits.clone(),
        });
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let barrier = Arc::new(Barrier::new(STARTS));
        let tasks: Vec<_> = (0..STARTS)
            .map(|i| {
                let orchestrator = h.orchestrator.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    orchestrator
                        .start_session(vec![Message::user(format!("start {i}"))], SessionFlags::default())
                        .await
                })
            })
            .collect();

        let mut started = 0;
        while started < STARTS {
            match h.events.recv().await {
                Some(AgentEvent::Started { .. }) => started += 1,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }

        // Exactly one session is reachable; stopping it must leave nothing running.
        assert!(h.orchestrator.is_running());
        assert!(h.orchestrator.stop_session());
        assert!(!h.orchestrator.is_running());
        assert!(!h.orchestrator.stop_session());

        permits.add_permits(STARTS);
        for task in tasks {
            let session = task.await.unwrap();
            assert_eq!(session.state, SessionState::Stopped, "session {} kept running", session.id);
            assert!(session.final_reply().is_none());
        }
    }

    #[tokio::test]
    async fn test_reply_discarded_when_stopped_mid_think() {
        let release = Arc::new(Notify::new());
        let backend = Arc::new(HeldBackend {
            release: release.clone(),
        });
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .start_session(vec![Message::user("hi")], SessionFlags::default())
                .await
        });

        while let Some(event) = h.events.recv().await {
            if matches!(event, AgentEvent::Thinking { .. }) {
                break;
            }
        }
        assert!(h.orchestrator.stop_session());
        release.notify_one();

        let session = task.await.unwrap();
        assert_eq!(session.state, SessionState::Stopped);
        assert!(session.final_reply().is_none());

        let mut rest = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            rest.push(event);
        }
        assert!(rest.iter().all(|e| !matches!(e, AgentEvent::Message { .. })));
    }

    #[tokio::test]
    async fn test_new_session_force_stops_previous() {
        let backend = Arc::new(
            ScriptedBackend::new("groq")
                .then_tool("c1", "execute_terminal_command", r#"{"command":"ls"}"#)
                .then_text("second session reply"),
        );
        let mut h = harness(backend, RecordingExecutor::default(), 10);

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .start_session(vec![Message::user("first")], SessionFlags::default())
                    .await
            })
        };

        let first_id = loop {
            match h.events.recv().await {
                Some(AgentEvent::RequestApproval { session_id, .. }) => break session_id,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        };

        let second = h
            .orchestrator
            .start_session(vec![Message::user("second")], SessionFlags::default())
            .await;
        let first = first.await.unwrap();

        assert_eq!(first.id, first_id);
        assert_eq!(first.state, SessionState::Stopped);
        assert_eq!(second.state, SessionState::Done);
        assert_ne!(second.id, first.id);
        // The first session's history never saw the second session's turns.
        assert!(first.history.iter().all(|m| m.content.text() != "second"));
        assert_eq!(second.final_reply(), Some(&Message::assistant("second session reply")));
    }

    #[tokio::test]
    async fn test_chat_mode_sends_no_tools_and_ends_on_reply() {
        let backend = Arc::new(ScriptedBackend::new("groq").then_text("Paris."));
        let mut h = harness(backend.clone(), RecordingExecutor::default(), 10);

        let orchestrator = h.orchestrator.clone();
        let flags = SessionFlags {
            agentic: Some(false),
            ambient_context: Some("they mentioned France".into()),
            ..SessionFlags::default()
        };
        let session = orchestrator
            .start_session(vec![Message::user("capital?")], flags)
            .await;

        assert_eq!(session.state, SessionState::Done);
        let sent = backend.messages_at(0);
        assert!(!sent[0].content.text().contains("execute_terminal_command"));
        assert_eq!(
            sent[1].content.text(),
            "capital?\n\n[Context from Audio Transcript]: they mentioned France"
        );
        while h.events.try_recv().is_ok() {}
    }
}
