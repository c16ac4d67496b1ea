//! Terminal driver for the overlay agent.
//!
//! Each plain line starts a new agent session (ending any running one).
//! While a tool call awaits approval, `y` / `n` answers it.
//!
//! Commands: `/stop`, `/new` (forget the conversation), `/context <text>`
//! (ambient transcript for the next prompt), `/quit`.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use overlay_agent::agent_core::{
    AgentEvent, AgentOrchestrator, AgentSession, OnEvent, SessionFlags, SessionState,
};
use overlay_agent::commands::{SettingsStore, ShellExecutor};
use overlay_agent::inference::config::{load_or_builtin, ModelsConfig};
use overlay_agent::inference::{Message, ProviderRegistry, Role};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = overlay_agent::data_dir();
    match overlay_agent::init_tracing(&data_dir) {
        Ok(path) => eprintln!("logging to {}", path.display()),
        Err(e) => eprintln!("logging disabled: {e}"),
    }

    let settings = SettingsStore::open_default();
    let cwd = std::env::current_dir().context("cannot read current directory")?;
    let mut config = load_or_builtin(&cwd, &data_dir).context("failed to load model config")?;
    apply_settings(&mut config, &settings);

    let registry = ProviderRegistry::from_config(&config).context("failed to build providers")?;
    let on_event: Arc<OnEvent> = Arc::new(print_event);
    let orchestrator = Arc::new(AgentOrchestrator::new(
        registry,
        Arc::new(ShellExecutor::default().with_cwd(&cwd)),
        config.agent.clone(),
        on_event,
    ));

    tracing::info!(
        premium = settings.is_premium(),
        agentic = config.agent.agentic_mode,
        "terminal driver ready"
    );
    println!("overlay agent ready. Type a request, /stop, /new, /context <text> or /quit.");

    let mut conversation: Vec<Message> = Vec::new();
    let mut ambient: Option<String> = None;
    let mut running: Option<JoinHandle<AgentSession>> = None;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if matches!(line, "y" | "yes" | "n" | "no") {
            if let Some(id) = orchestrator.pending_approval() {
                let approved = line.starts_with('y');
                orchestrator.resolve_approval(&id, approved);
                continue;
            }
        }

        match line {
            "/quit" | "/exit" => break,
            "/stop" => {
                if !orchestrator.stop_session() {
                    println!("(no session running)");
                }
            }
            "/new" => {
                orchestrator.stop_session();
                conversation.clear();
                println!("(conversation cleared)");
            }
            _ if line.starts_with("/context") => {
                let text = line.trim_start_matches("/context").trim();
                ambient = (!text.is_empty()).then(|| text.to_string());
                println!("(ambient context {})", if ambient.is_some() { "set" } else { "cleared" });
            }
            prompt => {
                orchestrator.stop_session();
                if let Some(previous) = running.take() {
                    absorb(previous, &mut conversation).await;
                }

                let mut initial = conversation.clone();
                initial.push(Message::user(prompt));
                let flags = SessionFlags {
                    premium: settings.is_premium(),
                    ambient_context: ambient.take(),
                    ..SessionFlags::default()
                };
                let orchestrator = orchestrator.clone();
                running = Some(tokio::spawn(async move {
                    orchestrator.start_session(initial, flags).await
                }));
            }
        }
    }

    orchestrator.stop_session();
    if let Some(previous) = running.take() {
        absorb(previous, &mut conversation).await;
    }
    tracing::info!(messages = conversation.len(), "terminal driver exiting");
    Ok(())
}

/// Fold the settings file into the loaded config.
fn apply_settings(config: &mut ModelsConfig, settings: &SettingsStore) {
    if let Some(key) = settings.api_key() {
        let primary = config.models.default.provider.clone();
        if let Some(provider) = config.providers.get_mut(&primary) {
            provider.api_key = Some(key.to_string());
        }
    }
    if let Some(prompt) = settings.custom_prompt() {
        config.agent.custom_prompt = Some(prompt.to_string());
    }
}

/// Keep a finished session's turns as context for the next prompt.
async fn absorb(handle: JoinHandle<AgentSession>, conversation: &mut Vec<Message>) {
    match handle.await {
        Ok(session) if session.state == SessionState::Done => {
            *conversation = session
                .history
                .into_iter()
                .filter(|m| m.role != Role::System)
                .collect();
        }
        Ok(session) => {
            tracing::debug!(session_id = %session.id, state = ?session.state, "session not kept");
        }
        Err(e) => tracing::error!(error = %e, "session task failed"),
    }
}

fn print_event(event: AgentEvent) {
    match event {
        AgentEvent::Started { model, .. } => println!("[{model}]"),
        AgentEvent::Thinking { .. } => println!("..."),
        AgentEvent::Message { text, .. } => println!("\n{text}\n"),
        AgentEvent::RequestApproval {
            tool_name,
            tool_args,
            ..
        } => println!("approve {tool_name} {tool_args}? [y/n]"),
        AgentEvent::Status { text, .. } => println!("{text}"),
        AgentEvent::Error { message, .. } => eprintln!("error: {message}"),
        AgentEvent::FeedUpdate { .. } | AgentEvent::Stopped { .. } => {}
    }
}
