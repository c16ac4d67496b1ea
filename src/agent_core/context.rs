//! Context assembly: builds the outbound message list for a turn.
//!
//! Always exactly one system message, first. Ambient context (a live audio
//! transcript) is folded into the new user message's first text block rather
//! than sent as a separate user turn.

use crate::inference::types::{ContentBlock, Message, MessageContent, Role, ToolDefinition};

use super::tools::{tool_definitions, ToolName};

/// Label placed before ambient transcript text.
pub const AMBIENT_CONTEXT_LABEL: &str = "[Context from Audio Transcript]:";

const BASE_PROMPT: &str = "You are a helpful desktop assistant that lives in an overlay on the user's screen. \
Answer directly and concisely. Use Markdown for structure and LaTeX for math when it helps. \
If the user shares a screenshot, describe or use what is visible in it.";

const AGENTIC_RULES: &str = "You can act on the user's computer with the tools below. \
Every tool call is shown to the user, who approves or denies it before it runs. \
Propose one tool call at a time and wait for its result. \
If the user denies an action, do not propose the same action again; choose a different approach or explain what you would need. \
When the task is complete, reply with a short plain-text summary and no tool call.";

/// Builds outbound message lists. Pure: holds only prompt configuration.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    custom_prompt: Option<String>,
    agentic: bool,
}

impl ContextAssembler {
    pub fn new(agentic: bool, custom_prompt: Option<String>) -> Self {
        Self {
            custom_prompt: custom_prompt.filter(|p| !p.trim().is_empty()),
            agentic,
        }
    }

    pub fn is_agentic(&self) -> bool {
        self.agentic
    }

    /// The fixed system instructions, including the tool section in agentic mode.
    pub fn system_prompt(&self) -> String {
        let mut prompt = BASE_PROMPT.to_string();

        if self.agentic {
            prompt.push_str("\n\n");
            prompt.push_str(AGENTIC_RULES);
            prompt.push_str("\n\nTools:");
            for tool in ToolName::ALL {
                prompt.push_str(&format!("\n- {}: {}", tool.as_str(), tool.description()));
            }
        }

        if let Some(custom) = &self.custom_prompt {
            prompt.push_str("\n\nAdditional instructions from the user:\n");
            prompt.push_str(custom.trim());
        }

        prompt
    }

    /// Tool schemas to send, or `None` in plain chat mode.
    pub fn tool_schemas(&self) -> Option<Vec<ToolDefinition>> {
        self.agentic.then(tool_definitions)
    }

    /// System message + prior turns + the new user turn.
    ///
    /// System messages already present in `history` are dropped so the
    /// result always has exactly one.
    pub fn assemble(
        &self,
        history: &[Message],
        new_user_content: MessageContent,
        ambient_context: Option<&str>,
    ) -> Vec<Message> {
        let mut messages = self.with_system(history);
        messages.push(Message::user(merge_ambient_context(
            new_user_content,
            ambient_context,
        )));
        messages
    }

    /// System message + `history`, without adding a user turn.
    pub fn with_system(&self, history: &[Message]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.system_prompt()));
        messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());
        messages
    }

    /// Build a session's starting history from caller-supplied messages.
    ///
    /// The trailing user message, if any, is treated as the new turn and
    /// receives the ambient context.
    pub fn prepare_session(&self, mut initial: Vec<Message>, ambient_context: Option<&str>) -> Vec<Message> {
        match initial.last() {
            Some(last) if last.role == Role::User => {
                let new_turn = initial.pop().map(|m| m.content).unwrap_or_else(|| MessageContent::Text(String::new()));
                self.assemble(&initial, new_turn, ambient_context)
            }
            _ => self.with_system(&initial),
        }
    }
}

/// Append ambient text to the first text block (or the plain string).
///
/// Content without any text block gets one inserted at the front.
pub fn merge_ambient_context(content: MessageContent, ambient: Option<&str>) -> MessageContent {
    let Some(ambient) = ambient.map(str::trim).filter(|a| !a.is_empty()) else {
        return content;
    };
    let suffix = format!("\n\n{AMBIENT_CONTEXT_LABEL} {ambient}");

    match content {
        MessageContent::Text(text) => MessageContent::Text(text + &suffix),
        MessageContent::Blocks(mut blocks) => {
            let first_text = blocks.iter_mut().find_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Image { .. } => None,
            });
            match first_text {
                Some(text) => text.push_str(&suffix),
                None => blocks.insert(
                    0,
                    ContentBlock::Text {
                        text: suffix.trim_start().to_string(),
                    },
                ),
            }
            MessageContent::Blocks(blocks)
        }
    }
}
