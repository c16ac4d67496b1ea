//! Model backend abstraction and model selection.
//!
//! A `ModelBackend` is a stateless service: it receives the full message
//! list for every call and never keeps conversation state.

use async_trait::async_trait;

use super::config::{ModelRef, ModelSelection};
use super::errors::InferenceError;
use super::types::{history_has_image, Message, ToolDefinition, ToolInvocation};

/// Raw outcome of one chat completion call, before recovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    /// Structured tool calls from the provider's `tool_calls` field.
    pub tool_calls: Vec<ToolInvocation>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(invocation: ToolInvocation) -> Self {
        Self {
            content: None,
            tool_calls: vec![invocation],
        }
    }
}

/// A normalized backend reply: free text or a single tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    Content(String),
    ToolCall(ToolInvocation),
}

/// Uniform interface to a chat completion provider.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider key, used in logs and attempt records.
    fn provider(&self) -> &str;

    /// Send one chat completion request. Must not retain `messages`.
    async fn send(
        &self,
        messages: &[Message],
        model: &str,
        tools: Option<&[ToolDefinition]>,
    ) -> Result<Completion, InferenceError>;
}

/// Caller-supplied selection hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelFlags {
    pub smart: bool,
    pub premium: bool,
}

/// Pick the model for a request.
///
/// Premium wins, then image content forces the vision model, then the smart
/// flag, then the default.
pub fn select_model(history: &[Message], flags: ModelFlags, selection: &ModelSelection) -> ModelRef {
    if flags.premium {
        selection.premium.clone()
    } else if history_has_image(history) {
        selection.vision.clone()
    } else if flags.smart {
        selection.smart.clone()
    } else {
        selection.default.clone()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays a fixed script of results and records every call.
    pub struct ScriptedBackend {
        provider: String,
        script: Mutex<VecDeque<Result<Completion, InferenceError>>>,
        calls: Mutex<Vec<(String, Vec<Message>)>>,
    }

    impl ScriptedBackend {
        pub fn new(provider: &str) -> Self {
            Self {
                provider: provider.to_string(),
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn then(self, result: Result<Completion, InferenceError>) -> Self {
            self.script.lock().unwrap().push_back(result);
            self
        }

        pub fn then_text(self, text: &str) -> Self {
            self.then(Ok(Completion::text(text)))
        }

        pub fn then_tool(self, id: &str, name: &str, args: &str) -> Self {
            self.then(Ok(Completion::tool_call(ToolInvocation::new(id, name, args))))
        }

        pub fn then_status(self, status: u16) -> Self {
            self.then(Err(InferenceError::HttpError {
                status,
                body: String::new(),
            }))
        }

        /// Models requested so far, in call order.
        pub fn models_called(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// Messages passed on the n-th call.
        pub fn messages_at(&self, n: usize) -> Vec<Message> {
            self.calls.lock().unwrap()[n].1.clone()
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn provider(&self) -> &str {
            &self.provider
        }

        async fn send(
            &self,
            messages: &[Message],
            model: &str,
            _tools: Option<&[ToolDefinition]>,
        ) -> Result<Completion, InferenceError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(InferenceError::ConnectionFailed {
                        endpoint: self.provider.clone(),
                        reason: "script exhausted".into(),
                    })
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::ModelsConfig;
    use crate::inference::types::{ContentBlock, MessageContent};

    fn image_history() -> Vec<Message> {
        vec![Message::user(MessageContent::Blocks(vec![
            ContentBlock::Text { text: "what is this".into() },
            ContentBlock::Image { url: "data:image/png;base64,AA".into() },
        ]))]
    }

    #[test]
    fn test_select_default() {
        let selection = ModelsConfig::builtin().models;
        let chosen = select_model(&[Message::user("hi")], ModelFlags::default(), &selection);
        assert_eq!(chosen, selection.default);
    }

    #[test]
    fn test_select_vision_when_image_present() {
        let selection = ModelsConfig::builtin().models;
        let flags = ModelFlags { smart: true, premium: false };
        assert_eq!(select_model(&image_history(), flags, &selection), selection.vision);
    }

    #[test]
    fn test_select_premium_wins() {
        let selection = ModelsConfig::builtin().models;
        let flags = ModelFlags { smart: true, premium: true };
        assert_eq!(select_model(&image_history(), flags, &selection), selection.premium);
    }

    #[test]
    fn test_select_smart() {
        let mut selection = ModelsConfig::builtin().models;
        selection.smart = ModelRef::new("groq", "bigger");
        let flags = ModelFlags { smart: true, premium: false };
        assert_eq!(select_model(&[], flags, &selection).model, "bigger");
    }
}
