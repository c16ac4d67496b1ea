//! Shared types for the inference layer.
//!
//! `Message` and friends are the conversation model the agent loop owns.
//! The `Chat*` types mirror the OpenAI Chat Completions API and are only
//! built at the HTTP boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Conversation Types ──────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One block of multimodal user content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { url: String },
}

/// Message content: either plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn has_image(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::Image { .. })),
        }
    }

    /// All text in the content, blocks joined by newlines. Images are skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

/// A tool call proposed by the model.
///
/// `raw_arguments` is kept exactly as received; `parsed_arguments` is only
/// set when the raw string decodes to a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
    pub parsed_arguments: Option<Value>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        let raw_arguments = raw_arguments.into();
        let parsed_arguments = serde_json::from_str::<Value>(&raw_arguments)
            .ok()
            .filter(Value::is_object);
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments,
            parsed_arguments,
        }
    }

    /// Build from an already-decoded argument value.
    pub fn from_value(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let raw_arguments = arguments.to_string();
        let parsed_arguments = arguments.is_object().then_some(arguments);
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments,
            parsed_arguments,
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolInvocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// An assistant turn that proposes a single tool call.
    pub fn assistant_tool_call(invocation: ToolInvocation) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(String::new()),
            tool_calls: Some(vec![invocation]),
            tool_call_id: None,
        }
    }

    /// The result (or denial/error text) for a previous tool call.
    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_image(&self) -> bool {
        self.content.has_image()
    }
}

/// Whether any message in the history carries image content.
pub fn history_has_image(messages: &[Message]) -> bool {
    messages.iter().any(Message::has_image)
}

// ─── Request Types ───────────────────────────────────────────────────────────

/// A single message in the OpenAI wire format.
///
/// `content` is emitted as `""` rather than `null` for assistant tool-call
/// turns; several OpenAI-compatible runtimes reject `null` there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

fn serialize_content<S>(value: &Option<WireContent>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(content) => content.serialize(serializer),
        None => serializer.serialize_str(""),
    }
}

/// Wire content: a string, or typed parts for multimodal turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        let content = match &message.content {
            MessageContent::Text(s) if s.is_empty() && message.tool_calls.is_some() => None,
            MessageContent::Text(s) => Some(WireContent::Text(s.clone())),
            MessageContent::Blocks(blocks) => Some(WireContent::Parts(
                blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => ContentPart::Text { text: text.clone() },
                        ContentBlock::Image { url } => ContentPart::ImageUrl {
                            image_url: ImageUrl { url: url.clone() },
                        },
                    })
                    .collect(),
            )),
        };

        let tool_calls = message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|call| ToolCallResponse {
                    id: call.id.clone(),
                    r#type: "function".to_string(),
                    function: FunctionCallResponse {
                        name: call.name.clone(),
                        arguments: call.raw_arguments.clone(),
                    },
                })
                .collect()
        });

        Self {
            role: message.role,
            content,
            tool_call_id: message.tool_call_id.clone(),
            tool_calls,
        }
    }
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

/// Function definition within a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Request body for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// Tool call as returned in the OpenAI response format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
