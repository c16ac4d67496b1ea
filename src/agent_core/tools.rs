//! The four tools the assistant may propose, and the executor boundary.
//!
//! The core only checks a minimal required-field set per tool before a call
//! reaches the executor. How keystrokes, clicks or page operations are
//! actually performed is the executor's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::errors::ArgumentError;
use crate::inference::types::{FunctionDefinition, ToolDefinition, ToolInvocation};

// ─── Tool names ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ExecuteTerminalCommand,
    BrowserAction,
    KeyboardAction,
    ComputerAction,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::ExecuteTerminalCommand,
        ToolName::BrowserAction,
        ToolName::KeyboardAction,
        ToolName::ComputerAction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ExecuteTerminalCommand => "execute_terminal_command",
            ToolName::BrowserAction => "browser_action",
            ToolName::KeyboardAction => "keyboard_action",
            ToolName::ComputerAction => "computer_action",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::ExecuteTerminalCommand => {
                "Run a single non-interactive shell command on the user's machine and return its output."
            }
            ToolName::BrowserAction => {
                "Control the automation browser: navigate, click, type, scroll, read the page, get the URL, run a script, press a key or close it."
            }
            ToolName::KeyboardAction => {
                "Type text into the frontmost window, or into the named target application."
            }
            ToolName::ComputerAction => {
                "Move or click the mouse, drag, scroll, or query the cursor position and screen size."
            }
        }
    }

    fn parameters(self) -> Value {
        match self {
            ToolName::ExecuteTerminalCommand => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to run."}
                },
                "required": ["command"]
            }),
            ToolName::BrowserAction => json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["navigate", "click", "type", "scroll", "read_page", "get_url", "execute_script", "press_key", "close"]
                    },
                    "url": {"type": "string"},
                    "selector": {"type": "string", "description": "CSS selector of the target element."},
                    "text": {"type": "string"},
                    "key": {"type": "string"},
                    "direction": {"type": "string", "enum": ["up", "down"]},
                    "script": {"type": "string"}
                },
                "required": ["action"]
            }),
            ToolName::KeyboardAction => json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["type"]},
                    "text": {"type": "string"},
                    "target": {"type": "string", "description": "Application to focus first. Defaults to the frontmost window."}
                },
                "required": ["text", "action"]
            }),
            ToolName::ComputerAction => json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["mouse_move", "left_click", "right_click", "double_click", "drag", "scroll", "get_cursor_position", "get_screen_size"]
                    },
                    "coordinate": {
                        "type": "array",
                        "items": {"type": "integer"},
                        "minItems": 2,
                        "maxItems": 2,
                        "description": "[x, y] in screen pixels. Required for mouse_move and drag."
                    },
                    "direction": {"type": "string", "enum": ["up", "down", "left", "right"]}
                },
                "required": ["action"]
            }),
        }
    }
}

/// OpenAI tool schemas for every tool.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    ToolName::ALL
        .into_iter()
        .map(|tool| ToolDefinition {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: tool.as_str().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            },
        })
        .collect()
}

// ─── Typed arguments ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserActionKind {
    Navigate,
    Click,
    Type,
    Scroll,
    ReadPage,
    GetUrl,
    ExecuteScript,
    PressKey,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserArgs {
    pub action: BrowserActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardArgs {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputerActionKind {
    MouseMove,
    LeftClick,
    RightClick,
    DoubleClick,
    Drag,
    Scroll,
    GetCursorPosition,
    GetScreenSize,
}

impl ComputerActionKind {
    fn needs_coordinate(self) -> bool {
        matches!(self, ComputerActionKind::MouseMove | ComputerActionKind::Drag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerArgs {
    pub action: ComputerActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<[i64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// Validated arguments, keyed by tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolArguments {
    ExecuteTerminalCommand { command: String },
    BrowserAction(BrowserArgs),
    KeyboardAction(KeyboardArgs),
    ComputerAction(ComputerArgs),
}

impl ToolArguments {
    pub fn tool(&self) -> ToolName {
        match self {
            ToolArguments::ExecuteTerminalCommand { .. } => ToolName::ExecuteTerminalCommand,
            ToolArguments::BrowserAction(_) => ToolName::BrowserAction,
            ToolArguments::KeyboardAction(_) => ToolName::KeyboardAction,
            ToolArguments::ComputerAction(_) => ToolName::ComputerAction,
        }
    }

    /// Validate a proposed call against its tool's required fields.
    pub fn from_invocation(invocation: &ToolInvocation) -> Result<Self, ArgumentError> {
        let tool = ToolName::from_name(&invocation.name).ok_or_else(|| ArgumentError::UnknownTool {
            name: invocation.name.clone(),
        })?;

        let Some(Value::Object(args)) = &invocation.parsed_arguments else {
            let reason = serde_json::from_str::<Value>(&invocation.raw_arguments)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "expected an object".to_string());
            return Err(ArgumentError::InvalidJson {
                tool: tool.as_str().to_string(),
                reason,
            });
        };

        Self::parse(tool, args)
    }

    pub fn parse(tool: ToolName, args: &Map<String, Value>) -> Result<Self, ArgumentError> {
        match tool {
            ToolName::ExecuteTerminalCommand => {
                let command = required_str(tool, args, "command")?;
                if command.trim().is_empty() {
                    return Err(invalid(tool, "command", "must not be empty"));
                }
                Ok(ToolArguments::ExecuteTerminalCommand {
                    command: command.to_string(),
                })
            }
            ToolName::BrowserAction => {
                required_str(tool, args, "action")?;
                let parsed: BrowserArgs = decode(tool, "action", args)?;
                let needed = match parsed.action {
                    BrowserActionKind::Navigate => Some(("url", &parsed.url)),
                    BrowserActionKind::Click => Some(("selector", &parsed.selector)),
                    BrowserActionKind::Type => Some(("text", &parsed.text)),
                    BrowserActionKind::ExecuteScript => Some(("script", &parsed.script)),
                    BrowserActionKind::PressKey => Some(("key", &parsed.key)),
                    _ => None,
                };
                if let Some((field, None)) = needed {
                    return Err(missing(tool, field));
                }
                Ok(ToolArguments::BrowserAction(parsed))
            }
            ToolName::KeyboardAction => {
                required_str(tool, args, "text")?;
                match args.get("action").and_then(Value::as_str) {
                    None | Some("type") => {}
                    Some(other) => {
                        return Err(invalid(tool, "action", &format!("unsupported action '{other}'")))
                    }
                }
                let parsed: KeyboardArgs = decode(tool, "text", args)?;
                Ok(ToolArguments::KeyboardAction(parsed))
            }
            ToolName::ComputerAction => {
                required_str(tool, args, "action")?;
                let parsed: ComputerArgs = decode(tool, "action", args)?;
                if parsed.action.needs_coordinate() && parsed.coordinate.is_none() {
                    return Err(missing(tool, "coordinate"));
                }
                Ok(ToolArguments::ComputerAction(parsed))
            }
        }
    }
}

fn required_str<'a>(
    tool: ToolName,
    args: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, ArgumentError> {
    match args.get(field) {
        None | Some(Value::Null) => Err(missing(tool, field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(invalid(tool, field, "expected a string")),
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    tool: ToolName,
    field: &str,
    args: &Map<String, Value>,
) -> Result<T, ArgumentError> {
    serde_json::from_value(Value::Object(args.clone())).map_err(|e| invalid(tool, field, &e.to_string()))
}

fn missing(tool: ToolName, field: &str) -> ArgumentError {
    ArgumentError::MissingField {
        tool: tool.as_str().to_string(),
        field: field.to_string(),
    }
}

fn invalid(tool: ToolName, field: &str, reason: &str) -> ArgumentError {
    ArgumentError::InvalidValue {
        tool: tool.as_str().to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─── Executor boundary ───────────────────────────────────────────────────────

/// Performs approved tool calls. Stateless from the core's point of view.
///
/// An `Err` is folded into history as the tool's result text; it never ends
/// the session.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn run(&self, call: &ToolArguments) -> anyhow::Result<String>;
}
