//! Tool-call recovery: reclassifies unstructured model output as a tool call.
//!
//! Some providers occasionally emit a tool call as text instead of the
//! structured `tool_calls` field, or reject the turn outright with the
//! model's raw output attached as a diagnostic. The strategies below are
//! tried in a fixed order and the first one that yields a call wins:
//!
//! 1. **Structured**: the provider already returned a tool call.
//! 2. **FunctionTag**: `<function=NAME>{json}</function>` markup in the text.
//! 3. **BalancedJson**: a bare `{"name": .., "parameters": ..}` object.
//! 4. **FailedGeneration**: the tag markup inside a provider error's
//!    `failed_generation` field.
//!
//! Recovery is pure: it never executes anything, it only reclassifies.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use super::backend::{BackendReply, Completion};
use super::errors::InferenceError;
use super::types::ToolInvocation;

/// Opening marker of the tag form.
const FUNCTION_TAG: &str = "<function=";

/// Closing marker; the trailing `>` is optional in practice.
const FUNCTION_CLOSE: &str = "</function";

/// Disambiguates ids synthesized within the same millisecond.
static RECOVERY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Which rule produced a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Structured,
    FunctionTag,
    BalancedJson,
    FailedGeneration,
}

impl RecoveryStrategy {
    /// Application order. Earlier strategies shadow later ones.
    pub const ORDER: [RecoveryStrategy; 4] = [
        RecoveryStrategy::Structured,
        RecoveryStrategy::FunctionTag,
        RecoveryStrategy::BalancedJson,
        RecoveryStrategy::FailedGeneration,
    ];

    fn id_tag(self) -> &'static str {
        match self {
            RecoveryStrategy::Structured => "structured",
            RecoveryStrategy::FunctionTag => "tag",
            RecoveryStrategy::BalancedJson => "json",
            RecoveryStrategy::FailedGeneration => "failed_gen",
        }
    }

    /// Apply this single strategy.
    pub fn apply(
        self,
        result: &Result<Completion, InferenceError>,
    ) -> Option<ToolInvocation> {
        match (self, result) {
            (RecoveryStrategy::Structured, Ok(c)) => c.tool_calls.first().cloned(),
            (RecoveryStrategy::FunctionTag, Ok(c)) => {
                c.content.as_deref().and_then(|t| recover_function_tag(t, self))
            }
            (RecoveryStrategy::BalancedJson, Ok(c)) => {
                c.content.as_deref().and_then(recover_balanced_json)
            }
            (RecoveryStrategy::FailedGeneration, Err(e)) => {
                e.failed_generation().and_then(|g| recover_failed_generation(&g))
            }
            _ => None,
        }
    }
}

/// A normalized reply plus the strategy that produced its tool call, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub reply: BackendReply,
    pub strategy: Option<RecoveryStrategy>,
}

/// Normalize a raw backend result.
///
/// Returns the original error when it is not recoverable, and plain content
/// (possibly containing unparseable tool markup) when no strategy matches.
pub fn recover(result: Result<Completion, InferenceError>) -> Result<Recovery, InferenceError> {
    for strategy in RecoveryStrategy::ORDER {
        if let Some(invocation) = strategy.apply(&result) {
            if strategy != RecoveryStrategy::Structured {
                tracing::info!(
                    strategy = ?strategy,
                    tool = %invocation.name,
                    "recovered tool call from unstructured output"
                );
            } else if let Ok(c) = &result {
                if c.tool_calls.len() > 1 {
                    tracing::warn!(
                        count = c.tool_calls.len(),
                        "model proposed several tool calls, only the first is used"
                    );
                }
            }
            return Ok(Recovery {
                reply: BackendReply::ToolCall(invocation),
                strategy: Some(strategy),
            });
        }
    }

    let completion = result?;
    Ok(Recovery {
        reply: BackendReply::Content(completion.content.unwrap_or_default()),
        strategy: None,
    })
}

// ─── Strategies ──────────────────────────────────────────────────────────────

/// Recover `<function=NAME ...>BODY</function>` markup.
///
/// The name is cut at the first character that cannot be part of a tool
/// name, which drops trailing quote/colon artifacts. Leading separator junk
/// (`"`, `'`, `:`, `=`, `>`, whitespace) is stripped from the body before
/// parsing. A body that does not parse discards the match.
pub fn recover_function_tag(text: &str, strategy: RecoveryStrategy) -> Option<ToolInvocation> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find(FUNCTION_TAG) {
        let header_start = search_from + rel + FUNCTION_TAG.len();
        search_from = header_start;

        let rest = &text[header_start..];
        let name_len = rest
            .find(|c: char| !is_tool_name_char(c))
            .unwrap_or(rest.len());
        let name = clean_tool_name(&rest[..name_len]);
        if name.is_empty() {
            continue;
        }

        let body = rest[name_len..].trim_start_matches(is_body_prefix_junk);
        let Some(arguments) = parse_tag_body(body) else {
            tracing::debug!(tool = %name, "function tag body did not parse, skipping");
            continue;
        };

        return Some(ToolInvocation::from_value(
            synthesize_id(strategy),
            name,
            arguments,
        ));
    }
    None
}

/// Recover the first balanced `{...}` object that has a `name` and either
/// `parameters` or `arguments`. Objects without those keys are skipped whole.
pub fn recover_balanced_json(text: &str) -> Option<ToolInvocation> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find('{') {
        let start = search_from + rel;
        let Some(end) = find_matching_brace(text, start) else {
            search_from = start + 1;
            continue;
        };

        match serde_json::from_str::<Value>(&text[start..=end]) {
            Ok(candidate) => {
                if let Some(invocation) = promote_json_call(&candidate) {
                    return Some(invocation);
                }
                search_from = end + 1;
            }
            Err(_) => search_from = start + 1,
        }
    }
    None
}

/// Recover the tag form from a provider's `failed_generation` diagnostic.
///
/// Handles the hallucinated `<function=name={...}>` shape by stripping the
/// leading `=` along with the other separator characters.
pub fn recover_failed_generation(diagnostic: &str) -> Option<ToolInvocation> {
    recover_function_tag(diagnostic, RecoveryStrategy::FailedGeneration)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn is_tool_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn is_body_prefix_junk(c: char) -> bool {
    matches!(c, '"' | '\'' | ':' | '=' | '>') || c.is_whitespace()
}

/// Trim trailing quote/colon punctuation from a tool name.
fn clean_tool_name(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| matches!(c, '"' | '\'' | ':' | '.' | '-'))
        .to_string()
}

/// Parse the body of a function tag into an argument object.
fn parse_tag_body(body: &str) -> Option<Value> {
    let candidate = if body.starts_with('{') {
        let end = find_matching_brace(body, 0)?;
        &body[..=end]
    } else {
        let end = body.find(FUNCTION_CLOSE).unwrap_or(body.len());
        body[..end].trim()
    };

    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(Value::is_object)
}

/// Turn `{"name": .., "parameters"|"arguments": ..}` into an invocation.
///
/// `arguments` may itself be a JSON-encoded string, as in the OpenAI wire format.
fn promote_json_call(candidate: &Value) -> Option<ToolInvocation> {
    let name = candidate.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let args = candidate
        .get("parameters")
        .or_else(|| candidate.get("arguments"))?;

    let id = synthesize_id(RecoveryStrategy::BalancedJson);
    match args {
        Value::Object(_) => Some(ToolInvocation::from_value(id, name, args.clone())),
        Value::String(raw) => Some(ToolInvocation::new(id, name, raw.clone())),
        _ => None,
    }
}

/// Find the `}` matching the `{` at `start`, ignoring braces inside JSON strings.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// `call_rec_<tag>_<millis>_<n>`: unique per process without a provider id.
fn synthesize_id(strategy: RecoveryStrategy) -> String {
    let n = RECOVERY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "call_rec_{}_{}_{n}",
        strategy.id_tag(),
        chrono::Utc::now().timestamp_millis()
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
