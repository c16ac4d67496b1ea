//! Inference layer: everything between the agent loop and a model.
//!
//! - Provider/model configuration loading from `overlay-agent.yaml`
//! - The `ModelBackend` seam and the OpenAI-compatible HTTP backend
//! - Tool-call recovery from unstructured output
//! - The provider fallback chain, ending in a lazily started local runtime
//!
//! Hosted providers all speak the OpenAI Chat Completions API, so switching
//! models or providers is a config change, not a code change.

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod local;
pub mod recovery;
pub mod types;

pub use backend::{select_model, BackendReply, Completion, ModelBackend, ModelFlags};
pub use client::HttpBackend;
pub use config::{ModelRef, ModelSelection, ModelsConfig};
pub use errors::InferenceError;
pub use fallback::{AttemptOutcome, ChainOutcome, FallbackChain, ProviderAttempt, ProviderRegistry};
pub use recovery::{recover, RecoveryStrategy};
pub use types::{ContentBlock, Message, MessageContent, Role, ToolDefinition, ToolInvocation};
