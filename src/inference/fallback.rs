//! Provider fallback chain.
//!
//! An ordered list of hosted tiers (primary, then optionally a smaller model
//! on the same provider) followed by an optional local tier. Each tier is
//! tried at most once per turn:
//!
//! - rate limited / no credentials → advance to the next hosted tier
//! - any other failure → go straight to the local tier if one is configured,
//!   otherwise propagate the error
//! - hosted tiers exhausted → local tier, started lazily with a bounded wait

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::backend::{select_model, BackendReply, ModelBackend, ModelFlags};
use super::client::HttpBackend;
use super::config::{ModelRef, ModelSelection, ModelsConfig};
use super::errors::InferenceError;
use super::local::{ensure_ready, LocalRuntime, OllamaRuntime, ReadinessPolicy};
use super::recovery::{recover, RecoveryStrategy};
use super::types::{history_has_image, Message, ToolDefinition, ToolInvocation};

/// Content returned when the local tier was needed but never came up.
pub const FALLBACK_UNAVAILABLE: &str = "All hosted providers are unavailable right now and the local fallback model could not be started. Please try again shortly.";

// ─── Attempt records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    TransportError,
}

/// One backend call made while serving a turn. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub model: String,
    pub outcome: AttemptOutcome,
    pub recovered_tool_call: Option<ToolInvocation>,
}

/// The reply that ended the turn and how it was obtained.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub reply: BackendReply,
    pub strategy: Option<RecoveryStrategy>,
    pub attempts: Vec<ProviderAttempt>,
}

// ─── Tiers ───────────────────────────────────────────────────────────────────

/// A hosted backend paired with the model to request from it.
#[derive(Clone)]
pub struct Tier {
    pub backend: Arc<dyn ModelBackend>,
    pub model: String,
}

/// The on-device tier. The model depends on whether the history has images.
#[derive(Clone)]
pub struct LocalTier {
    pub backend: Arc<dyn ModelBackend>,
    pub runtime: Arc<dyn LocalRuntime>,
    pub text_model: String,
    pub vision_model: String,
    pub readiness: ReadinessPolicy,
}

/// Ordered hosted tiers plus an optional local tier.
#[derive(Clone)]
pub struct FallbackChain {
    tiers: Vec<Tier>,
    local: Option<LocalTier>,
}

impl FallbackChain {
    pub fn new(tiers: Vec<Tier>, local: Option<LocalTier>) -> Self {
        Self { tiers, local }
    }

    /// Serve one turn.
    pub async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChainOutcome, InferenceError> {
        let mut attempts = Vec::new();

        for tier in &self.tiers {
            let provider = tier.backend.provider().to_string();
            let result = tier.backend.send(messages, &tier.model, tools).await;

            match recover(result) {
                Ok(recovery) => {
                    attempts.push(success_attempt(&provider, &tier.model, &recovery.reply, recovery.strategy));
                    return Ok(ChainOutcome {
                        reply: recovery.reply,
                        strategy: recovery.strategy,
                        attempts,
                    });
                }
                Err(e) if e.is_rate_limited() => {
                    tracing::warn!(
                        provider = %provider,
                        model = %tier.model,
                        error = %e,
                        "provider rate limited or unconfigured, advancing fallback chain"
                    );
                    attempts.push(failed_attempt(&provider, &tier.model, AttemptOutcome::RateLimited));
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %provider,
                        model = %tier.model,
                        error = %e,
                        "provider call failed"
                    );
                    attempts.push(failed_attempt(&provider, &tier.model, AttemptOutcome::TransportError));
                    if self.local.is_none() {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        match &self.local {
            Some(local) => complete_locally(local, messages, tools, attempts).await,
            None => Err(InferenceError::AllModelsUnavailable {
                attempted: attempts
                    .iter()
                    .map(|a| format!("{}/{}", a.provider, a.model))
                    .collect(),
            }),
        }
    }
}

async fn complete_locally(
    local: &LocalTier,
    messages: &[Message],
    tools: Option<&[ToolDefinition]>,
    mut attempts: Vec<ProviderAttempt>,
) -> Result<ChainOutcome, InferenceError> {
    let model = if history_has_image(messages) {
        &local.vision_model
    } else {
        &local.text_model
    };
    let provider = local.backend.provider().to_string();

    if !ensure_ready(local.runtime.as_ref(), local.readiness).await {
        attempts.push(failed_attempt(&provider, model, AttemptOutcome::TransportError));
        return Ok(ChainOutcome {
            reply: BackendReply::Content(FALLBACK_UNAVAILABLE.to_string()),
            strategy: None,
            attempts,
        });
    }

    tracing::info!(model = %model, "using local fallback model");
    let result = local.backend.send(messages, model, tools).await;
    match recover(result) {
        Ok(recovery) => {
            attempts.push(success_attempt(&provider, model, &recovery.reply, recovery.strategy));
            Ok(ChainOutcome {
                reply: recovery.reply,
                strategy: recovery.strategy,
                attempts,
            })
        }
        Err(e) => Err(InferenceError::LocalFallbackFailed {
            reason: e.to_string(),
        }),
    }
}

fn success_attempt(
    provider: &str,
    model: &str,
    reply: &BackendReply,
    strategy: Option<RecoveryStrategy>,
) -> ProviderAttempt {
    let recovered_tool_call = match (reply, strategy) {
        (BackendReply::ToolCall(call), Some(s)) if s != RecoveryStrategy::Structured => {
            Some(call.clone())
        }
        _ => None,
    };
    ProviderAttempt {
        provider: provider.to_string(),
        model: model.to_string(),
        outcome: AttemptOutcome::Success,
        recovered_tool_call,
    }
}

fn failed_attempt(provider: &str, model: &str, outcome: AttemptOutcome) -> ProviderAttempt {
    ProviderAttempt {
        provider: provider.to_string(),
        model: model.to_string(),
        outcome,
        recovered_tool_call: None,
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// All configured backends, and the rules for turning them into a chain.
#[derive(Clone)]
pub struct ProviderRegistry {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
    selection: ModelSelection,
    local: Option<LocalTier>,
}

impl ProviderRegistry {
    pub fn new(
        backends: HashMap<String, Arc<dyn ModelBackend>>,
        selection: ModelSelection,
        local: Option<LocalTier>,
    ) -> Self {
        Self {
            backends,
            selection,
            local,
        }
    }

    /// Build HTTP backends for every provider plus the Ollama local tier.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, InferenceError> {
        let mut backends: HashMap<String, Arc<dyn ModelBackend>> = HashMap::new();
        for (key, provider) in &config.providers {
            if provider.usable_api_key().is_none() {
                tracing::warn!(provider = %key, "no usable API key configured");
            }
            backends.insert(key.clone(), Arc::new(HttpBackend::from_provider(key, provider)?));
        }

        let local = match &config.local_fallback {
            Some(lf) => Some(LocalTier {
                backend: Arc::new(HttpBackend::local(&lf.base_url)?),
                runtime: Arc::new(OllamaRuntime::new(lf)?),
                text_model: lf.text_model.clone(),
                vision_model: lf.vision_model.clone(),
                readiness: ReadinessPolicy::from_config(lf),
            }),
            None => None,
        };

        Ok(Self::new(backends, config.models.clone(), local))
    }

    pub fn select(&self, history: &[Message], flags: ModelFlags) -> ModelRef {
        select_model(history, flags, &self.selection)
    }

    /// Chain for a turn whose first choice is `primary`.
    ///
    /// The secondary model joins only when it lives on the same provider as
    /// the primary, differs from it, and the turn has no image content.
    pub fn chain_for(&self, primary: &ModelRef, has_image: bool) -> FallbackChain {
        let mut tiers = Vec::new();
        match self.backends.get(&primary.provider) {
            Some(backend) => tiers.push(Tier {
                backend: backend.clone(),
                model: primary.model.clone(),
            }),
            None => tracing::warn!(provider = %primary.provider, "no backend for provider"),
        }

        if let Some(secondary) = &self.selection.secondary {
            let eligible = secondary.provider == primary.provider
                && secondary.model != primary.model
                && !has_image;
            if eligible {
                if let Some(backend) = self.backends.get(&secondary.provider) {
                    tiers.push(Tier {
                        backend: backend.clone(),
                        model: secondary.model.clone(),
                    });
                }
            }
        }

        FallbackChain::new(tiers, self.local.clone())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
