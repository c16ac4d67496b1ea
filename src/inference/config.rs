//! Provider and model configuration loading.
//!
//! Reads `overlay-agent.yaml` (or the file named by `OVERLAY_AGENT_CONFIG`)
//! and resolves environment variables. When no file exists the built-in
//! defaults are used, so a fresh install only needs an API key in the
//! environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;

/// File name searched for when walking upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "overlay-agent.yaml";

/// Env var that pins the config file location.
pub const CONFIG_ENV_VAR: &str = "OVERLAY_AGENT_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// One hosted, OpenAI-compatible chat completions provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub display_name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Keys not starting with this prefix are treated as absent.
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl ProviderConfig {
    /// The API key, if one is set and matches the provider's prefix.
    pub fn usable_api_key(&self) -> Option<&str> {
        let key = self.api_key.as_deref().map(str::trim)?;
        if key.is_empty() {
            return None;
        }
        match &self.key_prefix {
            Some(prefix) if !key.starts_with(prefix.as_str()) => None,
            _ => Some(key),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// A model served by a named provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }
}

/// The model rule table: which model serves which kind of request.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSelection {
    pub default: ModelRef,
    pub smart: ModelRef,
    pub vision: ModelRef,
    pub premium: ModelRef,
    /// Smaller model on the same provider, tried once after a rate limit.
    #[serde(default)]
    pub secondary: Option<ModelRef>,
}

/// On-device runtime used when every hosted tier has failed.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalFallbackConfig {
    #[serde(default = "default_local_base_url")]
    pub base_url: String,
    pub text_model: String,
    pub vision_model: String,
    /// Command that launches the runtime when it is not already listening.
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_local_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_start_command() -> Vec<String> {
    vec!["ollama".to_string(), "serve".to_string()]
}
fn default_readiness_timeout_secs() -> u64 {
    15
}
fn default_poll_interval_ms() -> u64 {
    500
}

/// Agent loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Maximum executed tool calls per session.
    #[serde(default = "default_action_limit")]
    pub action_limit: u32,
    /// When `false`, no tool schemas are sent and the loop is plain chat.
    #[serde(default = "default_agentic_mode")]
    pub agentic_mode: bool,
    /// Extra instructions appended to the system prompt.
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            action_limit: default_action_limit(),
            agentic_mode: default_agentic_mode(),
            custom_prompt: None,
        }
    }
}

fn default_action_limit() -> u32 {
    10
}
fn default_agentic_mode() -> bool {
    true
}

/// Top-level configuration (mirrors `overlay-agent.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub models: ModelSelection,
    #[serde(default)]
    pub local_fallback: Option<LocalFallbackConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl ModelsConfig {
    /// Defaults used when no config file is present.
    ///
    /// API keys come from `GROQ_API_KEY` and `XAI_API_KEY`.
    pub fn builtin() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "groq".to_string(),
            ProviderConfig {
                display_name: "Groq".into(),
                base_url: "https://api.groq.com/openai/v1".into(),
                api_key: std::env::var("GROQ_API_KEY").ok(),
                key_prefix: Some("gsk_".into()),
                temperature: 0.7,
                max_tokens: 4096,
            },
        );
        providers.insert(
            "xai".to_string(),
            ProviderConfig {
                display_name: "xAI".into(),
                base_url: "https://api.x.ai/v1".into(),
                api_key: std::env::var("XAI_API_KEY").ok(),
                key_prefix: None,
                temperature: 0.0,
                max_tokens: 4096,
            },
        );

        Self {
            providers,
            models: ModelSelection {
                default: ModelRef::new("groq", "llama-3.3-70b-versatile"),
                smart: ModelRef::new("groq", "llama-3.3-70b-versatile"),
                vision: ModelRef::new("groq", "meta-llama/llama-4-scout-17b-16e-instruct"),
                premium: ModelRef::new("xai", "grok-beta"),
                secondary: Some(ModelRef::new("groq", "llama-3.1-8b-instant")),
            },
            local_fallback: Some(LocalFallbackConfig {
                base_url: default_local_base_url(),
                text_model: "llama3.2".into(),
                vision_model: "qwen3-vl:4b".into(),
                start_command: default_start_command(),
                readiness_timeout_secs: default_readiness_timeout_secs(),
                poll_interval_ms: default_poll_interval_ms(),
            }),
            agent: AgentConfig::default(),
        }
    }

    /// Check that every model reference names a configured provider.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let refs = [
            Some(&self.models.default),
            Some(&self.models.smart),
            Some(&self.models.vision),
            Some(&self.models.premium),
            self.models.secondary.as_ref(),
        ];
        for model_ref in refs.into_iter().flatten() {
            if !self.providers.contains_key(&model_ref.provider) {
                return Err(InferenceError::ConfigError {
                    reason: format!(
                        "model '{}' references unknown provider '{}'",
                        model_ref.model, model_ref.provider
                    ),
                });
            }
        }
        if self.agent.action_limit == 0 {
            return Err(InferenceError::ConfigError {
                reason: "agent.action_limit must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `OVERLAY_AGENT_CONFIG` first, then searches upward from `start`
/// for `overlay-agent.yaml`, then `<data_dir>/config.yaml`. Returns `None`
/// when no file exists anywhere.
pub fn find_config_path(start: &Path, data_dir: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    let candidate = data_dir.join("config.yaml");
    candidate.exists().then_some(candidate)
}

/// Load and parse the configuration file.
///
/// Performs environment-variable interpolation on string values matching
/// `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_models_config(path: &Path) -> Result<ModelsConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_models_config(&raw)
}

/// Parse configuration text, interpolating env vars and validating references.
pub fn parse_models_config(raw: &str) -> Result<ModelsConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ModelsConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

/// Load the config from disk if one is found, else fall back to the built-in defaults.
pub fn load_or_builtin(start: &Path, data_dir: &Path) -> Result<ModelsConfig, InferenceError> {
    match find_config_path(start, data_dir) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading model config");
            load_models_config(&path)
        }
        None => {
            tracing::info!("no config file found, using built-in provider defaults");
            Ok(ModelsConfig::builtin())
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
providers:
  groq:
    display_name: Groq
    base_url: https://api.groq.com/openai/v1
    api_key: "${__OVERLAY_TEST_KEY__:-gsk_default}"
    key_prefix: gsk_
models:
  default: { provider: groq, model: llama-3.3-70b-versatile }
  smart: { provider: groq, model: llama-3.3-70b-versatile }
  vision: { provider: groq, model: llama-4-scout }
  premium: { provider: groq, model: big }
local_fallback:
  text_model: llama3.2
  vision_model: qwen3-vl:4b
"#;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TEST_NONEXISTENT_VAR__");
        let input = "${__TEST_NONEXISTENT_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TEST_OVERLAY_VAR__", "/custom/path");
        let input = "${__TEST_OVERLAY_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/custom/path");
        std::env::remove_var("__TEST_OVERLAY_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/Documents"));
    }

    #[test]
    fn test_parse_sample_applies_defaults() {
        let config = parse_models_config(SAMPLE).unwrap();
        let groq = &config.providers["groq"];
        assert_eq!(groq.api_key.as_deref(), Some("gsk_default"));
        assert_eq!(groq.max_tokens, 4096);
        assert!(config.models.secondary.is_none());
        assert_eq!(config.agent.action_limit, 10);
        assert!(config.agent.agentic_mode);

        let local = config.local_fallback.unwrap();
        assert_eq!(local.base_url, "http://localhost:11434");
        assert_eq!(local.start_command, vec!["ollama", "serve"]);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let yaml = SAMPLE.replace("premium: { provider: groq", "premium: { provider: nope");
        let err = parse_models_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown provider 'nope'"));
    }

    #[test]
    fn test_usable_api_key_checks_prefix() {
        let mut provider = ProviderConfig {
            display_name: "Groq".into(),
            base_url: "http://x".into(),
            api_key: Some("sk-wrong".into()),
            key_prefix: Some("gsk_".into()),
            temperature: 0.7,
            max_tokens: 10,
        };
        assert!(provider.usable_api_key().is_none());

        provider.api_key = Some("  ".into());
        assert!(provider.usable_api_key().is_none());

        provider.api_key = Some("gsk_abc".into());
        assert_eq!(provider.usable_api_key(), Some("gsk_abc"));

        provider.key_prefix = None;
        provider.api_key = Some("anything".into());
        assert_eq!(provider.usable_api_key(), Some("anything"));
    }

    #[test]
    fn test_builtin_is_valid() {
        let config = ModelsConfig::builtin();
        config.validate().unwrap();
        assert_eq!(config.models.premium.provider, "xai");
        assert_eq!(
            config.models.secondary.as_ref().map(|m| m.model.as_str()),
            Some("llama-3.1-8b-instant")
        );
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(CONFIG_FILE_NAME), SAMPLE).unwrap();
        let data = tempfile::tempdir().unwrap();

        // Skip when the developer has pinned a config via env.
        if std::env::var(CONFIG_ENV_VAR).is_ok() {
            return;
        }
        let found = find_config_path(&nested, data.path()).unwrap();
        assert_eq!(found, root.path().join(CONFIG_FILE_NAME));
        load_models_config(&found).unwrap();
    }
}
