//! Local on-device runtime (Ollama) used as the last fallback tier.
//!
//! The runtime is started lazily: nothing is spawned until every hosted tier
//! has failed, and the chain then waits a bounded time for it to come up.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};

use super::config::LocalFallbackConfig;
use super::errors::InferenceError;

/// Timeout for a single readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Something that can report readiness and be launched on demand.
#[async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn is_ready(&self) -> bool;

    /// Launch the runtime. Returns once the process is spawned, not once it is ready.
    async fn start(&self) -> Result<(), InferenceError>;
}

/// How long to wait for a freshly started runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ReadinessPolicy {
    pub fn from_config(config: &LocalFallbackConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.readiness_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }
}

/// Make sure the runtime is reachable, starting it if needed.
///
/// Returns `false` if it could not be started or did not become ready
/// within `policy.timeout`.
pub async fn ensure_ready(runtime: &dyn LocalRuntime, policy: ReadinessPolicy) -> bool {
    if runtime.is_ready().await {
        return true;
    }

    tracing::info!(timeout_secs = policy.timeout.as_secs(), "local runtime not running, starting it");
    if let Err(e) = runtime.start().await {
        tracing::warn!(error = %e, "failed to start local runtime");
        return false;
    }

    let wait = async {
        loop {
            tokio::time::sleep(policy.poll_interval).await;
            if runtime.is_ready().await {
                break;
            }
        }
    };

    match tokio::time::timeout(policy.timeout, wait).await {
        Ok(()) => {
            tracing::info!("local runtime is ready");
            true
        }
        Err(_) => {
            tracing::warn!(
                timeout_secs = policy.timeout.as_secs(),
                "local runtime did not become ready in time"
            );
            false
        }
    }
}

// ─── Ollama ──────────────────────────────────────────────────────────────────

/// Raw Ollama `/api/tags` response shape.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Option<Vec<OllamaTagModel>>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagModel {
    name: String,
}

/// Ollama reachable over HTTP, launched with a configurable command.
pub struct OllamaRuntime {
    http: reqwest::Client,
    base_url: String,
    start_command: Vec<String>,
    /// The process we spawned, if any. Kept so it is not reaped early.
    child: Mutex<Option<Child>>,
}

impl OllamaRuntime {
    pub fn new(config: &LocalFallbackConfig) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            start_command: config.start_command.clone(),
            child: Mutex::new(None),
        })
    }

    /// Names of the models the runtime has pulled.
    pub async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(InferenceError::HttpError {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let tags: OllamaTagsResponse =
            response
                .json()
                .await
                .map_err(|e| InferenceError::ResponseParse {
                    reason: format!("invalid /api/tags response: {e}"),
                })?;

        Ok(tags
            .models
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.name)
            .collect())
    }
}

#[async_trait]
impl LocalRuntime for OllamaRuntime {
    async fn is_ready(&self) -> bool {
        match self.list_models().await {
            Ok(models) => {
                tracing::debug!(count = models.len(), models = ?models, "local runtime reachable");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "local runtime not reachable");
                false
            }
        }
    }

    async fn start(&self) -> Result<(), InferenceError> {
        let (program, args) =
            self.start_command
                .split_first()
                .ok_or_else(|| InferenceError::ConfigError {
                    reason: "local_fallback.start_command is empty".into(),
                })?;

        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::debug!("local runtime already spawned, waiting for readiness");
                return Ok(());
            }
        }

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| InferenceError::LocalFallbackFailed {
                reason: format!("failed to spawn '{program}': {e}"),
            })?;

        tracing::info!(command = %self.start_command.join(" "), pid = ?child.id(), "spawned local runtime");
        *guard = Some(child);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FakeRuntime;
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn config(base_url: &str) -> LocalFallbackConfig {
        LocalFallbackConfig {
            base_url: base_url.into(),
            text_model: "llama3.2".into(),
            vision_model: "qwen3-vl:4b".into(),
            start_command: vec![],
            readiness_timeout_secs: 1,
            poll_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_already_running_is_not_restarted() {
        let rt = FakeRuntime::ready();
        assert!(ensure_ready(&rt, fast_policy()).await);
        assert_eq!(rt.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_started_runtime_becomes_ready() {
        let rt = FakeRuntime::starts_after(3);
        assert!(ensure_ready(&rt, fast_policy()).await);
        assert_eq!(rt.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_readiness_wait_is_bounded() {
        let rt = FakeRuntime::never_ready();
        let started = std::time::Instant::now();
        assert!(!ensure_ready(&rt, fast_policy()).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_ollama_probe_against_mock() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "llama3.2:latest"}]
            })))
            .mount(&server)
            .await;

        let rt = OllamaRuntime::new(&config(&server.uri())).unwrap();
        assert!(rt.is_ready().await);
        assert_eq!(rt.list_models().await.unwrap(), vec!["llama3.2:latest"]);
    }

    #[tokio::test]
    async fn test_ollama_error_status_is_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let rt = OllamaRuntime::new(&config(&server.uri())).unwrap();
        assert!(!rt.is_ready().await);
        assert!(matches!(
            rt.list_models().await,
            Err(InferenceError::HttpError { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_start_command_is_config_error() {
        let rt = OllamaRuntime::new(&config("http://127.0.0.1:9")).unwrap();
        let err = rt.start().await.unwrap_err();
        assert!(matches!(err, InferenceError::ConfigError { .. }));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReadinessPolicy::from_config(&config("http://x"));
        assert_eq!(policy.timeout, Duration::from_secs(1));
        assert_eq!(policy.poll_interval, Duration::from_millis(50));
    }
}
