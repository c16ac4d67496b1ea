//! Persisted user settings.
//!
//! A small JSON file in the platform data directory holding the premium
//! toggle, the user's own API key and the signed-in account profile. Writes
//! go through a temp file and a rename so a crash never leaves a torn file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent_core::AgentError;

/// File name inside the data directory.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

// ─── Types ──────────────────────────────────────────────────────────────────

/// Signed-in account profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub is_premium: bool,
    /// Extra instructions appended to the system prompt.
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

/// On-disk settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub account: Option<Account>,
    /// RFC 3339 time of the last write.
    #[serde(default)]
    pub updated_at: Option<String>,
}

// ─── SettingsStore ──────────────────────────────────────────────────────────

pub struct SettingsStore {
    settings: Settings,
    path: PathBuf,
}

impl SettingsStore {
    /// Open the store in the platform data directory.
    pub fn open_default() -> Self {
        Self::open(crate::data_dir().join(SETTINGS_FILE_NAME))
    }

    /// Open the store at `path`. A missing or unreadable file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = load_from_disk(&path);
        Self { settings, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Premium if either the local toggle or the account says so.
    pub fn is_premium(&self) -> bool {
        self.settings.is_premium
            || self.settings.account.as_ref().is_some_and(|a| a.is_premium)
    }

    pub fn set_premium(&mut self, premium: bool) -> Result<(), AgentError> {
        self.settings.is_premium = premium;
        self.save()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.settings.api_key.as_deref()
    }

    /// Store a user-supplied key after checking it carries `required_prefix`.
    pub fn set_api_key(&mut self, key: &str, required_prefix: Option<&str>) -> Result<(), AgentError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AgentError::InvalidSetting {
                field: "api_key".into(),
                reason: "key is empty".into(),
            });
        }
        if let Some(prefix) = required_prefix {
            if !key.starts_with(prefix) {
                return Err(AgentError::InvalidSetting {
                    field: "api_key".into(),
                    reason: format!("expected a key starting with '{prefix}'"),
                });
            }
        }

        self.settings.api_key = Some(key.to_string());
        self.save()?;
        tracing::info!("api key updated");
        Ok(())
    }

    pub fn clear_api_key(&mut self) -> Result<(), AgentError> {
        self.settings.api_key = None;
        self.save()
    }

    pub fn account(&self) -> Option<&Account> {
        self.settings.account.as_ref()
    }

    /// Replace the account profile (`None` signs out).
    pub fn set_account(&mut self, account: Option<Account>) -> Result<(), AgentError> {
        tracing::info!(signed_in = account.is_some(), "account updated");
        self.settings.account = account;
        self.save()
    }

    /// The account's custom prompt, if set and non-blank.
    pub fn custom_prompt(&self) -> Option<&str> {
        self.settings
            .account
            .as_ref()
            .and_then(|a| a.custom_prompt.as_deref())
            .filter(|p| !p.trim().is_empty())
    }

    // ─── Persistence ────────────────────────────────────────────────────

    fn save(&mut self) -> Result<(), AgentError> {
        self.settings.updated_at = Some(chrono::Utc::now().to_rfc3339());
        let content = serde_json::to_string_pretty(&self.settings)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| settings_error("create settings dir", &e))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).map_err(|e| settings_error("write settings temp file", &e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| settings_error("rename settings file", &e))?;

        tracing::debug!(path = %self.path.display(), "saved settings");
        Ok(())
    }
}

fn load_from_disk(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => {
                tracing::info!(path = %path.display(), "loaded settings");
                settings
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to parse settings file, using defaults"
                );
                Settings::default()
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read settings file");
            Settings::default()
        }
    }
}

fn settings_error(action: &str, e: &std::io::Error) -> AgentError {
    AgentError::SettingsError {
        reason: format!("{action}: {e}"),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::open(dir.path().join(SETTINGS_FILE_NAME))
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.settings(), &Settings::default());
        assert!(!store.is_premium());
        assert!(store.api_key().is_none());
    }

    #[test]
    fn test_settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.set_premium(true).unwrap();
        store.set_api_key("gsk_abc123", Some("gsk_")).unwrap();

        let reopened = store_in(&dir);
        assert!(reopened.is_premium());
        assert_eq!(reopened.api_key(), Some("gsk_abc123"));
        assert!(reopened.settings().updated_at.is_some());
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn test_api_key_prefix_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        let err = store.set_api_key("sk-wrong", Some("gsk_")).unwrap_err();
        assert!(matches!(err, AgentError::InvalidSetting { ref field, .. } if field == "api_key"));
        assert!(store.set_api_key("   ", None).is_err());
        assert!(store.api_key().is_none());

        store.set_api_key("  anything  ", None).unwrap();
        assert_eq!(store.api_key(), Some("anything"));
        store.clear_api_key().unwrap();
        assert!(store.api_key().is_none());
    }

    #[test]
    fn test_account_premium_and_custom_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store
            .set_account(Some(Account {
                id: "u1".into(),
                email: "a@example.com".into(),
                is_premium: true,
                custom_prompt: Some("Be brief.".into()),
            }))
            .unwrap();

        assert!(store.is_premium());
        assert_eq!(store.custom_prompt(), Some("Be brief."));

        store.set_account(None).unwrap();
        assert!(!store.is_premium());
        assert!(store.custom_prompt().is_none());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE_NAME), "{not json").unwrap();
        let store = store_in(&dir);
        assert_eq!(store.settings(), &Settings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE_NAME), r#"{"is_premium": true}"#).unwrap();
        let store = store_in(&dir);
        assert!(store.is_premium());
        assert!(store.account().is_none());
    }
}
