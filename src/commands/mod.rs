//! Host-side pieces used by the terminal driver.
//!
//! - `settings`: persisted user settings (premium toggle, API key, account)
//! - `terminal`: shell-backed `ToolExecutor`

pub mod settings;
pub mod terminal;

pub use settings::{Account, Settings, SettingsStore};
pub use terminal::ShellExecutor;
