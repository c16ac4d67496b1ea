pub mod agent_core;
pub mod commands;
pub mod inference;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for the overlay agent.
///
/// - macOS: `~/Library/Application Support/com.overlay-agent/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.overlay-agent\`
/// - Linux: `$XDG_DATA_HOME/com.overlay-agent/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.overlay-agent/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.overlay-agent");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".overlay-agent")
}

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "overlay-agent.log";

/// Install the tracing subscriber, writing to `<log_dir>/overlay-agent.log`.
///
/// Previous logs are rotated (`.1` → `.3`) first. `RUST_LOG` overrides the
/// default filter. Returns the path of the fresh log file.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("overlay_agent=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
    if let Err(e) = installed {
        return Err(std::io::Error::other(format!("tracing already initialized: {e}")));
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== overlay agent starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A `std::fs::File` writer that flushes after every write, so the last
/// lines before a crash reach the disk.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        let nth = |n: u32| PathBuf::from(format!("{}.{n}", base.display()));

        std::fs::write(&base, "current").unwrap();
        std::fs::write(nth(1), "one").unwrap();
        std::fs::write(nth(2), "two").unwrap();
        std::fs::write(nth(3), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        assert_eq!(std::fs::read_to_string(nth(1)).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(nth(2)).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(nth(3)).unwrap(), "two");
    }

    #[test]
    fn test_rotate_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();

        rotate_log_file(&base, 3);

        assert_eq!(
            std::fs::read_to_string(format!("{}.1", base.display())).unwrap(),
            "current"
        );
        assert!(!PathBuf::from(format!("{}.2", base.display())).exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }

    #[test]
    fn test_data_dir_is_namespaced() {
        let dir = data_dir();
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name == "com.overlay-agent" || name == ".overlay-agent");
    }
}
