//! Subcommand implementations and the file loading they share.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use adsel_core::AdSelectionConfig;
use anyhow::{bail, Context, Result};

pub mod config;
pub mod run;
pub mod script;

/// Maximum size of any JSON or script file read by the CLI (4 MiB).
pub const MAX_INPUT_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// Loads the engine configuration, or the defaults when no path is given.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(path: Option<&Path>) -> Result<AdSelectionConfig> {
    let Some(path) = path else {
        return Ok(AdSelectionConfig::default());
    };
    AdSelectionConfig::from_file(path)
        .with_context(|| format!("failed to load config from '{}'", path.display()))
}

/// Reads a UTF-8 file of at most `limit` bytes.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read, or is larger than
/// `limit`.
pub fn read_bounded(path: &Path, limit: u64) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?;
    let mut content = String::new();
    file.take(limit + 1)
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    if content.len() as u64 > limit {
        bail!(
            "file '{}' exceeds maximum size limit of {limit} bytes",
            path.display()
        );
    }
    Ok(content)
}

/// Builds the single-threaded runtime commands run on.
///
/// # Errors
///
/// Returns an error if the runtime cannot be created.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;

    #[test]
    fn missing_config_path_yields_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.timeouts.overall, Duration::from_secs(10));
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[features]\ndebug_reporting = true").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert!(config.features.debug_reporting);
        assert!(config.features.best_bid_per_custom_audience);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/adsel.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/adsel.toml"));
    }

    #[test]
    fn read_bounded_accepts_exact_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abcd").unwrap();
        assert_eq!(read_bounded(file.path(), 4).unwrap(), "abcd");
    }

    #[test]
    fn read_bounded_rejects_oversized_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abcde").unwrap();
        let err = read_bounded(file.path(), 4).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum size"));
    }
}
