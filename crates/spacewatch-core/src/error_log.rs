//! Persistent JSON error log.
//!
//! Each run writes to `spacewatch_errors_<YYYYmmdd_HHMMSS>.json`, a JSON
//! array of [`ErrorEntry`] values. Every append rewrites the file through a
//! temporary file in the same directory so a crash never leaves a truncated
//! log behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ENV_PREFIX;
use crate::error::{Error, Result};

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp_utc: DateTime<Utc>,
    /// Where the failure happened (e.g. `"start_session"`).
    pub context: String,
    /// Short error kind.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// `source()` chain, outermost first.
    pub chain: Vec<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Append-only error log bound to one file.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log file for this run inside `dir`.
    pub fn in_dir(dir: &Path, now: DateTime<Local>) -> Self {
        Self::new(dir.join(format!(
            "spacewatch_errors_{}.json",
            now.format("%Y%m%d_%H%M%S")
        )))
    }

    /// Log file for this run in the default directory.
    ///
    /// `SPACE_WATCHER_LOG_DIR`, then `configured`, then the platform data
    /// directory, then the home directory.
    pub fn for_run(configured: Option<&Path>) -> Self {
        let dir = std::env::var_os(format!("{ENV_PREFIX}LOG_DIR"))
            .map(PathBuf::from)
            .or_else(|| configured.map(Path::to_path_buf))
            .or_else(|| dirs::data_local_dir().map(|d| d.join("spacewatch")))
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::in_dir(&dir, Local::now())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `err` under `context`. Returns the log path.
    pub fn record(
        &self,
        context: &str,
        err: &(dyn std::error::Error + 'static),
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Result<&Path> {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        self.append(ErrorEntry {
            timestamp_utc: Utc::now(),
            context: context.to_string(),
            kind: error_kind(err),
            message: err.to_string(),
            chain,
            extra,
        })?;
        Ok(&self.path)
    }

    /// All entries currently in the file. A missing or corrupt file reads as empty.
    pub fn entries(&self) -> Vec<ErrorEntry> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Discarding unreadable error log");
            Vec::new()
        })
    }

    fn append(&self, entry: ErrorEntry) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut entries = self.entries();
        entries.push(entry);
        let body = serde_json::to_vec_pretty(&entries)?;

        let mut tmp = tempfile::Builder::new()
            .prefix("errors_")
            .suffix(".json")
            .tempfile_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::ErrorLog {
            path: self.path.clone(),
            reason: e.error.to_string(),
        })?;
        Ok(())
    }
}

/// Debug representation up to the first `(` or `{`, e.g. `MissingDependency`.
fn error_kind(err: &dyn std::error::Error) -> String {
    let debug = format!("{err:?}");
    debug
        .split(['(', '{', ' '])
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn appends_entries_with_kind_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("errors.json"));

        let missing = Error::MissingDependency {
            program: "mpv".into(),
        };
        log.record("start_session", &missing, serde_json::Map::new())
            .unwrap();
        let mut extra = serde_json::Map::new();
        extra.insert("url".into(), "https://x.com/i/spaces/1x".into());
        log.record("mute_toggle", &Error::Config("bad".into()), extra)
            .unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "MissingDependency");
        assert_eq!(entries[0].context, "start_session");
        assert!(entries[0].message.contains("mpv"));
        assert_eq!(entries[1].kind, "Config");
        assert_eq!(entries[1].extra["url"], "https://x.com/i/spaces/1x");
    }

    #[test]
    fn io_source_is_captured_in_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("errors.json"));
        let err = Error::Io(std::io::Error::other("disk on fire"));

        log.record("main", &err, serde_json::Map::new()).unwrap();
        assert_eq!(log.entries()[0].chain, vec!["disk on fire".to_string()]);
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.json");
        std::fs::write(&path, "[{truncated").unwrap();

        let log = ErrorLog::new(&path);
        log.record("main", &Error::Config("x".into()), serde_json::Map::new())
            .unwrap();
        assert_eq!(log.entries().len(), 1);
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.is_array());
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::in_dir(&dir.path().join("logs"), Local::now());
        log.record("main", &Error::Config("x".into()), serde_json::Map::new())
            .unwrap();
        assert!(log.path().is_file());
        assert!(
            log.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("spacewatch_errors_")
        );
    }
}
