//! Discovery of the external executables the relay spawns.
//!
//! Lookup order for a program `name`:
//! 1. `$SPACE_WATCHER_BIN_DIR/<exe>`
//! 2. `$SPACE_WATCHER_<NAME>_PATH`
//! 3. `<dir of current exe>/<exe>` and `<dir of current exe>/bin/<exe>`
//! 4. every directory on `PATH`

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ENV_PREFIX;
use crate::error::{Error, Result};

/// Fetch program.
pub const FETCHER: &str = "yt-dlp";
/// Playback program.
pub const PLAYER: &str = "mpv";
/// Recording encoder.
pub const ENCODER: &str = "ffmpeg";

/// Resolved paths of every program a session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependencies {
    pub fetcher: PathBuf,
    pub player: PathBuf,
    pub encoder: Option<PathBuf>,
}

/// Environment-driven executable locator.
#[derive(Debug, Clone, Default)]
pub struct BinaryLocator {
    env: HashMap<String, String>,
    local_dirs: Vec<PathBuf>,
    path: Option<OsString>,
}

impl BinaryLocator {
    /// Snapshot `SPACE_WATCHER_*` variables, `PATH` and the executable's directory.
    pub fn from_env() -> Self {
        let env = std::env::vars()
            .filter(|(k, v)| k.starts_with(ENV_PREFIX) && !v.is_empty())
            .collect();
        let local_dirs = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .map(|dir| vec![dir.clone(), dir.join("bin")])
            .unwrap_or_default();
        Self {
            env,
            local_dirs,
            path: std::env::var_os("PATH"),
        }
    }

    /// Set an environment entry (used by tests and the CLI).
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the searched local directories.
    #[must_use]
    pub fn with_local_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.local_dirs = dirs;
        self
    }

    /// Replace the `PATH` value searched last.
    #[must_use]
    pub fn with_path(mut self, path: Option<OsString>) -> Self {
        self.path = path;
        self
    }

    /// Every candidate location for `name`, in lookup order.
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let exe = exe_name(name);
        let mut out = Vec::new();

        if let Some(dir) = self.env.get(&format!("{ENV_PREFIX}BIN_DIR")) {
            out.push(PathBuf::from(dir).join(&exe));
        }
        if let Some(path) = self.env.get(&env_key(name)) {
            out.push(PathBuf::from(path));
        }
        for dir in &self.local_dirs {
            out.push(dir.join(&exe));
        }
        if let Some(path) = &self.path {
            out.extend(std::env::split_paths(path).map(|dir| dir.join(&exe)));
        }
        out
    }

    /// Resolve `name` to an existing file.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let found = self.candidates(name).into_iter().find(|p| p.is_file());
        match found {
            Some(path) => {
                debug!(program = name, path = %path.display(), "Resolved executable");
                Ok(path)
            }
            None => Err(Error::MissingDependency {
                program: name.to_string(),
            }),
        }
    }

    /// Resolve the fetcher, the player and, when recording, the encoder.
    pub fn ensure_dependencies(&self, record: bool) -> Result<Dependencies> {
        Ok(Dependencies {
            fetcher: self.resolve(FETCHER)?,
            player: self.resolve(PLAYER)?,
            encoder: if record {
                Some(self.resolve(ENCODER)?)
            } else {
                None
            },
        })
    }
}

/// Environment variable naming an explicit path for `name`.
///
/// `yt-dlp` maps to `SPACE_WATCHER_YT_DLP_PATH`.
pub fn env_key(name: &str) -> String {
    let key: String = name
        .to_ascii_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{ENV_PREFIX}{key}_PATH")
}

/// Platform executable file name.
pub fn exe_name(name: &str) -> String {
    if cfg!(windows) && !name.to_ascii_lowercase().ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(exe_name(name));
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn empty_locator() -> BinaryLocator {
        BinaryLocator::default()
    }

    #[test]
    fn env_key_replaces_punctuation() {
        assert_eq!(env_key("yt-dlp"), "SPACE_WATCHER_YT_DLP_PATH");
        assert_eq!(env_key("ffmpeg"), "SPACE_WATCHER_FFMPEG_PATH");
    }

    #[test]
    fn bin_dir_wins_over_path() {
        let bin = tempfile::tempdir().unwrap();
        let on_path = tempfile::tempdir().unwrap();
        let expected = touch(bin.path(), "mpv");
        touch(on_path.path(), "mpv");

        let locator = empty_locator()
            .with_env("SPACE_WATCHER_BIN_DIR", bin.path().to_string_lossy())
            .with_path(Some(on_path.path().as_os_str().to_owned()));
        assert_eq!(locator.resolve("mpv").unwrap(), expected);
    }

    #[test]
    fn explicit_override_is_used_before_local_dirs() {
        let local = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        touch(local.path(), "yt-dlp");
        let explicit = touch(other.path(), "yt-dlp");

        let locator = empty_locator()
            .with_env(env_key("yt-dlp"), explicit.to_string_lossy())
            .with_local_dirs(vec![local.path().to_path_buf()]);
        assert_eq!(locator.resolve("yt-dlp").unwrap(), explicit);
    }

    #[test]
    fn path_fallback_searches_every_entry() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = touch(second.path(), "ffmpeg");
        let path = std::env::join_paths([first.path(), second.path()]).unwrap();

        let locator = empty_locator().with_path(Some(path));
        assert_eq!(locator.resolve("ffmpeg").unwrap(), expected);
    }

    #[test]
    fn missing_binary_names_the_program() {
        let err = empty_locator().resolve("mpv").unwrap_err();
        assert!(matches!(err, Error::MissingDependency { ref program } if program == "mpv"));
        assert!(err.to_string().contains("Missing 'mpv'"));
    }

    #[test]
    fn encoder_is_only_required_when_recording() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), FETCHER);
        touch(dir.path(), PLAYER);
        let locator = empty_locator().with_local_dirs(vec![dir.path().to_path_buf()]);

        let deps = locator.ensure_dependencies(false).unwrap();
        assert!(deps.encoder.is_none());
        assert!(matches!(
            locator.ensure_dependencies(true),
            Err(Error::MissingDependency { .. })
        ));
    }
}
