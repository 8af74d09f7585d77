//! Configuration resolution for spacewatch.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/spacewatch/settings.json`)
//! 3. Environment variables (`SPACE_WATCHER_*`)
//! 4. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "SPACE_WATCHER_";

/// Complete spacewatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retry and streaming parameters of the relay loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Attempts shorter than this count as fast failures (milliseconds).
    pub fast_fail_window_ms: u64,
    /// Backoff after a fast failure (milliseconds).
    pub fast_fail_delay_ms: u64,
    /// Backoff after an attempt that ran past the fast-fail window (milliseconds).
    pub steady_delay_ms: u64,
    /// Read buffer size for the fetch process output.
    pub chunk_size: usize,
    /// Browser passed to the fetcher when no cookie file is available.
    pub cookie_browser: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fast_fail_window_ms: 5_000,
            fast_fail_delay_ms: 2_000,
            steady_delay_ms: 1_000,
            chunk_size: 64 * 1024,
            cookie_browser: "edge".to_string(),
        }
    }
}

/// Playback sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Audio output driver (`--ao`). `None` lets the player pick.
    pub audio_output: Option<String>,
    /// Output device selector (`--audio-device`).
    pub audio_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            audio_output: default_audio_output(),
            audio_device: None,
        }
    }
}

fn default_audio_output() -> Option<String> {
    if cfg!(target_os = "windows") {
        Some("wasapi".to_string())
    } else {
        None
    }
}

/// Recording encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory for recordings. Defaults to `~/Desktop/space_recordings`.
    pub out_dir: Option<PathBuf>,
    /// Capture frame rate.
    pub frame_rate: u32,
    /// AAC bitrate passed to the encoder.
    pub audio_bitrate: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            out_dir: None,
            frame_rate: 30,
            audio_bitrate: "128k".to_string(),
        }
    }
}

impl RecordingConfig {
    /// Resolved output directory.
    pub fn out_dir(&self) -> PathBuf {
        self.out_dir.clone().unwrap_or_else(default_out_dir)
    }
}

fn default_out_dir() -> PathBuf {
    dirs::desktop_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("space_recordings")
}

/// Screen region captured alongside the audio when recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowRect {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 360,
            height: 780,
        }
    }
}

/// Per-session defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Try the unauthenticated mode first.
    pub try_guest_first: bool,
    /// Escalate to cookie-authenticated fetching after fast failures.
    pub allow_cookies_fallback: bool,
    /// Window geometry used for screen capture.
    pub window: WindowRect,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            try_guest_first: true,
            allow_cookies_fallback: true,
            window: WindowRect::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Directory for the persistent JSON error log.
    pub error_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            error_log_dir: None,
        }
    }
}

/// Load configuration: defaults, then the global file, then env overrides.
pub fn load_config() -> Result<Config> {
    let mut config = match global_config_path() {
        Some(path) if path.exists() => load_config_file(&path)?,
        _ => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".spacewatch").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME").ok().map(|h| {
            PathBuf::from(h).join("Library/Application Support/spacewatch/settings.json")
        })
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("spacewatch").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read and parse one settings file. Missing sections fall back to defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `SPACE_WATCHER_*` overrides read through `lookup`.
///
/// Empty values are ignored so that `SPACE_WATCHER_AUDIO_DEVICE=` does not
/// select an empty device name.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

    if let Some(val) = var("AUDIO_DEVICE") {
        config.playback.audio_device = Some(val);
    }
    if let Some(val) = var("AUDIO_OUTPUT") {
        config.playback.audio_output = Some(val);
    }
    if let Some(val) = var("OUT_DIR") {
        config.recording.out_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = var("LOG_DIR") {
        config.logging.error_log_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = var("LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(val) = var("COOKIE_BROWSER") {
        config.relay.cookie_browser = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_relay_timings() {
        let config = Config::default();
        assert_eq!(config.relay.fast_fail_window_ms, 5_000);
        assert_eq!(config.relay.fast_fail_delay_ms, 2_000);
        assert_eq!(config.relay.steady_delay_ms, 1_000);
        assert_eq!(config.relay.chunk_size, 65_536);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"playback": {"audio_device": "wasapi/{abc}"}, "session": {"try_guest_first": false}}"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.playback.audio_device.as_deref(), Some("wasapi/{abc}"));
        assert!(!config.session.try_guest_first);
        assert!(config.session.allow_cookies_fallback);
        assert_eq!(config.session.window, WindowRect::default());
        assert_eq!(config.relay.cookie_browser, "edge");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply_and_skip_empty_values() {
        let env: HashMap<&str, &str> = [
            ("SPACE_WATCHER_AUDIO_DEVICE", "pulse/headset"),
            ("SPACE_WATCHER_LOG_LEVEL", ""),
            ("SPACE_WATCHER_OUT_DIR", "/tmp/recs"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.playback.audio_device.as_deref(), Some("pulse/headset"));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.recording.out_dir(), PathBuf::from("/tmp/recs"));
    }
}
