//! Recording plan: output file naming and the encoder command line.
//!
//! The encoder reads the relayed audio on stdin and captures the screen
//! region the Space is shown in, muxing both into an MP4 file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::config::{RecordingConfig, WindowRect};
use crate::error::Result;

/// Where a recording goes and how the encoder is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPlan {
    pub out_path: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RecordingPlan {
    /// Create the output directory and build the encoder invocation.
    pub fn new(
        encoder: &Path,
        config: &RecordingConfig,
        rect: WindowRect,
        now: DateTime<Local>,
    ) -> Result<Self> {
        let out_dir = config.out_dir();
        std::fs::create_dir_all(&out_dir)?;
        let out_path = out_dir.join(file_name(rect, now));
        let args = encoder_args(config, rect, &out_path);
        Ok(Self {
            out_path,
            program: encoder.to_path_buf(),
            args,
        })
    }
}

/// `space_<YYYYmmdd_HHMMSS>_<w>x<h>.mp4`
pub fn file_name(rect: WindowRect, now: DateTime<Local>) -> String {
    format!(
        "space_{}_{}x{}.mp4",
        now.format("%Y%m%d_%H%M%S"),
        rect.width,
        rect.height
    )
}

fn screen_input(rect: WindowRect) -> Vec<String> {
    let size = format!("{}x{}", rect.width, rect.height);
    if cfg!(target_os = "windows") {
        vec![
            "-f".into(),
            "gdigrab".into(),
            "-offset_x".into(),
            rect.x.to_string(),
            "-offset_y".into(),
            rect.y.to_string(),
            "-video_size".into(),
            size,
            "-i".into(),
            "desktop".into(),
        ]
    } else if cfg!(target_os = "macos") {
        vec![
            "-f".into(),
            "avfoundation".into(),
            "-capture_cursor".into(),
            "1".into(),
            "-i".into(),
            "1:none".into(),
        ]
    } else {
        let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
        vec![
            "-f".into(),
            "x11grab".into(),
            "-video_size".into(),
            size,
            "-i".into(),
            format!("{display}+{},{}", rect.x, rect.y),
        ]
    }
}

fn encoder_args(config: &RecordingConfig, rect: WindowRect, out_path: &Path) -> Vec<String> {
    let rate = config.frame_rate.to_string();
    let mut args: Vec<String> = ["-y", "-f", "aac", "-i", "pipe:0", "-framerate", rate.as_str()]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(screen_input(rect));
    args.extend(
        [
            "-map",
            "1:v:0",
            "-map",
            "0:a:0",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-pix_fmt",
            "yuv420p",
            "-r",
            rate.as_str(),
            "-c:a",
            "aac",
            "-b:a",
            config.audio_bitrate.as_str(),
        ]
        .into_iter()
        .map(String::from),
    );
    args.push(out_path.to_string_lossy().into_owned());
    args
}
