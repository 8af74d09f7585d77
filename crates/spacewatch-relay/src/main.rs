//! `spacewatch` CLI
//!
//! Relays a live X/Twitter Space to the local player and, optionally, records
//! it together with a screen region. Reads simple commands from stdin while
//! the relay runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use spacewatch_core::config::{Config, load_config};
use spacewatch_core::cookies::find_cookies_file;
use spacewatch_core::deps::BinaryLocator;
use spacewatch_core::error_log::ErrorLog;
use spacewatch_core::{RecordingPlan, SpaceUrl, tracing_init};
use spacewatch_relay::{
    AuthMode, CommandSpec, LogCallback, PlaybackConfig, RelaySession, RelaySupervisor,
    RetryPolicy, SourceFetcher,
};

#[derive(Parser, Debug)]
#[allow(clippy::struct_excessive_bools)]
#[command(name = "spacewatch")]
#[command(version, about = "spacewatch - listen to and record live X Spaces")]
struct Args {
    /// Space URL (https://x.com/i/spaces/...)
    url: String,

    /// Record the Space (audio plus screen region) to an MP4 file
    #[arg(long)]
    record: bool,

    /// Directory for recordings
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Skip the guest attempt and go straight to cookies
    #[arg(long)]
    no_guest: bool,

    /// Never fall back to cookies
    #[arg(long)]
    no_cookies: bool,

    /// Browser whose cookie store is used when no cookies.txt is found
    #[arg(long)]
    cookies_browser: Option<String>,

    /// Left edge of the captured screen region
    #[arg(long)]
    x: Option<i32>,

    /// Top edge of the captured screen region
    #[arg(long)]
    y: Option<i32>,

    /// Width of the captured screen region
    #[arg(long)]
    width: Option<u32>,

    /// Height of the captured screen region
    #[arg(long)]
    height: Option<u32>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, env = "SPACE_WATCHER_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags win over every other configuration layer.
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.out_dir {
            config.recording.out_dir = Some(dir.clone());
        }
        if self.no_guest {
            config.session.try_guest_first = false;
        }
        if self.no_cookies {
            config.session.allow_cookies_fallback = false;
        }
        if let Some(browser) = &self.cookies_browser {
            config.relay.cookie_browser.clone_from(browser);
        }
        let window = &mut config.session.window;
        window.x = self.x.unwrap_or(window.x);
        window.y = self.y.unwrap_or(window.y);
        window.width = self.width.unwrap_or(window.width);
        window.height = self.height.unwrap_or(window.height);
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        config.logging.json |= self.log_json;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config().unwrap_or_else(|e| {
        eprintln!("spacewatch: ignoring unreadable settings: {e}");
        Config::default()
    });
    args.apply(&mut config);

    let filter = tracing_init::default_filter(&config.logging.level);
    tracing_init::init_tracing(&filter, config.logging.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        record = args.record,
        "Starting spacewatch"
    );

    let result = run(&args, &config).await;
    if let Err(e) = &result {
        error!(error = %e, "spacewatch failed");
        let log = ErrorLog::for_run(config.logging.error_log_dir.as_deref());
        let mut extra = serde_json::Map::new();
        extra.insert("url".into(), args.url.clone().into());
        extra.insert("record".into(), args.record.into());
        match log.record("spacewatch", e.as_ref(), extra) {
            Ok(path) => eprintln!("Error details saved to {}", path.display()),
            Err(log_err) => warn!(error = %log_err, "Failed to write error log"),
        }
    }
    result
}

async fn run(args: &Args, config: &Config) -> anyhow::Result<()> {
    let url = SpaceUrl::parse(&args.url)?;
    let deps = BinaryLocator::from_env()
        .ensure_dependencies(args.record)
        .context("Missing required programs")?;

    let recording = match &deps.encoder {
        Some(encoder) => {
            let plan = RecordingPlan::new(
                encoder,
                &config.recording,
                config.session.window,
                Local::now(),
            )?;
            info!(path = %plan.out_path.display(), "Recording enabled");
            println!("Recording to {}", plan.out_path.display());
            Some(CommandSpec::new(plan.program).args(plan.args))
        }
        None => None,
    };

    if let Some(path) = find_cookies_file() {
        info!(path = %path.display(), "Found cookies file");
    }
    let fetcher = SourceFetcher::new(CommandSpec::new(&deps.fetcher))
        .with_cookies_lookup(Arc::new(find_cookies_file))
        .with_cookie_browser(config.relay.cookie_browser.clone())
        .with_chunk_size(config.relay.chunk_size);

    let mut playback = PlaybackConfig::new(CommandSpec::new(&deps.player));
    playback.audio_output.clone_from(&config.playback.audio_output);
    playback.audio_device.clone_from(&config.playback.audio_device);

    let supervisor = RelaySupervisor::new(
        fetcher,
        playback,
        RetryPolicy::from_config(&config.relay),
    );
    let modes = AuthMode::candidates(
        config.session.try_guest_first,
        config.session.allow_cookies_fallback,
    );
    let log: LogCallback = Arc::new(|message: &str| println!("{message}"));

    let session = supervisor
        .start(url.as_str(), &modes, recording, log)
        .await
        .context("Failed to start audio")?;
    println!("Commands: m = toggle mute, q = quit");

    let outcome = drive(&session).await;
    session.stop().await;
    session.wait().await;
    info!(attempts = session.attempts(), "spacewatch stopped");
    outcome
}

/// Serve stdin commands until quit, end of input or a shutdown signal.
async fn drive(session: &RelaySession) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();
    tokio::pin!(sigterm_future);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_command(session, line.trim()).await? {
                            break;
                        }
                    }
                    // Stdin closed (e.g. detached): keep relaying until a signal.
                    None => {
                        wait_for_signal(&mut sigterm_future).await;
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = &mut sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break;
            }
        }
    }
    Ok(())
}

async fn wait_for_signal<F>(sigterm: &mut std::pin::Pin<&mut F>)
where
    F: std::future::Future<Output = Option<()>>,
{
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        _ = sigterm.as_mut() => info!("Received SIGTERM shutdown signal"),
    }
}

/// Returns `false` when the session should end.
async fn handle_command(session: &RelaySession, command: &str) -> anyhow::Result<bool> {
    match command {
        "m" | "mute" => {
            let muted = session.toggle_mute().await?;
            println!("{}", if muted { "Muted" } else { "Unmuted" });
        }
        "q" | "quit" => return Ok(false),
        "s" | "status" => {
            let status = session.sink_status().await;
            println!(
                "mode={} attempts={} muted={} playback_alive={} recording_alive={:?}",
                session.mode_index(),
                session.attempts(),
                status.muted,
                status.playback_alive,
                status.recording_alive,
            );
        }
        "" => {}
        other => println!("Unknown command {other:?} (m = mute, s = status, q = quit)"),
    }
    Ok(true)
}
