//! Playback and recording sinks.
//!
//! A sink is a child process that consumes the relayed bytes on stdin. It can
//! die at any time; the owner checks [`Sink::is_alive`] before every write
//! and respawns through [`Sink::ensure_alive`]. A failed write terminates the
//! process and leaves the respawn to the next liveness check.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::process::{CommandSpec, KillSwitch, Pipes, ProcessHandle};

/// How to build the command of a sink process.
pub trait SinkCommand {
    fn label(&self) -> &'static str;
    fn command(&self) -> CommandSpec;
}

/// Player settings shared by every playback sink of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Resolved player command (program plus leading arguments).
    pub base: CommandSpec,
    /// Audio output driver (`--ao`).
    pub audio_output: Option<String>,
    /// Output device selector (`--audio-device`).
    pub audio_device: Option<String>,
}

impl PlaybackConfig {
    pub const fn new(base: CommandSpec) -> Self {
        Self {
            base,
            audio_output: None,
            audio_device: None,
        }
    }

    /// Player arguments for the given mute state; stdin is the last argument.
    pub fn command(&self, muted: bool) -> CommandSpec {
        let volume = if muted { 0 } else { 100 };
        let mut cmd = self.base.clone().args([
            "--no-video".to_string(),
            "--no-config".to_string(),
            "--mute=no".to_string(),
            format!("--volume={volume}"),
        ]);
        if let Some(ao) = &self.audio_output {
            cmd = cmd.arg(format!("--ao={ao}"));
        }
        cmd = cmd.args(["--cache=yes", "--demuxer-max-bytes=512MiB"]);
        if let Some(device) = &self.audio_device {
            cmd = cmd.arg(format!("--audio-device={device}"));
        }
        cmd.arg("-")
    }
}

/// Playback sink spec: player settings plus the current mute state.
#[derive(Debug, Clone)]
pub struct Playback {
    config: Arc<PlaybackConfig>,
    muted: bool,
}

impl Playback {
    pub const fn new(config: Arc<PlaybackConfig>, muted: bool) -> Self {
        Self { config, muted }
    }
}

impl SinkCommand for Playback {
    fn label(&self) -> &'static str {
        "playback"
    }

    fn command(&self) -> CommandSpec {
        self.config.command(self.muted)
    }
}

/// Recording sink spec: the encoder command, reused verbatim on respawn.
#[derive(Debug, Clone)]
pub struct Recording(pub CommandSpec);

impl SinkCommand for Recording {
    fn label(&self) -> &'static str {
        "recording"
    }

    fn command(&self) -> CommandSpec {
        self.0.clone()
    }
}

/// Result of offering one chunk to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Written,
    /// The sink was dead; nothing was written.
    Skipped,
    /// The write failed and the sink process was terminated.
    Failed,
}

/// A sink process plus the spec it was spawned from.
#[derive(Debug)]
pub struct Sink<C> {
    spec: C,
    process: ProcessHandle,
    kill: KillSwitch,
    respawns: u64,
}

pub type PlaybackSink = Sink<Playback>;
pub type RecordingSink = Sink<Recording>;

impl<C: SinkCommand> Sink<C> {
    pub fn spawn(spec: C) -> Result<Self, RelayError> {
        let process = ProcessHandle::spawn(spec.label(), &spec.command(), Pipes::Stdin)?;
        let kill = KillSwitch::default();
        kill.arm(process.id());
        Ok(Self {
            spec,
            process,
            kill,
            respawns: 0,
        })
    }

    /// Out-of-band terminator for the current process, valid across respawns.
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    pub const fn spec(&self) -> &C {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// Number of times this sink has been replaced.
    pub const fn respawns(&self) -> u64 {
        self.respawns
    }

    pub fn is_alive(&mut self) -> bool {
        let alive = self.process.is_alive();
        if !alive {
            self.kill.disarm();
        }
        alive
    }

    pub fn terminate(&mut self) {
        self.kill.disarm();
        self.process.terminate();
    }

    /// Replace the process with a fresh one built from the current spec.
    ///
    /// On failure the old (terminated) process stays in place, so the next
    /// liveness check reports dead and retries.
    pub fn respawn(&mut self) -> Result<(), RelayError> {
        self.terminate();
        let process = ProcessHandle::spawn(self.spec.label(), &self.spec.command(), Pipes::Stdin)?;
        self.process = process;
        self.kill.arm(self.process.id());
        self.respawns += 1;
        info!(
            label = self.spec.label(),
            pid = ?self.process.id(),
            respawns = self.respawns,
            "Sink respawned"
        );
        Ok(())
    }

    /// Respawn if dead. Returns `true` when a new process was spawned.
    pub fn ensure_alive(&mut self) -> Result<bool, RelayError> {
        if self.is_alive() {
            return Ok(false);
        }
        debug!(label = self.spec.label(), "Sink is dead, respawning");
        self.respawn()?;
        Ok(true)
    }

    /// Write one chunk. A dead sink is never written to.
    pub async fn write(&mut self, chunk: &[u8]) -> Delivery {
        if !self.is_alive() {
            return Delivery::Skipped;
        }
        match self.process.write(chunk).await {
            Ok(()) => Delivery::Written,
            Err(e) => {
                warn!(label = self.spec.label(), error = %e, "Sink write failed, terminating");
                self.terminate();
                Delivery::Failed
            }
        }
    }
}

impl Sink<Playback> {
    pub const fn muted(&self) -> bool {
        self.spec.muted
    }

    /// Change the mute state used by the next (re)spawn.
    pub const fn set_muted(&mut self, muted: bool) {
        self.spec.muted = muted;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn argv(spec: &CommandSpec) -> Vec<String> {
        spec.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn playback_volume_follows_mute() {
        let config = PlaybackConfig::new(CommandSpec::new("mpv"));
        assert!(argv(&config.command(false)).contains(&"--volume=100".to_string()));
        assert!(argv(&config.command(true)).contains(&"--volume=0".to_string()));
    }

    #[test]
    fn playback_reads_stdin_with_optional_driver_and_device() {
        let mut config = PlaybackConfig::new(CommandSpec::new("mpv"));
        let plain = argv(&config.command(false));
        assert_eq!(plain.last().map(String::as_str), Some("-"));
        assert!(!plain.iter().any(|a| a.starts_with("--ao=")));

        config.audio_output = Some("wasapi".into());
        config.audio_device = Some("wasapi/{guid}".into());
        let full = argv(&config.command(false));
        let n = full.len();
        assert!(full.contains(&"--ao=wasapi".to_string()));
        assert_eq!(full[n - 2], "--audio-device=wasapi/{guid}");
        assert_eq!(full[n - 1], "-");
    }

    #[cfg(unix)]
    fn cat_config() -> Arc<PlaybackConfig> {
        Arc::new(PlaybackConfig::new(
            CommandSpec::new("/bin/sh").arg("-c").arg("exec cat >/dev/null").arg("player"),
        ))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_sink_is_skipped_then_respawned() {
        let mut sink = PlaybackSink::spawn(Playback::new(cat_config(), false)).unwrap();
        assert_eq!(sink.write(b"chunk").await, Delivery::Written);

        let first = sink.pid();
        sink.terminate();
        assert_eq!(sink.write(b"chunk").await, Delivery::Skipped);

        assert!(sink.ensure_alive().unwrap());
        assert_ne!(sink.pid(), first);
        assert_eq!(sink.respawns(), 1);
        assert!(!sink.ensure_alive().unwrap());
        assert_eq!(sink.write(b"chunk").await, Delivery::Written);
        sink.terminate();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn broken_pipe_terminates_sink() {
        // The encoder closes its end of the pipe but keeps running.
        let spec = Recording(
            CommandSpec::new("/bin/sh")
                .arg("-c")
                .arg("exec 0<&-; exec sleep 5"),
        );
        let mut sink = RecordingSink::spawn(spec).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(sink.is_alive());
        assert_eq!(sink.write(b"x").await, Delivery::Failed);
        assert!(!sink.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_switch_follows_respawns() {
        let mut sink = PlaybackSink::spawn(Playback::new(cat_config(), false)).unwrap();
        let switch = sink.kill_switch();
        assert_eq!(switch.pid(), sink.pid());

        sink.respawn().unwrap();
        assert_eq!(switch.pid(), sink.pid());

        // Firing from outside the sink makes the next write fail.
        assert!(switch.fire("playback"));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!sink.is_alive());
        assert!(switch.pid().is_none());
        assert_eq!(sink.write(b"chunk").await, Delivery::Skipped);

        sink.terminate();
        assert!(switch.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn set_muted_applies_on_respawn() {
        let mut sink = PlaybackSink::spawn(Playback::new(cat_config(), false)).unwrap();
        sink.set_muted(true);
        sink.respawn().unwrap();
        assert!(sink.muted());
        assert!(argv(&sink.spec().command()).contains(&"--volume=0".to_string()));
        sink.terminate();
    }
}
