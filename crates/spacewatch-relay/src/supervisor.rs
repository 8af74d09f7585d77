//! Relay supervisor: the fetch → sink forwarding loop and its session handle.
//!
//! One forwarding task runs per session:
//!
//! ```text
//! SelectingMode -> Fetching -> Draining -> Backoff -> SelectingMode ...
//!                                  \-> Stopped (only on stop())
//! ```
//!
//! The playback sink, the recording sink and the mute flag live behind a
//! single mutex. Every chunk write takes it for the whole
//! check-respawn-write sequence, and so does the mute toggle, so a chunk is
//! never written to a half-replaced sink. The stop signal is a
//! [`CancellationToken`] and is never reset.
//!
//! A sink that stops reading can block a write, and with it the mutex,
//! indefinitely. Writes are therefore raced against the stop token, and each
//! sink's [`KillSwitch`] is fired without the mutex: by `stop()` always, and
//! by the mute toggle when the lock is not released within [`SWAP_GRACE`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::fetcher::{AuthMode, CookieSource, FetchStream, SourceFetcher};
use crate::policy::{self, RetryPolicy};
use crate::process::{CommandSpec, KillSwitch, ProcessHandle};
use crate::sink::{Delivery, Playback, PlaybackConfig, PlaybackSink, Recording, RecordingSink};

/// How long the mute toggle waits for an in-flight chunk write before it
/// terminates the playback process to unblock it.
pub const SWAP_GRACE: Duration = Duration::from_millis(500);

/// Receives human-readable progress and failure messages.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Factory for relay sessions. Holds everything that is fixed across sessions.
#[derive(Debug, Clone)]
pub struct RelaySupervisor {
    fetcher: SourceFetcher,
    playback: Arc<PlaybackConfig>,
    policy: RetryPolicy,
}

impl RelaySupervisor {
    pub fn new(fetcher: SourceFetcher, playback: PlaybackConfig, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            playback: Arc::new(playback),
            policy,
        }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start a session.
    ///
    /// Spawns the unmuted playback sink and the recording sink (if any), then
    /// launches the forwarding loop and returns immediately; the loop spawns
    /// the first fetch process. Only sink spawn failures are returned.
    pub async fn start(
        &self,
        url: impl Into<String>,
        modes: &[AuthMode],
        recording: Option<CommandSpec>,
        log: LogCallback,
    ) -> Result<RelaySession, RelayError> {
        let url = url.into();
        let mut playback = PlaybackSink::spawn(Playback::new(Arc::clone(&self.playback), false))?;
        let recording = match recording.map(|cmd| RecordingSink::spawn(Recording(cmd))) {
            Some(Ok(sink)) => Some(sink),
            Some(Err(e)) => {
                playback.terminate();
                return Err(e);
            }
            None => None,
        };

        let modes = if modes.is_empty() {
            vec![AuthMode::Guest]
        } else {
            modes.to_vec()
        };
        info!(
            url = %url,
            modes = ?modes,
            recording = recording.is_some(),
            "Starting relay session"
        );

        let kill = KillSwitches {
            playback: playback.kill_switch(),
            recording: recording.as_ref().map(RecordingSink::kill_switch),
        };
        let shared = Arc::new(Shared {
            kill,
            sinks: Mutex::new(Sinks {
                playback,
                recording,
            }),
            fetch: Mutex::new(None),
            stop: CancellationToken::new(),
            modes,
            mode_index: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
            log,
        });

        let worker = tokio::spawn(forward(
            Arc::clone(&shared),
            self.fetcher.clone(),
            self.policy,
            url,
        ));
        let guard = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            if let Err(e) = worker.await {
                let reason = if e.is_panic() {
                    "panicked"
                } else {
                    "was cancelled"
                };
                error!(error = %e, "Forwarding loop {reason}");
                guard.stop.cancel();
                guard.emit(&format!("Audio relay {reason}; stopping audio processes"));
                guard.shutdown().await;
            }
        });

        Ok(RelaySession {
            shared,
            task: StdMutex::new(Some(task)),
        })
    }
}

/// Sink state guarded by the session mutex. The mute flag lives in the
/// playback sink, so a respawn always uses the current mute state.
struct Sinks {
    playback: PlaybackSink,
    recording: Option<RecordingSink>,
}

/// Lock-free terminators for the current sink processes.
struct KillSwitches {
    playback: KillSwitch,
    recording: Option<KillSwitch>,
}

struct Shared {
    kill: KillSwitches,
    sinks: Mutex<Sinks>,
    /// Current fetch process. A fetch is only spawned while holding this
    /// lock with the stop token checked under it.
    fetch: Mutex<Option<ProcessHandle>>,
    stop: CancellationToken,
    /// Candidate modes in escalation order. Never empty.
    modes: Vec<AuthMode>,
    mode_index: AtomicUsize,
    attempts: AtomicU64,
    log: LogCallback,
}

impl Shared {
    fn current_mode(&self) -> AuthMode {
        policy::select_mode(&self.modes, self.mode_index.load(Ordering::SeqCst))
    }

    fn emit(&self, message: &str) {
        info!("{message}");
        (self.log)(message);
    }

    /// Spawn the fetch process for one attempt, unless stop was signalled.
    async fn begin_attempt(
        &self,
        fetcher: &SourceFetcher,
        url: &str,
        source: CookieSource,
    ) -> Result<Option<FetchStream>, RelayError> {
        let mut slot = self.fetch.lock().await;
        if self.stop.is_cancelled() {
            return Ok(None);
        }
        let (process, stream) = fetcher.spawn(url, source)?;
        debug!(pid = ?process.id(), "Fetch process started");
        *slot = Some(process);
        Ok(Some(stream))
    }

    async fn end_attempt(&self) {
        if let Some(mut process) = self.fetch.lock().await.take() {
            process.terminate();
        }
    }

    /// Read and forward chunks until EOF or stop. Returns whether any data arrived.
    async fn drain(&self, mut stream: FetchStream) -> bool {
        let mut got_data = false;
        loop {
            let chunk = tokio::select! {
                () = self.stop.cancelled() => break,
                chunk = stream.next_chunk() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            got_data = true;
            self.forward_chunk(&chunk).await;
        }
        got_data
    }

    async fn forward_chunk(&self, chunk: &[u8]) {
        let mut sinks = self.sinks.lock().await;
        if self.stop.is_cancelled() {
            return;
        }
        let Sinks {
            playback,
            recording,
        } = &mut *sinks;

        if let Err(e) = playback.ensure_alive() {
            warn!(error = %e, "Failed to respawn playback sink");
        }
        if let Some(recording) = recording.as_mut()
            && let Err(e) = recording.ensure_alive()
        {
            warn!(error = %e, "Failed to respawn recording sink");
        }

        let deliver = async {
            if playback.write(chunk).await == Delivery::Failed {
                debug!("Playback sink will be respawned on the next chunk");
            }
            if let Some(recording) = recording.as_mut()
                && recording.write(chunk).await == Delivery::Failed
            {
                debug!("Recording sink will be respawned on the next chunk");
            }
        };
        tokio::select! {
            () = deliver => {}
            () = self.stop.cancelled() => debug!("Chunk write abandoned on stop"),
        }
    }

    /// Terminate recording, playback and fetch, in that order.
    ///
    /// The sink processes are signalled before the sink mutex is taken, so a
    /// write blocked on a stalled sink fails and releases the lock.
    async fn shutdown(&self) {
        if let Some(recording) = &self.kill.recording {
            recording.fire("recording");
        }
        self.kill.playback.fire("playback");
        {
            let mut sinks = self.sinks.lock().await;
            if let Some(recording) = sinks.recording.as_mut() {
                recording.terminate();
            }
            sinks.playback.terminate();
        }
        if let Some(fetch) = self.fetch.lock().await.as_mut() {
            fetch.terminate();
        }
    }
}

/// The forwarding loop. Retries forever; only the stop token ends it.
async fn forward(
    shared: Arc<Shared>,
    fetcher: SourceFetcher,
    policy: RetryPolicy,
    url: String,
) {
    let candidates = shared.modes.len();
    while !shared.stop.is_cancelled() {
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let index = shared.mode_index.load(Ordering::SeqCst);
        let mode = policy::select_mode(&shared.modes, index);
        let source = fetcher.cookie_source(mode);
        shared.emit(&format!(
            "Starting audio ({mode}){} [attempt {attempt}]",
            source.describe()
        ));

        let started = Instant::now();
        let got_data = match shared.begin_attempt(&fetcher, &url, source).await {
            Ok(Some(stream)) => shared.drain(stream).await,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, attempt, "Failed to spawn fetch process");
                shared.emit(&format!("Audio fetch failed to start: {e}"));
                false
            }
        };
        shared.end_attempt().await;

        if shared.stop.is_cancelled() {
            break;
        }

        let elapsed = started.elapsed();
        let fast_fail = policy.is_fast_fail(elapsed);
        let next = policy::next_mode_index(index, fast_fail, candidates);
        if next != index {
            info!(from = index, to = next, "Escalating fetch mode");
            shared.mode_index.store(next, Ordering::SeqCst);
        }
        if !got_data {
            shared.emit("Audio not ready yet, retrying...");
        }

        let delay = policy.next_delay(fast_fail);
        debug!(
            attempt,
            elapsed_ms = elapsed.as_millis(),
            fast_fail,
            got_data,
            delay_ms = delay.as_millis(),
            "Fetch attempt ended"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.stop.cancelled() => break,
        }
    }
    debug!("Forwarding loop stopped");
}

/// Snapshot of the sink processes, for status display and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStatus {
    pub muted: bool,
    pub playback_pid: Option<u32>,
    pub playback_alive: bool,
    pub playback_respawns: u64,
    /// `None` when the session does not record.
    pub recording_alive: Option<bool>,
    pub recording_respawns: u64,
}

/// Handle to a running relay session.
pub struct RelaySession {
    shared: Arc<Shared>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("stopped", &self.is_stopped())
            .field("mode_index", &self.mode_index())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

impl RelaySession {
    /// Signal stop, then terminate the recording sink, the playback sink and
    /// the fetch process. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.shared.stop.is_cancelled() {
            info!("Stopping relay session");
        }
        self.shared.stop.cancel();
        self.shared.shutdown().await;
    }

    /// Flip the mute state by replacing the playback sink. Returns the new state.
    ///
    /// After stop, only the flag changes and nothing is spawned.
    ///
    /// If a chunk write holds the sink lock for longer than [`SWAP_GRACE`]
    /// (a player that stopped reading), the playback process is terminated
    /// to release it.
    pub async fn toggle_mute(&self) -> Result<bool, RelayError> {
        let mut sinks = match tokio::time::timeout(SWAP_GRACE, self.shared.sinks.lock()).await {
            Ok(sinks) => sinks,
            Err(_) => {
                warn!("Playback write is stalled, terminating the player");
                self.shared.kill.playback.fire("playback");
                self.shared.sinks.lock().await
            }
        };
        let muted = !sinks.playback.muted();
        sinks.playback.set_muted(muted);
        if self.shared.stop.is_cancelled() {
            sinks.playback.terminate();
        } else {
            sinks.playback.respawn()?;
        }
        info!(muted, "Playback mute toggled");
        Ok(muted)
    }

    pub async fn is_muted(&self) -> bool {
        self.shared.sinks.lock().await.playback.muted()
    }

    pub async fn sink_status(&self) -> SinkStatus {
        let mut sinks = self.shared.sinks.lock().await;
        let playback_alive = sinks.playback.is_alive();
        let (recording_alive, recording_respawns) = match sinks.recording.as_mut() {
            Some(r) => (Some(r.is_alive()), r.respawns()),
            None => (None, 0),
        };
        SinkStatus {
            muted: sinks.playback.muted(),
            playback_pid: sinks.playback.pid(),
            playback_alive,
            playback_respawns: sinks.playback.respawns(),
            recording_alive,
            recording_respawns,
        }
    }

    /// Index into the candidate mode list used by the current attempt.
    pub fn mode_index(&self) -> usize {
        self.shared.mode_index.load(Ordering::SeqCst)
    }

    /// Mode of the current (or next) attempt.
    pub fn current_mode(&self) -> AuthMode {
        self.shared.current_mode()
    }

    /// Number of fetch attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Wait for the forwarding loop to finish. Returns immediately on later calls.
    pub async fn wait(&self) {
        let task = self.task_slot().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Relay supervisor task failed");
        }
    }

    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        if !self.shared.stop.is_cancelled() {
            // Dropped without stop(): the loop and the children are cleaned up
            // in the background.
            self.shared.stop.cancel();
            let shared = Arc::clone(&self.shared);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { shared.shutdown().await });
            }
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script).arg("spacewatch-test")
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            fast_fail_window: Duration::from_millis(500),
            fast_fail_delay: Duration::from_millis(20),
            steady_delay: Duration::from_millis(10),
        }
    }

    fn quiet() -> LogCallback {
        Arc::new(|_: &str| {})
    }

    fn supervisor(fetch: &str) -> RelaySupervisor {
        RelaySupervisor::new(
            SourceFetcher::new(sh(fetch)),
            PlaybackConfig::new(sh("exec cat >/dev/null")),
            quick_policy(),
        )
    }

    #[tokio::test]
    async fn start_fails_when_player_is_missing() {
        let supervisor = RelaySupervisor::new(
            SourceFetcher::new(sh("exit 0")),
            PlaybackConfig::new(CommandSpec::new("/nonexistent/spacewatch-player")),
            quick_policy(),
        );
        let err = supervisor
            .start("https://x.com/i/spaces/1x", &[AuthMode::Guest], None, quiet())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DependencyMissing { .. }));
    }

    #[tokio::test]
    async fn recording_failure_aborts_start() {
        let supervisor = supervisor("exit 0");
        let result = supervisor
            .start(
                "https://x.com/i/spaces/1x",
                &[AuthMode::Guest],
                Some(CommandSpec::new("/nonexistent/spacewatch-encoder")),
                quiet(),
            )
            .await;
        assert!(matches!(result, Err(RelayError::DependencyMissing { .. })));
    }

    #[tokio::test]
    async fn empty_mode_list_runs_as_guest() {
        let messages = Arc::new(StdMutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&messages);
        let log: LogCallback = Arc::new(move |m: &str| sink.lock().unwrap().push(m.to_string()));

        let session = supervisor("exit 0")
            .start("https://x.com/i/spaces/1x", &[], None, log)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.stop().await;

        let messages = messages.lock().unwrap();
        assert!(messages[0].starts_with("Starting audio (guest) [attempt 1]"));
        assert_eq!(session.mode_index(), 0);
        assert_eq!(session.current_mode(), AuthMode::Guest);
    }

    #[tokio::test]
    async fn toggle_mute_returns_negation_and_keeps_one_live_sink() {
        let session = supervisor("exec sleep 30")
            .start("https://x.com/i/spaces/1x", &[AuthMode::Guest], None, quiet())
            .await
            .unwrap();
        let before = session.sink_status().await;
        assert!(!before.muted);

        assert!(session.toggle_mute().await.unwrap());
        let after = session.sink_status().await;
        assert!(after.muted && after.playback_alive);
        assert_ne!(after.playback_pid, before.playback_pid);

        assert!(!session.toggle_mute().await.unwrap());
        assert!(!session.is_muted().await);
        assert_eq!(session.sink_status().await.playback_respawns, 2);

        session.stop().await;
        session.wait().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_the_loop() {
        let session = supervisor("exec sleep 30")
            .start("https://x.com/i/spaces/1x", &[AuthMode::Guest], None, quiet())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.stop().await;
        session.stop().await;
        tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        session.wait().await;

        assert!(session.is_stopped());
        let status = session.sink_status().await;
        assert!(!status.playback_alive);
        assert_eq!(session.attempts(), 1);
    }

    #[tokio::test]
    async fn loop_panic_stops_the_session() {
        let messages = Arc::new(StdMutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&messages);
        let log: LogCallback = Arc::new(move |m: &str| {
            assert!(!m.starts_with("Starting audio"), "log callback failure");
            sink.lock().unwrap().push(m.to_string());
        });

        let session = supervisor("exec sleep 30")
            .start("https://x.com/i/spaces/1x", &[AuthMode::Guest], None, log)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();

        assert!(session.is_stopped());
        assert!(!session.sink_status().await.playback_alive);
        assert!(
            messages
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.starts_with("Audio relay panicked"))
        );

        // No loop is left to feed a new player.
        assert!(session.toggle_mute().await.unwrap());
        assert_eq!(session.sink_status().await.playback_respawns, 0);
    }

    #[tokio::test]
    async fn toggle_after_stop_spawns_nothing() {
        let session = supervisor("exit 0")
            .start("https://x.com/i/spaces/1x", &[AuthMode::Guest], None, quiet())
            .await
            .unwrap();
        session.stop().await;
        assert!(session.toggle_mute().await.unwrap());
        let status = session.sink_status().await;
        assert!(!status.playback_alive);
        assert_eq!(status.playback_respawns, 0);
    }
}
