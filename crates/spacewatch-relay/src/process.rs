//! Child process wrapper shared by the fetcher and the sinks.
//!
//! A [`ProcessHandle`] owns one spawned child and knows nothing about what the
//! child does. Liveness is a non-blocking exit poll; a handle that has been
//! terminated reports dead even while the OS process is still exiting.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::RelayError;

/// A resolved, ready-to-spawn command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Which standard streams of the child are piped back to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipes {
    /// Bytes are written to the child's stdin (sinks).
    Stdin,
    /// Bytes are read from the child's stdout (fetcher).
    Stdout,
}

/// One spawned child process.
#[derive(Debug)]
pub struct ProcessHandle {
    label: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    terminated: bool,
}

impl ProcessHandle {
    /// Spawn `spec`. Stderr is always piped and drained into `tracing`.
    pub fn spawn(label: &'static str, spec: &CommandSpec, pipes: Pipes) -> Result<Self, RelayError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .stderr(Stdio::piped());
        match pipes {
            Pipes::Stdin => {
                cmd.stdin(Stdio::piped()).stdout(Stdio::null());
            }
            Pipes::Stdout => {
                cmd.stdin(Stdio::null()).stdout(Stdio::piped());
            }
        }

        debug!(label, command = %spec, "Spawning process");
        let mut child = cmd
            .spawn()
            .map_err(|e| RelayError::from_spawn(spec.program.clone(), e))?;

        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(label, pid, "stderr: {}", line);
                }
            });
        }

        let stdin = match pipes {
            Pipes::Stdin => Some(
                child
                    .stdin
                    .take()
                    .ok_or(RelayError::MissingPipe { label, pipe: "stdin" })?,
            ),
            Pipes::Stdout => None,
        };

        Ok(Self {
            label,
            child,
            stdin,
            terminated: false,
        })
    }

    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// OS process id, `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the stdout pipe. Only the first call returns `Some`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Non-blocking liveness query.
    pub fn is_alive(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(label = self.label, ?status, "Process exited");
                false
            }
            Err(e) => {
                warn!(label = self.label, error = %e, "Failed to poll process status");
                false
            }
        }
    }

    /// Ask the process to exit and mark the handle dead.
    ///
    /// Closes stdin first so encoders see end of input. Calling this on a
    /// handle that is already terminated or exited does nothing.
    pub fn terminate(&mut self) {
        let alive = self.is_alive();
        self.terminated = true;
        self.stdin = None;
        if alive {
            debug!(label = self.label, pid = ?self.child.id(), "Terminating process");
            send_terminate(&mut self.child, self.label);
        }
    }

    /// Write `chunk` to stdin and flush.
    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin is closed")
        })?;
        stdin.write_all(chunk).await?;
        stdin.flush().await
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.stdin = None;
        self.child.wait().await
    }
}

/// Lock-free handle for terminating whatever process a slot currently holds.
///
/// The owner arms it with the pid of each process it spawns and disarms it
/// before that process is reaped. Any clone can fire it without touching the
/// owner, so a task blocked inside the owner cannot keep the process alive.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicU32>);

impl KillSwitch {
    pub fn arm(&self, pid: Option<u32>) {
        self.0.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Currently armed pid.
    pub fn pid(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Send SIGTERM to the armed process and disarm. Returns whether a signal
    /// was delivered.
    pub fn fire(&self, label: &'static str) -> bool {
        match self.0.swap(0, Ordering::SeqCst) {
            0 => false,
            pid => {
                debug!(label, pid, "Terminating process out of band");
                match signal_terminate(pid) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(label, pid, error = %e, "Failed to send SIGTERM");
                        false
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) with SIGTERM has no memory-safety preconditions; the
    // pid belongs to a child we have not reaped yet.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signalling by pid is unix only",
    ))
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, label: &'static str) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = signal_terminate(pid) {
        warn!(label, pid, error = %err, "Failed to send SIGTERM, killing");
        child.start_kill().ok();
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, label: &'static str) {
    if let Err(e) = child.start_kill() {
        warn!(label, error = %e, "Failed to kill process");
    }
}
