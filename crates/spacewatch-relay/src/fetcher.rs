//! Fetch process command construction and output streaming.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tracing::debug;

use crate::error::RelayError;
use crate::process::{CommandSpec, Pipes, ProcessHandle};

/// Default read size for the fetch output.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// How the fetch process authenticates, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthMode {
    /// No credentials.
    Guest,
    /// Cookie file or browser-stored cookies.
    Authenticated,
}

impl AuthMode {
    /// Candidate list in escalation order. Never empty.
    pub fn candidates(try_guest_first: bool, allow_cookies: bool) -> Vec<Self> {
        let mut modes = Vec::with_capacity(2);
        if try_guest_first {
            modes.push(Self::Guest);
        }
        if allow_cookies {
            modes.push(Self::Authenticated);
        }
        if modes.is_empty() {
            modes.push(Self::Guest);
        }
        modes
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => f.write_str("guest"),
            Self::Authenticated => f.write_str("cookies"),
        }
    }
}

/// Where credentials come from for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    None,
    File(PathBuf),
    Browser(String),
}

impl CookieSource {
    /// Suffix for the "Starting audio" message.
    pub fn describe(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::File(_) => " (cookies file)".to_string(),
            Self::Browser(browser) => format!(" ({browser} cookies)"),
        }
    }
}

/// Finds the cookie file, if any. Called once per authenticated attempt.
pub type CookieLookup = Arc<dyn Fn() -> Option<PathBuf> + Send + Sync>;

/// Builds and spawns fetch commands.
///
/// The base command is the resolved fetch program plus any leading
/// arguments; mode, retry and output flags are appended per attempt.
#[derive(Clone)]
pub struct SourceFetcher {
    base: CommandSpec,
    cookies_file: CookieLookup,
    cookie_browser: String,
    chunk_size: usize,
}

impl fmt::Debug for SourceFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFetcher")
            .field("base", &self.base)
            .field("cookie_browser", &self.cookie_browser)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl SourceFetcher {
    pub fn new(base: CommandSpec) -> Self {
        Self {
            base,
            cookies_file: Arc::new(|| None),
            cookie_browser: "edge".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Fixed cookie file preferred for authenticated attempts.
    #[must_use]
    pub fn with_cookies_file(self, path: Option<PathBuf>) -> Self {
        self.with_cookies_lookup(Arc::new(move || path.clone()))
    }

    /// Look the cookie file up again for every authenticated attempt, so a
    /// file that appears mid-session is used by the next attempt.
    #[must_use]
    pub fn with_cookies_lookup(mut self, lookup: CookieLookup) -> Self {
        self.cookies_file = lookup;
        self
    }

    /// Browser whose cookie store is used when no file is available.
    #[must_use]
    pub fn with_cookie_browser(mut self, browser: impl Into<String>) -> Self {
        self.cookie_browser = browser.into();
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Credentials for an attempt in `mode`. Runs the cookie lookup.
    pub fn cookie_source(&self, mode: AuthMode) -> CookieSource {
        match mode {
            AuthMode::Guest => CookieSource::None,
            AuthMode::Authenticated => (self.cookies_file)()
                .map_or_else(|| CookieSource::Browser(self.cookie_browser.clone()), CookieSource::File),
        }
    }

    /// Full command line for one attempt.
    pub fn command(&self, url: &str, mode: AuthMode) -> CommandSpec {
        self.command_with(url, self.cookie_source(mode))
    }

    /// Full command line for one attempt with already resolved credentials.
    pub fn command_with(&self, url: &str, source: CookieSource) -> CommandSpec {
        let cmd = match source {
            CookieSource::None => self.base.clone().arg("--no-cookies"),
            CookieSource::File(path) => self.base.clone().arg("--cookies").arg(path),
            CookieSource::Browser(browser) => self
                .base
                .clone()
                .arg("--cookies-from-browser")
                .arg(browser),
        };
        cmd.args([
            "--retries",
            "infinite",
            "--fragment-retries",
            "infinite",
            "--retry-sleep",
            "1",
            "--hls-use-mpegts",
            "-o",
            "-",
            url,
        ])
    }

    /// Spawn the fetch process for one attempt.
    pub fn spawn(
        &self,
        url: &str,
        source: CookieSource,
    ) -> Result<(ProcessHandle, FetchStream), RelayError> {
        let mut process =
            ProcessHandle::spawn("fetch", &self.command_with(url, source), Pipes::Stdout)?;
        let stdout = process.take_stdout().ok_or(RelayError::MissingPipe {
            label: "fetch",
            pipe: "stdout",
        })?;
        Ok((process, FetchStream::new(stdout, self.chunk_size)))
    }
}

/// Finite sequence of output chunks from one fetch process.
#[derive(Debug)]
pub struct FetchStream {
    stdout: ChildStdout,
    buf: BytesMut,
    chunk_size: usize,
    finished: bool,
}

impl FetchStream {
    fn new(stdout: ChildStdout, chunk_size: usize) -> Self {
        Self {
            stdout,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            finished: false,
        }
    }

    /// Next non-empty chunk, or `None` at end of stream.
    ///
    /// A read error ends the stream the same way EOF does.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        self.buf.reserve(self.chunk_size);
        let limit = self.chunk_size;
        let read = (&mut self.stdout)
            .take(limit as u64)
            .read_buf(&mut self.buf)
            .await;
        match read {
            Ok(0) => {
                self.finished = true;
                None
            }
            Ok(_) => Some(self.buf.split().freeze()),
            Err(e) => {
                debug!(error = %e, "Fetch output read failed");
                self.finished = true;
                None
            }
        }
    }
}
