//! spacewatch relay library
//!
//! Supervises one live audio relay session:
//! - Spawning the fetch process and reading its output in chunks
//! - Forwarding every chunk to the playback sink and the optional recording sink
//! - Respawning dead sinks and retrying the fetch with backoff and auth-mode escalation
//! - Hot-swapping the playback sink on mute without interrupting the fetch

pub mod error;
pub mod fetcher;
pub mod policy;
pub mod process;
pub mod sink;
pub mod supervisor;

pub use error::RelayError;
pub use fetcher::{AuthMode, CookieLookup, CookieSource, SourceFetcher};
pub use policy::RetryPolicy;
pub use process::{CommandSpec, KillSwitch, ProcessHandle};
pub use sink::{PlaybackConfig, PlaybackSink, RecordingSink};
pub use supervisor::{LogCallback, RelaySession, RelaySupervisor, SinkStatus};
