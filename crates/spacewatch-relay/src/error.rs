//! Relay error types.
//!
//! Only session-start failures reach the caller. Everything that goes wrong
//! once the forwarding loop runs is retried or reported through the log
//! callback.

use std::path::PathBuf;

/// Errors that can occur while starting a relay session or swapping a sink.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Missing '{}': executable not found", program.display())]
    DependencyMissing { program: PathBuf },

    #[error("Failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned {label} process has no {pipe} pipe")]
    MissingPipe {
        label: &'static str,
        pipe: &'static str,
    },
}

impl RelayError {
    /// Classify a spawn failure; "not found" means the binary is missing.
    pub(crate) fn from_spawn(program: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::DependencyMissing { program }
        } else {
            Self::Spawn { program, source }
        }
    }
}
