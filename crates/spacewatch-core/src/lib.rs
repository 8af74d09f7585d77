//! `spacewatch` Core Library
//!
//! Shared functionality for the relay and its front-end:
//! - Configuration resolution and hierarchy
//! - Discovery of the external binaries and the cookie file
//! - Space URL validation
//! - Recording command planning
//! - Persistent JSON error log
//! - Common error types

pub mod config;
pub mod cookies;
pub mod deps;
pub mod error;
pub mod error_log;
pub mod recording;
pub mod tracing_init;
pub mod url;

pub use config::{Config, WindowRect};
pub use error::{Error, Result};
pub use recording::RecordingPlan;
pub use url::SpaceUrl;
