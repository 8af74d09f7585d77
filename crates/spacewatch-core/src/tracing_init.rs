//! Tracing subscriber setup for the `spacewatch` binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose events are governed by the `--log-level` flag.
const OWN_TARGETS: [&str; 3] = ["spacewatch", "spacewatch_relay", "spacewatch_core"];

/// Build an env-filter directive that applies `level` to every workspace crate.
///
/// `default_filter("debug")` yields
/// `"spacewatch=debug,spacewatch_relay=debug,spacewatch_core=debug"`.
pub fn default_filter(level: &str) -> String {
    OWN_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. With `log_json` the
/// subscriber emits one JSON object per event. Returns `false` when a global
/// subscriber was already installed (e.g. a second call from tests).
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    installed.is_ok()
}
