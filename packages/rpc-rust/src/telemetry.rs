//! Tracing subscriber setup for hosts of a client or server.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter` when it is set.
/// With `json` the output is one JSON object per event.
///
/// # Errors
///
/// Returns an error if the filter does not parse or a global subscriber is
/// already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.with_target(false).compact().try_init()
    };

    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
