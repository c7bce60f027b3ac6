//! Process-wide log setup shared by the worker and `leaseflowctl`.

use tracing_subscriber::EnvFilter;

use crate::config::env_bool;

/// Install the global subscriber. `RUST_LOG` filters (default `info`);
/// `LEASEFLOW_LOG_JSON` switches to one JSON object per line.
///
/// Returns `false` when a global subscriber was already installed; the
/// existing one stays in place and the refusal is logged through it.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if env_bool("LEASEFLOW_LOG_JSON").unwrap_or(false) {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    match installed {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "tracing subscriber not installed");
            false
        }
    }
}
