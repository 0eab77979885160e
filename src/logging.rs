//! Diagnostic tracing on stderr.
//!
//! Diagnostics go through `tracing` and are controlled by `RUST_LOG`. What
//! the user is meant to read (spinners, the status table, the summary) is
//! printed by [`crate::ui`] and is unaffected by the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, or
/// `warn,ralph=debug` with `verbose`.
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,ralph=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
