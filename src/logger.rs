//! Logging support.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialises the global tracing subscriber.
///
/// `--verbose` selects debug-level output for this crate; `RUST_LOG` takes
/// precedence over both when set.
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "pixelpilot_mini_rk=debug"
    } else {
        "pixelpilot_mini_rk=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
