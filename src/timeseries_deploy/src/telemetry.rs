//! Tracing (logging) setup for binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "timeseries_deploy=info,metric_transform=info";

/// Install the global subscriber: `RUST_LOG` filter (or [`DEFAULT_FILTER`]) and a fmt layer
/// writing to stderr.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
