//! Tracing subscriber initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::ClientError;

const DEFAULT_FILTER: &str = "codelingo_client=info,warn";

/// Install the JSON subscriber, filtered by `RUST_LOG` when set.
///
/// Logs go to stderr so command output on stdout stays machine readable.
pub fn init_tracing() -> Result<(), ClientError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| ClientError::Telemetry(format!("Failed to init subscriber: {}", e)))?;

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "tracing initialized");
    Ok(())
}
