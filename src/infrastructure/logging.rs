//! Logging system initialization
//!
//! Console logging through `tracing` with an environment-controlled filter.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `RUST_LOG` overrides the default level.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}
