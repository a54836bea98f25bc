//! Logging bootstrap for binaries and tests embedding the object server.

use crate::core::{CacheError, Result};
use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|err| CacheError::Config(format!("invalid log filter: {}", err)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| CacheError::Config(format!("tracing already initialized: {}", err)))
}
