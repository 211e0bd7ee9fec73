//! Logging setup
//!
//! Installs the global `tracing` subscriber according to [`LoggingConfig`].

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use crate::cli::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level; `verbose` forces debug.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        "pretty" => builder
            .with_file(true)
            .with_line_number(true)
            .try_init(),
        other => bail!("Unknown log format: {}", other),
    };

    if let Err(e) = installed {
        bail!("Failed to install log subscriber: {}", e);
    }

    Ok(())
}
