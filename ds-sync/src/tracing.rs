//!
//! Initializes the tracing logs.
//!
//! Precedence of the filter: `--tracing-env-filter`, then `RUST_LOG`, then the
//! `[logging]` section of the config file.
//!

use tracing_subscriber::EnvFilter;

use crate::config::LoggingToml;

/// Builds the filter from the `[logging]` section.
pub fn env_filter_from_config(config: &LoggingToml) -> EnvFilter {
    let mut filter = EnvFilter::new("");
    filter = filter.add_directive(config.level.clone().into());
    for module_level in &config.module_levels {
        filter = filter.add_directive(module_level.clone().into());
    }
    filter
}

/// Initialize the tracing logger. `cli_filter` wins over `RUST_LOG`, which wins over the config.
pub fn init_tracing_logs(config: &LoggingToml, cli_filter: Option<&str>) -> anyhow::Result<()> {
    let env_filter = match cli_filter {
        Some(filter) => EnvFilter::try_new(filter)
            .map_err(|e| anyhow::anyhow!("Invalid tracing env filter '{filter}': {e}"))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| env_filter_from_config(config)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    Ok(())
}
