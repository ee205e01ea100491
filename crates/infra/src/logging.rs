use crate::config::AppConfig;
use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber once per binary. JSON lines in production,
/// compact text elsewhere.
pub fn init_tracing(config: &AppConfig, service: &'static str) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|err| {
        eprintln!("invalid log_level '{}': {err}; using info", config.log_level);
        EnvFilter::new("info")
    });

    let installed = if config.is_production() {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_target(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;

    tracing::info!(
        service,
        app_env = %config.app_env,
        data_backend = %config.data_backend,
        "tracing initialised"
    );
    Ok(())
}
