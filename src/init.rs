// Initialization utilities for a single CLI invocation
//
// Configuration, logging/tracing setup and workspace construction

use anyhow::{Context as _, Result};
use fuku_config::{FukuConfig, LogConfig, LogFormat};
use fuku_core::{Client, Context, ShellRunner, Store};
use tracing::{debug, warn};

use crate::cli::Cli;
use crate::modules;
use crate::workspace::Workspace;

/// Load configuration, honouring `--config` and `--log-level`.
pub fn load_config(cli: &Cli) -> Result<FukuConfig> {
    let mut config = match &cli.config {
        Some(path) => FukuConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => FukuConfig::load_or_default().context("Failed to load configuration")?,
    };
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
        config.validate()?;
    }
    Ok(config)
}

/// Log configuration warnings; only meaningful after [`init_tracing`].
pub fn report_config_warnings(config: &FukuConfig) {
    for warning in config.warnings() {
        warn!("{}", warning);
    }
}

/// Initialize tracing/logging from the log configuration
pub fn init_tracing(log: &LogConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("warn"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Ignore error if a subscriber is already set (tests initialize repeatedly)
    let _ = match log.format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_writer(std::io::stderr)),
        ),
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_writer(std::io::stderr)),
        ),
    };
}

/// Module client over `store`, with every module registered and the `--app`
/// override applied.
pub fn build_client(config: &FukuConfig, store: Store, app: Option<&str>) -> Result<Client> {
    let mut overrides = Context::new();
    if let Some(app) = app {
        overrides.insert("app", app);
    }
    let mut client = Client::new(store).with_overrides(overrides);
    modules::register_all(&mut client, &config.paths.rc_dir())?;
    Ok(client)
}

/// Workspace backed by the on-disk store and real subprocesses
pub fn build_workspace(config: FukuConfig, app: Option<&str>) -> Result<Workspace> {
    let store_path = config.paths.store_path();
    debug!(store = %store_path.display(), "opening store");
    let store = Store::open(store_path)?;
    let client = build_client(&config, store, app)?;
    Ok(Workspace::new(client, config, Box::new(ShellRunner)))
}
