// fuku - provision and operate AWS-hosted container stacks
//
// A module registry (fuku-core) drives selections and context; each module
// under `modules` contributes clap subcommands and an async handler that talks
// to AWS through the SDK and to local tools (ssh, docker, gpg, psql) through
// the command runner.

use anyhow::{Context as _, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing::debug;

pub mod aws;
pub mod cli;
mod init;
pub mod modules;
pub mod workspace;

pub use cli::{Cli, Commands};
pub use init::{build_client, build_workspace, init_tracing, load_config};
pub use workspace::Workspace;

/// Dispatch one parsed command against a workspace.
pub async fn dispatch(ws: &mut Workspace, command: Commands) -> Result<()> {
    debug!(module = command.module(), "dispatching command");
    match command {
        Commands::Profile { command } => modules::profile::run(ws, command).await,
        Commands::Region { command } => modules::region::run(ws, command).await,
        Commands::Configuration { command } => modules::configuration::run(ws, command).await,
        Commands::Session { command } => modules::session::run(ws, command).await,
        Commands::Cluster { command } => modules::cluster::run(ws, command).await,
        Commands::Node { command } => modules::node::run(ws, command).await,
        Commands::Metrics { command } => modules::metrics::run(ws, command).await,
        Commands::App { command } => modules::app::run(ws, command).await,
        Commands::Image { command } => modules::image::run(ws, command).await,
        Commands::Task { command } => modules::task::run(ws, command).await,
        Commands::Service { command } => modules::service::run(ws, command).await,
        Commands::Pg { command } => modules::pg::run(ws, command).await,
        Commands::Redis { command } => modules::redis::run(ws, command).await,
        Commands::Route { command } => modules::route::run(ws, command).await,
        Commands::Ssl { command } => modules::ssl::run(ws, command).await,
    }
}

/// Run a parsed command line: load config, set up logging, dispatch, and save
/// the store only when the handler succeeds.
pub fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    init_tracing(&config.log);
    init::report_config_warnings(&config);

    let Cli { command, app, .. } = cli;
    let mut ws = build_workspace(config, app.as_deref())?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(dispatch(&mut ws, command))?;

    ws.save()
}

/// Process entry point: parse arguments, run, and map any error to a single
/// line on stderr and exit status 1.
pub fn entry() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::from(1)
        }
    }
}
