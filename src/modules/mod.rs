//! Feature modules and their registration
//!
//! Each module file holds the [`fuku_core::Module`] implementation (name,
//! dependencies, context, selection hooks), its clap subcommands and the async
//! handler that runs them against a [`crate::workspace::Workspace`].

use anyhow::Result;
use dialoguer::Confirm;
use fuku_core::{Client, SecureFiles};
use std::path::Path;
use tracing::warn;

pub mod app;
pub mod cluster;
pub mod configuration;
pub mod image;
pub mod metrics;
pub mod node;
pub mod pg;
pub mod profile;
pub mod redis;
pub mod region;
pub mod route;
pub mod service;
pub mod session;
pub mod ssl;
pub mod task;

/// Register every module. Order only matters for display: dependencies are
/// resolved by name.
pub fn register_all(client: &mut Client, rc_dir: &Path) -> fuku_core::Result<()> {
    client.add_module(Box::new(profile::ProfileModule))?;
    client.add_module(Box::new(region::RegionModule))?;
    client.add_module(Box::new(configuration::ConfigurationModule))?;
    client.add_module(Box::new(session::SessionModule))?;
    client.add_module(Box::new(cluster::ClusterModule::new(rc_dir)))?;
    client.add_module(Box::new(node::NodeModule))?;
    client.add_module(Box::new(metrics::MetricsModule))?;
    client.add_module(Box::new(app::AppModule))?;
    client.add_module(Box::new(image::ImageModule))?;
    client.add_module(Box::new(task::TaskModule))?;
    client.add_module(Box::new(service::ServiceModule))?;
    client.add_module(Box::new(pg::PgModule::new(rc_dir)))?;
    client.add_module(Box::new(redis::RedisModule))?;
    client.add_module(Box::new(route::RouteModule))?;
    client.add_module(Box::new(ssl::SslModule))?;
    Ok(())
}

/// Encrypt a cached secure file, asking to retry when gpg fails (usually a
/// mistyped passphrase confirmation).
pub fn encrypt_with_retry(secure: &SecureFiles<'_>, path: &str, purpose: &str) -> Result<()> {
    println!("{}", purpose);
    loop {
        match secure.encrypt(path) {
            Ok(_) => return Ok(()),
            Err(err) => {
                warn!(path, error = %err, "encryption failed");
                let again = Confirm::new()
                    .with_prompt("Encryption failed, try again?")
                    .default(true)
                    .interact()?;
                if !again {
                    return Err(err.into());
                }
            }
        }
    }
}
