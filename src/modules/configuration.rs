//! Account-wide settings; currently the bucket holding fuku's objects

use anyhow::Result;
use clap::Subcommand;
use fuku_core::{Context, FukuError, Module, ModuleState, SELECTED};

use crate::aws::s3::ensure_bucket;
use crate::workspace::Workspace;

pub const BUCKET: &str = "bucket";

pub struct ConfigurationModule;

impl Module for ConfigurationModule {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["region"]
    }

    fn my_context(&self, state: &ModuleState<'_>) -> fuku_core::Result<Context> {
        let bucket = state
            .get_str(BUCKET)
            .ok_or_else(|| FukuError::usage("bucket not set"))?;
        Ok(Context::new().with(BUCKET, bucket))
    }

    fn persisted_keys(&self) -> &'static [&'static str] {
        &[SELECTED, BUCKET]
    }
}

#[derive(Debug, Subcommand)]
pub enum ConfigurationCommand {
    /// Set the bucket, creating it when missing
    Bucket { name: String },
    /// Show stored configuration
    Ls,
}

pub async fn run(ws: &mut Workspace, cmd: ConfigurationCommand) -> Result<()> {
    match cmd {
        ConfigurationCommand::Bucket { name } => {
            let region = ws.client().dependency_context("configuration")?;
            let region = region.require("region")?.to_string();
            let aws = ws.aws("configuration").await?;
            ensure_bucket(&aws.s3(), &name, &region).await?;
            ws.client_mut().store_mut().set("configuration", BUCKET, name);
        }
        ConfigurationCommand::Ls => {
            if let Some(bucket) = ws.client().store().get_str("configuration", BUCKET) {
                println!("bucket: {}", bucket);
            }
        }
    }
    Ok(())
}
