//! Everything a command handler needs for one invocation
//!
//! Owns the module [`Client`] (store, registry, selections), the loaded
//! configuration and the command runner. AWS sessions and the object store
//! are built on demand from a module's dependency context.

use anyhow::Result;
use fuku_config::FukuConfig;
use fuku_core::{
    Client, CommandOutput, CommandRunner, Context, SecureFiles, ShellCommand,
};
use std::path::{Path, PathBuf};

use crate::aws::{AwsSession, S3ObjectStore};

pub struct Workspace {
    client: Client,
    config: FukuConfig,
    runner: Box<dyn CommandRunner>,
    rc_dir: PathBuf,
}

impl Workspace {
    pub fn new(client: Client, config: FukuConfig, runner: Box<dyn CommandRunner>) -> Self {
        let rc_dir = config.paths.rc_dir();
        Self {
            client,
            config,
            runner,
            rc_dir,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn config(&self) -> &FukuConfig {
        &self.config
    }

    pub fn rc_dir(&self) -> &Path {
        &self.rc_dir
    }

    /// Full context of `module`
    pub fn context(&self, module: &str) -> Result<Context> {
        Ok(self.client.context(module)?)
    }

    pub fn selected(&self, module: &str) -> Option<&str> {
        self.client.selected(module)
    }

    pub fn select(&mut self, module: &str, value: Option<&str>) -> Result<()> {
        Ok(self.client.select(module, value)?)
    }

    /// AWS session for `module`, from its dependencies' `region` and `profile`.
    pub async fn aws(&self, module: &str) -> Result<AwsSession> {
        let ctx = self.client.dependency_context(module)?;
        Ok(AwsSession::from_context(&ctx, self.config.aws.waiter_timeout()).await)
    }

    /// Object store in the configured bucket, reached with `module`'s session.
    pub async fn objects(&self, module: &str) -> Result<S3ObjectStore> {
        let bucket = self.client.context("configuration")?.require("bucket")?.to_string();
        let aws = self.aws(module).await?;
        Ok(S3ObjectStore::new(aws.s3(), bucket))
    }

    pub fn secure<'a>(&'a self, objects: &'a S3ObjectStore) -> SecureFiles<'a> {
        SecureFiles::new(&self.rc_dir, objects, self.runner.as_ref())
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn run(&self, command: ShellCommand) -> Result<CommandOutput> {
        Ok(self.runner.run(command)?)
    }

    pub fn save(&self) -> Result<()> {
        Ok(self.client.save()?)
    }
}
