//! A redis task for the app, and wiring other tasks to it

use anyhow::Result;
use clap::Subcommand;
use fuku_core::Module;
use std::collections::BTreeMap;

use crate::modules::task::Tasks;
use crate::workspace::Workspace;

const TASK: &str = "redis";
const IMAGE: &str = "!redis:alpine";
const MEMORY: i32 = 64;

pub struct RedisModule;

impl Module for RedisModule {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["task"]
    }
}

#[derive(Debug, Subcommand)]
pub enum RedisCommand {
    /// Create the app's redis task
    Mk,
    /// Set REDIS_URL on a task
    Connect { target: String },
}

pub fn url(app: &str) -> String {
    format!("redis://{}-{}:6379", app, TASK)
}

pub async fn run(ws: &mut Workspace, cmd: RedisCommand) -> Result<()> {
    let ctx = ws.context("redis")?;
    let aws = ws.aws("redis").await?;
    let tasks = Tasks::new(&aws, &ctx)?;

    match cmd {
        RedisCommand::Mk => {
            tasks.make(TASK, IMAGE, None, Some(MEMORY)).await?;
        }
        RedisCommand::Connect { target } => {
            let env = BTreeMap::from([("REDIS_URL".to_string(), url(tasks.app()))]);
            tasks.set_env(Some(&target), env).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        assert_eq!(url("shop"), "redis://shop-redis:6379");
    }
}
