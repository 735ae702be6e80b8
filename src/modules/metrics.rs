//! collectd CloudWatch whitelist on the selected node

use anyhow::{anyhow, Result};
use clap::Subcommand;
use fuku_core::{Capture, Module};

use crate::modules::node;
use crate::workspace::Workspace;

const CONFIG_DIR: &str = "/usr/share/collectd/collectd-cloudwatch/src/cloudwatch/config";

pub struct MetricsModule;

impl Module for MetricsModule {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["node"]
    }
}

#[derive(Debug, Subcommand)]
pub enum MetricsCommand {
    /// List whitelisted metrics
    Ls {
        /// Include inactive metrics
        #[arg(short, long)]
        all: bool,
    },
    /// Whitelist a metric
    Add { name: String },
    /// Remove a metric from the whitelist
    Rm { name: String },
}

pub async fn run(ws: &mut Workspace, cmd: MetricsCommand) -> Result<()> {
    let ctx = ws.context("metrics")?;
    let node_name = ctx
        .get("node")
        .ok_or_else(|| anyhow!("no node currently selected"))?
        .to_string();
    let cluster = ctx.require("cluster")?;
    let aws = ws.aws("node").await?;
    let target = node::find(&aws.ec2(), cluster, &node_name).await?;

    match cmd {
        MetricsCommand::Ls { all } => {
            let output = node::ssh_run(ws, &aws, &ctx, &target, &list_command(all), false, Capture::Text)
                .await?;
            for line in metric_lines(&output.text) {
                println!("{}", line);
            }
        }
        MetricsCommand::Add { name } => {
            node::ssh_run(ws, &aws, &ctx, &target, &add_command(&name), false, Capture::Stream).await?;
        }
        MetricsCommand::Rm { name } => {
            node::ssh_run(ws, &aws, &ctx, &target, &remove_command(&name), false, Capture::Stream)
                .await?;
        }
    }
    Ok(())
}

fn list_command(all: bool) -> String {
    let file = if all { "blocked_metrics" } else { "whitelist.conf" };
    format!("cat {}/{}", CONFIG_DIR, file)
}

fn add_command(name: &str) -> String {
    format!(
        "echo {} >> {}/whitelist.conf; systemctl restart collectd",
        name, CONFIG_DIR
    )
}

/// Drops exact matches of `name` only
fn remove_command(name: &str) -> String {
    format!(
        "sed -i '/^{}$/d' {}/whitelist.conf; systemctl restart collectd",
        sed_escape(name),
        CONFIG_DIR
    )
}

/// Escape a literal for a sed basic regular expression
fn sed_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '.' | '*' | '[' | ']' | '^' | '$' | '\\' | '/') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Metric names from a whitelist file; the first two lines are a header.
fn metric_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().skip(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands() {
        assert!(list_command(false).ends_with("/whitelist.conf"));
        assert!(list_command(true).ends_with("/blocked_metrics"));
        assert!(add_command("cpu-.*").starts_with("echo cpu-.* >> "));
        assert!(remove_command("cpu-.*").starts_with("sed -i '/^cpu-\\.\\*$/d' "));
        assert_eq!(sed_escape("a/b[0]"), "a\\/b\\[0\\]");
    }

    #[test]
    fn test_metric_lines_skip_header() {
        let text = "# whitelist\n\ncpu--cpu.percent\nmemory--memory.used\n";
        assert_eq!(
            metric_lines(text).collect::<Vec<_>>(),
            vec!["cpu--cpu.percent", "memory--memory.used"]
        );
    }
}
