use anyhow::{bail, Result};
use clap::Subcommand;
use fuku_core::{Context, FukuError, Module, ModuleState};

use crate::workspace::Workspace;

/// Selected AWS region, restricted to the configured list.
pub struct RegionModule;

impl Module for RegionModule {
    fn name(&self) -> &'static str {
        "region"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["profile"]
    }

    fn my_context(&self, state: &ModuleState<'_>) -> fuku_core::Result<Context> {
        let region = state
            .selected()
            .ok_or_else(|| FukuError::usage("no region currently selected"))?;
        Ok(Context::new().with("region", region))
    }

    fn selectable(&self) -> bool {
        true
    }
}

#[derive(Debug, Subcommand)]
pub enum RegionCommand {
    /// List available regions
    Ls,
    /// Select a region, or clear the selection
    Sl { name: Option<String> },
}

pub async fn run(ws: &mut Workspace, cmd: RegionCommand) -> Result<()> {
    match cmd {
        RegionCommand::Ls => {
            for region in sorted_regions(&ws.config().aws.regions) {
                println!("{}", region);
            }
        }
        RegionCommand::Sl { name } => {
            if let Some(name) = &name {
                if !ws.config().aws.regions.contains(name) {
                    bail!("no region \"{}\"", name);
                }
            }
            ws.select("region", name.as_deref())?;
        }
    }
    Ok(())
}

fn sorted_regions(regions: &[String]) -> Vec<&str> {
    let mut sorted: Vec<&str> = regions.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_regions() {
        let regions = vec![
            "us-west-2".to_string(),
            "ap-southeast-2".to_string(),
            "us-west-2".to_string(),
        ];
        assert_eq!(sorted_regions(&regions), vec!["ap-southeast-2", "us-west-2"]);
    }
}
