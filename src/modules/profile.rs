//! AWS credential profiles and the EC2 instance role they provision

use anyhow::{bail, Context as _, Result};
use clap::Subcommand;
use fuku_core::{Context, Module, ModuleState};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::info;

use crate::aws::{tolerate_code, tolerate_existing, AwsSession};
use crate::workspace::Workspace;

pub const ROLE_NAME: &str = "ec2-role";
pub const ROLE_POLICY_NAME: &str = "ec2-policy";
pub const INSTANCE_PROFILE_NAME: &str = "ec2-profile";

const ASSUME_ROLE_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Principal": {"Service": "ec2.amazonaws.com"},
      "Action": "sts:AssumeRole"
    }
  ]
}"#;

/// Lets node instances join ECS, pull from ECR and ship logs and metrics.
const ROLE_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Action": [
        "ecs:CreateCluster",
        "ecs:DeregisterContainerInstance",
        "ecs:DiscoverPollEndpoint",
        "ecs:Poll",
        "ecs:RegisterContainerInstance",
        "ecs:StartTelemetrySession",
        "ecs:Submit*",
        "ecr:GetAuthorizationToken",
        "ecr:BatchCheckLayerAvailability",
        "ecr:GetDownloadUrlForLayer",
        "ecr:BatchGetImage",
        "logs:CreateLogStream",
        "logs:PutLogEvents",
        "cloudwatch:PutMetricData",
        "ec2:DescribeTags"
      ],
      "Resource": "*"
    }
  ]
}"#;

static SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[\s*(?:profile\s+)?([^\]]+?)\s*\]\s*$").expect("valid section regex")
});

pub struct ProfileModule;

impl Module for ProfileModule {
    fn name(&self) -> &'static str {
        "profile"
    }

    fn my_context(&self, state: &ModuleState<'_>) -> fuku_core::Result<Context> {
        let mut ctx = Context::new();
        if let Some(profile) = state.selected() {
            ctx.insert("profile", profile);
        }
        Ok(ctx)
    }

    fn selectable(&self) -> bool {
        true
    }
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// List profiles from the AWS credentials and config files
    Ls,
    /// Select a profile, or clear the selection
    Sl { name: Option<String> },
    /// Create the EC2 instance role and profile using a profile
    Add { name: String },
    /// Remove the EC2 instance role and profile
    Rm { name: String },
}

pub async fn run(ws: &mut Workspace, cmd: ProfileCommand) -> Result<()> {
    match cmd {
        ProfileCommand::Ls => {
            for name in known_profiles() {
                println!("{}", name);
            }
        }
        ProfileCommand::Sl { name } => {
            if let Some(name) = &name {
                if !known_profiles().contains(name) {
                    bail!("no profile named \"{}\"", name);
                }
            }
            ws.select("profile", name.as_deref())?;
        }
        ProfileCommand::Add { name } => {
            let aws = profile_session(ws, &name).await;
            create_instance_role(&aws.iam()).await?;
        }
        ProfileCommand::Rm { name } => {
            let aws = profile_session(ws, &name).await;
            delete_instance_role(&aws.iam()).await?;
        }
    }
    Ok(())
}

async fn profile_session(ws: &Workspace, profile: &str) -> AwsSession {
    let region = ws
        .selected("region")
        .or_else(|| ws.config().aws.regions.first().map(String::as_str));
    AwsSession::load(region, Some(profile), ws.config().aws.waiter_timeout()).await
}

fn aws_files() -> Vec<PathBuf> {
    dirs::home_dir()
        .map(|home| vec![home.join(".aws/credentials"), home.join(".aws/config")])
        .unwrap_or_default()
}

fn known_profiles() -> BTreeSet<String> {
    aws_files()
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .flat_map(|content| profile_names(&content))
        .collect()
}

/// Section names of an AWS ini file; `[profile x]` counts as `x`.
pub fn profile_names(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| SECTION.captures(line))
        .map(|caps| caps[1].to_string())
        .collect()
}

async fn create_instance_role(iam: &aws_sdk_iam::Client) -> Result<()> {
    tolerate_existing(
        iam.create_role()
            .role_name(ROLE_NAME)
            .assume_role_policy_document(ASSUME_ROLE_POLICY)
            .send()
            .await,
    )
    .context("Failed to create role")?;
    iam.put_role_policy()
        .role_name(ROLE_NAME)
        .policy_name(ROLE_POLICY_NAME)
        .policy_document(ROLE_POLICY)
        .send()
        .await
        .context("Failed to put role policy")?;
    tolerate_existing(
        iam.create_instance_profile()
            .instance_profile_name(INSTANCE_PROFILE_NAME)
            .send()
            .await,
    )
    .context("Failed to create instance profile")?;
    // An instance profile holds one role; IAM reports a second add as a quota hit
    tolerate_code(
        iam.add_role_to_instance_profile()
            .instance_profile_name(INSTANCE_PROFILE_NAME)
            .role_name(ROLE_NAME)
            .send()
            .await,
        "LimitExceeded",
    )
    .context("Failed to add role to instance profile")?;
    info!(role = ROLE_NAME, profile = INSTANCE_PROFILE_NAME, "instance role ready");
    Ok(())
}

async fn delete_instance_role(iam: &aws_sdk_iam::Client) -> Result<()> {
    iam.remove_role_from_instance_profile()
        .instance_profile_name(INSTANCE_PROFILE_NAME)
        .role_name(ROLE_NAME)
        .send()
        .await
        .context("Failed to remove role from instance profile")?;
    iam.delete_instance_profile()
        .instance_profile_name(INSTANCE_PROFILE_NAME)
        .send()
        .await
        .context("Failed to delete instance profile")?;
    iam.delete_role_policy()
        .role_name(ROLE_NAME)
        .policy_name(ROLE_POLICY_NAME)
        .send()
        .await
        .context("Failed to delete role policy")?;
    iam.delete_role()
        .role_name(ROLE_NAME)
        .send()
        .await
        .context("Failed to delete role")?;
    info!(role = ROLE_NAME, "instance role removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_names() {
        let credentials = "[default]\naws_access_key_id = x\n\n[work]\nregion=us-east-1\n";
        let config = "[profile staging ]\nregion = ap-southeast-2\n[default]\n";
        assert_eq!(profile_names(credentials), vec!["default", "work"]);
        assert_eq!(profile_names(config), vec!["staging", "default"]);
        assert!(profile_names("not = a section\n").is_empty());
    }

    #[test]
    fn test_policies_are_json() {
        serde_json::from_str::<serde_json::Value>(ASSUME_ROLE_POLICY).unwrap();
        serde_json::from_str::<serde_json::Value>(ROLE_POLICY).unwrap();
    }
}
