//! EC2 container instances of a cluster, plus its SSH bastion
//!
//! Nodes live in the private subnets and are reached through the bastion:
//! `ssh -A` to the bastion's public address, then on to the node's private
//! address. Remote commands travel base64-encoded so no quoting survives two
//! shells.

use anyhow::{anyhow, bail, Context as _, Result};
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::types::{
    Filter, IamInstanceProfileSpecification, Instance, InstanceNetworkInterfaceSpecification,
    InstanceType, Tag,
};
use aws_sdk_ecs::types::{Attribute, TargetType};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Subcommand;
use fuku_core::{validate, Capture, CommandOutput, Context, Module, ModuleState, ShellCommand};
use serde_json::json;
use tracing::info;

use crate::aws::network::{self, Tier};
use crate::aws::{cluster_resource, AwsSession};
use crate::modules::profile::INSTANCE_PROFILE_NAME;
use crate::workspace::Workspace;

pub const BASTION: &str = "bastion";
pub const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";
const BASTION_INSTANCE_TYPE: &str = "t2.nano";

/// Every state an instance can be found in before it is gone for good
const LIVE_STATES: &[&str] = &["pending", "running", "shutting-down", "stopping", "stopped"];

pub struct NodeModule;

impl Module for NodeModule {
    fn name(&self) -> &'static str {
        "node"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["cluster"]
    }

    fn my_context(&self, state: &ModuleState<'_>) -> fuku_core::Result<Context> {
        let mut ctx = Context::new();
        if let Some(node) = state.selected() {
            ctx.insert("node", node);
        }
        Ok(ctx)
    }

    fn selectable(&self) -> bool {
        true
    }
}

#[derive(Debug, Subcommand)]
pub enum NodeCommand {
    /// List nodes, or show one node
    Ls { name: Option<String> },
    /// Launch a container instance
    Mk {
        name: String,
        /// Availability zone
        #[arg(short = 'a', long = "availability-zone", value_parser = ["a", "b"])]
        zone: Option<String>,
        /// Instance type
        #[arg(short = 't', long = "type", default_value = DEFAULT_INSTANCE_TYPE)]
        instance_type: String,
    },
    /// Launch the bastion in a public subnet
    Bastion,
    /// Set ECS attributes on a node (key=value ...)
    Putattr { name: String, values: Vec<String> },
    /// Terminate a node
    Rm { name: String },
    /// Reboot a node (the selected one by default)
    Reboot { name: Option<String> },
    /// Wait until a node passes its status checks
    Wait { name: String },
    /// Open a shell on a node
    Ssh { name: Option<String> },
    /// Select a node, or clear the selection
    Sl { name: Option<String> },
}

/// The parts of an EC2 instance fuku cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInstance {
    pub id: String,
    pub name: String,
    pub state: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub bastion: bool,
}

impl NodeInstance {
    fn from_sdk(instance: &Instance) -> Option<Self> {
        let tag = |key: &str| {
            instance
                .tags()
                .iter()
                .find(|t| t.key() == Some(key))
                .and_then(|t| t.value())
                .map(str::to_string)
        };
        Some(Self {
            id: instance.instance_id()?.to_string(),
            name: tag("name").unwrap_or_default(),
            state: instance
                .state()
                .and_then(|s| s.name())
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            private_ip: instance.private_ip_address().map(str::to_string),
            public_ip: instance.public_ip_address().map(str::to_string),
            bastion: tag("bastion").as_deref() == Some("true"),
        })
    }

    fn private_ip(&self) -> Result<&str> {
        self.private_ip
            .as_deref()
            .ok_or_else(|| anyhow!("node \"{}\" has no private address", self.name))
    }
}

pub async fn run(ws: &mut Workspace, cmd: NodeCommand) -> Result<()> {
    let ctx = ws.context("node")?;
    let cluster = ctx.require("cluster")?.to_string();
    let aws = ws.aws("node").await?;
    let ec2 = aws.ec2();

    match cmd {
        NodeCommand::Ls { name: Some(name) } => {
            let node = find(&ec2, &cluster, &name).await?;
            let details = json!({
                "id": node.id,
                "name": node.name,
                "state": node.state,
                "private_ip": node.private_ip,
                "public_ip": node.public_ip,
                "bastion": node.bastion,
            });
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        NodeCommand::Ls { name: None } => {
            for node in list(&ec2, &cluster, LIVE_STATES).await? {
                println!("{}", node.name);
            }
        }
        NodeCommand::Mk {
            name,
            zone,
            instance_type,
        } => {
            make(ws, &aws, &ctx, &name, zone.as_deref(), &instance_type).await?;
        }
        NodeCommand::Bastion => make_bastion(ws, &aws, &ctx).await?,
        NodeCommand::Putattr { name, values } => {
            put_attributes(&aws, &cluster, &name, &values).await?;
        }
        NodeCommand::Rm { name } => {
            let node = find(&ec2, &cluster, &name).await?;
            ec2.terminate_instances()
                .instance_ids(&node.id)
                .send()
                .await
                .context("Failed to terminate instance")?;
            info!(node = %name, id = %node.id, "terminated node");
        }
        NodeCommand::Reboot { name } => {
            let name = name
                .or_else(|| ctx.get("node").map(str::to_string))
                .ok_or_else(|| anyhow!("unknown node"))?;
            let node = find(&ec2, &cluster, &name).await?;
            ec2.reboot_instances()
                .instance_ids(&node.id)
                .send()
                .await
                .context("Failed to reboot instance")?;
        }
        NodeCommand::Wait { name } => {
            let node = find(&ec2, &cluster, &name).await?;
            wait_status_ok(&aws, &node.id).await?;
        }
        NodeCommand::Ssh { name } => {
            let name = name
                .or_else(|| ctx.get("node").map(str::to_string))
                .ok_or_else(|| anyhow!("unknown node"))?;
            let node = find(&ec2, &cluster, &name).await?;
            ssh_run(ws, &aws, &ctx, &node, "", true, Capture::Stream).await?;
        }
        NodeCommand::Sl { name } => {
            if let Some(name) = &name {
                let names: Vec<String> = list(&ec2, &cluster, LIVE_STATES)
                    .await?
                    .into_iter()
                    .map(|n| n.name)
                    .collect();
                if !names.contains(name) {
                    bail!("no node \"{}\"", name);
                }
            }
            ws.select("node", name.as_deref())?;
        }
    }
    Ok(())
}

/// Instances tagged with `cluster` in one of `states`.
pub async fn list(
    ec2: &aws_sdk_ec2::Client,
    cluster: &str,
    states: &[&str],
) -> Result<Vec<NodeInstance>> {
    let mut filters = vec![Filter::builder().name("tag:cluster").values(cluster).build()];
    filters.push(
        Filter::builder()
            .name("instance-state-name")
            .set_values(Some(states.iter().map(|s| s.to_string()).collect()))
            .build(),
    );
    describe(ec2, filters).await
}

/// The node called `name` in `cluster`.
pub async fn find(ec2: &aws_sdk_ec2::Client, cluster: &str, name: &str) -> Result<NodeInstance> {
    let filters = vec![
        Filter::builder().name("tag:cluster").values(cluster).build(),
        Filter::builder().name("tag:name").values(name).build(),
        Filter::builder()
            .name("instance-state-name")
            .set_values(Some(LIVE_STATES.iter().map(|s| s.to_string()).collect()))
            .build(),
    ];
    describe(ec2, filters)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no node in cluster \"{}\" with name \"{}\"", cluster, name))
}

/// A running node that is not the bastion, for one-off commands.
pub async fn any_worker(ec2: &aws_sdk_ec2::Client, cluster: &str) -> Result<NodeInstance> {
    list(ec2, cluster, &["running"])
        .await?
        .into_iter()
        .find(|node| !node.bastion)
        .ok_or_else(|| anyhow!("no nodes available"))
}

async fn describe(ec2: &aws_sdk_ec2::Client, filters: Vec<Filter>) -> Result<Vec<NodeInstance>> {
    let mut nodes = Vec::new();
    let mut token = None;
    loop {
        let output = ec2
            .describe_instances()
            .set_filters(Some(filters.clone()))
            .set_next_token(token)
            .send()
            .await
            .context("Failed to describe instances")?;
        nodes.extend(
            output
                .reservations()
                .iter()
                .flat_map(|r| r.instances())
                .filter_map(NodeInstance::from_sdk),
        );
        token = output.next_token().map(str::to_string);
        if token.is_none() {
            break;
        }
    }
    Ok(nodes)
}

/// Script that joins a fresh instance to the cluster's ECS cluster.
pub fn user_data(cluster: &str) -> String {
    let script = format!(
        "#!/bin/bash\necho ECS_CLUSTER={} >> /etc/ecs/ecs.config",
        cluster_resource(cluster)
    );
    STANDARD.encode(script)
}

fn name_tags(cluster: &str, name: &str) -> Vec<Tag> {
    [
        ("Name", format!("fuku-{}-{}", cluster, name)),
        ("name", name.to_string()),
        ("cluster", cluster.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| Tag::builder().key(k).value(v).build())
    .collect()
}

fn ami<'a>(ws: &'a Workspace, ctx: &Context) -> Result<&'a str> {
    let region = ctx.require("region")?;
    ws.config()
        .aws
        .ecs_ami(region)
        .ok_or_else(|| anyhow!("no ECS AMI configured for region \"{}\"", region))
}

async fn make(
    ws: &Workspace,
    aws: &AwsSession,
    ctx: &Context,
    name: &str,
    zone: Option<&str>,
    instance_type: &str,
) -> Result<()> {
    validate(name)?;
    let cluster = ctx.require("cluster")?;
    let ec2 = aws.ec2();
    let existing = list(&ec2, cluster, LIVE_STATES).await?;
    if existing.iter().any(|n| n.name == name) {
        bail!("node \"{}\" already exists", name);
    }

    let sg_id = network::security_group_id(&ec2, cluster).await?;
    let subnet = network::subnet(&ec2, cluster, Tier::Private, zone).await?;
    let output = ec2
        .run_instances()
        .image_id(ami(ws, ctx)?)
        .subnet_id(subnet)
        .key_name(cluster_resource(cluster))
        .security_group_ids(sg_id)
        .instance_type(InstanceType::from(instance_type))
        .iam_instance_profile(
            IamInstanceProfileSpecification::builder()
                .name(INSTANCE_PROFILE_NAME)
                .build(),
        )
        .min_count(1)
        .max_count(1)
        .user_data(user_data(cluster))
        .send()
        .await
        .context("Failed to launch instance")?;
    let id = first_instance_id(&output)?;

    let mut tags = name_tags(cluster, name);
    tags.push(Tag::builder().key("node").value("worker").build());
    ec2.create_tags()
        .resources(&id)
        .set_tags(Some(tags))
        .send()
        .await
        .context("Failed to tag instance")?;
    info!(node = name, %id, "launched node, waiting for status checks");
    wait_status_ok(aws, &id).await
}

async fn make_bastion(ws: &Workspace, aws: &AwsSession, ctx: &Context) -> Result<()> {
    let cluster = ctx.require("cluster")?;
    let ec2 = aws.ec2();
    let sg_id = network::security_group_id(&ec2, cluster).await?;
    let subnet = network::subnet(&ec2, cluster, Tier::Public, None).await?;
    let output = ec2
        .run_instances()
        .image_id(ami(ws, ctx)?)
        .network_interfaces(
            InstanceNetworkInterfaceSpecification::builder()
                .device_index(0)
                .subnet_id(subnet)
                .groups(sg_id)
                .associate_public_ip_address(true)
                .build(),
        )
        .key_name(cluster_resource(cluster))
        .instance_type(InstanceType::from(BASTION_INSTANCE_TYPE))
        .iam_instance_profile(
            IamInstanceProfileSpecification::builder()
                .name(INSTANCE_PROFILE_NAME)
                .build(),
        )
        .min_count(1)
        .max_count(1)
        .send()
        .await
        .context("Failed to launch bastion")?;
    let id = first_instance_id(&output)?;

    let mut tags = name_tags(cluster, BASTION);
    tags.push(Tag::builder().key("bastion").value("true").build());
    ec2.create_tags()
        .resources(&id)
        .set_tags(Some(tags))
        .send()
        .await
        .context("Failed to tag bastion")?;
    info!(%id, "launched bastion, waiting for status checks");
    wait_status_ok(aws, &id).await
}

fn first_instance_id(output: &aws_sdk_ec2::operation::run_instances::RunInstancesOutput) -> Result<String> {
    output
        .instances()
        .first()
        .and_then(|i| i.instance_id())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no instance returned"))
}

pub async fn wait_status_ok(aws: &AwsSession, id: &str) -> Result<()> {
    aws.ec2()
        .wait_until_instance_status_ok()
        .instance_ids(id)
        .wait(aws.waiter_timeout())
        .await
        .with_context(|| format!("Instance {} did not pass status checks", id))?;
    Ok(())
}

async fn put_attributes(aws: &AwsSession, cluster: &str, name: &str, values: &[String]) -> Result<()> {
    let pairs = crate::aws::task_def::parse_pairs(values)?;
    let node = find(&aws.ec2(), cluster, name).await?;
    let ecs = aws.ecs();
    let arn = container_instance_arn(&ecs, cluster, &node.id).await?;

    let mut attributes = Vec::new();
    for (key, value) in pairs {
        attributes.push(
            Attribute::builder()
                .name(key)
                .value(value)
                .target_type(TargetType::ContainerInstance)
                .target_id(&arn)
                .build()
                .context("Invalid attribute")?,
        );
    }
    ecs.put_attributes()
        .cluster(cluster_resource(cluster))
        .set_attributes(Some(attributes))
        .send()
        .await
        .context("Failed to put attributes")?;
    Ok(())
}

async fn container_instance_arn(
    ecs: &aws_sdk_ecs::Client,
    cluster: &str,
    instance_id: &str,
) -> Result<String> {
    let cluster = cluster_resource(cluster);
    let mut token = None;
    loop {
        let page = ecs
            .list_container_instances()
            .cluster(&cluster)
            .set_next_token(token)
            .send()
            .await
            .context("Failed to list container instances")?;
        if !page.container_instance_arns().is_empty() {
            let described = ecs
                .describe_container_instances()
                .cluster(&cluster)
                .set_container_instances(Some(page.container_instance_arns().to_vec()))
                .send()
                .await
                .context("Failed to describe container instances")?;
            if let Some(arn) = described
                .container_instances()
                .iter()
                .find(|ci| ci.ec2_instance_id() == Some(instance_id))
                .and_then(|ci| ci.container_instance_arn())
            {
                return Ok(arn.to_string());
            }
        }
        token = page.next_token().map(str::to_string);
        if token.is_none() {
            bail!("instance {} is not registered with {}", instance_id, cluster);
        }
    }
}

/// Shell line that runs `command` on a node via the bastion. An empty
/// command opens an interactive shell.
pub fn ssh_command(pem: &str, bastion_ip: &str, node_ip: &str, command: &str, tty: bool) -> String {
    let t = if tty { " -t" } else { "" };
    let opts = "-o StrictHostKeyChecking=no -o LogLevel=QUIET";
    let mut line = format!(
        "ssh-add {pem} 2> /dev/null && ssh{t} {opts} -A ec2-user@{bastion_ip} ssh{t} {opts} {node_ip}"
    );
    if !command.is_empty() {
        let encoded = STANDARD.encode(command);
        line.push_str(&format!(" \"\\`echo {} | base64 -di\\`\"", encoded));
    }
    line
}

/// Run `command` on `node` through the cluster bastion.
pub async fn ssh_run(
    ws: &Workspace,
    aws: &AwsSession,
    ctx: &Context,
    node: &NodeInstance,
    command: &str,
    tty: bool,
    capture: Capture,
) -> Result<CommandOutput> {
    let cluster = ctx.require("cluster")?;
    let pem = ctx.require("pem")?;
    let bastion = find(&aws.ec2(), cluster, BASTION).await?;
    let bastion_ip = bastion
        .public_ip
        .as_deref()
        .ok_or_else(|| anyhow!("bastion has no public address"))?;
    let line = ssh_command(pem, bastion_ip, node.private_ip()?, command, tty);
    ws.run(ShellCommand::new(line).capture(capture))
}
