//! Applications: one ALB target group per app, exposed by host-header rules
//!
//! An app is the target group `fuku-<cluster>-<app>`. Exposing it adds a
//! forward rule to a listener of one of the cluster's load balancers.

use anyhow::{anyhow, bail, Context as _, Result};
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, LoadBalancer, Matcher, ProtocolEnum, Rule, RuleCondition, TargetGroup,
};
use aws_sdk_elasticloadbalancingv2::Client as ElbClient;
use clap::Subcommand;
use fuku_core::{validate, Capture, Context, FukuError, Module, ModuleState};
use tracing::{debug, info};

use crate::aws::network;
use crate::aws::task_def::{self, ContainerSpec, TaskSpec};
use crate::aws::{app_resource, is_code, tolerate_existing};
use crate::modules::{image, node};
use crate::workspace::Workspace;

/// ECR repository holding the base image every app starts from
pub const BASE_REPOSITORY: &str = "fuku";

const DEFAULT_TARGET: &str = "default";

pub struct AppModule;

impl Module for AppModule {
    fn name(&self) -> &'static str {
        "app"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["cluster"]
    }

    fn my_context(&self, state: &ModuleState<'_>) -> fuku_core::Result<Context> {
        let app = state
            .override_value("app")
            .or_else(|| state.selected())
            .ok_or_else(|| FukuError::usage("no app currently selected"))?;
        Ok(Context::new().with("app", app))
    }

    fn selectable(&self) -> bool {
        true
    }
}

#[derive(Debug, Subcommand)]
pub enum AppCommand {
    /// List apps in the selected cluster
    Ls,
    /// Create an app and select it
    Mk { name: String },
    /// Delete an app's target group
    Rm { name: String },
    /// Select an app, or clear the selection
    Sl { name: Option<String> },
    /// Run an image once on a cluster node
    Run {
        image: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Route a domain to the app through a cluster load balancer
    Expose { name: String, domain: String },
    /// Remove every load balancer rule routing to the app
    Hide { name: String },
}

pub async fn run(ws: &mut Workspace, cmd: AppCommand) -> Result<()> {
    let deps = ws.client().dependency_context("app")?;
    let cluster = deps.require("cluster")?.to_string();
    let aws = ws.aws("app").await?;
    let elb = aws.elb();

    match cmd {
        AppCommand::Ls => {
            for app in list(&elb, &cluster).await? {
                println!("{}", app);
            }
        }
        AppCommand::Mk { name } => {
            validate(&name)?;
            if list(&elb, &cluster).await?.contains(&name) {
                bail!("app \"{}\" already exists", name);
            }
            let vpc = network::require_vpc(&aws.ec2(), &cluster).await?;
            elb.create_target_group()
                .name(app_resource(&cluster, &name))
                .protocol(ProtocolEnum::Http)
                .port(80)
                .vpc_id(vpc)
                .matcher(Matcher::builder().http_code("200,301").build())
                .send()
                .await
                .context("Failed to create target group")?;

            let ecr = aws.ecr();
            tolerate_existing(
                ecr.create_repository()
                    .repository_name(BASE_REPOSITORY)
                    .send()
                    .await,
            )
            .context("Failed to create base repository")?;
            let uri = image::repository_uri(&ecr, BASE_REPOSITORY).await?;
            let mut container = ContainerSpec::new(&name, uri, None);
            container.memory = None;
            container.memory_reservation = Some(1);
            let spec = TaskSpec::new(task_def::family(&cluster, &name, None), container);
            task_def::register(&aws.ecs(), &spec).await?;
            info!(app = %name, cluster = %cluster, "created app");

            ws.select("app", Some(&name))?;
        }
        AppCommand::Rm { name } => {
            let group = target_group(&elb, &cluster, &name).await?;
            elb.delete_target_group()
                .target_group_arn(group.target_group_arn().unwrap_or_default())
                .send()
                .await
                .context("Failed to delete target group")?;
            if ws.selected("app") == Some(name.as_str()) {
                ws.select("app", None)?;
            }
        }
        AppCommand::Sl { name } => {
            if let Some(name) = &name {
                if !list(&elb, &cluster).await?.contains(name) {
                    bail!("no app \"{}\"", name);
                }
            }
            ws.select("app", name.as_deref())?;
        }
        AppCommand::Run { image, command } => {
            let ctx = ws.context("app")?;
            let app = ctx.require("app")?;
            let image = image::resolve(&aws.ecr(), &image, app).await?;
            let target = node::any_worker(&aws.ec2(), &cluster).await?;
            let line = format!("docker run --rm -it {} {}", image, command.join(" "));
            node::ssh_run(ws, &aws, &ctx, &target, line.trim_end(), true, Capture::Stream).await?;
        }
        AppCommand::Expose { name, domain } => expose(&elb, &cluster, &name, &domain).await?,
        AppCommand::Hide { name } => hide(&elb, &cluster, &name).await?,
    }
    Ok(())
}

/// App names in `cluster`, sorted.
pub async fn list(elb: &ElbClient, cluster: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut marker = None;
    loop {
        let page = elb
            .describe_target_groups()
            .set_marker(marker)
            .send()
            .await
            .context("Failed to describe target groups")?;
        names.extend(
            page.target_groups()
                .iter()
                .filter_map(|tg| tg.target_group_name())
                .map(str::to_string),
        );
        marker = page.next_marker().map(str::to_string);
        if marker.is_none() {
            break;
        }
    }
    Ok(app_names(&names, cluster))
}

/// Apps from target group names: `fuku-<cluster>-<app>`, minus the default group.
fn app_names(target_groups: &[String], cluster: &str) -> Vec<String> {
    let prefix = app_resource(cluster, "");
    let mut apps: Vec<String> = target_groups
        .iter()
        .filter_map(|name| name.strip_prefix(&prefix))
        .filter(|app| *app != DEFAULT_TARGET && !app.contains('-'))
        .map(str::to_string)
        .collect();
    apps.sort();
    apps
}

/// The target group backing `app`.
pub async fn target_group(elb: &ElbClient, cluster: &str, app: &str) -> Result<TargetGroup> {
    let output = match elb
        .describe_target_groups()
        .names(app_resource(cluster, app))
        .send()
        .await
    {
        Ok(output) => output,
        Err(err) if is_code(&err, "TargetGroupNotFound") => bail!("no app \"{}\"", app),
        Err(err) => return Err(err).context("Failed to describe target group"),
    };
    output
        .target_groups()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no app \"{}\"", app))
}

/// Load balancers belonging to `cluster` (`fuku-<cluster>-<n>`), by name.
pub async fn load_balancers(elb: &ElbClient, cluster: &str) -> Result<Vec<LoadBalancer>> {
    let prefix = app_resource(cluster, "");
    let mut balancers = Vec::new();
    let mut marker = None;
    loop {
        let page = elb
            .describe_load_balancers()
            .set_marker(marker)
            .send()
            .await
            .context("Failed to describe load balancers")?;
        balancers.extend(
            page.load_balancers()
                .iter()
                .filter(|lb| {
                    lb.load_balancer_name()
                        .map(|n| n.starts_with(&prefix))
                        .unwrap_or(false)
                })
                .cloned(),
        );
        marker = page.next_marker().map(str::to_string);
        if marker.is_none() {
            break;
        }
    }
    balancers.sort_by(|a, b| a.load_balancer_name().cmp(&b.load_balancer_name()));
    Ok(balancers)
}

/// The load balancer the app's target group is attached to.
pub async fn app_load_balancer(elb: &ElbClient, cluster: &str, app: &str) -> Result<LoadBalancer> {
    let group = target_group(elb, cluster, app).await?;
    let arn = group
        .load_balancer_arns()
        .first()
        .ok_or_else(|| anyhow!("App {} is not exposed", app))?;
    let output = elb
        .describe_load_balancers()
        .load_balancer_arns(arn)
        .send()
        .await
        .context("Failed to describe load balancer")?;
    output
        .load_balancers()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("load balancer {} not found", arn))
}

async fn listener_arns(elb: &ElbClient, load_balancer_arn: &str) -> Result<Vec<String>> {
    let output = elb
        .describe_listeners()
        .load_balancer_arn(load_balancer_arn)
        .send()
        .await
        .context("Failed to describe listeners")?;
    Ok(output
        .listeners()
        .iter()
        .filter_map(|l| l.listener_arn())
        .map(str::to_string)
        .collect())
}

async fn rules(elb: &ElbClient, listener_arn: &str) -> Result<Vec<Rule>> {
    let output = elb
        .describe_rules()
        .listener_arn(listener_arn)
        .send()
        .await
        .context("Failed to describe rules")?;
    Ok(output.rules().to_vec())
}

/// One past the highest numeric priority; `default` and friends are ignored.
fn next_priority<'a>(priorities: impl IntoIterator<Item = &'a str>) -> i32 {
    priorities
        .into_iter()
        .filter_map(|p| p.parse::<i32>().ok())
        .max()
        .map_or(1, |max| max + 1)
}

fn forwards_to(rule: &Rule, target_group_arn: &str) -> bool {
    rule.actions()
        .iter()
        .any(|a| a.target_group_arn() == Some(target_group_arn))
}

fn matches_host(rule: &Rule, domain: &str) -> bool {
    rule.conditions()
        .iter()
        .filter(|c| c.field() == Some("host-header"))
        .any(|c| {
            c.values().iter().any(|v| v == domain)
                || c.host_header_config()
                    .map(|h| h.values().iter().any(|v| v == domain))
                    .unwrap_or(false)
        })
}

async fn expose(elb: &ElbClient, cluster: &str, app: &str, domain: &str) -> Result<()> {
    let group = target_group(elb, cluster, app).await?;
    let group_arn = group.target_group_arn().unwrap_or_default();

    for balancer in load_balancers(elb, cluster).await? {
        let lb_name = balancer.load_balancer_name().unwrap_or_default();
        let lb_arn = balancer.load_balancer_arn().unwrap_or_default();
        for listener in listener_arns(elb, lb_arn).await? {
            let existing = rules(elb, &listener).await?;
            if existing
                .iter()
                .any(|r| forwards_to(r, group_arn) && matches_host(r, domain))
            {
                bail!("App already exposed on {}", lb_name);
            }
            let priority = next_priority(existing.iter().filter_map(|r| r.priority()));
            let result = elb
                .create_rule()
                .listener_arn(&listener)
                .priority(priority)
                .conditions(
                    RuleCondition::builder()
                        .field("host-header")
                        .values(domain)
                        .build(),
                )
                .actions(
                    Action::builder()
                        .r#type(ActionTypeEnum::Forward)
                        .target_group_arn(group_arn)
                        .build()
                        .context("Invalid forward action")?,
                )
                .send()
                .await;
            match result {
                Ok(_) => {
                    println!("{} [added]", lb_name);
                    return Ok(());
                }
                Err(err) if is_code(&err, "TooManyRules") => {
                    println!("{} [skipped - full]", lb_name);
                }
                Err(err) => return Err(err).context("Failed to create rule"),
            }
        }
    }
    bail!("no load balancer with room for another rule")
}

async fn hide(elb: &ElbClient, cluster: &str, app: &str) -> Result<()> {
    let group = target_group(elb, cluster, app).await?;
    let group_arn = group.target_group_arn().unwrap_or_default();
    let lb_arn = group
        .load_balancer_arns()
        .first()
        .ok_or_else(|| anyhow!("App {} is not exposed", app))?;

    for listener in listener_arns(elb, lb_arn).await? {
        for rule in rules(elb, &listener).await? {
            if rule.is_default().unwrap_or(false) || !forwards_to(&rule, group_arn) {
                continue;
            }
            let arn = rule.rule_arn().unwrap_or_default();
            elb.delete_rule()
                .rule_arn(arn)
                .send()
                .await
                .context("Failed to delete rule")?;
            debug!(rule = arn, "deleted rule");
        }
    }
    Ok(())
}
