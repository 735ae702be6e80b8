//! Long-running ECS services, one per task: `<app>-<task>`

use anyhow::{anyhow, Context as _, Result};
use aws_sdk_ecs::client::Waiters;
use aws_sdk_ecs::types::{LoadBalancer, Service};
use clap::Subcommand;
use fuku_core::Module;
use serde_json::json;
use tracing::info;

use crate::aws::cluster_resource;
use crate::modules::app;
use crate::modules::task::Tasks;
use crate::workspace::Workspace;

/// DescribeServices accepts at most this many names per call
const DESCRIBE_BATCH: usize = 10;

pub struct ServiceModule;

impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["task"]
    }
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommand {
    /// List the app's services, or show one
    Ls { task: Option<String> },
    /// Start a service running a task
    Mk {
        task: String,
        #[arg(short, long)]
        replicas: Option<i32>,
    },
    /// Redeploy a service with the latest task revision
    Up {
        task: String,
        #[arg(short, long)]
        replicas: Option<i32>,
    },
    /// Scale a service to zero and delete it
    Rm { task: String },
}

pub fn service_name(app: &str, task: &str) -> String {
    format!("{}-{}", app, task)
}

/// Every service name in the ECS cluster.
pub async fn names(ecs: &aws_sdk_ecs::Client, cluster: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut token = None;
    loop {
        let page = ecs
            .list_services()
            .cluster(cluster_resource(cluster))
            .set_next_token(token)
            .send()
            .await
            .context("Failed to list services")?;
        names.extend(
            page.service_arns()
                .iter()
                .filter_map(|arn| arn.rsplit('/').next())
                .map(str::to_string),
        );
        token = page.next_token().map(str::to_string);
        if token.is_none() {
            return Ok(names);
        }
    }
}

/// Task names of the app's services, from the full service list.
pub fn app_services<'a>(names: &'a [String], app: &str) -> Vec<&'a str> {
    let prefix = format!("{}-", app);
    let mut tasks: Vec<&str> = names.iter().filter_map(|n| n.strip_prefix(&prefix)).collect();
    tasks.sort_unstable();
    tasks
}

pub async fn describe(
    ecs: &aws_sdk_ecs::Client,
    cluster: &str,
    names: &[String],
) -> Result<Vec<Service>> {
    let mut services = Vec::new();
    for batch in names.chunks(DESCRIBE_BATCH) {
        let output = ecs
            .describe_services()
            .cluster(cluster_resource(cluster))
            .set_services(Some(batch.to_vec()))
            .send()
            .await
            .context("Failed to describe services")?;
        services.extend(output.services().iter().cloned());
    }
    Ok(services)
}

pub async fn run(ws: &mut Workspace, cmd: ServiceCommand) -> Result<()> {
    let ctx = ws.context("service")?;
    let cluster = ctx.require("cluster")?.to_string();
    let aws = ws.aws("service").await?;
    let tasks = Tasks::new(&aws, &ctx)?;
    let ecs = tasks.ecs();

    match cmd {
        ServiceCommand::Ls { task: None } => {
            let all = names(ecs, &cluster).await?;
            for task in app_services(&all, tasks.app()) {
                println!("{}", task);
            }
        }
        ServiceCommand::Ls { task: Some(task) } => {
            let name = service_name(tasks.app(), &task);
            let service = describe(ecs, &cluster, &[name.clone()])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no service \"{}\"", name))?;
            let details = json!({
                "name": service.service_name(),
                "status": service.status(),
                "task_definition": service.task_definition(),
                "desired": service.desired_count(),
                "running": service.running_count(),
                "pending": service.pending_count(),
            });
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        ServiceCommand::Mk { task, replicas } => {
            let container = tasks.container(Some(&task)).await?;
            let name = service_name(tasks.app(), &task);
            let mut request = ecs
                .create_service()
                .cluster(cluster_resource(&cluster))
                .service_name(&name)
                .task_definition(tasks.family(Some(&task)))
                .desired_count(replicas.unwrap_or(1));
            if let Some(port) = container.container_port() {
                let group = app::target_group(&aws.elb(), &cluster, tasks.app()).await?;
                request = request.load_balancers(
                    LoadBalancer::builder()
                        .set_target_group_arn(group.target_group_arn().map(str::to_string))
                        .container_name(&container.name)
                        .container_port(port)
                        .build(),
                );
            }
            request
                .send()
                .await
                .with_context(|| format!("Failed to create service {}", name))?;
            info!(service = %name, "created service");
        }
        ServiceCommand::Up { task, replicas } => {
            let name = service_name(tasks.app(), &task);
            ecs.update_service()
                .cluster(cluster_resource(&cluster))
                .service(&name)
                .task_definition(tasks.family(Some(&task)))
                .force_new_deployment(true)
                .set_desired_count(replicas)
                .send()
                .await
                .with_context(|| format!("Failed to update service {}", name))?;
            info!(service = %name, "waiting for service to stabilise");
            ecs.wait_until_services_stable()
                .cluster(cluster_resource(&cluster))
                .services(&name)
                .wait(aws.waiter_timeout())
                .await
                .with_context(|| format!("Service {} did not stabilise", name))?;
        }
        ServiceCommand::Rm { task } => {
            let name = service_name(tasks.app(), &task);
            ecs.update_service()
                .cluster(cluster_resource(&cluster))
                .service(&name)
                .desired_count(0)
                .send()
                .await
                .with_context(|| format!("Failed to scale down service {}", name))?;
            ecs.delete_service()
                .cluster(cluster_resource(&cluster))
                .service(&name)
                .send()
                .await
                .with_context(|| format!("Failed to delete service {}", name))?;
            info!(service = %name, "deleted service");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_services() {
        let names: Vec<String> = ["api-worker", "shop-web", "api-web"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(app_services(&names, "api"), vec!["web", "worker"]);
        assert_eq!(service_name("api", "web"), "api-web");
    }
}
