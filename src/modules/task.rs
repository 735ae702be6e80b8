//! ECS task definitions of the selected app
//!
//! Task `web` of app `api` in cluster `prod` is the family
//! `fuku-prod-api-web` with a single container named `web`. The app's base
//! family `fuku-prod-api` holds one container named after the app.

use anyhow::{bail, Context as _, Result};
use aws_sdk_ecs::types::{SortOrder, TaskDefinitionFamilyStatus};
use clap::{Subcommand, ValueEnum};
use fuku_core::{Context, Module};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::aws::task_def::{
    self, parse_pairs, parse_ports, read_env_file, ContainerSpec, LogSpec, TaskSpec, LAUNCH_PREFIX,
};
use crate::aws::AwsSession;
use crate::modules::image;
use crate::workspace::Workspace;

pub struct TaskModule;

impl Module for TaskModule {
    fn name(&self) -> &'static str {
        "task"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["app"]
    }
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// List tasks, or show one task's container
    Ls { name: Option<String> },
    /// Create a task from an image
    Mk {
        name: String,
        image: String,
        /// CPU units
        #[arg(short, long)]
        cpu: Option<i32>,
        /// Memory reservation (MiB)
        #[arg(short, long)]
        memory: Option<i32>,
    },
    /// Change a task's image or resources
    Up {
        name: String,
        #[arg(short, long)]
        image: Option<String>,
        #[arg(short, long)]
        cpu: Option<i32>,
        #[arg(short, long)]
        memory: Option<i32>,
    },
    /// Deregister every revision of a task
    Rm { name: String },
    /// Deregister all but the newest revision of each task
    Prune,
    /// Manage a task's environment (the app's base task by default)
    Env {
        #[arg(short, long)]
        name: Option<String>,
        #[command(subcommand)]
        action: EnvAction,
    },
    /// Manage port mappings
    Ports {
        name: String,
        #[command(subcommand)]
        action: PortsAction,
    },
    /// Manage volumes
    Volume {
        name: String,
        #[command(subcommand)]
        action: VolumeAction,
    },
    /// Set or remove the container command
    Command {
        name: String,
        command: Option<String>,
        #[arg(short, long)]
        remove: bool,
    },
    /// Set the log destination
    Logs {
        name: String,
        #[arg(value_enum)]
        driver: LogDestination,
        /// Driver options (key=value)
        options: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum EnvAction {
    Ls,
    Set {
        /// Load KEY=VALUE lines from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
        values: Vec<String>,
    },
    Unset {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PortsAction {
    Ls,
    Set {
        /// HOST:CONTAINER
        #[arg(required = true)]
        values: Vec<String>,
    },
    Unset {
        #[arg(required = true)]
        hosts: Vec<i32>,
    },
}

#[derive(Debug, Subcommand)]
pub enum VolumeAction {
    Add {
        volume: String,
        destination: String,
        #[arg(short, long)]
        source: Option<String>,
    },
    Rm { volume: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogDestination {
    Aws,
    Syslog,
    None,
}

/// Task operations scoped to one app
pub struct Tasks {
    ecs: aws_sdk_ecs::Client,
    ecr: aws_sdk_ecr::Client,
    cluster: String,
    app: String,
    region: String,
}

impl Tasks {
    pub fn new(aws: &AwsSession, ctx: &Context) -> Result<Self> {
        Ok(Self {
            ecs: aws.ecs(),
            ecr: aws.ecr(),
            cluster: ctx.require("cluster")?.to_string(),
            app: ctx.require("app")?.to_string(),
            region: ctx.require("region")?.to_string(),
        })
    }

    pub fn ecs(&self) -> &aws_sdk_ecs::Client {
        &self.ecs
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn family(&self, task: Option<&str>) -> String {
        task_def::family(&self.cluster, &self.app, task)
    }

    /// Container edited for `task`: the task itself, or the app for the base task
    fn container_name<'a>(&'a self, task: Option<&'a str>) -> &'a str {
        task.unwrap_or(&self.app)
    }

    pub async fn names(&self) -> Result<Vec<String>> {
        let base = self.family(None);
        let prefix = format!("{}-", base);
        let mut names = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .ecs
                .list_task_definition_families()
                .family_prefix(&base)
                .status(TaskDefinitionFamilyStatus::Active)
                .set_next_token(token)
                .send()
                .await
                .context("Failed to list task definition families")?;
            names.extend(
                page.families()
                    .iter()
                    .filter_map(|f| f.strip_prefix(&prefix))
                    .filter(|task| !task.contains('-'))
                    .map(str::to_string),
            );
            token = page.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(names);
            }
        }
    }

    pub async fn get(&self, task: Option<&str>) -> Result<TaskSpec> {
        let label = self.container_name(task);
        task_def::require(&self.ecs, &self.family(task), label).await
    }

    pub async fn container(&self, task: Option<&str>) -> Result<ContainerSpec> {
        let spec = self.get(task).await?;
        Ok(spec.container(self.container_name(task))?.clone())
    }

    pub fn default_logs(&self) -> LogSpec {
        LogSpec::awslogs(&self.cluster, &self.region, &self.app)
    }

    /// Register a new single-container task. `image` is an image reference.
    pub async fn make(
        &self,
        name: &str,
        image: &str,
        cpu: Option<i32>,
        memory: Option<i32>,
    ) -> Result<TaskSpec> {
        let family = self.family(Some(name));
        if task_def::describe(&self.ecs, &family).await?.is_some() {
            bail!("task \"{}\" already exists", name);
        }
        let image = image::resolve(&self.ecr, image, &self.app).await?;
        let mut container = ContainerSpec::new(name, image, memory);
        container.cpu = cpu;
        container.log = Some(self.default_logs());
        let spec = TaskSpec::new(family, container);
        task_def::register(&self.ecs, &spec).await?;
        Ok(spec)
    }

    /// Edit the task's container and register the result.
    pub async fn edit_container<F>(&self, task: Option<&str>, edit: F) -> Result<String>
    where
        F: FnOnce(&mut ContainerSpec) -> Result<()>,
    {
        let name = self.container_name(task);
        task_def::update(&self.ecs, &self.family(task), name, |spec| {
            edit(spec.container_mut(name)?)
        })
        .await
    }

    pub async fn edit_task<F>(&self, task: Option<&str>, edit: F) -> Result<String>
    where
        F: FnOnce(&mut TaskSpec, &str) -> Result<()>,
    {
        let name = self.container_name(task);
        task_def::update(&self.ecs, &self.family(task), name, |spec| edit(spec, name)).await
    }

    pub async fn set_env(&self, task: Option<&str>, values: BTreeMap<String, String>) -> Result<()> {
        self.edit_container(task, |c| {
            c.set_env(values);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// ARNs of every active revision of `family`, newest first.
    async fn revisions(&self, family: &str) -> Result<Vec<String>> {
        let mut arns = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .ecs
                .list_task_definitions()
                .family_prefix(family)
                .sort(SortOrder::Desc)
                .set_next_token(token)
                .send()
                .await
                .context("Failed to list task definitions")?;
            arns.extend(
                page.task_definition_arns()
                    .iter()
                    .filter(|arn| arn_family(arn) == Some(family))
                    .cloned(),
            );
            token = page.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(arns);
            }
        }
    }

    async fn deregister(&self, arns: &[String]) -> Result<()> {
        for arn in arns {
            self.ecs
                .deregister_task_definition()
                .task_definition(arn)
                .send()
                .await
                .with_context(|| format!("Failed to deregister {}", arn))?;
            info!(%arn, "deregistered task definition");
        }
        Ok(())
    }

    /// Deregister every revision of the task and its launch family.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let family = self.family(Some(name));
        let revisions = self.revisions(&family).await?;
        if revisions.is_empty() {
            bail!("no task \"{}\"", name);
        }
        self.deregister(&revisions).await?;
        let launch = self.revisions(&format!("{}{}", LAUNCH_PREFIX, family)).await?;
        self.deregister(&launch).await
    }

    pub async fn prune(&self) -> Result<()> {
        for name in self.names().await? {
            let family = self.family(Some(&name));
            for family in [family.clone(), format!("{}{}", LAUNCH_PREFIX, family)] {
                let revisions = self.revisions(&family).await?;
                if let Some(stale) = revisions.get(1..) {
                    self.deregister(stale).await?;
                }
            }
        }
        Ok(())
    }
}

/// Family of a task definition ARN (`...:task-definition/<family>:<revision>`)
fn arn_family(arn: &str) -> Option<&str> {
    let tail = arn.rsplit('/').next()?;
    let (family, _revision) = tail.rsplit_once(':')?;
    Some(family)
}

pub async fn run(ws: &mut Workspace, cmd: TaskCommand) -> Result<()> {
    let ctx = ws.context("task")?;
    let aws = ws.aws("task").await?;
    let tasks = Tasks::new(&aws, &ctx)?;

    match cmd {
        TaskCommand::Ls { name: Some(name) } => {
            let container = tasks.container(Some(&name)).await?;
            println!("{}", serde_json::to_string_pretty(&container)?);
        }
        TaskCommand::Ls { name: None } => {
            for name in tasks.names().await? {
                println!("{}", name);
            }
        }
        TaskCommand::Mk {
            name,
            image,
            cpu,
            memory,
        } => {
            tasks.make(&name, &image, cpu, memory).await?;
        }
        TaskCommand::Up {
            name,
            image,
            cpu,
            memory,
        } => {
            let image = match image {
                Some(image) => Some(image::resolve(&aws.ecr(), &image, tasks.app()).await?),
                None => None,
            };
            tasks
                .edit_container(Some(&name), |c| {
                    if let Some(image) = image {
                        c.image = image;
                    }
                    if cpu.is_some() {
                        c.cpu = cpu;
                    }
                    if let Some(memory) = memory {
                        c.set_memory(memory);
                    }
                    Ok(())
                })
                .await?;
        }
        TaskCommand::Rm { name } => tasks.remove(&name).await?,
        TaskCommand::Prune => tasks.prune().await?,
        TaskCommand::Env { name, action } => env(&tasks, name.as_deref(), action).await?,
        TaskCommand::Ports { name, action } => match action {
            PortsAction::Ls => {
                for (host, container) in tasks.container(Some(&name)).await?.ports {
                    println!("{}:{}", host, container);
                }
            }
            PortsAction::Set { values } => {
                let ports = parse_ports(&values)?;
                tasks
                    .edit_container(Some(&name), |c| {
                        c.set_ports(&ports);
                        Ok(())
                    })
                    .await?;
            }
            PortsAction::Unset { hosts } => {
                tasks
                    .edit_container(Some(&name), |c| {
                        c.unset_ports(&hosts);
                        Ok(())
                    })
                    .await?;
            }
        },
        TaskCommand::Volume { name, action } => match action {
            VolumeAction::Add {
                volume,
                destination,
                source,
            } => {
                tasks
                    .edit_task(Some(&name), |spec, container| {
                        spec.add_volume(container, &volume, &destination, source.as_deref(), false)
                    })
                    .await?;
            }
            VolumeAction::Rm { volume } => {
                tasks
                    .edit_task(Some(&name), |spec, container| spec.remove_volume(container, &volume))
                    .await?;
            }
        },
        TaskCommand::Command {
            name,
            command,
            remove,
        } => {
            if !remove && command.is_none() {
                bail!("give a command, or --remove");
            }
            tasks
                .edit_container(Some(&name), |c| {
                    c.set_command(if remove { None } else { command.as_deref() });
                    Ok(())
                })
                .await?;
        }
        TaskCommand::Logs {
            name,
            driver,
            options,
        } => {
            let log = match driver {
                LogDestination::Aws => Some(tasks.default_logs()),
                LogDestination::Syslog => Some(LogSpec::syslog(parse_pairs(&options)?)),
                LogDestination::None => None,
            };
            tasks
                .edit_container(Some(&name), |c| {
                    c.log = log;
                    Ok(())
                })
                .await?;
        }
    }
    Ok(())
}

async fn env(tasks: &Tasks, name: Option<&str>, action: EnvAction) -> Result<()> {
    match action {
        EnvAction::Ls => {
            for line in tasks.container(name).await?.env_lines() {
                println!("{}", line);
            }
        }
        EnvAction::Set { file, values } => {
            let mut to_set = match file {
                Some(path) => read_env_file(&path)?,
                None => BTreeMap::new(),
            };
            to_set.extend(parse_pairs(&values)?);
            tasks.set_env(name, to_set).await?;
        }
        EnvAction::Unset { keys } => {
            tasks
                .edit_container(name, |c| {
                    c.unset_env(&keys);
                    Ok(())
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arn_family() {
        assert_eq!(
            arn_family("arn:aws:ecs:ap-southeast-2:123:task-definition/fuku-prod-api-web:7"),
            Some("fuku-prod-api-web")
        );
        assert_eq!(
            arn_family("arn:aws:ecs:ap-southeast-2:123:task-definition/_fuku-prod-api-web:2"),
            Some("_fuku-prod-api-web")
        );
        assert_eq!(arn_family("garbage"), None);
    }
}
