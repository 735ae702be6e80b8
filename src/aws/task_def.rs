//! Editable ECS task definitions
//!
//! A registered task definition is read into a [`TaskSpec`], edited in plain
//! Rust, and registered again as a new revision of the same family.

use anyhow::{anyhow, bail, Context as _, Result};
use aws_sdk_ecs::types::{
    ContainerDefinition, HostVolumeProperties, KeyValuePair, LogConfiguration, LogDriver,
    MountPoint, PortMapping, TaskDefinition, Volume,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

use super::{app_resource, is_code};

/// Default container memory (MiB) when none is given
pub const DEFAULT_MEMORY: i32 = 4;

/// Families registered for one-off launches carry this prefix
pub const LAUNCH_PREFIX: &str = "_";

/// `fuku-<cluster>-<app>` for the app's base task, `fuku-<cluster>-<app>-<task>`
/// otherwise.
pub fn family(cluster: &str, app: &str, task: Option<&str>) -> String {
    match task {
        Some(task) => format!("{}-{}", app_resource(cluster, app), task),
        None => app_resource(cluster, app),
    }
}

/// Task name from a family: the text after the last `-`.
pub fn task_name(family: &str) -> &str {
    family.rsplit('-').next().unwrap_or(family)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSpec {
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

impl LogSpec {
    /// CloudWatch logs into the cluster log group, streams prefixed by app
    pub fn awslogs(cluster: &str, region: &str, app: &str) -> Self {
        let options = [
            ("awslogs-group", format!("/{}", cluster)),
            ("awslogs-region", region.to_string()),
            ("awslogs-stream-prefix", app.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            driver: "awslogs".to_string(),
            options,
        }
    }

    /// Syslog tagged with the task name; `extra` overrides the defaults.
    pub fn syslog(extra: BTreeMap<String, String>) -> Self {
        let mut options: BTreeMap<String, String> = [
            ("tag", "{{ (.ExtraAttributes nil).TASK_NAME }}/{{ .ID }}"),
            ("env", "TASK_NAME"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        options.extend(extra);
        Self {
            driver: "syslog".to_string(),
            options,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reservation: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub essential: Option<bool>,
    pub environment: BTreeMap<String, String>,
    /// host port -> container port
    pub ports: BTreeMap<i32, i32>,
    /// volume name -> mount
    pub mounts: BTreeMap<String, Mount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSpec>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, memory: Option<i32>) -> Self {
        let memory = memory.unwrap_or(DEFAULT_MEMORY);
        Self {
            name: name.into(),
            image: image.into(),
            memory: Some(memory),
            memory_reservation: Some(memory),
            ..Default::default()
        }
    }

    pub fn set_memory(&mut self, memory: i32) {
        self.memory = Some(memory);
        self.memory_reservation = Some(memory);
    }

    pub fn set_env<I, K, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    pub fn unset_env<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            self.environment.remove(key.as_ref());
        }
    }

    /// `KEY=value` lines, sorted by key
    pub fn env_lines(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    pub fn set_ports(&mut self, ports: &[(i32, i32)]) {
        self.ports.extend(ports.iter().copied());
    }

    pub fn unset_ports(&mut self, hosts: &[i32]) {
        for host in hosts {
            self.ports.remove(host);
        }
    }

    /// `command` split on whitespace, or `None` to remove it
    pub fn set_command(&mut self, command: Option<&str>) {
        self.command = command.map(|c| c.split_whitespace().map(str::to_string).collect());
    }

    /// First mapped container port, if any
    pub fn container_port(&self) -> Option<i32> {
        self.ports.values().next().copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    pub family: String,
    pub containers: Vec<ContainerSpec>,
    /// volume name -> host source path
    pub volumes: BTreeMap<String, Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

impl TaskSpec {
    pub fn new(family: impl Into<String>, container: ContainerSpec) -> Self {
        Self {
            family: family.into(),
            containers: vec![container],
            ..Default::default()
        }
    }

    pub fn container(&self, name: &str) -> Result<&ContainerSpec> {
        self.containers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| anyhow!("container definition \"{}\" does not exist", name))
    }

    pub fn container_mut(&mut self, name: &str) -> Result<&mut ContainerSpec> {
        self.containers
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| anyhow!("container definition \"{}\" does not exist", name))
    }

    /// Add (or replace) volume `volume` and mount it in `container`.
    pub fn add_volume(
        &mut self,
        container: &str,
        volume: &str,
        destination: &str,
        source: Option<&str>,
        read_only: bool,
    ) -> Result<()> {
        self.container_mut(container)?.mounts.insert(
            volume.to_string(),
            Mount {
                container_path: destination.to_string(),
                read_only,
            },
        );
        self.volumes
            .insert(volume.to_string(), source.map(str::to_string));
        Ok(())
    }

    pub fn remove_volume(&mut self, container: &str, volume: &str) -> Result<()> {
        self.container_mut(container)?.mounts.remove(volume);
        self.volumes.remove(volume);
        Ok(())
    }

    pub fn from_sdk(def: &TaskDefinition) -> Self {
        Self {
            family: def.family().unwrap_or_default().to_string(),
            containers: def
                .container_definitions()
                .iter()
                .map(container_from_sdk)
                .collect(),
            volumes: def
                .volumes()
                .iter()
                .filter_map(|v| {
                    let name = v.name()?.to_string();
                    let source = v
                        .host()
                        .and_then(|h| h.source_path())
                        .map(str::to_string);
                    Some((name, source))
                })
                .collect(),
            network_mode: def.network_mode().map(|m| m.as_str().to_string()),
        }
    }

    pub fn container_definitions(&self) -> Result<Vec<ContainerDefinition>> {
        self.containers.iter().map(container_to_sdk).collect()
    }

    pub fn sdk_volumes(&self) -> Vec<Volume> {
        self.volumes
            .iter()
            .map(|(name, source)| {
                let mut builder = Volume::builder().name(name);
                if let Some(source) = source {
                    builder = builder.host(HostVolumeProperties::builder().source_path(source).build());
                }
                builder.build()
            })
            .collect()
    }
}

fn container_from_sdk(def: &ContainerDefinition) -> ContainerSpec {
    ContainerSpec {
        name: def.name().unwrap_or_default().to_string(),
        image: def.image().unwrap_or_default().to_string(),
        cpu: Some(def.cpu()).filter(|cpu| *cpu > 0),
        memory: def.memory(),
        memory_reservation: def.memory_reservation(),
        essential: def.essential(),
        environment: def
            .environment()
            .iter()
            .filter_map(|kv| Some((kv.name()?.to_string(), kv.value().unwrap_or_default().to_string())))
            .collect(),
        ports: def
            .port_mappings()
            .iter()
            .filter_map(|pm| {
                let container = pm.container_port()?;
                Some((pm.host_port().unwrap_or(container), container))
            })
            .collect(),
        mounts: def
            .mount_points()
            .iter()
            .filter_map(|mp| {
                Some((
                    mp.source_volume()?.to_string(),
                    Mount {
                        container_path: mp.container_path().unwrap_or_default().to_string(),
                        read_only: mp.read_only().unwrap_or(false),
                    },
                ))
            })
            .collect(),
        command: Some(def.command().to_vec()).filter(|c| !c.is_empty()),
        log: def.log_configuration().map(|lc| LogSpec {
            driver: lc.log_driver().as_str().to_string(),
            options: lc
                .options()
                .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }),
    }
}

fn container_to_sdk(spec: &ContainerSpec) -> Result<ContainerDefinition> {
    let mut builder = ContainerDefinition::builder()
        .name(&spec.name)
        .image(&spec.image)
        .set_memory(spec.memory)
        .set_memory_reservation(spec.memory_reservation)
        .set_essential(spec.essential)
        .set_command(spec.command.clone());
    if let Some(cpu) = spec.cpu {
        builder = builder.cpu(cpu);
    }
    for (name, value) in &spec.environment {
        builder = builder.environment(KeyValuePair::builder().name(name).value(value).build());
    }
    for (host, container) in &spec.ports {
        builder = builder.port_mappings(
            PortMapping::builder()
                .host_port(*host)
                .container_port(*container)
                .build(),
        );
    }
    for (volume, mount) in &spec.mounts {
        builder = builder.mount_points(
            MountPoint::builder()
                .source_volume(volume)
                .container_path(&mount.container_path)
                .read_only(mount.read_only)
                .build(),
        );
    }
    if let Some(log) = &spec.log {
        let options: HashMap<String, String> = log.options.clone().into_iter().collect();
        builder = builder.log_configuration(
            LogConfiguration::builder()
                .log_driver(LogDriver::from(log.driver.as_str()))
                .set_options(Some(options))
                .build()
                .context("Invalid log configuration")?,
        );
    }
    Ok(builder.build())
}

/// Parse `KEY=value` pairs, as given on the command line.
pub fn parse_pairs<S: AsRef<str>>(values: &[S]) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|pair| {
            let pair = pair.as_ref();
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got \"{}\"", pair))
        })
        .collect()
}

/// Parse `HOST:CONTAINER` port pairs.
pub fn parse_ports<S: AsRef<str>>(values: &[S]) -> Result<Vec<(i32, i32)>> {
    values
        .iter()
        .map(|pair| {
            let pair = pair.as_ref();
            let (host, container) = pair
                .split_once(':')
                .ok_or_else(|| anyhow!("expected HOST:CONTAINER, got \"{}\"", pair))?;
            let host = host
                .parse()
                .with_context(|| format!("invalid host port \"{}\"", host))?;
            let container = container
                .parse()
                .with_context(|| format!("invalid container port \"{}\"", container))?;
            Ok((host, container))
        })
        .collect()
}

/// Read an env file: `KEY=value` per line; comments and other lines ignored.
pub fn parse_env_file(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read env file: {}", path.display()))?;
    Ok(parse_env_file(&content))
}

/// Latest active revision of `family`, or `None` when it does not exist.
pub async fn describe(ecs: &aws_sdk_ecs::Client, family: &str) -> Result<Option<TaskSpec>> {
    match ecs
        .describe_task_definition()
        .task_definition(family)
        .send()
        .await
    {
        Ok(output) => Ok(output.task_definition().map(TaskSpec::from_sdk)),
        // ECS reports an unknown family as a client error
        Err(err) if is_code(&err, "ClientException") => {
            debug!(family, error = %err, "task definition not found");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("Failed to describe task definition {}", family)),
    }
}

/// Like [`describe`], but a missing task is an error naming `task`.
pub async fn require(ecs: &aws_sdk_ecs::Client, family: &str, task: &str) -> Result<TaskSpec> {
    match describe(ecs, family).await? {
        Some(spec) => Ok(spec),
        None => bail!("no task \"{}\"", task),
    }
}

/// Register `spec` as a new revision; returns the task definition ARN.
pub async fn register(ecs: &aws_sdk_ecs::Client, spec: &TaskSpec) -> Result<String> {
    let mut request = ecs
        .register_task_definition()
        .family(&spec.family)
        .set_container_definitions(Some(spec.container_definitions()?))
        .set_volumes(Some(spec.sdk_volumes()));
    if let Some(mode) = &spec.network_mode {
        request = request.network_mode(aws_sdk_ecs::types::NetworkMode::from(mode.as_str()));
    }
    let output = request
        .send()
        .await
        .with_context(|| format!("Failed to register task definition {}", spec.family))?;
    let arn = output
        .task_definition()
        .and_then(|td| td.task_definition_arn())
        .unwrap_or_default()
        .to_string();
    info!(family = %spec.family, %arn, "registered task definition");
    Ok(arn)
}

/// Fetch, edit and re-register the task definition for `task`.
pub async fn update<F>(ecs: &aws_sdk_ecs::Client, family: &str, task: &str, edit: F) -> Result<String>
where
    F: FnOnce(&mut TaskSpec) -> Result<()>,
{
    let mut spec = require(ecs, family, task).await?;
    edit(&mut spec)?;
    register(ecs, &spec).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web() -> TaskSpec {
        let mut container = ContainerSpec::new("web", "nginx:latest", None);
        container.log = Some(LogSpec::awslogs("prod", "ap-southeast-2", "api"));
        TaskSpec::new(family("prod", "api", Some("web")), container)
    }

    #[test]
    fn test_family_names() {
        assert_eq!(family("prod", "api", None), "fuku-prod-api");
        assert_eq!(family("prod", "api", Some("web")), "fuku-prod-api-web");
        assert_eq!(task_name("fuku-prod-api-web"), "web");
    }

    #[test]
    fn test_default_container() {
        let spec = web();
        let container = spec.container("web").unwrap();
        assert_eq!(container.memory, Some(4));
        assert_eq!(container.memory_reservation, Some(4));
        let log = container.log.as_ref().unwrap();
        assert_eq!(log.driver, "awslogs");
        assert_eq!(log.options["awslogs-group"], "/prod");
        assert_eq!(log.options["awslogs-stream-prefix"], "api");
    }

    #[test]
    fn test_missing_container() {
        let spec = web();
        let err = spec.container("worker").unwrap_err();
        assert_eq!(err.to_string(), "container definition \"worker\" does not exist");
    }

    #[test]
    fn test_env_edits() {
        let mut spec = web();
        let container = spec.container_mut("web").unwrap();
        container.set_env(parse_pairs(&["B=2", "A=1=one"]).unwrap());
        container.set_env([("B", "3")]);
        assert_eq!(container.env_lines(), vec!["A=1=one", "B=3"]);

        container.unset_env(&["A", "missing"]);
        assert_eq!(container.env_lines(), vec!["B=3"]);
    }

    #[test]
    fn test_env_file() {
        let env = parse_env_file(
            "# comment\nDATABASE_URL=postgres://x\n\n  DEBUG=1  \n# SECRET=old\n  #PORT=80\n",
        );
        assert_eq!(env.len(), 2);
        assert!(!env.contains_key("# SECRET"));
        assert!(!env.contains_key("#PORT"));
        assert_eq!(env["DATABASE_URL"], "postgres://x");
        assert_eq!(env["DEBUG"], "1");
    }

    #[test]
    fn test_port_edits() {
        let mut container = ContainerSpec::new("web", "nginx", Some(128));
        container.set_ports(&parse_ports(&["80:8080", "443:8443"]).unwrap());
        assert_eq!(container.container_port(), Some(8080));
        container.unset_ports(&[80, 9999]);
        assert_eq!(container.ports.into_iter().collect::<Vec<_>>(), vec![(443, 8443)]);

        assert!(parse_ports(&["80"]).is_err());
        assert!(parse_ports(&["80:http"]).is_err());
    }

    #[test]
    fn test_volume_edits() {
        let mut spec = web();
        spec.add_volume("web", "certs", "/etc/letsencrypt", Some("/var/certs"), false)
            .unwrap();
        assert_eq!(spec.volumes["certs"].as_deref(), Some("/var/certs"));
        assert_eq!(spec.container("web").unwrap().mounts["certs"].container_path, "/etc/letsencrypt");

        spec.remove_volume("web", "certs").unwrap();
        assert!(spec.volumes.is_empty());
        assert!(spec.container("web").unwrap().mounts.is_empty());
    }

    #[test]
    fn test_command_and_logs() {
        let mut container = ContainerSpec::new("web", "nginx", None);
        container.set_command(Some("gunicorn  app:main -w 2"));
        assert_eq!(
            container.command.as_deref(),
            Some(&["gunicorn".to_string(), "app:main".into(), "-w".into(), "2".into()][..])
        );
        container.set_command(None);
        assert!(container.command.is_none());

        let mut extra = BTreeMap::new();
        extra.insert("syslog-address".to_string(), "udp://logs:514".to_string());
        let log = LogSpec::syslog(extra);
        assert_eq!(log.options["env"], "TASK_NAME");
        assert_eq!(log.options["syslog-address"], "udp://logs:514");
    }

    #[test]
    fn test_sdk_round_trip_keeps_edits() {
        let mut spec = web();
        spec.container_mut("web").unwrap().set_ports(&[(80, 8000)]);
        spec.container_mut("web").unwrap().set_env([("A", "1")]);

        let defs = spec.container_definitions().unwrap();
        let def = TaskDefinition::builder()
            .family(&spec.family)
            .set_container_definitions(Some(defs))
            .set_volumes(Some(spec.sdk_volumes()))
            .build();
        assert_eq!(TaskSpec::from_sdk(&def), spec);
    }
}
