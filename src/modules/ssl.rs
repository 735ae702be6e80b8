//! TLS termination with a lets-nginx task in front of an upstream

use anyhow::Result;
use clap::Subcommand;
use fuku_core::Module;
use std::collections::BTreeMap;

use crate::aws::task_def::TaskSpec;
use crate::modules::task::Tasks;
use crate::workspace::Workspace;

const TASK: &str = "ssl";
const IMAGE: &str = "!smashwilson/lets-nginx";

/// (volume, mount point) pairs the certificate tooling persists
const VOLUMES: &[(&str, &str)] = &[
    ("letsencrypt", "/etc/letsencrypt"),
    ("letsencrypt-backups", "/var/lib/letsencrypt"),
    ("dhparam-cache", "/cache"),
];

pub struct SslModule;

impl Module for SslModule {
    fn name(&self) -> &'static str {
        "ssl"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["task"]
    }
}

#[derive(Debug, Subcommand)]
pub enum SslCommand {
    /// Create (or with --update, reconfigure) the ssl task
    Add {
        email: String,
        domain: String,
        /// host:port requests are proxied to
        upstream: String,
        /// Use the Let's Encrypt staging environment
        #[arg(short, long)]
        staging: bool,
        /// Reconfigure an existing ssl task
        #[arg(short, long)]
        update: bool,
    },
}

/// Apply the proxy configuration to the ssl task.
fn configure(
    spec: &mut TaskSpec,
    container: &str,
    email: &str,
    domain: &str,
    upstream: &str,
    staging: bool,
) -> Result<()> {
    {
        let c = spec.container_mut(container)?;
        let mut env = BTreeMap::from([
            ("EMAIL".to_string(), email.to_string()),
            ("DOMAIN".to_string(), domain.to_string()),
            ("UPSTREAM".to_string(), upstream.to_string()),
        ]);
        if staging {
            env.insert("STAGING".to_string(), "1".to_string());
        } else {
            c.unset_env(&["STAGING"]);
        }
        c.set_env(env);
        c.set_ports(&[(80, 80), (443, 443)]);
    }
    for (volume, destination) in VOLUMES {
        spec.add_volume(container, volume, destination, None, false)?;
    }
    Ok(())
}

pub async fn run(ws: &mut Workspace, cmd: SslCommand) -> Result<()> {
    let ctx = ws.context("ssl")?;
    let aws = ws.aws("ssl").await?;
    let tasks = Tasks::new(&aws, &ctx)?;

    match cmd {
        SslCommand::Add {
            email,
            domain,
            upstream,
            staging,
            update,
        } => {
            if !update {
                tasks.make(TASK, IMAGE, None, None).await?;
            }
            tasks
                .edit_task(Some(TASK), |spec, container| {
                    configure(spec, container, &email, &domain, &upstream, staging)
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::task_def::ContainerSpec;

    fn ssl_task() -> TaskSpec {
        let mut container = ContainerSpec::new("ssl", "smashwilson/lets-nginx", None);
        container.set_env([("STAGING", "1")]);
        TaskSpec::new("fuku-prod-api-ssl", container)
    }

    #[test]
    fn test_configure() {
        let mut spec = ssl_task();
        configure(&mut spec, "ssl", "ops@example.com", "example.com", "web:8000", false).unwrap();
        let c = spec.container("ssl").unwrap();
        assert_eq!(
            c.env_lines(),
            vec!["DOMAIN=example.com", "EMAIL=ops@example.com", "UPSTREAM=web:8000"]
        );
        assert_eq!(c.ports.get(&443), Some(&443));
        assert_eq!(c.mounts["letsencrypt"].container_path, "/etc/letsencrypt");
        assert_eq!(spec.volumes.len(), 3);
        assert_eq!(spec.volumes["dhparam-cache"], None);
    }

    #[test]
    fn test_configure_staging() {
        let mut spec = ssl_task();
        configure(&mut spec, "ssl", "a@b.c", "b.c", "web:80", true).unwrap();
        assert!(spec.container("ssl").unwrap().env_lines().contains(&"STAGING=1".to_string()));
    }
}
