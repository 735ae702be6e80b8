//! ECR repositories for an app and the local images bound to them
//!
//! Image references used across fuku:
//! - `!nginx:alpine`: a literal docker image, used as is
//! - `/name`: the global repository `name`
//! - `name`: the app repository `<app>-name`

use anyhow::{anyhow, bail, Context as _, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Subcommand;
use fuku_core::{Capture, Module, ShellCommand};
use tracing::info;

use crate::workspace::Workspace;

pub struct ImageModule;

impl Module for ImageModule {
    fn name(&self) -> &'static str {
        "image"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["app"]
    }
}

#[derive(Debug, Subcommand)]
pub enum ImageCommand {
    /// List repositories visible to the app
    Ls,
    /// Create a repository
    Mk { name: String },
    /// Delete a repository
    Rm { name: String },
    /// Bind a local docker image to a repository
    Connect {
        name: String,
        local: Option<String>,
        /// Show the current binding
        #[arg(short, long)]
        show: bool,
    },
    /// Tag and push the bound local image
    Push { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Literal(String),
    Repository(String),
}

impl ImageRef {
    pub fn parse(name: &str, app: &str) -> Result<Self> {
        if let Some(image) = name.strip_prefix('!') {
            return Ok(ImageRef::Literal(image.to_string()));
        }
        if let Some(repo) = name.strip_prefix('/') {
            return Ok(ImageRef::Repository(repo.to_string()));
        }
        if name.is_empty() {
            bail!("empty image name");
        }
        Ok(ImageRef::Repository(format!("{}-{}", app, name)))
    }
}

/// Docker image (or repository URI) for an image reference.
pub async fn resolve(ecr: &aws_sdk_ecr::Client, name: &str, app: &str) -> Result<String> {
    match ImageRef::parse(name, app)? {
        ImageRef::Literal(image) => Ok(image),
        ImageRef::Repository(repo) => repository_uri(ecr, &repo).await,
    }
}

pub async fn repository_uri(ecr: &aws_sdk_ecr::Client, repo: &str) -> Result<String> {
    let output = ecr
        .describe_repositories()
        .repository_names(repo)
        .send()
        .await
        .with_context(|| format!("no image repository \"{}\"", repo))?;
    output
        .repositories()
        .first()
        .and_then(|r| r.repository_uri())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no image repository \"{}\"", repo))
}

async fn repository_names(ecr: &aws_sdk_ecr::Client) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut token = None;
    loop {
        let page = ecr
            .describe_repositories()
            .set_next_token(token)
            .send()
            .await
            .context("Failed to describe repositories")?;
        names.extend(
            page.repositories()
                .iter()
                .filter_map(|r| r.repository_name())
                .map(str::to_string),
        );
        token = page.next_token().map(str::to_string);
        if token.is_none() {
            return Ok(names);
        }
    }
}

/// Repositories as image references: globals (`/name`, no `-` in the
/// repository name) followed by the app's own.
pub fn visible_images(repositories: &[String], app: &str) -> Vec<String> {
    let prefix = format!("{}-", app);
    let globals = repositories
        .iter()
        .filter(|r| !r.contains('-'))
        .map(|r| format!("/{}", r));
    let own = repositories
        .iter()
        .filter_map(|r| r.strip_prefix(&prefix))
        .map(str::to_string);
    globals.chain(own).collect()
}

fn binding_key(app: &str, name: &str) -> String {
    format!("images.{}.{}.local", app, name)
}

pub async fn run(ws: &mut Workspace, cmd: ImageCommand) -> Result<()> {
    let ctx = ws.context("image")?;
    let app = ctx.require("app")?.to_string();
    let aws = ws.aws("image").await?;
    let ecr = aws.ecr();

    match cmd {
        ImageCommand::Ls => {
            for image in visible_images(&repository_names(&ecr).await?, &app) {
                println!("{}", image);
            }
        }
        ImageCommand::Mk { name } => {
            if visible_images(&repository_names(&ecr).await?, &app).contains(&name) {
                bail!("image by that name already exists");
            }
            let ImageRef::Repository(repo) = ImageRef::parse(&name, &app)? else {
                bail!("\"{}\" is a literal image, not a repository", name);
            };
            ecr.create_repository()
                .repository_name(&repo)
                .send()
                .await
                .with_context(|| format!("Failed to create repository {}", repo))?;
            info!(repository = %repo, "created repository");
        }
        ImageCommand::Rm { name } => {
            let ImageRef::Repository(repo) = ImageRef::parse(&name, &app)? else {
                bail!("\"{}\" is a literal image, not a repository", name);
            };
            ecr.delete_repository()
                .repository_name(&repo)
                .send()
                .await
                .with_context(|| format!("Failed to delete repository {}", repo))?;
        }
        ImageCommand::Connect { name, local, show } => {
            if !visible_images(&repository_names(&ecr).await?, &app).contains(&name) {
                bail!("image does not exist");
            }
            let key = binding_key(&app, &name);
            if show {
                if let Some(local) = ws.client().store().get_str("image", &key) {
                    println!("{}", local);
                }
            } else {
                let local = local.unwrap_or_default();
                ws.client_mut().store_mut().set("image", &key, local);
            }
        }
        ImageCommand::Push { name } => {
            let local = ws
                .client()
                .store()
                .get_str("image", &binding_key(&app, &name))
                .map(str::to_string)
                .ok_or_else(|| anyhow!("image not connected"))?;
            let uri = resolve(&ecr, &name, &app).await?;
            ws.run(ShellCommand::new(format!("docker tag {} {}:latest", local, uri)))?;
            login(ws, &ecr).await?;
            ws.run(ShellCommand::new(format!("docker push {}:latest", uri)))?;
        }
    }
    Ok(())
}

/// `docker login` against the account registry.
pub async fn login(ws: &Workspace, ecr: &aws_sdk_ecr::Client) -> Result<()> {
    let output = ecr
        .get_authorization_token()
        .send()
        .await
        .context("Failed to get ECR authorization token")?;
    let data = output
        .authorization_data()
        .first()
        .ok_or_else(|| anyhow!("no ECR authorization data"))?;
    let token = data
        .authorization_token()
        .ok_or_else(|| anyhow!("no ECR authorization token"))?;
    let endpoint = data.proxy_endpoint().unwrap_or_default();
    let password = registry_password(token)?;
    ws.run(
        ShellCommand::new(format!("docker login -u AWS --password-stdin {}", endpoint))
            .stdin(password)
            .capture(Capture::Discard),
    )?;
    Ok(())
}

/// Password half of a base64 `AWS:<password>` token
fn registry_password(token: &str) -> Result<String> {
    let decoded = STANDARD
        .decode(token)
        .context("ECR authorization token is not base64")?;
    let decoded = String::from_utf8(decoded).context("ECR authorization token is not UTF-8")?;
    decoded
        .split_once(':')
        .map(|(_, password)| password.to_string())
        .ok_or_else(|| anyhow!("malformed ECR authorization token"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_refs() {
        assert_eq!(
            ImageRef::parse("!redis:alpine", "api").unwrap(),
            ImageRef::Literal("redis:alpine".into())
        );
        assert_eq!(
            ImageRef::parse("/fuku", "api").unwrap(),
            ImageRef::Repository("fuku".into())
        );
        assert_eq!(
            ImageRef::parse("web", "api").unwrap(),
            ImageRef::Repository("api-web".into())
        );
        assert!(ImageRef::parse("", "api").is_err());
    }

    #[test]
    fn test_visible_images() {
        let repos: Vec<String> = ["fuku", "api-web", "api-worker", "shop-web"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(visible_images(&repos, "api"), vec!["/fuku", "web", "worker"]);
    }

    #[test]
    fn test_registry_password() {
        let token = STANDARD.encode("AWS:s3cr:et");
        assert_eq!(registry_password(&token).unwrap(), "s3cr:et");
        assert!(registry_password(&STANDARD.encode("nocolon")).is_err());
    }

    #[test]
    fn test_binding_key() {
        assert_eq!(binding_key("api", "/fuku"), "images.api./fuku.local");
    }
}
