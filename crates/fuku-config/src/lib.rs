// fuku-config - Layered configuration for the fuku CLI
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file passed on the command line (--config)
// 3. Config file path from FUKU_CONFIG env var
// 4. Config file contents from FUKU_CONFIG_CONTENT env var
// 5. Default config file locations (./fuku.toml, ~/.fukurc/config.toml)
// 6. Built-in defaults (lowest priority)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};

/// Directory name (under the home directory) holding the store and cached keys
pub const RC_DIR_NAME: &str = ".fukurc";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FukuConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub aws: AwsConfig,
}

/// Local filesystem locations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Overrides `~/.fukurc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Resolved rc directory: the configured path, else `~/.fukurc`, else
    /// `./.fukurc` when no home directory is known.
    pub fn rc_dir(&self) -> PathBuf {
        match &self.rc_dir {
            Some(dir) => dir.clone(),
            None => default_rc_dir(),
        }
    }

    /// Location of the persisted module store
    pub fn store_path(&self) -> PathBuf {
        self.rc_dir().join("db.json")
    }
}

fn default_rc_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(RC_DIR_NAME)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unsupported log format: {}. Supported: text, json", s),
        }
    }
}

/// AWS-facing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Regions offered by `fuku region ls`
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,

    /// ECS-optimized AMI per region, used for worker nodes and bastions
    #[serde(default = "default_ecs_amis")]
    pub ecs_amis: BTreeMap<String, String>,

    /// Upper bound on blocking waiters (NAT gateway, instance status, RDS, ...)
    #[serde(default = "default_waiter_timeout_secs")]
    pub waiter_timeout_secs: u64,
}

fn default_regions() -> Vec<String> {
    vec!["ap-southeast-2".to_string()]
}

fn default_ecs_amis() -> BTreeMap<String, String> {
    BTreeMap::from([("ap-southeast-2".to_string(), "ami-c1a6bda2".to_string())])
}

fn default_waiter_timeout_secs() -> u64 {
    30 * 60
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            ecs_amis: default_ecs_amis(),
            waiter_timeout_secs: default_waiter_timeout_secs(),
        }
    }
}

impl AwsConfig {
    pub fn waiter_timeout(&self) -> Duration {
        Duration::from_secs(self.waiter_timeout_secs)
    }

    pub fn ecs_ami(&self, region: &str) -> Option<&str> {
        self.ecs_amis.get(region).map(String::as_str)
    }
}

impl FukuConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration starting from a specific file (for the CLI `--config` flag).
    /// A missing or unparsable file is an error.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Load configuration, falling back to defaults when no file is readable.
    pub fn load_or_default() -> Result<Self> {
        sources::load_or_default()
    }

    /// Merge a file-sourced configuration over this one.
    pub fn merge(&mut self, other: FukuConfig) {
        if other.paths.rc_dir.is_some() {
            self.paths.rc_dir = other.paths.rc_dir;
        }
        self.log = other.log;
        self.aws = other.aws;
    }

    /// Apply environment overrides from a custom source (tests, embedding).
    pub fn apply_env_overrides_from<E: EnvSource>(&mut self, env: &E) -> Result<()> {
        env_overrides::apply_env_overrides(self, env)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    /// Non-fatal problems, for logging after tracing is initialized
    pub fn warnings(&self) -> Vec<String> {
        validation::config_warnings(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FukuConfig::default();
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.log.format, LogFormat::Text);
        assert_eq!(config.aws.regions, vec!["ap-southeast-2"]);
        assert_eq!(config.aws.ecs_ami("ap-southeast-2"), Some("ami-c1a6bda2"));
        assert_eq!(config.aws.ecs_ami("us-east-1"), None);
        assert_eq!(config.aws.waiter_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: FukuConfig = toml::from_str(
            r#"
            [aws]
            regions = ["us-east-1", "ap-southeast-2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.aws.regions, vec!["us-east-1", "ap-southeast-2"]);
        assert_eq!(config.aws.waiter_timeout_secs, 1800);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_rc_dir_override() {
        let paths = PathsConfig {
            rc_dir: Some(PathBuf::from("/tmp/fuku-rc")),
        };
        assert_eq!(paths.rc_dir(), PathBuf::from("/tmp/fuku-rc"));
        assert_eq!(paths.store_path(), PathBuf::from("/tmp/fuku-rc/db.json"));
    }

    #[test]
    fn test_default_rc_dir_name() {
        assert!(PathsConfig::default().rc_dir().ends_with(RC_DIR_NAME));
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_merge_keeps_rc_dir_when_unset() {
        let mut config = FukuConfig::default();
        config.paths.rc_dir = Some(PathBuf::from("/srv/fuku"));

        let mut file = FukuConfig::default();
        file.log.level = "debug".to_string();
        config.merge(file);

        assert_eq!(config.paths.rc_dir, Some(PathBuf::from("/srv/fuku")));
        assert_eq!(config.log.level, "debug");
    }
}
