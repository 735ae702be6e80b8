// Configuration source loading.
//
// Priority order:
// 1. Environment variables (FUKU_* prefix)
// 2. Config file path from FUKU_CONFIG
// 3. Inline config content from FUKU_CONFIG_CONTENT
// 4. Default config files (./fuku.toml, ~/.fukurc/config.toml)
// 5. Built-in defaults

use crate::env_overrides::{self, EnvSource, ENV_PREFIX};
use crate::*;
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Load configuration using native environment/file access.
pub fn load_config() -> Result<FukuConfig> {
    let mut config = FukuConfig::default();

    if let Some(file_config) = load_from_file()? {
        config.merge(file_config);
    }

    let env_source = StdEnvSource;
    env_overrides::apply_env_overrides(&mut config, &env_source)?;
    config.validate()?;
    Ok(config)
}

fn load_from_file() -> Result<Option<FukuConfig>> {
    if let Ok(path) = env::var("FUKU_CONFIG") {
        return parse_file(Path::new(&path)).map(Some);
    }

    if let Ok(content) = env::var("FUKU_CONFIG_CONTENT") {
        let config: FukuConfig = toml::from_str(&content)
            .context("Failed to parse inline config from FUKU_CONFIG_CONTENT")?;
        return Ok(Some(config));
    }

    for path in default_paths() {
        if path.exists() {
            return parse_file(&path).map(Some);
        }
    }

    Ok(None)
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("./fuku.toml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(RC_DIR_NAME).join("config.toml"));
    }
    paths
}

fn parse_file(path: &Path) -> Result<FukuConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from a specific file path (for CLI --config flag).
/// Returns error if file doesn't exist or can't be parsed.
pub fn load_from_file_path(path: impl AsRef<Path>) -> Result<FukuConfig> {
    let file_config = parse_file(path.as_ref())?;

    let mut config = FukuConfig::default();
    config.merge(file_config);

    let env_source = StdEnvSource;
    env_overrides::apply_env_overrides(&mut config, &env_source)?;

    config.validate()?;
    Ok(config)
}

/// Load configuration with graceful fallback to defaults.
pub fn load_or_default() -> Result<FukuConfig> {
    let mut config = FukuConfig::default();

    // Try to load from file, but don't fail if not found
    if let Ok(Some(file_config)) = load_from_file() {
        config.merge(file_config);
    }

    let env_source = StdEnvSource;
    env_overrides::apply_env_overrides(&mut config, &env_source)?;

    config.validate()?;
    Ok(config)
}

struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(format!("{}{}", ENV_PREFIX, key)).ok()
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn clear_env() {
        for key in [
            "FUKU_CONFIG",
            "FUKU_CONFIG_CONTENT",
            "FUKU_RC_DIR",
            "FUKU_LOG_LEVEL",
            "FUKU_LOG_FORMAT",
            "FUKU_REGIONS",
            "FUKU_WAITER_TIMEOUT_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_load_from_file_path() {
        clear_env();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[log]\nlevel = \"info\"\n\n[aws]\nwaiter_timeout_secs = 120"
        )
        .unwrap();

        let config = load_from_file_path(file.path()).unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.aws.waiter_timeout_secs, 120);
        assert!(config.aws.ecs_amis.contains_key("ap-southeast-2"));
    }

    #[test]
    #[serial]
    fn test_missing_file_path_is_error() {
        clear_env();
        let err = load_from_file_path("/nonexistent/fuku.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    #[serial]
    fn test_inline_content_and_env_priority() {
        clear_env();
        env::set_var("FUKU_CONFIG_CONTENT", "[log]\nlevel = \"info\"\nformat = \"json\"");
        env::set_var("FUKU_LOG_LEVEL", "trace");

        let config = load_config().unwrap();
        assert_eq!(config.log.level, "trace");
        assert_eq!(config.log.format, LogFormat::Json);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_inline_content() {
        clear_env();
        env::set_var("FUKU_CONFIG_CONTENT", "[log\nlevel =");
        let err = load_config().unwrap_err();
        assert!(err.to_string().contains("FUKU_CONFIG_CONTENT"));

        // load_or_default tolerates the bad file source
        assert!(load_or_default().is_ok());
        clear_env();
    }
}
