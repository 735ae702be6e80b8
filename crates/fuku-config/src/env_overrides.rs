use super::{FukuConfig, LogFormat};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

pub const ENV_PREFIX: &str = "FUKU_";

/// Abstraction over environment-variable lookups so tests can supply their
/// own source of overrides.
pub trait EnvSource {
    /// Get a FUKU_-prefixed variable; `key` omits the prefix
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the FUKU_ prefix
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut FukuConfig, env: &E) -> Result<()> {
    if let Some(dir) = get_env_string(env, "RC_DIR")? {
        config.paths.rc_dir = Some(PathBuf::from(dir));
    }

    if let Some(level) = get_env_string(env, "LOG_LEVEL")? {
        config.log.level = level;
    }
    if let Some(format) = get_env_string(env, "LOG_FORMAT")? {
        config.log.format = format
            .parse::<LogFormat>()
            .context("Invalid FUKU_LOG_FORMAT value")?;
    }

    if let Some(regions) = get_env_list(env, "REGIONS")? {
        config.aws.regions = regions;
    }
    if let Some(secs) = get_env_u64(env, "WAITER_TIMEOUT_SECS")? {
        config.aws.waiter_timeout_secs = secs;
    }

    // AWS_DEFAULT_REGION is always offered
    if let Some(region) = get_raw_env_string(env, "AWS_DEFAULT_REGION")? {
        if !config.aws.regions.contains(&region) {
            config.aws.regions.push(region);
        }
    }

    Ok(())
}

fn get_env_string<E: EnvSource>(env: &E, key: &str) -> Result<Option<String>> {
    Ok(env.get(key).filter(|v| !v.is_empty()))
}

fn get_raw_env_string<E: EnvSource>(env: &E, key: &str) -> Result<Option<String>> {
    Ok(env.get_raw(key).filter(|v| !v.is_empty()))
}

/// Comma-separated list; blank entries are dropped.
fn get_env_list<E: EnvSource>(env: &E, key: &str) -> Result<Option<Vec<String>>> {
    Ok(get_env_string(env, key)?.map(|val| {
        val.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }))
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    match get_env_string(env, key)? {
        Some(val) => {
            let parsed = val
                .parse::<u64>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapEnv(HashMap<String, String>);

    impl MapEnv {
        fn with(mut self, key: &str, value: &str) -> Self {
            self.0.insert(key.to_string(), value.to_string());
            self
        }
    }

    impl EnvSource for MapEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(&format!("{}{}", ENV_PREFIX, key)).cloned()
        }

        fn get_raw(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn test_overrides_apply() {
        let env = MapEnv::default()
            .with("FUKU_RC_DIR", "/tmp/rc")
            .with("FUKU_LOG_LEVEL", "debug")
            .with("FUKU_LOG_FORMAT", "json")
            .with("FUKU_REGIONS", "us-east-1, eu-west-1,")
            .with("FUKU_WAITER_TIMEOUT_SECS", "60");

        let mut config = FukuConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();

        assert_eq!(config.paths.rc_dir, Some(PathBuf::from("/tmp/rc")));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.aws.regions, vec!["us-east-1", "eu-west-1"]);
        assert_eq!(config.aws.waiter_timeout_secs, 60);
    }

    #[test]
    fn test_invalid_number_is_error() {
        let env = MapEnv::default().with("FUKU_WAITER_TIMEOUT_SECS", "soon");
        let mut config = FukuConfig::default();
        let err = apply_env_overrides(&mut config, &env).unwrap_err();
        assert!(err.to_string().contains("FUKU_WAITER_TIMEOUT_SECS"));
    }

    #[test]
    fn test_default_region_appended_once() {
        let env = MapEnv::default().with("AWS_DEFAULT_REGION", "us-west-2");
        let mut config = FukuConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();
        apply_env_overrides(&mut config, &env).unwrap();
        assert_eq!(config.aws.regions, vec!["ap-southeast-2", "us-west-2"]);
    }

    #[test]
    fn test_empty_values_ignored() {
        let env = MapEnv::default().with("FUKU_LOG_LEVEL", "");
        let mut config = FukuConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();
        assert_eq!(config.log.level, "warn");
    }
}
