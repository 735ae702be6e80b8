// Configuration validation
//
// Validates that required fields are present and values are sensible. Soft
// problems are returned by `config_warnings` so they can be logged once a
// subscriber is installed.

use crate::*;
use anyhow::{bail, Result};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

pub fn validate_config(config: &FukuConfig) -> Result<()> {
    validate_paths_config(&config.paths)?;
    validate_log_config(&config.log)?;
    validate_aws_config(&config.aws)?;
    Ok(())
}

fn validate_paths_config(config: &PathsConfig) -> Result<()> {
    if let Some(dir) = &config.rc_dir {
        if dir.as_os_str().is_empty() {
            bail!("paths.rc_dir must not be empty");
        }
    }
    Ok(())
}

fn validate_log_config(config: &LogConfig) -> Result<()> {
    if config.level.trim().is_empty() {
        bail!("log.level must not be empty");
    }

    // Target directives ("fuku=debug") pass through; bare words must be levels
    for directive in config.level.split(',').map(str::trim) {
        if directive.contains('=') {
            continue;
        }
        if !LOG_LEVELS.contains(&directive.to_lowercase().as_str()) {
            bail!(
                "log.level \"{}\" is not one of {}",
                directive,
                LOG_LEVELS.join(", ")
            );
        }
    }
    Ok(())
}

fn validate_aws_config(config: &AwsConfig) -> Result<()> {
    if config.regions.is_empty() {
        bail!("aws.regions must list at least one region");
    }
    if config.regions.iter().any(|r| r.trim().is_empty()) {
        bail!("aws.regions must not contain empty names");
    }

    if config.waiter_timeout_secs == 0 {
        bail!("aws.waiter_timeout_secs must be greater than 0");
    }
    Ok(())
}

/// Settings that load fine but will likely cause trouble later.
pub fn config_warnings(config: &FukuConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.aws.waiter_timeout_secs > 4 * 60 * 60 {
        warnings.push(format!(
            "aws.waiter_timeout_secs is {}; commands may block for hours",
            config.aws.waiter_timeout_secs
        ));
    }
    for region in &config.aws.regions {
        if !config.aws.ecs_amis.contains_key(region) {
            warnings.push(format!(
                "no ECS AMI configured for {}; node creation will fail there",
                region
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&FukuConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_regions_rejected() {
        let mut config = FukuConfig::default();
        config.aws.regions.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("aws.regions"));
    }

    #[test]
    fn test_zero_waiter_timeout_rejected() {
        let mut config = FukuConfig::default();
        config.aws.waiter_timeout_secs = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_log_level_rejected() {
        let mut config = FukuConfig::default();
        config.log.level = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut config = FukuConfig::default();
        config.log.level = "verbose".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().starts_with("log.level \"verbose\""));
    }

    #[test]
    fn test_log_directives_accepted() {
        let mut config = FukuConfig::default();
        config.log.level = "warn,fuku=debug".to_string();
        assert!(validate_config(&config).is_ok());
        config.log.level = "INFO".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_region_without_ami_only_warns() {
        let mut config = FukuConfig::default();
        assert!(config_warnings(&config).is_empty());

        config.aws.regions.push("eu-west-1".to_string());
        assert!(validate_config(&config).is_ok());
        let warnings = config_warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("eu-west-1"));
    }
}
