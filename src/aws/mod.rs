//! AWS session plumbing shared by every module
//!
//! A session is built fresh for each command from the calling module's
//! dependency context (`region`, `profile`) and hands out service clients.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use fuku_core::Context;
use std::time::Duration;
use tracing::debug;

pub mod errors;
pub mod network;
pub mod s3;
pub mod task_def;

pub use errors::{is_code, tolerate_code, tolerate_existing, ErrorCode};
pub use s3::S3ObjectStore;

#[derive(Clone)]
pub struct AwsSession {
    config: SdkConfig,
    region: Option<String>,
    waiter_timeout: Duration,
}

impl AwsSession {
    /// Load SDK configuration for an optional region and named profile.
    pub async fn load(
        region: Option<&str>,
        profile: Option<&str>,
        waiter_timeout: Duration,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        debug!(?region, ?profile, "loading AWS configuration");
        Self {
            config: loader.load().await,
            region: region.map(str::to_string),
            waiter_timeout,
        }
    }

    /// Session for whatever `region` and `profile` the context carries.
    pub async fn from_context(ctx: &Context, waiter_timeout: Duration) -> Self {
        Self::load(ctx.get("region"), ctx.get("profile"), waiter_timeout).await
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Upper bound for blocking waiters
    pub fn waiter_timeout(&self) -> Duration {
        self.waiter_timeout
    }

    pub fn ec2(&self) -> aws_sdk_ec2::Client {
        aws_sdk_ec2::Client::new(&self.config)
    }

    pub fn ecs(&self) -> aws_sdk_ecs::Client {
        aws_sdk_ecs::Client::new(&self.config)
    }

    pub fn ecr(&self) -> aws_sdk_ecr::Client {
        aws_sdk_ecr::Client::new(&self.config)
    }

    pub fn elb(&self) -> aws_sdk_elasticloadbalancingv2::Client {
        aws_sdk_elasticloadbalancingv2::Client::new(&self.config)
    }

    pub fn iam(&self) -> aws_sdk_iam::Client {
        aws_sdk_iam::Client::new(&self.config)
    }

    pub fn logs(&self) -> aws_sdk_cloudwatchlogs::Client {
        aws_sdk_cloudwatchlogs::Client::new(&self.config)
    }

    pub fn rds(&self) -> aws_sdk_rds::Client {
        aws_sdk_rds::Client::new(&self.config)
    }

    pub fn route53(&self) -> aws_sdk_route53::Client {
        aws_sdk_route53::Client::new(&self.config)
    }

    pub fn s3(&self) -> aws_sdk_s3::Client {
        aws_sdk_s3::Client::new(&self.config)
    }

    pub fn sts(&self) -> aws_sdk_sts::Client {
        aws_sdk_sts::Client::new(&self.config)
    }
}

/// `fuku-<cluster>`: ECS cluster, VPC, key pair and security group name
pub fn cluster_resource(cluster: &str) -> String {
    format!("fuku-{}", cluster)
}

/// `fuku-<cluster>-<app>`: target group and base task family
pub fn app_resource(cluster: &str, app: &str) -> String {
    format!("fuku-{}-{}", cluster, app)
}

/// `<region><zone>`, e.g. `ap-southeast-2a`
pub fn availability_zone(region: &str, zone: &str) -> String {
    format!("{}{}", region, zone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        assert_eq!(cluster_resource("prod"), "fuku-prod");
        assert_eq!(app_resource("prod", "api"), "fuku-prod-api");
        assert_eq!(availability_zone("ap-southeast-2", "b"), "ap-southeast-2b");
    }
}
