//! Lookups for the per-cluster network resources created by `cluster mk`
//!
//! Everything is found by tag: the VPC, internet gateway and NAT gateway by
//! `cluster`, the subnets and route tables by `Name`
//! (`fuku-<cluster>-<tier>-<zone>`, `fuku-<cluster>-<tier>`).

use anyhow::{anyhow, Context as _, Result};
use aws_sdk_ec2::types::{Filter, NatGatewayState};
use aws_sdk_ec2::Client;
use rand::seq::SliceRandom;

use super::cluster_resource;

/// Zones every cluster spans
pub const ZONES: &[&str] = &["a", "b"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Public,
    Private,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Public => "public",
            Tier::Private => "private",
        }
    }
}

pub fn subnet_name(cluster: &str, tier: Tier, zone: &str) -> String {
    format!("fuku-{}-{}-{}", cluster, tier.as_str(), zone)
}

/// The requested zone, or one of [`ZONES`] at random.
pub fn pick_zone(zone: Option<&str>) -> String {
    match zone {
        Some(zone) => zone.to_string(),
        None => ZONES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("a")
            .to_string(),
    }
}

fn tag_filter(tag: &str, value: &str) -> Filter {
    Filter::builder()
        .name(format!("tag:{}", tag))
        .values(value)
        .build()
}

pub async fn find_vpc(ec2: &Client, cluster: &str) -> Result<Option<String>> {
    let output = ec2
        .describe_vpcs()
        .filters(tag_filter("cluster", cluster))
        .send()
        .await
        .context("Failed to describe VPCs")?;
    Ok(output
        .vpcs()
        .iter()
        .find_map(|vpc| vpc.vpc_id().map(str::to_string)))
}

pub async fn require_vpc(ec2: &Client, cluster: &str) -> Result<String> {
    find_vpc(ec2, cluster)
        .await?
        .ok_or_else(|| anyhow!("no VPC for cluster \"{}\"", cluster))
}

pub async fn find_igw(ec2: &Client, cluster: &str) -> Result<Option<String>> {
    let output = ec2
        .describe_internet_gateways()
        .filters(tag_filter("cluster", cluster))
        .send()
        .await
        .context("Failed to describe internet gateways")?;
    Ok(output
        .internet_gateways()
        .iter()
        .find_map(|igw| igw.internet_gateway_id().map(str::to_string)))
}

/// A cluster NAT gateway and whether it has finished coming up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatGateway {
    pub id: String,
    pub available: bool,
}

/// A NAT gateway of the cluster that is available or still pending.
pub async fn find_nat(ec2: &Client, cluster: &str) -> Result<Option<NatGateway>> {
    let output = ec2
        .describe_nat_gateways()
        .filter(tag_filter("cluster", cluster))
        .filter(
            Filter::builder()
                .name("state")
                .values("pending")
                .values("available")
                .build(),
        )
        .send()
        .await
        .context("Failed to describe NAT gateways")?;
    Ok(output
        .nat_gateways()
        .iter()
        .find_map(|nat| {
            nat.nat_gateway_id().map(|id| NatGateway {
                id: id.to_string(),
                available: nat.state() == Some(&NatGatewayState::Available),
            })
        }))
}

pub fn route_table_name(cluster: &str, tier: Tier) -> String {
    format!("{}-{}", cluster_resource(cluster), tier.as_str())
}

/// A tier's route table and the subnets already associated with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    pub id: String,
    pub subnets: Vec<String>,
}

pub async fn find_route_table(ec2: &Client, cluster: &str, tier: Tier) -> Result<Option<RouteTable>> {
    let output = ec2
        .describe_route_tables()
        .filters(tag_filter("Name", &route_table_name(cluster, tier)))
        .send()
        .await
        .context("Failed to describe route tables")?;
    Ok(output.route_tables().iter().find_map(|table| {
        table.route_table_id().map(|id| RouteTable {
            id: id.to_string(),
            subnets: table
                .associations()
                .iter()
                .filter_map(|assoc| assoc.subnet_id().map(str::to_string))
                .collect(),
        })
    }))
}

async fn subnet_by_name(ec2: &Client, name: &str) -> Result<Option<String>> {
    let output = ec2
        .describe_subnets()
        .filters(tag_filter("Name", name))
        .send()
        .await
        .context("Failed to describe subnets")?;
    Ok(output
        .subnets()
        .iter()
        .find_map(|subnet| subnet.subnet_id().map(str::to_string)))
}

/// One subnet of `tier`, in `zone` or a random zone.
pub async fn subnet(ec2: &Client, cluster: &str, tier: Tier, zone: Option<&str>) -> Result<String> {
    let name = subnet_name(cluster, tier, &pick_zone(zone));
    subnet_by_name(ec2, &name)
        .await?
        .ok_or_else(|| anyhow!("no {} subnets", tier.as_str()))
}

/// Every subnet of `tier`, zone `a` first.
pub async fn subnets(ec2: &Client, cluster: &str, tier: Tier) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for zone in ZONES {
        if let Some(id) = subnet_by_name(ec2, &subnet_name(cluster, tier, zone)).await? {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Id of the `fuku-<cluster>` security group inside the cluster VPC.
pub async fn security_group_id(ec2: &Client, cluster: &str) -> Result<String> {
    let vpc = require_vpc(ec2, cluster).await?;
    let group_name = cluster_resource(cluster);
    let output = ec2
        .describe_security_groups()
        .filters(Filter::builder().name("vpc-id").values(&vpc).build())
        .send()
        .await
        .context("Failed to describe security groups")?;
    output
        .security_groups()
        .iter()
        .find(|sg| sg.group_name() == Some(group_name.as_str()))
        .and_then(|sg| sg.group_id().map(str::to_string))
        .ok_or_else(|| anyhow!("security group for \"{}\" does not exist", cluster))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_name() {
        assert_eq!(subnet_name("prod", Tier::Public, "a"), "fuku-prod-public-a");
        assert_eq!(subnet_name("prod", Tier::Private, "b"), "fuku-prod-private-b");
        assert_eq!(route_table_name("prod", Tier::Public), "fuku-prod-public");
    }

    #[test]
    fn test_pick_zone() {
        assert_eq!(pick_zone(Some("b")), "b");
        for _ in 0..10 {
            assert!(ZONES.contains(&pick_zone(None).as_str()));
        }
    }
}
