//! ECS clusters and the network, key pair and load balancer around them

use anyhow::{anyhow, bail, Context as _, Result};
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::types::{
    AttributeBooleanValue, DomainType, IpPermission, ResourceType, Tag, TagSpecification,
    UserIdGroupPair,
};
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, IpAddressType, LoadBalancerSchemeEnum, Matcher, ProtocolEnum,
};
use clap::Subcommand;
use fuku_core::{remove_cached, validate, Context, FukuError, Module, ModuleState, ShellCommand};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::aws::network::{self, Tier, ZONES};
use crate::aws::{app_resource, availability_zone, cluster_resource, tolerate_existing, AwsSession};
use crate::modules::{app, encrypt_with_retry, service};
use crate::workspace::Workspace;

static CLUSTER_ARN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^/]*/fuku-(.+)").expect("valid cluster ARN regex")
});

const VPC_CIDR: &str = "10.0.0.0/16";

/// (tier, zone, CIDR) of every subnet a cluster gets
const SUBNETS: &[(Tier, &str, &str)] = &[
    (Tier::Public, "a", "10.0.4.0/23"),
    (Tier::Public, "b", "10.0.6.0/23"),
    (Tier::Private, "a", "10.0.0.0/23"),
    (Tier::Private, "b", "10.0.2.0/23"),
];

/// Ports open to the world on the cluster security group
const INGRESS_PORTS: &[i32] = &[22, 80, 443, 5432];

pub struct ClusterModule {
    rc_dir: PathBuf,
}

impl ClusterModule {
    pub fn new(rc_dir: impl Into<PathBuf>) -> Self {
        Self {
            rc_dir: rc_dir.into(),
        }
    }
}

/// Object path of a cluster's SSH key
pub fn key_path(cluster: &str) -> String {
    format!("{}/key.pem", cluster)
}

impl Module for ClusterModule {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["region"]
    }

    fn my_context(&self, state: &ModuleState<'_>) -> fuku_core::Result<Context> {
        let cluster = state
            .selected()
            .ok_or_else(|| FukuError::usage("no cluster currently selected"))?;
        let pem = self.rc_dir.join(key_path(cluster));
        Ok(Context::new()
            .with("cluster", cluster)
            .with("pem", pem.display().to_string()))
    }

    fn selectable(&self) -> bool {
        true
    }

    fn on_deselect(&self, previous: &str, _context: &Context) -> fuku_core::Result<()> {
        remove_cached(&self.rc_dir, &key_path(previous));
        Ok(())
    }
}

#[derive(Debug, Subcommand)]
pub enum ClusterCommand {
    /// List clusters
    Ls,
    /// Create a cluster and select it
    Mk { name: String },
    /// Select a cluster, or clear the selection
    Sl { name: Option<String> },
    /// Replace a cluster's stored SSH key
    Up {
        name: String,
        #[arg(short, long)]
        pem: PathBuf,
    },
    /// Services per app with desired and running counts
    Summary,
}

pub async fn run(ws: &mut Workspace, cmd: ClusterCommand) -> Result<()> {
    let aws = ws.aws("cluster").await?;

    match cmd {
        ClusterCommand::Ls => {
            for name in list(&aws.ecs()).await? {
                println!("{}", name);
            }
        }
        ClusterCommand::Mk { name } => make(ws, &aws, &name).await?,
        ClusterCommand::Sl { name } => select(ws, &aws, name.as_deref()).await?,
        ClusterCommand::Up { name, pem } => {
            let key = std::fs::read_to_string(&pem)
                .with_context(|| format!("Failed to read PEM file: {}", pem.display()))?;
            store_key(ws, &name, &key).await?;
        }
        ClusterCommand::Summary => {
            let cluster = ws.context("cluster")?.require("cluster")?.to_string();
            summary(&aws, &cluster).await?;
        }
    }
    Ok(())
}

/// Cluster name from an ECS cluster ARN, for clusters fuku made.
pub fn cluster_name(arn: &str) -> Option<&str> {
    CLUSTER_ARN
        .captures(arn)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub async fn list(ecs: &aws_sdk_ecs::Client) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut token = None;
    loop {
        let page = ecs
            .list_clusters()
            .set_next_token(token)
            .send()
            .await
            .context("Failed to list clusters")?;
        names.extend(
            page.cluster_arns()
                .iter()
                .filter_map(|arn| cluster_name(arn))
                .map(str::to_string),
        );
        token = page.next_token().map(str::to_string);
        if token.is_none() {
            return Ok(names);
        }
    }
}

async fn select(ws: &mut Workspace, aws: &AwsSession, name: Option<&str>) -> Result<()> {
    if let Some(name) = name {
        if !list(&aws.ecs()).await?.iter().any(|c| c == name) {
            bail!("no cluster \"{}\"", name);
        }
        let objects = ws.objects("cluster").await?;
        let path = ws.secure(&objects).fetch(&key_path(name)).await?;
        ws.run(ShellCommand::new(format!("ssh-add {}", path.display())))?;
    }
    ws.select("cluster", name)
}

/// Cache `key` as the cluster PEM, encrypt it and upload the encrypted copy.
async fn store_key(ws: &Workspace, cluster: &str, key: &str) -> Result<()> {
    let objects = ws.objects("cluster").await?;
    let secure = ws.secure(&objects);
    let path = key_path(cluster);
    secure.write_private(&path, key)?;
    encrypt_with_retry(&secure, &path, "Enter a passphrase to protect the cluster SSH key.")?;
    secure.upload(&path).await?;
    info!(cluster, "stored cluster key");
    Ok(())
}

fn tags(pairs: &[(&str, &str)]) -> Vec<Tag> {
    pairs
        .iter()
        .map(|(k, v)| Tag::builder().key(*k).value(*v).build())
        .collect()
}

async fn tag(ec2: &aws_sdk_ec2::Client, id: &str, pairs: &[(&str, &str)]) -> Result<()> {
    ec2.create_tags()
        .resources(id)
        .set_tags(Some(tags(pairs)))
        .send()
        .await
        .with_context(|| format!("Failed to tag {}", id))?;
    Ok(())
}

async fn make(ws: &mut Workspace, aws: &AwsSession, name: &str) -> Result<()> {
    validate(name)?;
    let ec2 = aws.ec2();
    let region = aws
        .region()
        .ok_or_else(|| anyhow!("no region currently selected"))?
        .to_string();

    let vpc = create_vpc(&ec2, name).await?;
    create_subnets(&ec2, name, &vpc, &region).await?;
    let igw = create_igw(&ec2, name, &vpc).await?;
    let nat = create_nat(&ec2, name, aws.waiter_timeout()).await?;
    create_route_tables(&ec2, name, &vpc, &nat, &igw).await?;

    tolerate_existing(
        aws.ecs()
            .create_cluster()
            .cluster_name(cluster_resource(name))
            .send()
            .await,
    )
    .context("Failed to create ECS cluster")?;

    create_key_pair(ws, &ec2, name).await?;
    let sg = create_security_group(aws, name, &vpc).await?;

    tolerate_existing(
        aws.logs()
            .create_log_group()
            .log_group_name(format!("/{}", name))
            .send()
            .await,
    )
    .context("Failed to create log group")?;

    create_load_balancer(aws, name, &vpc, &sg).await?;
    info!(cluster = name, "cluster ready");

    select(ws, aws, Some(name)).await
}

async fn create_vpc(ec2: &aws_sdk_ec2::Client, name: &str) -> Result<String> {
    if let Some(vpc) = network::find_vpc(ec2, name).await? {
        debug!(cluster = name, %vpc, "VPC exists");
        return Ok(vpc);
    }
    let output = ec2
        .create_vpc()
        .cidr_block(VPC_CIDR)
        .send()
        .await
        .context("Failed to create VPC")?;
    let vpc = output
        .vpc()
        .and_then(|v| v.vpc_id())
        .ok_or_else(|| anyhow!("no VPC id returned"))?
        .to_string();
    ec2.modify_vpc_attribute()
        .vpc_id(&vpc)
        .enable_dns_support(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .context("Failed to enable VPC DNS support")?;
    ec2.modify_vpc_attribute()
        .vpc_id(&vpc)
        .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .context("Failed to enable VPC DNS hostnames")?;
    tag(
        ec2,
        &vpc,
        &[("Name", &cluster_resource(name)), ("cluster", name), ("type", "ecs")],
    )
    .await?;
    info!(cluster = name, %vpc, "created VPC");
    Ok(vpc)
}

async fn create_subnets(ec2: &aws_sdk_ec2::Client, name: &str, vpc: &str, region: &str) -> Result<()> {
    for (tier, zone, cidr) in SUBNETS {
        let subnet_name = network::subnet_name(name, *tier, zone);
        if network::subnet(ec2, name, *tier, Some(zone)).await.is_ok() {
            debug!(subnet = %subnet_name, "subnet exists");
            continue;
        }
        let output = ec2
            .create_subnet()
            .vpc_id(vpc)
            .cidr_block(*cidr)
            .availability_zone(availability_zone(region, zone))
            .send()
            .await
            .with_context(|| format!("Failed to create subnet {}", subnet_name))?;
        let id = output
            .subnet()
            .and_then(|s| s.subnet_id())
            .ok_or_else(|| anyhow!("no subnet id returned"))?;
        tag(ec2, id, &[("Name", &subnet_name), ("cluster", name)]).await?;
    }
    Ok(())
}

async fn create_igw(ec2: &aws_sdk_ec2::Client, name: &str, vpc: &str) -> Result<String> {
    if let Some(igw) = network::find_igw(ec2, name).await? {
        return Ok(igw);
    }
    let output = ec2
        .create_internet_gateway()
        .send()
        .await
        .context("Failed to create internet gateway")?;
    let igw = output
        .internet_gateway()
        .and_then(|g| g.internet_gateway_id())
        .ok_or_else(|| anyhow!("no internet gateway id returned"))?
        .to_string();
    tag(ec2, &igw, &[("Name", &cluster_resource(name)), ("cluster", name)]).await?;
    ec2.attach_internet_gateway()
        .internet_gateway_id(&igw)
        .vpc_id(vpc)
        .send()
        .await
        .context("Failed to attach internet gateway")?;
    Ok(igw)
}

/// Elastic IP plus NAT gateway in a public subnet, once available.
async fn create_nat(ec2: &aws_sdk_ec2::Client, name: &str, timeout: Duration) -> Result<String> {
    let nat = match network::find_nat(ec2, name).await? {
        Some(existing) if existing.available => {
            debug!(cluster = name, nat = %existing.id, "NAT gateway exists");
            return Ok(existing.id);
        }
        Some(existing) => existing.id,
        None => {
            let labels = [("Name", cluster_resource(name)), ("cluster", name.to_string())];
            let eip = ec2
                .allocate_address()
                .domain(DomainType::Vpc)
                .tag_specifications(tag_spec(ResourceType::ElasticIp, &labels))
                .send()
                .await
                .context("Failed to allocate elastic IP")?;
            let allocation = eip
                .allocation_id()
                .ok_or_else(|| anyhow!("no allocation id returned"))?;
            let subnet = network::subnet(ec2, name, Tier::Public, None).await?;
            let output = ec2
                .create_nat_gateway()
                .subnet_id(subnet)
                .allocation_id(allocation)
                .tag_specifications(tag_spec(ResourceType::Natgateway, &labels))
                .send()
                .await
                .context("Failed to create NAT gateway")?;
            output
                .nat_gateway()
                .and_then(|n| n.nat_gateway_id())
                .ok_or_else(|| anyhow!("no NAT gateway id returned"))?
                .to_string()
        }
    };
    info!(%nat, "waiting for NAT gateway");
    ec2.wait_until_nat_gateway_available()
        .nat_gateway_ids(&nat)
        .wait(timeout)
        .await
        .context("NAT gateway did not become available")?;
    Ok(nat)
}

fn tag_spec(resource: ResourceType, labels: &[(&str, String)]) -> TagSpecification {
    let pairs: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (*k, v.as_str())).collect();
    TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(tags(&pairs)))
        .build()
}

/// One route table per tier: private through the NAT, public through the
/// internet gateway. Subnets already associated are left alone.
async fn create_route_tables(
    ec2: &aws_sdk_ec2::Client,
    name: &str,
    vpc: &str,
    nat: &str,
    igw: &str,
) -> Result<()> {
    for tier in [Tier::Private, Tier::Public] {
        let table = match network::find_route_table(ec2, name, tier).await? {
            Some(table) => {
                debug!(table = %table.id, tier = tier.as_str(), "route table exists");
                table
            }
            None => create_route_table(ec2, name, vpc, tier, nat, igw).await?,
        };

        for subnet in network::subnets(ec2, name, tier).await? {
            if table.subnets.contains(&subnet) {
                continue;
            }
            ec2.associate_route_table()
                .route_table_id(&table.id)
                .subnet_id(subnet)
                .send()
                .await
                .context("Failed to associate route table")?;
        }
    }
    Ok(())
}

async fn create_route_table(
    ec2: &aws_sdk_ec2::Client,
    name: &str,
    vpc: &str,
    tier: Tier,
    nat: &str,
    igw: &str,
) -> Result<network::RouteTable> {
    let output = ec2
        .create_route_table()
        .vpc_id(vpc)
        .send()
        .await
        .context("Failed to create route table")?;
    let table = output
        .route_table()
        .and_then(|t| t.route_table_id())
        .ok_or_else(|| anyhow!("no route table id returned"))?
        .to_string();
    let table_name = network::route_table_name(name, tier);
    tag(ec2, &table, &[("Name", &table_name), ("cluster", name)]).await?;

    let route = ec2
        .create_route()
        .route_table_id(&table)
        .destination_cidr_block("0.0.0.0/0");
    let route = match tier {
        Tier::Private => route.nat_gateway_id(nat),
        Tier::Public => route.gateway_id(igw),
    };
    route
        .send()
        .await
        .with_context(|| format!("Failed to create {} route", tier.as_str()))?;
    Ok(network::RouteTable {
        id: table,
        subnets: Vec::new(),
    })
}

async fn create_key_pair(ws: &Workspace, ec2: &aws_sdk_ec2::Client, name: &str) -> Result<()> {
    let created = tolerate_existing(
        ec2.create_key_pair()
            .key_name(cluster_resource(name))
            .send()
            .await,
    )
    .context("Failed to create key pair")?;
    match created.as_ref().and_then(|output| output.key_material()) {
        Some(material) => store_key(ws, name, material).await,
        None => {
            println!("key-pair already exists, add PEM file manually");
            Ok(())
        }
    }
}

async fn create_security_group(aws: &AwsSession, name: &str, vpc: &str) -> Result<String> {
    let ec2 = aws.ec2();
    let created = tolerate_existing(
        ec2.create_security_group()
            .group_name(cluster_resource(name))
            .description(format!("{} security group", name))
            .vpc_id(vpc)
            .send()
            .await,
    )
    .context("Failed to create security group")?;
    let sg = match created.as_ref().and_then(|output| output.group_id()) {
        Some(id) => id.to_string(),
        None => network::security_group_id(&ec2, name).await?,
    };

    for port in INGRESS_PORTS {
        tolerate_existing(
            ec2.authorize_security_group_ingress()
                .group_id(&sg)
                .ip_protocol("tcp")
                .from_port(*port)
                .to_port(*port)
                .cidr_ip("0.0.0.0/0")
                .send()
                .await,
        )
        .with_context(|| format!("Failed to open port {}", port))?;
    }

    let identity = aws
        .sts()
        .get_caller_identity()
        .send()
        .await
        .context("Failed to get caller identity")?;
    let account = identity
        .account()
        .ok_or_else(|| anyhow!("no account id returned"))?;
    tolerate_existing(
        ec2.authorize_security_group_ingress()
            .group_id(&sg)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("-1")
                    .user_id_group_pairs(
                        UserIdGroupPair::builder()
                            .user_id(account)
                            .group_id(&sg)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await,
    )
    .context("Failed to allow intra-group traffic")?;
    Ok(sg)
}

async fn create_load_balancer(aws: &AwsSession, name: &str, vpc: &str, sg: &str) -> Result<()> {
    let elb = aws.elb();
    let subnets = network::subnets(&aws.ec2(), name, Tier::Public).await?;
    if subnets.len() < ZONES.len() {
        bail!("no public subnets");
    }

    let mut request = elb
        .create_load_balancer()
        .name(format!("{}-0", cluster_resource(name)))
        .set_subnets(Some(subnets))
        .security_groups(sg)
        .scheme(LoadBalancerSchemeEnum::InternetFacing)
        .ip_address_type(IpAddressType::Ipv4);
    for (key, value) in [("Name", name), ("cluster", name), ("index", "0")] {
        request = request.tags(
            aws_sdk_elasticloadbalancingv2::types::Tag::builder()
                .key(key)
                .value(value)
                .build()
                .context("Invalid load balancer tag")?,
        );
    }
    let output = request
        .send()
        .await
        .context("Failed to create load balancer")?;
    let lb_arn = output
        .load_balancers()
        .first()
        .and_then(|lb| lb.load_balancer_arn())
        .ok_or_else(|| anyhow!("no load balancer returned"))?;

    let group = elb
        .create_target_group()
        .name(app_resource(name, "default"))
        .protocol(ProtocolEnum::Http)
        .port(80)
        .vpc_id(vpc)
        .matcher(Matcher::builder().http_code("200,301").build())
        .send()
        .await
        .context("Failed to create default target group")?;
    let group_arn = group
        .target_groups()
        .first()
        .and_then(|tg| tg.target_group_arn())
        .ok_or_else(|| anyhow!("no target group returned"))?;

    elb.create_listener()
        .load_balancer_arn(lb_arn)
        .protocol(ProtocolEnum::Http)
        .port(80)
        .default_actions(
            Action::builder()
                .r#type(ActionTypeEnum::Forward)
                .target_group_arn(group_arn)
                .build()
                .context("Invalid forward action")?,
        )
        .send()
        .await
        .context("Failed to create listener")?;
    Ok(())
}

async fn summary(aws: &AwsSession, cluster: &str) -> Result<()> {
    let ecs = aws.ecs();
    let all = service::names(&ecs, cluster).await?;
    for app in app::list(&aws.elb(), cluster).await? {
        println!("{}", app);
        let names: Vec<String> = service::app_services(&all, &app)
            .into_iter()
            .map(|task| service::service_name(&app, task))
            .collect();
        let services = service::describe(&ecs, cluster, &names).await?;
        let counts: Vec<(String, i32, i32)> = services
            .iter()
            .filter_map(|svc| {
                let deployment = svc.deployments().first()?;
                let task = svc.service_name()?.strip_prefix(&format!("{}-", app))?;
                Some((
                    task.to_string(),
                    deployment.desired_count(),
                    deployment.running_count(),
                ))
            })
            .collect();
        for line in summary_lines(&counts) {
            println!("{}", line);
        }
    }
    Ok(())
}

/// `  <service>  <desired>  <running>` with service names padded to align.
fn summary_lines(counts: &[(String, i32, i32)]) -> Vec<String> {
    let width = counts.iter().map(|(name, _, _)| name.len()).max().unwrap_or(0);
    let mut sorted: Vec<&(String, i32, i32)> = counts.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .into_iter()
        .map(|(name, desired, running)| format!("  {:width$}  {}  {}", name, desired, running))
        .collect()
}
