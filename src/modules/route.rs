//! Route 53 CNAMEs pointing at the app's load balancer

use anyhow::{anyhow, bail, Context as _, Result};
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, HostedZone, ResourceRecord, ResourceRecordSet, RrType,
};
use aws_sdk_route53::Client as Route53Client;
use clap::Subcommand;
use fuku_core::Module;
use tracing::info;

use crate::modules::app;
use crate::workspace::Workspace;

const TTL: i64 = 60;

pub struct RouteModule;

impl Module for RouteModule {
    fn name(&self) -> &'static str {
        "route"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["app"]
    }
}

#[derive(Debug, Subcommand)]
pub enum RouteCommand {
    /// Point NAME.ZONE at the app's load balancer
    Mk { name: String, zone: String },
    /// Delete the NAME.ZONE record
    Rm { name: String, zone: String },
}

/// Fully qualified record name, with the trailing dot Route 53 reports.
pub fn record_name(name: &str, zone: &str) -> String {
    format!("{}.{}.", name, zone.trim_end_matches('.'))
}

pub async fn run(ws: &mut Workspace, cmd: RouteCommand) -> Result<()> {
    let ctx = ws.context("route")?;
    let cluster = ctx.require("cluster")?;
    let app_name = ctx.require("app")?;
    let aws = ws.aws("route").await?;
    let route53 = aws.route53();

    match cmd {
        RouteCommand::Mk { name, zone } => {
            let hosted = hosted_zone(&route53, &zone).await?;
            let balancer = app::app_load_balancer(&aws.elb(), cluster, app_name).await?;
            let dns = balancer
                .dns_name()
                .ok_or_else(|| anyhow!("load balancer has no DNS name"))?;
            let record = cname(&record_name(&name, &zone), vec![dns.to_string()])?;
            change(&route53, &hosted, ChangeAction::Upsert, record).await?;
            info!(record = %record_name(&name, &zone), target = dns, "upserted CNAME");
        }
        RouteCommand::Rm { name, zone } => {
            let hosted = hosted_zone(&route53, &zone).await?;
            let fqdn = record_name(&name, &zone);
            let existing = find_record(&route53, &hosted, &fqdn).await?;
            let values = existing
                .resource_records()
                .iter()
                .map(|r| r.value().to_string())
                .collect();
            change(&route53, &hosted, ChangeAction::Delete, cname(&fqdn, values)?).await?;
        }
    }
    Ok(())
}

fn cname(name: &str, values: Vec<String>) -> Result<ResourceRecordSet> {
    let mut builder = ResourceRecordSet::builder()
        .name(name)
        .r#type(RrType::Cname)
        .ttl(TTL);
    for value in values {
        builder = builder.resource_records(
            ResourceRecord::builder()
                .value(value)
                .build()
                .context("Invalid resource record")?,
        );
    }
    builder.build().context("Invalid record set")
}

async fn hosted_zone(route53: &Route53Client, zone: &str) -> Result<HostedZone> {
    let wanted = format!("{}.", zone.trim_end_matches('.'));
    let mut marker = None;
    loop {
        let page = route53
            .list_hosted_zones()
            .set_marker(marker)
            .send()
            .await
            .context("Failed to list hosted zones")?;
        if let Some(found) = page.hosted_zones().iter().find(|z| z.name() == wanted) {
            return Ok(found.clone());
        }
        marker = page.next_marker().map(str::to_string);
        if marker.is_none() {
            bail!("no hosted zone \"{}\"", zone);
        }
    }
}

async fn find_record(
    route53: &Route53Client,
    zone: &HostedZone,
    fqdn: &str,
) -> Result<ResourceRecordSet> {
    let output = route53
        .list_resource_record_sets()
        .hosted_zone_id(zone.id())
        .start_record_name(fqdn)
        .start_record_type(RrType::Cname)
        .max_items(1)
        .send()
        .await
        .context("Failed to list record sets")?;
    output
        .resource_record_sets()
        .iter()
        .find(|r| r.name() == fqdn && r.r#type() == &RrType::Cname)
        .cloned()
        .ok_or_else(|| anyhow!("Recordset {} not found.", fqdn))
}

async fn change(
    route53: &Route53Client,
    zone: &HostedZone,
    action: ChangeAction,
    record: ResourceRecordSet,
) -> Result<()> {
    let batch = ChangeBatch::builder()
        .changes(
            Change::builder()
                .action(action)
                .resource_record_set(record)
                .build()
                .context("Invalid change")?,
        )
        .build()
        .context("Invalid change batch")?;
    route53
        .change_resource_record_sets()
        .hosted_zone_id(zone.id())
        .change_batch(batch)
        .send()
        .await
        .context("Failed to change record sets")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_name() {
        assert_eq!(record_name("api", "example.com"), "api.example.com.");
        assert_eq!(record_name("api", "example.com."), "api.example.com.");
    }

    #[test]
    fn test_cname_record() {
        let record = cname("api.example.com.", vec!["lb.aws.com".into()]).unwrap();
        assert_eq!(record.name(), "api.example.com.");
        assert_eq!(record.ttl(), Some(60));
        assert_eq!(record.resource_records()[0].value(), "lb.aws.com");
    }
}
