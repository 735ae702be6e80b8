use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::modules::{
    app::AppCommand, cluster::ClusterCommand, configuration::ConfigurationCommand,
    image::ImageCommand, metrics::MetricsCommand, node::NodeCommand, pg::PgCommand,
    profile::ProfileCommand, redis::RedisCommand, region::RegionCommand, route::RouteCommand,
    service::ServiceCommand, session::SessionCommand, ssl::SslCommand, task::TaskCommand,
};

/// Provision and operate AWS-hosted container stacks
#[derive(Debug, Parser)]
#[command(name = "fuku")]
#[command(version)]
#[command(about = "Provision and operate AWS-hosted container stacks", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Act on APP instead of the selected app
    #[arg(long, value_name = "APP", global = true)]
    pub app: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// AWS credential profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// AWS regions
    Region {
        #[command(subcommand)]
        command: RegionCommand,
    },
    /// Shared settings kept in S3
    #[command(alias = "config")]
    Configuration {
        #[command(subcommand)]
        command: ConfigurationCommand,
    },
    /// Saved selections
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// VPC-backed ECS clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
    },
    /// Cluster instances
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
    /// CloudWatch metrics
    Metrics {
        #[command(subcommand)]
        command: MetricsCommand,
    },
    /// Applications within a cluster
    App {
        #[command(subcommand)]
        command: AppCommand,
    },
    /// ECR images
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },
    /// ECS task definitions
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// ECS services
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    /// RDS PostgreSQL databases
    Pg {
        #[command(subcommand)]
        command: PgCommand,
    },
    /// Redis task
    Redis {
        #[command(subcommand)]
        command: RedisCommand,
    },
    /// Route 53 records
    Route {
        #[command(subcommand)]
        command: RouteCommand,
    },
    /// TLS termination
    Ssl {
        #[command(subcommand)]
        command: SslCommand,
    },
}

impl Commands {
    /// Name of the module the command belongs to
    pub fn module(&self) -> &'static str {
        match self {
            Commands::Profile { .. } => "profile",
            Commands::Region { .. } => "region",
            Commands::Configuration { .. } => "configuration",
            Commands::Session { .. } => "session",
            Commands::Cluster { .. } => "cluster",
            Commands::Node { .. } => "node",
            Commands::Metrics { .. } => "metrics",
            Commands::App { .. } => "app",
            Commands::Image { .. } => "image",
            Commands::Task { .. } => "task",
            Commands::Service { .. } => "service",
            Commands::Pg { .. } => "pg",
            Commands::Redis { .. } => "redis",
            Commands::Route { .. } => "route",
            Commands::Ssl { .. } => "ssl",
        }
    }
}
