//! ecsfleet - elastic EC2 capacity for an ECS build cluster
//!
//! ## Usage
//!
//! ```bash
//! # Run the heartbeat until Ctrl+C
//! ecsfleet --settings cluster.json run --interval 60
//!
//! # Make two Linux instances available now
//! ecsfleet --settings cluster.json ensure --platform LINUX --count 2
//!
//! # Place one spot request for Windows capacity
//! ecsfleet --settings cluster.json spot --platform WINDOWS
//!
//! # Print the registered instances of every platform
//! ecsfleet --settings cluster.json status
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use ecsfleet_core::{Platform, RegisteredInstance};
use ecsfleet_orchestrator::{
    ClusterSettings, Ec2Compute, EcsCluster, ElasticProfile, Fleet, ResolvedInstanceConfig,
    SystemClock, load_sdk_config,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// ecsfleet: elastic EC2 capacity for an ECS cluster
#[derive(Parser)]
#[command(name = "ecsfleet")]
#[command(about = "Elastic EC2 capacity for an ECS build cluster", long_about = None)]
struct Cli {
    /// Cluster settings document (JSON)
    #[arg(long, global = true, env = "ECSFLEET_SETTINGS", default_value = "ecsfleet.json")]
    settings: PathBuf,

    /// AWS region (default: from the environment)
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    /// Server id stamped on created instances (default: settings file, then random)
    #[arg(long, global = true)]
    server_id: Option<String>,

    /// Also write daily rotated logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the maintenance heartbeat until interrupted
    Run {
        /// Heartbeat period (seconds)
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },

    /// Make on-demand instances available for a platform
    Ensure {
        /// LINUX or WINDOWS
        #[arg(long, default_value = "LINUX")]
        platform: Platform,

        /// Number of instances wanted
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Request one spot instance for a platform
    Spot {
        /// LINUX or WINDOWS
        #[arg(long, default_value = "LINUX")]
        platform: Platform,

        /// Maximum hourly price (default: on-demand price)
        #[arg(long)]
        price: Option<String>,
    },

    /// Print registered instances per platform as JSON
    Status,
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "ecsfleet=info,info".into());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ecsfleet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            None
        }
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<ClusterSettings> {
    let mut settings = ClusterSettings::from_file(&cli.settings)
        .with_context(|| format!("Failed to load settings from {}", cli.settings.display()))?;

    if let Some(server_id) = &cli.server_id {
        settings.server_id = server_id.clone();
    }
    if settings.server_id.trim().is_empty() {
        settings.server_id = uuid::Uuid::new_v4().to_string();
        warn!("No server id configured, using {}", settings.server_id);
    }

    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());

    let settings = load_settings(&cli)?;
    info!(
        cluster = %settings.cluster_name,
        server_id = %settings.server_id,
        "Loaded cluster settings"
    );

    let sdk_config = load_sdk_config(cli.region.clone()).await;
    let fleet = Fleet::new(
        Arc::new(Ec2Compute::new(&sdk_config)),
        Arc::new(EcsCluster::new(&sdk_config)),
        Arc::new(SystemClock),
    );

    let cluster = fleet.inventory.ensure_cluster_exists(&settings).await?;
    info!(
        "Cluster {} is {} with {} registered instances",
        cluster.name, cluster.status, cluster.registered_instances
    );

    match cli.command {
        Commands::Run { interval } => {
            fleet
                .heartbeat
                .run(&settings, Duration::from_secs(interval), async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                        std::future::pending::<()>().await;
                    }
                    info!("Received Ctrl+C");
                })
                .await;
        }

        Commands::Ensure { platform, count } => {
            let config = ResolvedInstanceConfig::resolve(&settings, &ElasticProfile::empty(platform))?;
            let instances = fleet.capacity.ensure_instances(&settings, &config, count).await?;
            info!(
                "{} {} instance(s) available: {:?}",
                instances.len(),
                platform,
                instances.iter().map(|i| i.instance.id.as_str()).collect::<Vec<_>>()
            );
        }

        Commands::Spot { platform, price } => {
            let profile = ElasticProfile::empty(platform).spot(price);
            let config = ResolvedInstanceConfig::resolve(&settings, &profile)?;
            fleet.spot.request_spot_capacity(&settings, &config).await?;
            info!("Spot capacity requested for {}", platform);
        }

        Commands::Status => {
            let mut status: BTreeMap<String, Vec<RegisteredInstance>> = Platform::ALL
                .iter()
                .map(|p| (p.to_string(), vec![]))
                .collect();
            for registered in fleet.inventory.registered_instances(&settings).await? {
                status
                    .entry(registered.instance.platform.to_string())
                    .or_default()
                    .push(registered);
            }
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
