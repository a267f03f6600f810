//! WolfMaster - Device Mastership Coordinator
//!
//! Node daemon: keeps one master and an ordered list of standbys for every
//! device across a cluster of controller nodes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmaster::api::HttpServer;
use wolfmaster::cluster::{MembershipView, NodeStatus, RegionIndex};
use wolfmaster::config::{StoreBackend, WolfMasterConfig};
use wolfmaster::coordinator::MastershipCoordinator;
use wolfmaster::error::Result;
use wolfmaster::gateway::ChannelRoleListener;
use wolfmaster::role::{NodeId, RegionId};
use wolfmaster::store::{MemoryRoleStore, RoleStore, SqliteRoleStore};

/// WolfMaster - Device Mastership Coordinator
#[derive(Parser)]
#[command(name = "wolfmaster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmaster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfMaster node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmaster.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = match cli.command {
        Commands::Start => WolfMasterConfig::from_file(&cli.config)
            .ok()
            .map(|config| config.logging),
        _ => None,
    };
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let json = logging.map(|l| l.format == "json").unwrap_or(false);

    // Initialize logging
    init_logging(&level, json);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the WolfMaster node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfMaster node...");

    // Load configuration
    let config = match WolfMasterConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    // Role store
    let store: Arc<dyn RoleStore> = match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory role store; roles are lost on restart");
            Arc::new(MemoryRoleStore::new())
        }
        StoreBackend::Sqlite => {
            if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
                tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
                return Err(e.into());
            }
            Arc::new(SqliteRoleStore::new(config.data_dir().clone())?)
        }
    };

    // Membership
    let membership = Arc::new(MembershipView::new(
        NodeId::new(config.node.id.as_str()),
        config.advertise_address().to_string(),
        config.heartbeat_timeout(),
    ));
    for member in &config.cluster.members {
        membership
            .add_node(
                NodeId::new(member.id.as_str()),
                member.address.clone(),
                NodeStatus::Active,
            )
            .await;
    }
    tracing::info!(
        "Cluster view initialized with {} node(s)",
        config.cluster.members.len() + 1
    );

    // Regions
    let regions = Arc::new(RegionIndex::new());
    for region in &config.regions {
        regions.upsert_region(region.to_region()).await?;
        for device in region.device_ids() {
            regions
                .bind_device(device, RegionId::new(region.id.as_str()))
                .await?;
        }
        tracing::info!(
            "Region {} loaded with {} device(s)",
            region.id,
            region.devices.len()
        );
    }

    // Coordinator
    let coordinator = Arc::new(MastershipCoordinator::new(
        store,
        Arc::clone(&membership),
        regions,
        config.coordinator_config(),
    ));

    // Device layer
    let (listener, mut pushes) = ChannelRoleListener::new();
    coordinator.gateway().register(Arc::new(listener)).await;
    tokio::spawn(async move {
        while let Some(push) = pushes.recv().await {
            tracing::info!(
                "Device {} must now treat this node as {} (term {})",
                push.device,
                push.role,
                push.term
            );
        }
    });

    coordinator.start().await?;

    // Heartbeat timeouts
    let timeout_membership = Arc::clone(&membership);
    let check_interval = config.check_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            ticker.tick().await;
            for node in timeout_membership.check_timeouts().await {
                tracing::warn!("Node {} missed its heartbeat deadline", node);
            }
        }
    });

    let http_server = HttpServer::new(config.api.clone(), Arc::clone(&coordinator));
    let api_enabled = config.api.enabled;
    let http = async move {
        if api_enabled {
            http_server.start().await
        } else {
            tracing::info!("HTTP API disabled");
            std::future::pending().await
        }
    };

    tokio::select! {
        result = http => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    coordinator.stop().await;
    tracing::info!("WolfMaster node stopped");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfMaster Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "/var/lib/wolfmaster/{node_id}"
# advertise_address = "my-public-ip:8180"

[cluster]
members = []
# members = [
#     {{ id = "node-2", address = "node-2.example.com:8180" }},
#     {{ id = "node-3", address = "node-3.example.com:8180" }},
# ]
heartbeat_timeout_ms = 3000
check_interval_ms = 1000

[store]
# memory or sqlite
backend = "sqlite"

[balancer]
enabled = true
interval_secs = 30
jitter_ms = 500
on_membership_change = true
on_topology_change = true

[election]
respect_region_policy = true
integrity_check_secs = 30

# [[regions]]
# id = "west"
# tiers = [["node-1"], ["node-2", "node-3"]]
# devices = ["of:0000000000000001"]

[api]
enabled = true
bind_address = "0.0.0.0:8180"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your cluster members and regions.");
    println!("Then start with: wolfmaster --config {} start", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfMasterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Members: {}", config.cluster.members.len());
            println!("  Regions: {}", config.regions.len());
            println!("  Store: {:?}", config.store.backend);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfMasterConfig::from_file(&config_path)?;

    println!("WolfMaster Node Information");
    println!("===========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Store Backend:    {:?}", config.store.backend);
    println!();
    println!("Cluster Configuration:");
    for member in &config.cluster.members {
        println!("  {:<16}{}", member.id, member.address);
    }
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_timeout_ms);
    println!();
    println!("Balancer:");
    println!("  Enabled:        {}", config.balancer.enabled);
    println!("  Interval:       {} s", config.balancer.interval_secs);
    println!("  Jitter:         {} ms", config.balancer.jitter_ms);
    println!();
    println!("Regions:");
    for region in &config.regions {
        let tiers: Vec<String> = region.tiers.iter().map(|t| t.join(",")).collect();
        println!(
            "  {:<16}tiers [{}], {} device(s)",
            region.id,
            tiers.join(" > "),
            region.devices.len()
        );
    }

    Ok(())
}
