//! WolfMasterCtl - Command line tool for WolfMaster nodes
//!
//! Usage:
//!   wolfmasterctl roles                     - Show every device and its roles
//!   wolfmasterctl role <device>             - Show one device
//!   wolfmasterctl set-role <device> <node> <role>
//!   wolfmasterctl balance                   - Run a balance pass now

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// WolfMaster Control Tool
#[derive(Parser)]
#[command(name = "wolfmasterctl")]
#[command(about = "Inspect and steer device mastership", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfmaster/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show local node status
    Status,
    /// List cluster nodes
    Nodes,
    /// Show every device with its master, standbys and term
    Roles,
    /// Show one device
    Role { device: String },
    /// Assign a role (MASTER, STANDBY, NONE) to a node for a device
    SetRole {
        device: String,
        node: String,
        role: String,
    },
    /// Make the local node give up mastership of a device
    Relinquish { device: String },
    /// Ask for a role on a device for the local node
    Request { device: String },
    /// Delete a device record
    Purge { device: String },
    /// List devices mastered by a node
    DevicesOf { node: String },
    /// Run a balance pass now
    Balance,
    /// Mark a node ACTIVE or INACTIVE
    NodeStatus { node: String, status: String },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct ClusterSummary {
    total_nodes: usize,
    active_nodes: usize,
    inactive_nodes: usize,
}

#[derive(Debug, Deserialize)]
struct Stats {
    #[serde(default)]
    master_changes: u64,
    #[serde(default)]
    elections_won: u64,
    #[serde(default)]
    races_lost: u64,
    #[serde(default)]
    balance_passes: u64,
    #[serde(default)]
    balance_mutations: u64,
    #[serde(default)]
    events_published: u64,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node_id: String,
    uptime_seconds: u64,
    devices: usize,
    local_masters: usize,
    cluster: ClusterSummary,
    stats: Stats,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    id: String,
    address: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct DeviceRole {
    device: String,
    master: Option<String>,
    #[serde(default)]
    standbys: Vec<String>,
    term: u64,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    role: String,
    term: u64,
    ack: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RoleInfo {
    #[serde(flatten)]
    role: DeviceRole,
    local_role: String,
    sync: Option<SyncInfo>,
}

#[derive(Debug, Deserialize)]
struct RelinquishResponse {
    master: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequestRoleResponse {
    role: String,
}

#[derive(Debug, Deserialize)]
struct DevicesOfResponse {
    devices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SkippedRegion {
    region: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct BalanceFailure {
    region: Option<String>,
    device: String,
    error: String,
}

#[derive(Debug, Deserialize)]
struct BalanceReport {
    mutations: usize,
    groups: usize,
    skipped: Vec<SkippedRegion>,
    failures: Vec<BalanceFailure>,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    message: Option<String>,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8180".to_string()
}

/// Endpoint from the config file, with wildcard binds mapped to localhost
fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

// ============ Client ============

struct Api {
    endpoint: String,
    client: reqwest::Client,
}

impl Api {
    fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { endpoint, client })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach {}", url))?;
        Self::decode(response).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach {}", url))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            match response.json::<ErrorResponse>().await {
                Ok(err) => bail!("{} ({}): {}", status, err.code, err.error),
                Err(_) => bail!("API error: {}", status),
            }
        }
        response.json().await.context("unexpected response body")
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));

    if let Err(e) = run(cli.command, endpoint).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, endpoint: String) -> Result<()> {
    let api = Api::new(endpoint)?;

    match command {
        Commands::Status => show_status(&api).await,
        Commands::Nodes => list_nodes(&api).await,
        Commands::Roles => list_roles(&api).await,
        Commands::Role { device } => show_role(&api, &device).await,
        Commands::SetRole { device, node, role } => {
            let record: DeviceRole = api
                .send(
                    reqwest::Method::POST,
                    &format!("/roles/{}", device),
                    Some(serde_json::json!({ "node": node, "role": role })),
                )
                .await
                .with_context(|| format!("failed to set {} as {} of {}", node, role, device))?;
            print_role_table(&[record]);
            Ok(())
        }
        Commands::Relinquish { device } => {
            let result: RelinquishResponse = api
                .send(
                    reqwest::Method::POST,
                    &format!("/roles/{}/relinquish", device),
                    None,
                )
                .await?;
            println!(
                "Master of {} is now {}",
                device,
                result.master.as_deref().unwrap_or("NONE")
            );
            Ok(())
        }
        Commands::Request { device } => {
            let result: RequestRoleResponse = api
                .send(reqwest::Method::POST, &format!("/roles/{}/request", device), None)
                .await?;
            println!("Local role for {}: {}", device, result.role);
            Ok(())
        }
        Commands::Purge { device } => {
            let _: DeviceRole = api
                .send(reqwest::Method::DELETE, &format!("/roles/{}", device), None)
                .await?;
            println!("Purged {}", device);
            Ok(())
        }
        Commands::DevicesOf { node } => {
            let result: DevicesOfResponse = api.get(&format!("/nodes/{}/devices", node)).await?;
            println!("{} masters {} device(s)", node, result.devices.len());
            for device in result.devices {
                println!("  {}", device);
            }
            Ok(())
        }
        Commands::Balance => run_balance(&api).await,
        Commands::NodeStatus { node, status } => {
            let result: AckResponse = api
                .send(
                    reqwest::Method::POST,
                    &format!("/cluster/nodes/{}/status", node),
                    Some(serde_json::json!({ "status": status.to_ascii_uppercase() })),
                )
                .await?;
            println!("{}", result.message.unwrap_or_else(|| "OK".to_string()));
            Ok(())
        }
    }
}

// ============ Commands ============

async fn show_status(api: &Api) -> Result<()> {
    let status: StatusResponse = api.get("/status").await?;

    println!();
    println!("WolfMaster Node Status (wolfmasterctl v{})", env!("CARGO_PKG_VERSION"));
    println!("==========================================");
    println!();
    println!("Node ID:          {}", status.node_id);
    println!("Uptime:           {} s", status.uptime_seconds);
    println!("Devices:          {}", status.devices);
    println!("Local Masters:    {}", status.local_masters);
    println!(
        "Cluster:          {} nodes ({} active, {} inactive)",
        status.cluster.total_nodes, status.cluster.active_nodes, status.cluster.inactive_nodes
    );
    println!();
    println!("Master Changes:   {}", status.stats.master_changes);
    println!(
        "Elections:        {} won, {} lost races",
        status.stats.elections_won, status.stats.races_lost
    );
    println!(
        "Balancing:        {} passes, {} moves",
        status.stats.balance_passes, status.stats.balance_mutations
    );
    println!("Events Published: {}", status.stats.events_published);
    println!();

    Ok(())
}

async fn list_nodes(api: &Api) -> Result<()> {
    let nodes: Vec<NodeInfo> = api.get("/cluster/nodes").await?;

    println!();
    println!("{:<20} {:<25} {:<10}", "NODE ID", "ADDRESS", "STATUS");
    println!("{}", "-".repeat(55));
    for node in &nodes {
        // Pad status to fixed width BEFORE adding color codes
        let status_padded = format!("{:<10}", node.status);
        let status_colored = match node.status.as_str() {
            "ACTIVE" => format!("\x1b[32m{}\x1b[0m", status_padded),
            "INACTIVE" => format!("\x1b[31m{}\x1b[0m", status_padded),
            _ => status_padded,
        };
        println!("{:<20} {:<25} {}", node.id, node.address, status_colored);
    }
    println!();

    Ok(())
}

async fn list_roles(api: &Api) -> Result<()> {
    let roles: Vec<DeviceRole> = api.get("/roles").await?;
    if roles.is_empty() {
        println!("No devices");
        return Ok(());
    }
    print_role_table(&roles);
    Ok(())
}

async fn show_role(api: &Api, device: &str) -> Result<()> {
    let info: RoleInfo = api
        .get(&format!("/roles/{}", device))
        .await
        .with_context(|| format!("failed to read roles of {}", device))?;

    print_role_table(std::slice::from_ref(&info.role));
    println!("Local role:       {}", info.local_role);
    match info.sync {
        Some(sync) => println!(
            "Last pushed:      {} (term {}), ack {}",
            sync.role, sync.term, sync.ack
        ),
        None => println!("Last pushed:      nothing"),
    }
    println!();
    Ok(())
}

async fn run_balance(api: &Api) -> Result<()> {
    let report: BalanceReport = api
        .send(reqwest::Method::POST, "/balance", None)
        .await
        .context("balance pass failed")?;

    println!(
        "Balanced {} group(s), moved {} device(s)",
        report.groups, report.mutations
    );
    for skipped in &report.skipped {
        println!("  skipped region {}: {}", skipped.region, skipped.reason);
    }
    for failure in &report.failures {
        println!(
            "  failed to move {} ({}): {}",
            failure.device,
            failure.region.as_deref().unwrap_or("no region"),
            failure.error
        );
    }
    Ok(())
}

fn print_role_table(roles: &[DeviceRole]) {
    println!();
    println!("{:<24} {:<16} {:<6} STANDBYS", "DEVICE", "MASTER", "TERM");
    println!("{}", "-".repeat(70));
    for role in roles {
        let master = match &role.master {
            Some(master) => format!("\x1b[1;34m{:<16}\x1b[0m", master),
            None => format!("{:<16}", "NONE"),
        };
        println!(
            "{:<24} {} {:<6} {}",
            role.device,
            master,
            role.term,
            role.standbys.join(", ")
        );
    }
    println!();
}
