//! hv-agent CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hv_agent::mgmt::SimulatedPool;
use hv_agent::stats::RrdUpdates;
use hv_agent::{Agent, AgentConfig, Answer, Command};
use serde_json::json;

/// Placeholder in a commands file replaced by the simulated local SR's UUID.
const LOCAL_SR_PLACEHOLDER: &str = "$LOCAL_SR";

#[derive(Parser)]
#[command(name = "hv-agent")]
#[command(about = "Hypervisor host agent for a cloud control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a config file
    CheckConfig {
        /// Path to the JSON config
        path: PathBuf,
    },
    /// Run a batch of commands against a simulated pool
    Simulate {
        /// JSON array of commands
        #[arg(long)]
        commands: PathBuf,
        /// Agent config (defaults to host-1 at 10.0.0.1)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse an RRD export and print host and VM statistics
    ParseRrd {
        /// RRD updates XML
        path: PathBuf,
        #[arg(long)]
        host_uuid: String,
        #[arg(long = "vm-uuid")]
        vm_uuids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("hv_agent=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => cmd_check_config(&path)?,
        Commands::Simulate { commands, config } => cmd_simulate(&commands, config.as_deref()).await?,
        Commands::ParseRrd {
            path,
            host_uuid,
            vm_uuids,
        } => cmd_parse_rrd(&path, &host_uuid, &vm_uuids)?,
    }

    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::from_file(path)?;
    println!("Config OK");
    println!("  Host:      {} ({})", config.host_uuid, config.host_address);
    println!("  Pool:      {}", config.pool_uuid.as_deref().unwrap_or("-"));
    println!("  User:      {}", config.username);
    println!("  Poll:      {} ms", config.tasks.poll_interval_ms);
    println!("  Teardown:  {} pass(es)", config.storage.teardown_passes);
    Ok(())
}

/// A two-host pool with a guest network, a template and local storage.
fn seed_pool(config: &AgentConfig) -> (SimulatedPool, String) {
    let sim = SimulatedPool::new();
    sim.add_user(&config.username, &config.password);
    sim.add_host(&config.host_uuid, "node1", &config.host_address);
    sim.add_host("host-2", "node2", "10.0.0.2");
    sim.add_network("guest0", "eth1");
    sim.add_template("Debian Template");
    let local_sr = sim.add_local_sr("Local storage", "/dev/sdb");
    (sim, local_sr)
}

async fn cmd_simulate(commands: &Path, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::builder()
            .host("host-1", "10.0.0.1")
            .credentials("root", "secret")
            .poll_interval_ms(10)
            .build_validated()?,
    };
    let (sim, local_sr) = seed_pool(&config);
    tracing::info!(sr = %local_sr, "Simulated pool ready");

    let text = std::fs::read_to_string(commands)?.replace(LOCAL_SR_PLACEHOLDER, &local_sr);
    let batch: Vec<Command> = serde_json::from_str(&text)?;

    let agent = Arc::new(Agent::new(config, Arc::new(sim.clone()), Arc::new(sim))?);
    let host = agent.initialize()?;
    tracing::info!(host = %host.uuid, version = %host.product_version, "Connected");

    let handles: Vec<_> = batch
        .into_iter()
        .map(|command| {
            let agent = agent.clone();
            tokio::task::spawn_blocking(move || agent.execute(command))
        })
        .collect();

    let mut answers: Vec<Answer> = Vec::with_capacity(handles.len());
    for handle in handles {
        answers.push(handle.await?);
    }
    println!("{}", serde_json::to_string_pretty(&answers)?);
    Ok(())
}

fn cmd_parse_rrd(path: &Path, host_uuid: &str, vm_uuids: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let xml = std::fs::read_to_string(path)?;
    let updates = RrdUpdates::parse(&xml)?;
    let host = updates.host_stats(host_uuid)?;
    let mut vms = serde_json::Map::new();
    for uuid in vm_uuids {
        vms.insert(uuid.clone(), serde_json::to_value(updates.vm_stats(uuid)?)?);
    }
    let report = json!({
        "window": { "start": updates.start, "end": updates.end, "step": updates.step },
        "host": host,
        "vms": vms,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
