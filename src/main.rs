use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use edge_jobs::config::{AgentConfig, HostConfig, OrchestratorConfig};
use edge_jobs::node::{Node, NodeConfig};
use edge_jobs::reconcile::published_nodes;
use edge_jobs::reconcile::service::PublisherJobDefaults;
use edge_jobs::scheduler::job::{Demand, RedundancyConfig};
use edge_jobs::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "edge-jobs")]
#[command(version)]
#[command(about = "Job orchestration for fleets of edge data-collection agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run orchestrator and agents in one process
    Standalone(StandaloneArgs),

    /// Check a published nodes file and print what it would publish
    Validate {
        /// Path to the published nodes file
        path: PathBuf,
    },
}

// =============================================================================
// Standalone Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StandaloneArgs {
    /// Published nodes file to seed jobs from
    #[arg(long, short = 'f')]
    published_nodes: Option<PathBuf>,

    /// How often to check the published nodes file for changes, in milliseconds
    #[arg(long, default_value = "5000")]
    refresh_ms: u64,

    /// Number of in-process agents
    #[arg(long, default_value = "2")]
    agents: usize,

    /// Jobs each agent may run concurrently
    #[arg(long, default_value = "4")]
    max_workers: usize,

    /// Agent capabilities (repeatable, format: "key=value")
    #[arg(long = "capability", value_parser = parse_key_value)]
    capabilities: Vec<(String, String)>,

    /// Job demands every seeded job carries (repeatable, format: "key=value")
    #[arg(long = "demand", value_parser = parse_key_value)]
    demands: Vec<(String, String)>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "30000")]
    heartbeat_ms: u64,

    /// Assignment poll interval in milliseconds
    #[arg(long, default_value = "10000")]
    job_check_ms: u64,

    /// Workers that should run each job actively
    #[arg(long, default_value = "1")]
    desired_active: u32,

    /// Standby workers per job
    #[arg(long, default_value = "0")]
    desired_passive: u32,

    /// Crash-loop base delay in milliseconds
    #[arg(long, default_value = "5000")]
    retry_base_ms: u64,

    /// Consecutive failures before a job host gives up
    #[arg(long, default_value = "10")]
    max_retries: u32,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

async fn run_standalone(args: StandaloneArgs) -> Result<(), Box<dyn std::error::Error>> {
    let agents = (0..args.agents.max(1))
        .map(|i| {
            let mut agent = AgentConfig::new(format!("agent-{}", i + 1), "in-process")
                .with_intervals(args.heartbeat_ms, args.job_check_ms)
                .with_max_workers(args.max_workers);
            for (key, value) in &args.capabilities {
                agent = agent.with_capability(key.clone(), value.clone());
            }
            agent
        })
        .collect();

    let config = NodeConfig {
        orchestrator: OrchestratorConfig {
            default_heartbeat_interval_ms: args.heartbeat_ms,
            ..Default::default()
        },
        host: HostConfig {
            base_delay_ms: args.retry_base_ms,
            max_retries: args.max_retries,
            ..Default::default()
        },
        agents,
        job_defaults: PublisherJobDefaults {
            demands: args
                .demands
                .iter()
                .map(|(k, v)| Demand::equals(k.clone(), v.clone()))
                .collect(),
            redundancy: RedundancyConfig {
                desired_active: args.desired_active,
                desired_passive: args.desired_passive,
            },
            ..Default::default()
        },
    };

    let node = Node::new(config);
    let shutdown = install_shutdown_handler()?;
    if let Some(path) = &args.published_nodes {
        node.follow_published_nodes(
            path.clone(),
            Duration::from_millis(args.refresh_ms.max(1)),
            shutdown.clone(),
        )
        .await?;
    }

    node.run(shutdown).await?;
    Ok(())
}

fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let entries = published_nodes::load(path)?;
    for entry in &entries {
        println!("{}", entry.endpoint_id());
        for (group, item) in entry.items() {
            println!(
                "  {:<40} publishing={:?} sampling={:?}",
                item.node_id, group.publishing_interval_ms, item.sampling_interval_ms
            );
        }
    }
    let nodes: usize = entries.iter().map(|e| e.opc_nodes.len()).sum();
    println!("{} endpoints, {} nodes", entries.len(), nodes);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Standalone(standalone) => run_standalone(standalone).await?,
        Commands::Validate { path } => validate(&path)?,
    }

    Ok(())
}
