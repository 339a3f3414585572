//! converge-node: keeps declared child collections converged.
//!
//! This daemon:
//! - Loads a revisioned manifest of parents and their exact children
//! - Reconciles each parent's remote collection, waiting out eventual consistency
//! - Prunes parents that were removed from the manifest
//! - Reports a JSON status per manifest entry

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use converge_node::{
    ImportError, Manifest, MemoryControlPlane, NodeAgent, ReconcileSettings, ResourceKind, SimulationConfig,
};

/// converge node agent
#[derive(Parser, Debug)]
#[command(name = "converge-node", version, about)]
struct Args {
    /// Simulated control plane configuration (JSON)
    #[arg(long, global = true)]
    simulation: Option<PathBuf>,

    /// Deadline for converging one parent, in seconds
    #[arg(long, global = true, default_value = "1200")]
    apply_timeout: u64,

    /// Deadline for a single add or remove, in seconds
    #[arg(long, global = true, default_value = "300")]
    operation_timeout: u64,

    /// How long a new role may take to become usable, in seconds
    #[arg(long, global = true, default_value = "120")]
    propagation_timeout: u64,

    /// Fixed polling interval in milliseconds (exponential backoff if unset)
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the manifest periodically
    Run {
        /// Path to the JSON manifest
        #[arg(long)]
        manifest: PathBuf,

        /// Seconds between passes
        #[arg(long, default_value = "60")]
        interval: u64,

        /// Run a single pass, print its status and exit
        #[arg(long)]
        once: bool,
    },
    /// Show the changes the next pass would make
    Plan {
        /// Path to the JSON manifest
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Read an existing child by its import id (`parent,child`)
    Import {
        /// Resource kind (subnet_association, policy_attachment)
        #[arg(long)]
        kind: ResourceKind,

        id: String,
    },
}

impl Args {
    fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            apply_timeout: Duration::from_secs(self.apply_timeout),
            operation_timeout: Duration::from_secs(self.operation_timeout),
            propagation_timeout: Duration::from_secs(self.propagation_timeout),
            poll_interval: self.poll_interval_ms.map(Duration::from_millis),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "converge_node=info,converge_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match execute(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn load_simulation(path: Option<&Path>) -> Result<SimulationConfig> {
    let Some(path) = path else {
        return Ok(SimulationConfig::default());
    };
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read simulation config {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Invalid simulation config {}", path.display()))
}

async fn execute(args: Args) -> Result<ExitCode> {
    let simulation = load_simulation(args.simulation.as_deref()).await?;
    let plane = Arc::new(MemoryControlPlane::new(simulation));
    let cancel = CancellationToken::new();
    let mut agent = NodeAgent::new(plane, args.settings(), cancel.clone());

    match args.command {
        Command::Run {
            manifest,
            interval,
            once,
        } => {
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C, shutting down");
                    shutdown.cancel();
                }
            });

            info!("Starting converge-node agent: {}", manifest.display());
            run_agent(&mut agent, &manifest, Duration::from_secs(interval), once, &cancel).await
        }
        Command::Plan { manifest } => {
            let manifest = Manifest::load(&manifest).await?;
            let changes = agent.plan(&manifest).await?;
            println!("{}", serde_json::to_string_pretty(&changes)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Import { kind, id } => match agent.import(kind, &id).await {
            Ok(resource) => {
                println!("{}", serde_json::to_string_pretty(&resource)?);
                Ok(ExitCode::SUCCESS)
            }
            Err(e @ ImportError::InvalidId { .. }) => {
                eprintln!("{e}");
                Ok(ExitCode::from(2))
            }
            Err(e @ ImportError::NotFound { .. }) => {
                eprintln!("{e}");
                Ok(ExitCode::from(3))
            }
            Err(e) => Err(e.into()),
        },
    }
}

/// Run the agent loop, restarting it after errors until cancelled.
async fn run_agent(
    agent: &mut NodeAgent,
    manifest: &Path,
    interval: Duration,
    once: bool,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    loop {
        match agent.run(manifest, interval, once).await {
            Ok(status) if once => {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(if status.is_converged() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                });
            }
            Ok(_) => {
                info!("Agent loop completed normally");
                return Ok(ExitCode::SUCCESS);
            }
            Err(e) if once || cancel.is_cancelled() => return Err(e),
            Err(e) => {
                error!("Agent error: {:#}. Restarting in 5 seconds...", e);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = cancel.cancelled() => return Ok(ExitCode::SUCCESS),
                }
            }
        }
    }
}
