mod config;
mod platform;

use clap::{Parser, Subcommand};
use conductor_orchestrator::{AgentFilter, Orchestrator};
use config::ConductorConfig;
use platform::LoggingPlatform;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: multi-agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and start all configured agents until Ctrl-C
    Run {
        /// Log a status summary every N seconds
        #[arg(long)]
        status_interval: Option<u64>,
    },
    /// Validate the config and list agents in start order
    Check,
}

/// Register every configured agent on a fresh orchestrator.
fn build(config: ConductorConfig) -> anyhow::Result<Orchestrator> {
    let orchestrator = Orchestrator::new(config.orchestrator, Arc::new(LoggingPlatform))?;
    for spec in config.agents {
        orchestrator.register_agent(spec.config, spec.work.into_work())?;
    }
    Ok(orchestrator)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = ConductorConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Run { status_interval } => {
            let orchestrator = build(config)?;
            let started = orchestrator.start_all_agents();
            info!(agents = ?started, "Conductor running; press Ctrl-C to stop");

            let mut ticker = status_interval
                .filter(|secs| *secs > 0)
                .map(|secs| tokio::time::interval(Duration::from_secs(secs)));
            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        signal?;
                        break;
                    }
                    _ = async {
                        match ticker.as_mut() {
                            Some(t) => { t.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        info!(status = %orchestrator.status_json(), "Conductor status");
                    }
                }
            }

            info!("Shutting down");
            orchestrator.shutdown().await;
        }
        Commands::Check => {
            let orchestrator = build(config)?;
            let agents = orchestrator.list_agents(&AgentFilter::all());
            if agents.is_empty() {
                println!("No agents configured.");
                println!("Define agents in conductor.toml under [[agents]]");
            } else {
                println!("Agents in start order:");
                for agent in &agents {
                    let flag = if agent.enabled { "" } else { " (disabled)" };
                    println!("  {} [{}]{flag}", agent.name, agent.priority);
                    if !agent.dependencies.is_empty() {
                        let deps: Vec<&str> =
                            agent.dependencies.iter().map(String::as_str).collect();
                        println!("    depends on: {}", deps.join(", "));
                    }
                }
                println!("\nTotal: {} agent(s)", agents.len());
            }
        }
    }

    Ok(())
}
