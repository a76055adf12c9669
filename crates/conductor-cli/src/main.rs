mod config;

use clap::{Parser, Subcommand};
use conductor_orchestrator::{EngineRuntime, OrchestrationEngine};
use config::ConductorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: agent, task and goal orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the engine from config and run its loops
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Seed the engine, run one dispatch cycle and print the dashboard JSON
    Check,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the engine and load the configured agents and goals into it.
async fn seed(config: ConductorConfig) -> anyhow::Result<Arc<OrchestrationEngine>> {
    let engine = Arc::new(OrchestrationEngine::new(config.engine));

    engine.events().on_all(|event| {
        let payload = serde_json::to_string(event)?;
        info!(topic = %event.topic(), payload = %payload, "Engine event");
        Ok(())
    });

    for agent in config.agents {
        engine.register_agent(agent).await;
    }
    for goal in config.goals {
        let name = goal.name.clone();
        let goal_id = engine.create_goal(goal).await;
        let tasks = engine.decompose_goal(&goal_id).await?;
        info!(goal_id = %goal_id, name = %name, tasks = tasks.len(), "Goal seeded");
    }
    Ok(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ConductorConfig::load(&cli.config).await.map_err(|e| {
        anyhow::anyhow!("Failed to load config '{}': {e}", cli.config.display())
    })?;
    info!(
        agents = config.agents.len(),
        goals = config.goals.len(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Run { duration_secs } => {
            let engine = seed(config).await?;
            let runtime = EngineRuntime::start(Arc::clone(&engine))?;
            info!("Conductor running");

            match duration_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
                    }
                }
            }

            runtime.stop().await;
            let status = engine.get_system_status().await;
            info!(
                agents = status.total_agents,
                tasks = status.total_tasks,
                goals = status.total_goals,
                queued = status.queue_length,
                "Conductor stopped"
            );
        }
        Commands::Check => {
            let engine = seed(config).await?;
            let assigned = engine.run_dispatch_cycle().await;
            info!(assigned = assigned.len(), "Dispatch cycle complete");
            engine.collect_metrics().await;
            println!("{}", serde_json::to_string_pretty(&engine.dashboard_json().await)?);
        }
    }

    Ok(())
}
