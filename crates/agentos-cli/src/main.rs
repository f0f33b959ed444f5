mod host;

use agentos_orchestrator::{AgentFilter, AgentStatus, Engine, StaticAgentLoader};
use clap::{Parser, Subcommand, ValueEnum};
use host::{AgentosConfig, EchoRunner, TaskFile};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentos", about = "AgentOS: priority task engine for AI agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentos.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured agents
    Agents {
        /// Only show agents with this role
        #[arg(long)]
        role: Option<String>,
    },
    /// Run a batch of tasks and print their outcomes
    Run {
        /// TOML file with [[tasks]] entries
        #[arg(short, long)]
        tasks: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = AgentosConfig::load(&cli.config)?;
    let runner = Arc::new(EchoRunner::new(&config.agents));
    let engine = Engine::new(
        config.engine.clone(),
        Arc::new(StaticAgentLoader::new(config.agents.clone())),
        runner,
    )?;

    match cli.command {
        Commands::Agents { role } => {
            engine.start().await?;
            let mut filter = AgentFilter::default();
            if let Some(role) = role {
                filter = filter.with_role(role);
            }
            let agents = engine.list_agents(&filter).await;
            if agents.is_empty() {
                println!("No agents configured.");
                println!("Add agents in agentos.toml under [[agents]]");
            } else {
                println!("Configured agents:");
                for agent in &agents {
                    let provider = agent.descriptor.model_provider.as_deref().unwrap_or("-");
                    println!(
                        "  {}: {} ({}, provider: {})",
                        agent.id(),
                        agent.descriptor.name,
                        agent.descriptor.role,
                        provider
                    );
                }
                let active = engine
                    .list_agents(&AgentFilter::default().with_status(AgentStatus::Active))
                    .await
                    .len();
                println!("{} agents, {} active", agents.len(), active);
            }
            engine.stop().await;
        }
        Commands::Run { tasks } => {
            let file = TaskFile::load(&tasks)?;
            info!(count = file.tasks.len(), path = %tasks.display(), "Loaded task file");

            engine.start().await?;
            let outcome = engine.execute_batch(file.tasks).await;
            for (index, result) in outcome.results.iter().enumerate() {
                match result {
                    Ok(value) => println!("[{index}] ok   {value}"),
                    Err(e) => println!("[{index}] fail {e}"),
                }
            }
            println!(
                "{} succeeded, {} failed",
                outcome.succeeded, outcome.failed
            );

            let status = engine.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            engine.stop().await;
        }
    }

    Ok(())
}
