//! Entry point for a standalone RockBot process: loads config, stands up
//! the full runtime graph, and drives either a one-shot introspection
//! command or the long-running daemon + interactive client. Grounded on the
//! teacher's `main.rs` clap surface, trimmed to the commands that survive
//! once the TUI/Telegram/WASM-tool-build surfaces move out of scope (spec
//! §1 treats richer front ends as external collaborators).

mod app;
mod interactive;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rockbot_config::AppConfig;
use rockbot_memory::ScheduledTask;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rockbot", about = "Run or inspect a RockBot agent process")]
struct Cli {
    /// Path to the TOML config file. Missing file falls back to defaults.
    #[arg(long, global = true, default_value = "rockbot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent: arms the scheduler, opens the bus, and drops into
    /// an interactive stdin/stdout chat session.
    Start {
        /// Session id the interactive client's turns are recorded under.
        #[arg(long, default_value = "local")]
        session: String,
        /// Skills to advertise on this agent's discovery card.
        #[arg(long = "skill")]
        skills: Vec<String>,
    },
    /// Print the resolved configuration and exit.
    Doctor,
    /// Inspect or arm cron-scheduled tasks.
    Schedule {
        #[command(subcommand)]
        action: ScheduleCommands,
    },
    /// Inspect the tool registry.
    Tool {
        #[command(subcommand)]
        action: ToolCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// List every armed cron entry.
    List,
    /// Arm (or re-arm) a named cron entry.
    Add {
        name: String,
        /// 5-field (`min hour dom mon dow`) or 6-field (seconds-leading) cron expression.
        cron_expression: String,
        description: String,
    },
    /// Cancel a named cron entry.
    Cancel { name: String },
}

#[derive(Subcommand)]
enum ToolCommands {
    /// List every tool currently registered.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.telemetry.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Commands::Doctor => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Start { session, skills } => run_start(config, session, skills).await,
        Commands::Schedule { action } => run_schedule(config, action).await,
        Commands::Tool { action } => run_tool(config, action).await,
    }
}

async fn run_start(config: AppConfig, session: String, skills: Vec<String>) -> Result<()> {
    let agent = app::build(config).await?;
    let description = format!("{} — a RockBot agent", agent.config.agent.name);
    app::wire(&agent, skills, description).await?;

    let result = interactive::run(&agent, &session).await;
    agent.shutdown.cancel();
    result
}

async fn run_schedule(config: AppConfig, action: ScheduleCommands) -> Result<()> {
    let agent = app::build(config).await?;
    match action {
        ScheduleCommands::List => {
            for task in agent.scheduler.list().await {
                let next = agent.scheduler.next_occurrence(&task).map(|at| at.to_rfc3339()).unwrap_or_else(|_| "never".to_string());
                println!("{}\t{}\tnext={}", task.name, task.cron_expression, next);
            }
        }
        ScheduleCommands::Add { name, cron_expression, description } => {
            let task = ScheduledTask { name, cron_expression, description, created_at: chrono::Utc::now(), last_fired_at: None };
            agent.scheduler.schedule(task).await?;
            println!("armed");
        }
        ScheduleCommands::Cancel { name } => {
            if agent.scheduler.cancel(&name).await? {
                println!("cancelled");
            } else {
                println!("no such scheduled task: {name}");
            }
        }
    }
    agent.shutdown.cancel();
    Ok(())
}

async fn run_tool(config: AppConfig, action: ToolCommands) -> Result<()> {
    let agent = app::build(config).await?;
    match action {
        ToolCommands::List => {
            for descriptor in agent.handles.tool_gate.visible_descriptors() {
                println!("{}\t{}", descriptor.name, descriptor.description);
            }
        }
    }
    agent.shutdown.cancel();
    Ok(())
}
