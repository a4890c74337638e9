use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use forge_agent::{EngineConfig, Phase};
use forge_core::ConstraintMemory;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod build;

/// Forge - turn a feature request into a verified, runnable codebase
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, synthesize, verify and package a project
    Build(BuildArgs),

    /// Show the learned constraint rules
    Constraints {
        /// Constraint store (defaults to the configured path)
        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,
    },

    /// Show today's spend across previous builds
    Spend {
        /// Directory holding previous builds
        #[arg(long, value_name = "DIR", default_value = "builds")]
        builds: PathBuf,
    },
}

#[derive(Args)]
pub struct BuildArgs {
    /// What to build
    pub feature: String,

    /// Project directory (default: builds/<slug of the feature>)
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Budget in USD before switching to the fallback model
    #[arg(long)]
    pub budget: Option<f64>,

    /// Maximum diagnose/patch cycles
    #[arg(long)]
    pub max_cycles: Option<u32>,

    /// Run in a local process instead of a container
    #[arg(long, conflicts_with = "container")]
    pub process: bool,

    /// Require a container runtime
    #[arg(long)]
    pub container: bool,

    /// plan | code | verify | all
    #[arg(long, default_value = "all")]
    pub phase: Phase,

    /// Only synthesize planned paths matching this glob
    #[arg(long, value_name = "GLOB")]
    pub focus: Option<String>,

    /// python | linux | node
    #[arg(long)]
    pub platform: Option<String>,

    /// Refuse to start once today's spend reaches this (USD)
    #[arg(long, value_name = "USD")]
    pub daily_cap: Option<f64>,

    /// File with research notes for the planner
    #[arg(long, value_name = "FILE")]
    pub research: Option<PathBuf>,
}

/// Learned rules and prohibited patterns, or a note that there are none
async fn constraints_report(memory: &ConstraintMemory, path: &Path) -> String {
    let summary = memory.rules_summary().await;
    if summary.is_empty() {
        format!("No constraints learned yet ({}).", path.display())
    } else {
        summary
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "forge=debug" } else { "forge=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(cli.verbose)
        .init();

    let config = EngineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Build(args) => build::run(config, args).await,
        Commands::Constraints { path } => {
            let path = path.unwrap_or_else(|| config.constraints_path.clone());
            let memory = ConstraintMemory::open(&path)
                .await
                .with_context(|| format!("Failed to open constraint store {:?}", path))?;
            println!("{}", constraints_report(&memory, &path).await);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Spend { builds } => {
            let today = chrono::Local::now().date_naive();
            let spent = forge_core::cost::daily_spend(&builds, today);
            println!("Spend on {} under {}: ${:.4}", today, builds.display(), spent);
            if let Some(cap) = config.daily_spend_cap {
                let line = format!("Daily cap: ${:.2} ({:.4} remaining)", cap, (cap - spent).max(0.0));
                if spent >= cap {
                    println!("{}", line.red());
                } else {
                    println!("{}", line.green());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
