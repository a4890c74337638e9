//! `forge build`

use crate::BuildArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use forge_agent::{BuildOptions, BuildOrchestrator, EngineConfig, SynthesisClient};
use forge_core::ConstraintMemory;
use forge_sandbox::{SandboxMode, SandboxSupervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Apply flags over the file configuration
fn apply_overrides(mut config: EngineConfig, args: &BuildArgs) -> Result<EngineConfig> {
    if let Some(budget) = args.budget {
        config.budget = budget;
    }
    if let Some(cycles) = args.max_cycles {
        config.max_fix_cycles = cycles;
    }
    if let Some(platform) = &args.platform {
        config.platform = platform.clone();
    }
    if let Some(cap) = args.daily_cap {
        config.daily_spend_cap = Some(cap);
    }
    if args.process {
        config.sandbox.mode = SandboxMode::Process;
    } else if args.container {
        config.sandbox.mode = SandboxMode::Container;
    }
    config.validate()?;
    Ok(config)
}

/// `builds/<first words of the feature>`
fn default_output(feature: &str) -> PathBuf {
    let slug: String = feature
        .split_whitespace()
        .take(5)
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let slug = if slug.is_empty() { "project".to_string() } else { slug };
    PathBuf::from("builds").join(slug)
}

pub async fn run(config: EngineConfig, args: BuildArgs) -> Result<ExitCode> {
    let config = apply_overrides(config, &args)?;
    let profile = config.profile()?;
    tracing::debug!(
        platform = %profile.name,
        budget = config.budget,
        max_fix_cycles = config.max_fix_cycles,
        sandbox = ?config.sandbox.mode,
        "Effective configuration"
    );

    let research = match &args.research {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read research notes {:?}", path))?,
        ),
        None => None,
    };
    let project_dir = args.output.clone().unwrap_or_else(|| default_output(&args.feature));

    let client = SynthesisClient::from_env(config.registry(), config.client_settings());
    let sandbox = SandboxSupervisor::detect(config.sandbox_config(&profile))
        .await
        .context("Sandbox unavailable")?;
    let constraints = ConstraintMemory::open(&config.constraints_path)
        .await
        .context("Failed to open constraint store")?;

    println!("{} {}", "▶ Building:".bold(), args.feature);
    println!(
        "  Output: {}  Platform: {}  Budget: ${:.2}  Max cycles: {}",
        project_dir.display(),
        profile.name,
        config.budget,
        config.max_fix_cycles
    );

    let orchestrator = BuildOrchestrator::new(config, Arc::new(client), Arc::new(sandbox), Arc::new(constraints))?;
    let options = BuildOptions {
        request: args.feature.clone(),
        project_dir,
        phase: args.phase,
        focus: args.focus.clone(),
        research,
        builds_root: None,
    };
    let report = orchestrator.run(&options).await?;

    println!();
    if report.success {
        println!("{}", "✓ BUILD SUCCEEDED".green().bold());
    } else if report.degraded {
        println!("{}", "⚠ BUILD DEGRADED".yellow().bold());
    } else {
        println!("{}", "✗ BUILD FAILED".red().bold());
    }
    println!("{}", report.summary());

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_slug() {
        assert_eq!(
            default_output("A Flask API for todo-lists, with auth!"),
            PathBuf::from("builds/a_flask_api_for_todolists")
        );
        assert_eq!(default_output("!!!"), PathBuf::from("builds/project"));
    }
}
