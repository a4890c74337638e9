//! Build orchestrator
//!
//! Sequences one build strictly in order:
//!
//! ```text
//! daily cap -> plan (or resume) -> synthesize -> dependency file
//!           -> verify (run / diagnose / patch) -> README + .env.example
//!           -> cost_report.json + build_report.json
//! ```
//!
//! Only a [`PlanningError`](forge_core::error::PlanningError) (and the
//! daily cap gate before anything starts) ends a build with an error.
//! Everything else is folded into the [`BuildReport`].

use crate::client::Synthesizer;
use crate::config::EngineConfig;
use crate::diagnosis::DiagnosisPatchLoop;
use crate::packaging;
use crate::planner::BlueprintPlanner;
use crate::prompts;
use crate::report::BuildReport;
use crate::session::BuildContext;
use crate::synthesis_loop::{FileSynthesisLoop, SynthesisSettings};
use chrono::Utc;
use forge_core::constraints::ConstraintMemory;
use forge_core::cost::{check_daily_cap, CostGovernor};
use forge_core::error::{Result, ResultExt, StateError};
use forge_core::manifest::BuildManifest;
use forge_core::platform::PlatformProfile;
use forge_core::state::CodebaseState;
use forge_core::symbols::ParserRegistry;
use forge_core::validator::{ConsistencyValidator, SymbolManifest};
use forge_sandbox::SandboxRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// How far a build goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Stop once the blueprint is persisted
    Plan,
    /// Plan and synthesize
    Code,
    /// Run, diagnose and patch an existing project
    Verify,
    #[default]
    All,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Plan => "plan",
            Phase::Code => "code",
            Phase::Verify => "verify",
            Phase::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plan" => Ok(Phase::Plan),
            "code" => Ok(Phase::Code),
            "verify" => Ok(Phase::Verify),
            "all" => Ok(Phase::All),
            other => Err(format!("unknown phase '{}' (expected plan, code, verify or all)", other)),
        }
    }
}

/// One build request
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub request: String,
    pub project_dir: PathBuf,
    pub phase: Phase,
    /// Glob limiting which planned paths are synthesized
    pub focus: Option<String>,
    /// Notes passed to the planner
    pub research: Option<String>,
    /// Where the daily cap looks for cost reports; defaults to the
    /// project directory's parent
    pub builds_root: Option<PathBuf>,
}

impl BuildOptions {
    pub fn new(request: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            request: request.into(),
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }
}

/// Runs builds; one instance can serve many builds
pub struct BuildOrchestrator {
    config: EngineConfig,
    profile: PlatformProfile,
    synthesizer: Arc<dyn Synthesizer>,
    runner: Arc<dyn SandboxRunner>,
    constraints: Arc<ConstraintMemory>,
    parsers: ParserRegistry,
}

impl fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("platform", &self.profile.name)
            .field("boundary", &self.runner.boundary_name())
            .field("budget", &self.config.budget)
            .finish_non_exhaustive()
    }
}

impl BuildOrchestrator {
    pub fn new(
        config: EngineConfig,
        synthesizer: Arc<dyn Synthesizer>,
        runner: Arc<dyn SandboxRunner>,
        constraints: Arc<ConstraintMemory>,
    ) -> Result<Self> {
        let profile = config.profile()?;
        Ok(Self {
            config,
            profile,
            synthesizer,
            runner,
            constraints,
            parsers: ParserRegistry::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one build to completion
    #[tracing::instrument(skip_all, fields(dir = %options.project_dir.display(), phase = %options.phase))]
    pub async fn run(&self, options: &BuildOptions) -> Result<BuildReport> {
        let started_at = Utc::now();
        let dir = options.project_dir.as_path();

        if let Some(cap) = self.config.daily_spend_cap {
            check_daily_cap(&builds_root(options), cap)?;
        }
        let focus = options.focus.as_deref().map(glob::Pattern::new).transpose()?;

        let ctx = BuildContext::new(
            self.synthesizer.clone(),
            CostGovernor::new(self.config.budget),
            self.config.models.clone(),
            self.constraints.clone(),
        );
        let mut state = CodebaseState::open(dir).await.context("Opening build state")?;
        let manifest = self.manifest(&ctx, options).await?;

        let mut report = BuildReport::new(&manifest, dir, options.phase, started_at);
        report.resumed = state.is_resumed();

        if options.phase == Phase::Plan {
            report.success = true;
            return Ok(self.finish(&ctx, report, dir).await);
        }

        let mut symbols = SymbolManifest::build(&state, &self.parsers);

        if options.phase != Phase::Verify {
            let settings = SynthesisSettings {
                max_review_attempts: self.config.max_review_attempts,
                max_lint_attempts: self.config.max_lint_attempts,
                context_budget: self.config.context_budget_chars,
                focus,
            };
            let stats = FileSynthesisLoop::new(&ctx, &self.profile, &self.parsers, settings)
                .run(&manifest, &mut state, &mut symbols)
                .await;
            report.record_synthesis(&stats);

            if let Err(e) = packaging::write_dependency_file(&manifest, &self.profile, &mut state).await {
                tracing::warn!("Could not write dependency file: {}", e);
            }
        }

        if options.phase == Phase::Code {
            report.success = report.files_failed.is_empty();
        } else {
            let rules = ctx.constraints().rules_summary().await;
            let directive = prompts::developer_directive(&self.profile, &rules);
            let outcome = DiagnosisPatchLoop::new(
                &ctx,
                self.runner.as_ref(),
                &self.parsers,
                self.config.max_fix_cycles,
                directive,
            )
            .with_context_budget(self.config.context_budget_chars)
            .run(&manifest, &mut state, &mut symbols)
            .await;
            report.record_verification(outcome);
        }

        report.validation_findings = ConsistencyValidator::new().validate(&symbols);
        if !report.validation_findings.is_empty() {
            tracing::warn!(count = report.validation_findings.len(), "Cross-file findings remain");
        }

        if options.phase != Phase::Verify {
            report.packaging = Some(packaging::finalize(&ctx, &manifest, &self.profile, &state).await);
        }

        Ok(self.finish(&ctx, report, dir).await)
    }

    /// Resume the persisted blueprint or plan a new one
    async fn manifest(&self, ctx: &BuildContext, options: &BuildOptions) -> Result<BuildManifest> {
        let dir = options.project_dir.as_path();
        match BuildManifest::load(dir).await {
            Ok(Some(manifest)) => {
                tracing::info!(project = %manifest.project_name, "Resuming from persisted blueprint");
                return Ok(manifest);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring unreadable blueprint: {}", e),
        }
        if options.phase == Phase::Verify {
            return Err(StateError::MissingManifest(dir.display().to_string()).into());
        }
        BlueprintPlanner::new(ctx, &self.profile)
            .plan(&options.request, options.research.as_deref(), dir)
            .await
    }

    async fn finish(&self, ctx: &BuildContext, mut report: BuildReport, dir: &Path) -> BuildReport {
        let cost = ctx.governor().report();
        if let Err(e) = cost.save(dir).await {
            tracing::warn!("Could not write cost report: {}", e);
        }
        report.cost = Some(cost);
        report.finished_at = Some(Utc::now());
        if let Err(e) = report.save(dir).await {
            tracing::warn!("Could not write build report: {}", e);
        }
        tracing::info!(
            success = report.success,
            cycles = report.fix_cycles,
            cost = ctx.governor().total_cost(),
            "Build finished"
        );
        report
    }
}

fn builds_root(options: &BuildOptions) -> PathBuf {
    options
        .builds_root
        .clone()
        .or_else(|| options.project_dir.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| options.project_dir.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parsing() {
        assert_eq!("Verify".parse::<Phase>().unwrap(), Phase::Verify);
        assert_eq!(Phase::default(), Phase::All);
        assert!("deploy".parse::<Phase>().is_err());
        assert_eq!(Phase::Code.to_string(), "code");
    }

    #[test]
    fn test_builds_root_defaults_to_parent() {
        let options = BuildOptions::new("x", "/tmp/builds/app");
        assert_eq!(builds_root(&options), PathBuf::from("/tmp/builds"));
    }
}
