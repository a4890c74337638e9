//! End-of-build report (`build_report.json`)

use crate::diagnosis::{StopReason, VerificationOutcome};
use crate::orchestrator::Phase;
use crate::packaging::PackagingReport;
use crate::synthesis_loop::SynthesisStats;
use chrono::{DateTime, Utc};
use forge_core::cost::CostReport;
use forge_core::error::Result;
use forge_core::manifest::BuildManifest;
use forge_core::validator::ValidationFinding;
use forge_sandbox::SandboxClassification;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const BUILD_REPORT_FILE: &str = "build_report.json";

/// Structured outcome of one build; produced even when verification fails
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub project_name: String,
    pub project_path: PathBuf,
    pub phase: Phase,
    pub success: bool,
    /// Picked up a previous blueprint or state
    pub resumed: bool,

    pub files_planned: usize,
    pub files_written: u32,
    pub files_resumed: u32,
    pub files_failed: Vec<String>,
    pub review_rejections: u32,
    pub lint_repairs: u32,
    pub auto_fixes: u32,

    pub fix_cycles: u32,
    pub sandbox_runs: u32,
    pub classification_history: Vec<SandboxClassification>,
    pub last_error: Option<String>,
    /// Maximum fix cycles reached without success
    pub degraded: bool,
    pub stop_reason: Option<StopReason>,

    pub validation_findings: Vec<ValidationFinding>,
    pub run_command: String,
    pub packaging: Option<PackagingReport>,
    pub cost: Option<CostReport>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildReport {
    pub fn new(manifest: &BuildManifest, project_path: &Path, phase: Phase, started_at: DateTime<Utc>) -> Self {
        Self {
            project_name: manifest.project_name.clone(),
            project_path: project_path.to_path_buf(),
            phase,
            success: false,
            resumed: false,
            files_planned: manifest.files.len(),
            files_written: 0,
            files_resumed: 0,
            files_failed: Vec::new(),
            review_rejections: 0,
            lint_repairs: 0,
            auto_fixes: 0,
            fix_cycles: 0,
            sandbox_runs: 0,
            classification_history: Vec::new(),
            last_error: None,
            degraded: false,
            stop_reason: None,
            validation_findings: Vec::new(),
            run_command: manifest.run_command.clone(),
            packaging: None,
            cost: None,
            started_at,
            finished_at: None,
        }
    }

    pub fn record_synthesis(&mut self, stats: &SynthesisStats) {
        self.files_written = stats.written;
        self.files_resumed = stats.resumed;
        self.files_failed = stats.failed.clone();
        self.review_rejections = stats.review_rejections;
        self.lint_repairs = stats.lint_repairs;
        self.auto_fixes = stats.auto_fixes;
    }

    pub fn record_verification(&mut self, outcome: VerificationOutcome) {
        self.success = outcome.success;
        self.fix_cycles = outcome.cycles;
        self.sandbox_runs = outcome.runs;
        self.classification_history = outcome.history;
        self.last_error = outcome.last_error;
        self.degraded = outcome.degraded;
        self.stop_reason = Some(outcome.stop);
    }

    /// Write as `build_report.json` inside `dir`
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(dir.join(BUILD_REPORT_FILE), json).await?;
        Ok(())
    }

    /// Terminal summary
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Project:   {} ({})", self.project_name, self.project_path.display()),
            format!("Phase:     {}", self.phase),
            format!(
                "Files:     {} planned, {} written, {} resumed, {} failed",
                self.files_planned,
                self.files_written,
                self.files_resumed,
                self.files_failed.len()
            ),
            format!(
                "Quality:   {} review rejections, {} lint repairs, {} auto-fixes",
                self.review_rejections, self.lint_repairs, self.auto_fixes
            ),
        ];
        if self.sandbox_runs > 0 {
            let history: Vec<String> = self.classification_history.iter().map(|c| c.to_string()).collect();
            lines.push(format!(
                "Sandbox:   {} runs, {} fix cycles [{}]",
                self.sandbox_runs,
                self.fix_cycles,
                history.join(" -> ")
            ));
        }
        if !self.validation_findings.is_empty() {
            lines.push(format!("Findings:  {}", self.validation_findings.len()));
        }
        if let Some(cost) = &self.cost {
            lines.push(format!(
                "Cost:      ${:.4} of ${:.2}{}",
                cost.total_cost,
                cost.budget,
                if cost.pivot_triggered { " (pivoted to fallback)" } else { "" }
            ));
        }
        if let (false, Some(error)) = (self.success, &self.last_error) {
            lines.push(format!("Last error:\n{}", error));
        }
        if self.degraded {
            lines.push("Degraded:  fix cycles exhausted".to_string());
        }
        lines.push(format!("Run:       {}", self.run_command));
        lines.join("\n")
    }
}
