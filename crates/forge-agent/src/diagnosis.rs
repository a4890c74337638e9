//! Diagnosis & patch loop
//!
//! A bounded state machine over the sandbox:
//!
//! ```text
//! RUN -> (success) done
//!     -> (failure, cycles < max) DIAGNOSE -> PATCH -> RUN
//!     -> (failure, cycles == max) degraded
//! ```
//!
//! Diagnosis names exactly one known file to change. A `HANG` always gets
//! the missing-sleep framing regardless of what the diagnoser says. A
//! diagnosis that cannot be parsed, or that points outside the project,
//! spends its cycle without touching any file and the program runs again.

use crate::prompts;
use crate::roster::Role;
use crate::session::BuildContext;
use chrono::Local;
use forge_core::context::{ContextAssembler, DEFAULT_CONTEXT_BUDGET};
use forge_core::error::{ForgeError, SynthesisError};
use forge_core::manifest::{normalize_path, BuildManifest};
use forge_core::state::CodebaseState;
use forge_core::symbols::ParserRegistry;
use forge_core::text::{extract_json_object, head_chars};
use forge_core::validator::{findings_digest, ConsistencyValidator, SymbolManifest};
use forge_sandbox::{write_cycle_log, SandboxClassification, SandboxResult, SandboxRunner};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Patch history appended on every patch
pub const CRASH_REPORT_FILE: &str = "crash_report.log";

/// Root cause forced onto every `HANG`
pub const HANG_ROOT_CAUSE: &str = "Infinite loop detected with no I/O or sleep.";

const HANG_INSTRUCTION: &str = " MUST add time.sleep() or event-based delays inside the while loops.";

/// Why a cycle ended without a patch
#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error("diagnosis call failed: {0}")]
    Backend(#[from] SynthesisError),

    #[error("unparseable diagnosis: {0}")]
    Unparseable(String),

    #[error("fix target {0:?} is not a project file")]
    UnknownTarget(String),

    #[error("patch failed: {0}")]
    Patch(#[from] ForgeError),
}

/// `{root_cause, fix_file, fix_instruction}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default)]
    pub root_cause: String,
    pub fix_file: String,
    #[serde(default)]
    pub fix_instruction: String,
}

impl Diagnosis {
    /// Lenient parse: fences and prose around the object are ignored
    pub fn parse(raw: &str) -> Option<Self> {
        let value = extract_json_object(raw)?;
        let mut diagnosis: Diagnosis = serde_json::from_value(value).ok()?;
        diagnosis.fix_file = normalize_path(&diagnosis.fix_file);
        if diagnosis.fix_file.is_empty() {
            return None;
        }
        Some(diagnosis)
    }

    /// Replace the root cause with the missing-yield framing
    pub fn force_hang_framing(&mut self) {
        self.root_cause = HANG_ROOT_CAUSE.to_string();
        if !self.fix_instruction.ends_with(HANG_INSTRUCTION) {
            self.fix_instruction.push_str(HANG_INSTRUCTION);
        }
    }
}

/// How the loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    Succeeded,
    /// Cycle budget spent without success
    CyclesExhausted,
    /// The diagnosis or patch call itself failed
    Aborted(String),
}

/// One diagnose-and-patch step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixCycle {
    pub cycle: u32,
    pub classification: SandboxClassification,
    pub error_summary: String,
    pub diagnosis: Option<Diagnosis>,
    pub patched: bool,
}

/// Result of verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    pub success: bool,
    /// Diagnose steps entered; never above the configured maximum
    pub cycles: u32,
    pub runs: u32,
    /// Classification of every run, in order
    pub history: Vec<SandboxClassification>,
    pub fixes: Vec<FixCycle>,
    pub last_error: Option<String>,
    /// Maximum cycles reached without success
    pub degraded: bool,
    pub stop: StopReason,
}

/// Bounded run/diagnose/patch driver
pub struct DiagnosisPatchLoop<'a> {
    ctx: &'a BuildContext,
    runner: &'a dyn SandboxRunner,
    parsers: &'a ParserRegistry,
    max_cycles: u32,
    context_budget: usize,
    developer_directive: String,
}

impl std::fmt::Debug for DiagnosisPatchLoop<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosisPatchLoop")
            .field("boundary", &self.runner.boundary_name())
            .field("max_cycles", &self.max_cycles)
            .finish_non_exhaustive()
    }
}

impl<'a> DiagnosisPatchLoop<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        runner: &'a dyn SandboxRunner,
        parsers: &'a ParserRegistry,
        max_cycles: u32,
        developer_directive: String,
    ) -> Self {
        Self {
            ctx,
            runner,
            parsers,
            max_cycles,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            developer_directive,
        }
    }

    pub fn with_context_budget(mut self, budget: usize) -> Self {
        self.context_budget = budget;
        self
    }

    /// Run until success, exhaustion or an aborted cycle
    #[tracing::instrument(skip_all, fields(run = %manifest.run_command, max_cycles = self.max_cycles))]
    pub async fn run(
        &self,
        manifest: &BuildManifest,
        state: &mut CodebaseState,
        symbols: &mut SymbolManifest,
    ) -> VerificationOutcome {
        let root = state.root().to_path_buf();
        let mut outcome = VerificationOutcome {
            success: false,
            cycles: 0,
            runs: 0,
            history: Vec::new(),
            fixes: Vec::new(),
            last_error: None,
            degraded: false,
            stop: StopReason::CyclesExhausted,
        };

        loop {
            outcome.runs += 1;
            let result = self.runner.run(&root, &manifest.run_command).await;
            if let Err(e) = write_cycle_log(&root, outcome.runs, &result).await {
                tracing::warn!("Could not write cycle log: {}", e);
            }
            outcome.history.push(result.classification);
            tracing::info!(
                run = outcome.runs,
                classification = %result.classification,
                boundary = self.runner.boundary_name(),
                "Sandbox run finished"
            );

            if result.success {
                outcome.success = true;
                outcome.stop = StopReason::Succeeded;
                return outcome;
            }
            outcome.last_error = Some(result.error_summary.clone());

            if outcome.cycles >= self.max_cycles {
                tracing::warn!(cycles = outcome.cycles, "Fix cycles exhausted, build is degraded");
                outcome.degraded = true;
                outcome.stop = StopReason::CyclesExhausted;
                return outcome;
            }
            outcome.cycles += 1;
            let cycle = outcome.cycles;

            let mut fix = FixCycle {
                cycle,
                classification: result.classification,
                error_summary: result.error_summary.clone(),
                diagnosis: None,
                patched: false,
            };

            let diagnosis = match self.diagnose(&result, state, symbols).await {
                Ok(diagnosis) => diagnosis,
                Err(e @ (DiagnosisError::Unparseable(_) | DiagnosisError::UnknownTarget(_))) => {
                    tracing::warn!(cycle, error = %e, "Cannot locate fix target, re-running without a patch");
                    outcome.fixes.push(fix);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(cycle, error = %e, "No patch this cycle, stopping");
                    outcome.fixes.push(fix);
                    outcome.stop = StopReason::Aborted(e.to_string());
                    return outcome;
                }
            };
            fix.diagnosis = Some(diagnosis.clone());

            if let Err(e) = self.patch(cycle, &diagnosis, &result, state, symbols).await {
                tracing::warn!(cycle, error = %e, "Patch failed, stopping");
                outcome.fixes.push(fix);
                outcome.stop = StopReason::Aborted(e.to_string());
                return outcome;
            }
            fix.patched = true;
            outcome.fixes.push(fix);
        }
    }

    /// Ask for `{root_cause, fix_file, fix_instruction}`
    pub async fn diagnose(
        &self,
        result: &SandboxResult,
        state: &CodebaseState,
        symbols: &SymbolManifest,
    ) -> Result<Diagnosis, DiagnosisError> {
        let files = state.paths();
        let findings = findings_digest(&ConsistencyValidator::new().validate(symbols));
        let content = prompts::diagnosis_content(result, &files, &findings);
        let raw = self
            .ctx
            .call(Role::Diagnoser, &prompts::diagnoser_directive(), &content)
            .await?;

        let mut diagnosis = Diagnosis::parse(&raw)
            .ok_or_else(|| DiagnosisError::Unparseable(head_chars(raw.trim(), 200).to_string()))?;
        if result.classification == SandboxClassification::Hang {
            diagnosis.force_hang_framing();
        }
        if !state.contains(&diagnosis.fix_file) {
            return Err(DiagnosisError::UnknownTarget(diagnosis.fix_file));
        }

        tracing::info!(
            fix_file = %diagnosis.fix_file,
            root_cause = %diagnosis.root_cause,
            "Diagnosis"
        );
        Ok(diagnosis)
    }

    /// Regenerate exactly the target file
    async fn patch(
        &self,
        cycle: u32,
        diagnosis: &Diagnosis,
        result: &SandboxResult,
        state: &mut CodebaseState,
        symbols: &mut SymbolManifest,
    ) -> Result<(), DiagnosisError> {
        let path = diagnosis.fix_file.as_str();
        let (current, review_count) = match state.get(path) {
            Some(record) => (record.content.clone(), record.review_count),
            None => return Err(DiagnosisError::UnknownTarget(path.to_string())),
        };
        let context = ContextAssembler::new(self.context_budget).assemble(state, path, &diagnosis.fix_instruction);
        let content = prompts::patch_content(
            path,
            &current,
            &diagnosis.root_cause,
            &diagnosis.fix_instruction,
            &result.error_summary,
            &context.text,
        );

        let patched = self
            .ctx
            .call(Role::Developer, &self.developer_directive, &content)
            .await?;
        let fixed = self.ctx.constraints().auto_fixer().await.apply(path, &patched);

        state.write(path, &fixed.content, review_count).await?;
        symbols.refresh(path, &fixed.content, self.parsers);

        if let Err(e) = append_crash_report(state.root(), cycle, &result.error_summary, &diagnosis.fix_instruction).await {
            tracing::warn!("Could not append crash report: {}", e);
        }
        tracing::info!(cycle, path = %path, "Patched");
        Ok(())
    }
}

/// Append one entry to `crash_report.log`
pub async fn append_crash_report(
    project_dir: &Path,
    cycle: u32,
    error_summary: &str,
    instruction: &str,
) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(project_dir.join(CRASH_REPORT_FILE))
        .await?;
    let entry = format!(
        "\n--- CYCLE {} FAILURE ({}) ---\n{}\nFIX: {}\n",
        cycle,
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        error_summary,
        instruction
    );
    file.write_all(entry.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Synthesis, Synthesizer};
    use crate::roster::ModelRoster;
    use async_trait::async_trait;
    use forge_core::constraints::ConstraintMemory;
    use forge_core::cost::CostGovernor;
    use forge_core::platform::PlatformProfile;
    use forge_sandbox::RawOutcome;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Doctor {
        diagnoses: Mutex<VecDeque<String>>,
        patch: String,
        patch_requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Synthesizer for Doctor {
        async fn synthesize(&self, model: &str, directive: &str, content: &str) -> Result<Synthesis, SynthesisError> {
            let text = if directive.contains("diagnose") {
                self.diagnoses.lock().unwrap().pop_front().ok_or(SynthesisError::EmptyResponse)?
            } else {
                self.patch_requests.lock().unwrap().push(content.to_string());
                self.patch.clone()
            };
            Ok(Synthesis {
                text,
                model: model.to_string(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    #[derive(Debug, Default)]
    struct Runs {
        results: Mutex<VecDeque<SandboxResult>>,
    }

    #[async_trait]
    impl SandboxRunner for Runs {
        async fn run(&self, _: &Path, command: &str) -> SandboxResult {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| SandboxResult::boundary_failure(command, "script exhausted"))
        }

        fn boundary_name(&self) -> &'static str {
            "scripted"
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn ok() -> SandboxResult {
        SandboxResult::classify(
            "python main.py",
            RawOutcome::Exited {
                code: Some(0),
                stdout: "done".into(),
                stderr: String::new(),
            },
            TIMEOUT,
        )
    }

    fn crash() -> SandboxResult {
        SandboxResult::classify(
            "python main.py",
            RawOutcome::Exited {
                code: Some(1),
                stdout: String::new(),
                stderr: "Traceback (most recent call last):\n  File \"main.py\", line 1\nNameError: name 'x' is not defined".into(),
            },
            TIMEOUT,
        )
    }

    fn hang() -> SandboxResult {
        SandboxResult::classify(
            "python main.py",
            RawOutcome::TimedOut {
                stdout: String::new(),
                stderr: String::new(),
            },
            TIMEOUT,
        )
    }

    fn diagnosis(file: &str) -> String {
        json!({"root_cause": "x undefined", "fix_file": file, "fix_instruction": "define x"}).to_string()
    }

    async fn verify(doctor: Arc<Doctor>, runs: Vec<SandboxResult>, max_cycles: u32) -> (VerificationOutcome, tempfile::TempDir, CodebaseState) {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        state.write("main.py", "print(x)\n", 1).await.unwrap();
        let manifest = BuildManifest::from_value(
            json!({"project_name": "demo", "files": [{"path": "main.py", "task": "print"}], "run_command": "python main.py"}),
            &PlatformProfile::python(),
        )
        .unwrap();

        let ctx = BuildContext::new(
            doctor,
            CostGovernor::new(10.0),
            ModelRoster::default(),
            Arc::new(ConstraintMemory::in_memory()),
        );
        let runner = Runs {
            results: Mutex::new(runs.into()),
        };
        let parsers = ParserRegistry::default();
        let mut symbols = SymbolManifest::build(&state, &parsers);
        let outcome = DiagnosisPatchLoop::new(&ctx, &runner, &parsers, max_cycles, "developer".into())
            .run(&manifest, &mut state, &mut symbols)
            .await;
        (outcome, dir, state)
    }

    #[test]
    fn test_lenient_parse() {
        let raw = "```json\n{\"root_cause\": \"typo\", \"fix_file\": \"./app/main.py\", \"fix_instruction\": \"fix\"}\n```";
        let parsed = Diagnosis::parse(raw).unwrap();
        assert_eq!(parsed.fix_file, "app/main.py");

        assert!(Diagnosis::parse("the bug is in main.py").is_none());
        assert!(Diagnosis::parse(r#"{"root_cause": "no target"}"#).is_none());
    }

    #[test]
    fn test_hang_framing_is_forced() {
        let mut d = Diagnosis::parse(&diagnosis("main.py")).unwrap();
        d.force_hang_framing();
        d.force_hang_framing();
        assert_eq!(d.root_cause, HANG_ROOT_CAUSE);
        assert_eq!(d.fix_instruction.matches("time.sleep()").count(), 1);
    }

    #[tokio::test]
    async fn test_one_patch_then_success() {
        let doctor = Arc::new(Doctor {
            diagnoses: Mutex::new(vec![diagnosis("main.py")].into()),
            patch: "x = 1\nprint(x)\n".into(),
            ..Doctor::default()
        });
        let (outcome, dir, state) = verify(doctor, vec![crash(), ok()], 3).await;

        assert!(outcome.success);
        assert_eq!(outcome.cycles, 1);
        assert_eq!(
            outcome.history,
            vec![SandboxClassification::RuntimeError, SandboxClassification::Success]
        );
        assert_eq!(state.get("main.py").unwrap().content, "x = 1\nprint(x)\n");
        assert!(dir.path().join("logs/error_cycle_1.log").exists());
        assert!(dir.path().join("logs/error_cycle_2.log").exists());
        let crash_report = std::fs::read_to_string(dir.path().join(CRASH_REPORT_FILE)).unwrap();
        assert!(crash_report.contains("--- CYCLE 1 FAILURE"));
        assert!(crash_report.contains("FIX: define x"));
    }

    #[tokio::test]
    async fn test_hang_patch_request_mentions_sleep() {
        let doctor = Arc::new(Doctor {
            diagnoses: Mutex::new(vec![diagnosis("main.py")].into()),
            patch: "import time\n".into(),
            ..Doctor::default()
        });
        let (outcome, _dir, _) = verify(doctor.clone(), vec![hang(), ok()], 3).await;

        assert!(outcome.success);
        let fix = outcome.fixes[0].diagnosis.as_ref().unwrap();
        assert_eq!(fix.root_cause, HANG_ROOT_CAUSE);
        assert!(doctor.patch_requests.lock().unwrap()[0].contains(HANG_ROOT_CAUSE));
    }

    #[tokio::test]
    async fn test_cycles_are_bounded() {
        let doctor = Arc::new(Doctor {
            diagnoses: Mutex::new((0..10).map(|_| diagnosis("main.py")).collect()),
            patch: "print(x)\n".into(),
            ..Doctor::default()
        });
        let (outcome, _dir, _) = verify(doctor, (0..10).map(|_| crash()).collect(), 2).await;

        assert!(!outcome.success);
        assert!(outcome.degraded);
        assert_eq!(outcome.cycles, 2);
        assert_eq!(outcome.runs, 3);
        assert_eq!(outcome.stop, StopReason::CyclesExhausted);
    }

    #[tokio::test]
    async fn test_unknown_target_skips_the_cycle() {
        let doctor = Arc::new(Doctor {
            diagnoses: Mutex::new(vec![diagnosis("helpers.py"), diagnosis("main.py")].into()),
            patch: "x = 1\nprint(x)\n".into(),
            ..Doctor::default()
        });
        let (outcome, _dir, state) = verify(doctor.clone(), vec![crash(), crash(), ok()], 3).await;

        assert!(outcome.success);
        assert_eq!(outcome.runs, 3);
        assert_eq!(outcome.cycles, 2);
        assert!(!outcome.fixes[0].patched);
        assert!(outcome.fixes[0].diagnosis.is_none());
        assert!(outcome.fixes[1].patched);
        assert_eq!(doctor.patch_requests.lock().unwrap().len(), 1);
        assert!(state.get("helpers.py").is_none());
        assert_eq!(state.get("main.py").unwrap().content, "x = 1\nprint(x)\n");
    }

    #[tokio::test]
    async fn test_unparseable_diagnosis_reruns_next_cycle() {
        let doctor = Arc::new(Doctor {
            diagnoses: Mutex::new(vec!["not json at all".to_string(), diagnosis("main.py")].into()),
            patch: "x = 1\nprint(x)\n".into(),
            ..Doctor::default()
        });
        let (outcome, _dir, _) = verify(doctor, vec![crash(), crash(), ok()], 3).await;

        assert!(outcome.success);
        assert_eq!(outcome.stop, StopReason::Succeeded);
        assert_eq!(outcome.runs, 3);
        assert!(outcome.fixes[0].diagnosis.is_none());
        assert!(!outcome.fixes[0].patched);
    }

    #[tokio::test]
    async fn test_unusable_diagnoses_end_degraded() {
        let doctor = Arc::new(Doctor {
            diagnoses: Mutex::new((0..5).map(|_| "I am not sure what went wrong.".to_string()).collect()),
            patch: "unused".into(),
            ..Doctor::default()
        });
        let (outcome, _dir, state) = verify(doctor.clone(), (0..5).map(|_| crash()).collect(), 2).await;

        assert!(!outcome.success);
        assert!(outcome.degraded);
        assert_eq!(outcome.stop, StopReason::CyclesExhausted);
        assert_eq!(outcome.cycles, 2);
        assert_eq!(outcome.runs, 3);
        assert!(doctor.patch_requests.lock().unwrap().is_empty());
        assert_eq!(state.get("main.py").unwrap().content, "print(x)\n");
        assert_eq!(outcome.last_error.as_deref().map(|e| e.contains("NameError")), Some(true));
    }
}
