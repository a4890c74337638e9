//! File synthesis loop
//!
//! Files are produced one at a time, entry point first:
//!
//! ```text
//! Pending -> Synthesized -> Reviewed -> [Repaired] -> Written
//! ```
//!
//! Every file passes through the review gate, the deterministic auto-fixer
//! and a bounded parse-and-repair loop before it is written. A file whose
//! synthesis fails is recorded as failed and the loop moves on.

use crate::prompts::{self, FilePrompt};
use crate::review::{ReviewGate, Resubmission};
use crate::roster::Role;
use crate::session::BuildContext;
use forge_core::context::{import_contract, ContextAssembler, DEFAULT_CONTEXT_BUDGET};
use forge_core::error::Result;
use forge_core::manifest::{BuildManifest, FileTask};
use forge_core::platform::PlatformProfile;
use forge_core::state::CodebaseState;
use forge_core::symbols::ParserRegistry;
use forge_core::validator::{findings_digest, ConsistencyValidator, FindingKind, SymbolManifest, ValidationFinding};
use serde::Serialize;
use std::collections::BTreeMap;

/// Where a file ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Not yet attempted
    Pending,
    /// First draft received
    Synthesized,
    /// Through the review gate
    Reviewed {
        /// False when accepted after exhausting attempts
        approved: bool,
    },
    /// A syntax repair was applied
    Repaired,
    /// On disk and in the state document
    Written,
    /// Already current from a previous run
    Resumed,
    /// Outside the focus pattern
    OutOfFocus,
    /// Synthesis failed
    Failed,
}

/// Knobs for one synthesis pass
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub max_review_attempts: u32,
    pub max_lint_attempts: u32,
    pub context_budget: usize,
    /// Only synthesize paths matching this pattern
    pub focus: Option<glob::Pattern>,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            max_review_attempts: 3,
            max_lint_attempts: 3,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            focus: None,
        }
    }
}

/// Counters for the synthesis phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SynthesisStats {
    pub written: u32,
    pub failed: Vec<String>,
    pub resumed: u32,
    pub review_rejections: u32,
    pub lint_repairs: u32,
    pub auto_fixes: u32,
    pub files: BTreeMap<String, FileState>,
}

/// Drives every planned file to `Written` or `Failed`
#[derive(Debug)]
pub struct FileSynthesisLoop<'a> {
    ctx: &'a BuildContext,
    profile: &'a PlatformProfile,
    parsers: &'a ParserRegistry,
    settings: SynthesisSettings,
}

impl<'a> FileSynthesisLoop<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        profile: &'a PlatformProfile,
        parsers: &'a ParserRegistry,
        settings: SynthesisSettings,
    ) -> Self {
        Self {
            ctx,
            profile,
            parsers,
            settings,
        }
    }

    /// Synthesize every planned file, entry point first
    #[tracing::instrument(skip_all, fields(project = %manifest.project_name))]
    pub async fn run(
        &self,
        manifest: &BuildManifest,
        state: &mut CodebaseState,
        symbols: &mut SymbolManifest,
    ) -> SynthesisStats {
        let mut stats = SynthesisStats::default();
        let entry = manifest.entry_point(self.profile).to_string();
        let summary = manifest.summary();
        let tasks = manifest.ordered_tasks(self.profile);
        let total = tasks.len();

        for task in &tasks {
            stats.files.insert(task.path.clone(), FileState::Pending);
        }

        for (index, task) in tasks.into_iter().enumerate() {
            if let Some(focus) = &self.settings.focus {
                if !focus.matches(&task.path) {
                    stats.files.insert(task.path.clone(), FileState::OutOfFocus);
                    continue;
                }
            }
            if state.is_current(&task.path) {
                tracing::info!(path = %task.path, "Already written, skipping");
                stats.resumed += 1;
                stats.files.insert(task.path.clone(), FileState::Resumed);
                continue;
            }

            tracing::info!(path = %task.path, "[{}/{}] Synthesizing", index + 1, total);
            match self
                .synthesize_file(task, &entry, &summary, state, symbols, &mut stats)
                .await
            {
                Ok(()) => {
                    stats.written += 1;
                    stats.files.insert(task.path.clone(), FileState::Written);
                }
                Err(e) => {
                    tracing::error!(path = %task.path, error = %e, "File synthesis failed, continuing");
                    stats.failed.push(task.path.clone());
                    stats.files.insert(task.path.clone(), FileState::Failed);
                }
            }
        }

        tracing::info!(
            written = stats.written,
            failed = stats.failed.len(),
            resumed = stats.resumed,
            "Synthesis finished"
        );
        stats
    }

    async fn synthesize_file(
        &self,
        task: &FileTask,
        entry: &str,
        summary: &str,
        state: &mut CodebaseState,
        symbols: &mut SymbolManifest,
        stats: &mut SynthesisStats,
    ) -> Result<()> {
        let path = task.path.as_str();
        let contract = if path == entry {
            None
        } else {
            state
                .get(entry)
                .and_then(|record| import_contract(&record.content, path))
        };
        let context = ContextAssembler::new(self.settings.context_budget).assemble(state, path, &task.task);
        let findings = relevant_findings(&ConsistencyValidator::new().validate(symbols), path);
        let symbol_summary = symbols.summary();

        let original = FilePrompt {
            path,
            task: &task.task,
            manifest_summary: summary,
            import_contract: contract.as_deref(),
            symbol_summary: &symbol_summary,
            context: &context.text,
            findings: &findings_digest(&findings),
        }
        .render();

        let rules = self.ctx.constraints().rules_summary().await;
        let directive = prompts::developer_directive(self.profile, &rules);

        let draft = self.ctx.call(Role::Developer, &directive, &original).await?;
        stats.files.insert(path.to_string(), FileState::Synthesized);

        let review = ReviewGate::new(self.ctx, self.settings.max_review_attempts)
            .review(
                path,
                draft,
                summary,
                Resubmission {
                    directive: &directive,
                    original: &original,
                },
            )
            .await;
        stats.review_rejections += review.rejections;
        stats.files.insert(
            path.to_string(),
            FileState::Reviewed {
                approved: review.approved,
            },
        );

        let fixed = self.ctx.constraints().auto_fixer().await.apply(path, &review.content);
        stats.auto_fixes += fixed.applied.len() as u32;

        let (content, repairs) = self.repair_syntax(path, fixed.content, &directive).await;
        if repairs > 0 {
            stats.lint_repairs += repairs;
            stats.files.insert(path.to_string(), FileState::Repaired);
        }

        state.write(path, &content, review.attempts).await?;
        symbols.refresh(path, &content, self.parsers);
        Ok(())
    }

    /// Resubmit with the exact parse error until the file parses or the
    /// attempts run out; the last content is kept either way
    async fn repair_syntax(&self, path: &str, mut content: String, directive: &str) -> (String, u32) {
        let mut repairs = 0;
        for attempt in 1..=self.settings.max_lint_attempts {
            let Some(issue) = self.parsers.check_syntax(path, &content) else {
                break;
            };
            tracing::info!(path = %path, attempt, issue = %issue, "Syntax repair");
            let request = prompts::lint_repair_content(path, &content, &issue.to_string());
            match self.ctx.call(Role::Developer, directive, &request).await {
                Ok(repaired) => {
                    content = repaired;
                    repairs += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Repair call failed, keeping best effort");
                    break;
                }
            }
        }
        if let Some(issue) = self.parsers.check_syntax(path, &content) {
            tracing::warn!(path = %path, issue = %issue, "Writing file that still does not parse");
        }
        (content, repairs)
    }
}

/// Findings about `path` or about imports that resolve to it
fn relevant_findings(findings: &[ValidationFinding], path: &str) -> Vec<ValidationFinding> {
    findings
        .iter()
        .filter(|f| {
            f.file == path
                || matches!(&f.kind, FindingKind::MissingExport { module_file, .. } if module_file == path)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Synthesis, Synthesizer};
    use crate::roster::ModelRoster;
    use async_trait::async_trait;
    use forge_core::constraints::ConstraintMemory;
    use forge_core::cost::CostGovernor;
    use forge_core::error::SynthesisError;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Drafts keyed by path; the reviewer always approves
    #[derive(Debug, Default)]
    struct Workshop {
        drafts: HashMap<String, String>,
        repair: Option<String>,
        requests: Mutex<Vec<String>>,
    }

    impl Workshop {
        fn with(drafts: &[(&str, &str)]) -> Self {
            Self {
                drafts: drafts.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect(),
                ..Self::default()
            }
        }

        fn developer_requests(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.starts_with("FILE: "))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Synthesizer for Workshop {
        async fn synthesize(&self, model: &str, directive: &str, content: &str) -> std::result::Result<Synthesis, SynthesisError> {
            self.requests.lock().unwrap().push(content.to_string());
            let text = if directive.contains("code reviewer") {
                r#"{"status": "APPROVED", "reason": "fine"}"#.to_string()
            } else if content.starts_with("The file ") {
                self.repair.clone().ok_or(SynthesisError::EmptyResponse)?
            } else {
                let path = content
                    .lines()
                    .next()
                    .and_then(|l| l.strip_prefix("FILE: "))
                    .unwrap_or_default();
                self.drafts.get(path).cloned().ok_or(SynthesisError::EmptyResponse)?
            };
            Ok(Synthesis {
                text,
                model: model.to_string(),
                input_tokens: 10,
                output_tokens: 10,
            })
        }
    }

    fn manifest(paths: &[&str]) -> BuildManifest {
        let files: Vec<_> = paths.iter().map(|p| json!({"path": p, "task": format!("implement {}", p)})).collect();
        BuildManifest::from_value(
            json!({"project_name": "demo", "files": files, "run_command": "python main.py"}),
            &PlatformProfile::python(),
        )
        .unwrap()
    }

    async fn run(
        workshop: Arc<Workshop>,
        manifest: &BuildManifest,
        state: &mut CodebaseState,
        settings: SynthesisSettings,
    ) -> SynthesisStats {
        let ctx = BuildContext::new(
            workshop,
            CostGovernor::new(10.0),
            ModelRoster::default(),
            Arc::new(ConstraintMemory::in_memory()),
        );
        let profile = PlatformProfile::python();
        let parsers = ParserRegistry::default();
        let mut symbols = SymbolManifest::build(state, &parsers);
        FileSynthesisLoop::new(&ctx, &profile, &parsers, settings)
            .run(manifest, state, &mut symbols)
            .await
    }

    #[tokio::test]
    async fn test_entry_point_first_with_import_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        let workshop = Arc::new(Workshop::with(&[
            ("main.py", "from engine import start\nstart()\n"),
            ("engine.py", "def start():\n    return 1\n"),
        ]));

        let stats = run(workshop.clone(), &manifest(&["engine.py", "main.py"]), &mut state, SynthesisSettings::default()).await;
        assert_eq!(stats.written, 2);
        assert_eq!(stats.files["engine.py"], FileState::Written);

        let requests = workshop.developer_requests();
        assert!(requests[0].starts_with("FILE: main.py"));
        assert!(!requests[0].contains("IMPORT CONTRACT"));
        assert!(requests[1].contains("IMPORT CONTRACT"));
        assert!(requests[1].contains("from engine import start"));
    }

    #[tokio::test]
    async fn test_failed_file_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        let workshop = Arc::new(Workshop::with(&[("main.py", "print('ok')\n"), ("b.py", "B = 2\n")]));

        let stats = run(workshop, &manifest(&["main.py", "a.py", "b.py"]), &mut state, SynthesisSettings::default()).await;
        assert_eq!(stats.written, 2);
        assert_eq!(stats.failed, vec!["a.py".to_string()]);
        assert!(state.contains("b.py"));
        assert!(!dir.path().join("a.py").exists());
    }

    #[tokio::test]
    async fn test_syntax_error_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        let workshop = Arc::new(Workshop {
            repair: Some("def fixed():\n    return 1\n".into()),
            ..Workshop::with(&[("main.py", "def broken(:\n    return\n")])
        });

        let stats = run(workshop, &manifest(&["main.py"]), &mut state, SynthesisSettings::default()).await;
        assert_eq!(stats.lint_repairs, 1);
        assert_eq!(state.get("main.py").unwrap().content, "def fixed():\n    return 1\n");
    }

    #[tokio::test]
    async fn test_unrepairable_file_is_written_anyway() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        let workshop = Arc::new(Workshop {
            repair: Some("def still(:\n".into()),
            ..Workshop::with(&[("main.py", "def broken(:\n")])
        });
        let settings = SynthesisSettings {
            max_lint_attempts: 2,
            ..SynthesisSettings::default()
        };

        let stats = run(workshop, &manifest(&["main.py"]), &mut state, settings).await;
        assert_eq!(stats.lint_repairs, 2);
        assert_eq!(stats.written, 1);
        assert_eq!(state.get("main.py").unwrap().content, "def still(:\n");
    }

    #[tokio::test]
    async fn test_auto_fix_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        let workshop = Arc::new(Workshop::with(&[("main.py", "from moviepy.editor import VideoFileClip\n")]));

        let stats = run(workshop, &manifest(&["main.py"]), &mut state, SynthesisSettings::default()).await;
        assert_eq!(stats.auto_fixes, 1);
        assert_eq!(state.get("main.py").unwrap().content, "from moviepy import VideoFileClip\n");
    }

    #[tokio::test]
    async fn test_current_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        state.write("main.py", "print('kept')\n", 1).await.unwrap();
        let workshop = Arc::new(Workshop::with(&[("util.py", "X = 1\n")]));

        let stats = run(workshop.clone(), &manifest(&["main.py", "util.py"]), &mut state, SynthesisSettings::default()).await;
        assert_eq!(stats.resumed, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.files["main.py"], FileState::Resumed);
        assert_eq!(workshop.developer_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_focus_limits_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        let workshop = Arc::new(Workshop::with(&[("main.py", "print(1)\n"), ("api/routes.py", "R = []\n")]));
        let settings = SynthesisSettings {
            focus: Some(glob::Pattern::new("api/*").unwrap()),
            ..SynthesisSettings::default()
        };

        let stats = run(workshop, &manifest(&["main.py", "api/routes.py"]), &mut state, settings).await;
        assert_eq!(stats.written, 1);
        assert_eq!(stats.files["main.py"], FileState::OutOfFocus);
        assert!(state.contains("api/routes.py"));
    }
}
