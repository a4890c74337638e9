//! Scripted backend and sandbox for driving whole builds in-process

#![allow(dead_code)]

use async_trait::async_trait;
use forge_agent::{BuildOrchestrator, EngineConfig, ModelRoster, Synthesis, Synthesizer};
use forge_core::error::SynthesisError;
use forge_core::ConstraintMemory;
use forge_sandbox::{RawOutcome, SandboxResult, SandboxRunner};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RUN: &str = "python main.py";

/// One recorded synthesis call
#[derive(Debug, Clone)]
pub struct Call {
    pub kind: &'static str,
    pub model: String,
    pub content: String,
}

/// Replies routed by what the directive asks for
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    pub plans: Mutex<VecDeque<String>>,
    /// Successive drafts per path; the last one repeats
    pub drafts: Mutex<HashMap<String, VecDeque<String>>>,
    pub verdicts: Mutex<VecDeque<String>>,
    pub diagnoses: Mutex<VecDeque<String>>,
    pub patches: Mutex<VecDeque<String>>,
    pub input_tokens: u64,
    pub calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            input_tokens: 100,
            ..Self::default()
        }
    }

    pub fn plan(self, paths: &[&str]) -> Self {
        let files: Vec<_> = paths
            .iter()
            .map(|p| json!({"path": p, "task": format!("implement {}", p)}))
            .collect();
        let plan = json!({
            "project_name": "demo",
            "stack": ["python"],
            "files": files,
            "dependencies": ["requests"],
            "run_command": RUN,
        });
        self.plans.lock().unwrap().push_back(plan.to_string());
        self
    }

    pub fn raw_plan(self, text: &str) -> Self {
        self.plans.lock().unwrap().push_back(text.to_string());
        self
    }

    pub fn draft(self, path: &str, content: &str) -> Self {
        self.drafts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(content.to_string());
        self
    }

    pub fn verdict(self, raw: &str) -> Self {
        self.verdicts.lock().unwrap().push_back(raw.to_string());
        self
    }

    pub fn rejection(self, description: &str) -> Self {
        let raw = json!({
            "status": "REJECTED",
            "reason": description,
            "issues": [{"severity": "high", "description": description, "fix": "fix it"}],
        });
        self.verdict(&raw.to_string())
    }

    pub fn diagnosis(self, file: &str, instruction: &str) -> Self {
        let raw = json!({"root_cause": "bug", "fix_file": file, "fix_instruction": instruction});
        self.diagnoses.lock().unwrap().push_back(raw.to_string());
        self
    }

    pub fn patch(self, content: &str) -> Self {
        self.patches.lock().unwrap().push_back(content.to_string());
        self
    }

    pub fn tokens(mut self, input_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self
    }

    pub fn calls_of(&self, kind: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn models(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.model.clone()).collect()
    }

    fn reply(&self, kind: &'static str, content: &str) -> Result<String, SynthesisError> {
        match kind {
            "plan" => self.plans.lock().unwrap().pop_front().ok_or(SynthesisError::EmptyResponse),
            "review" => Ok(self
                .verdicts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| r#"{"status": "APPROVED", "reason": "ok"}"#.to_string())),
            "diagnose" => self.diagnoses.lock().unwrap().pop_front().ok_or(SynthesisError::EmptyResponse),
            "readme" => Ok("# demo\n".to_string()),
            "patch" => self.patches.lock().unwrap().pop_front().ok_or(SynthesisError::EmptyResponse),
            _ => {
                let path = content
                    .lines()
                    .next()
                    .and_then(|l| l.strip_prefix("FILE: "))
                    .unwrap_or_default()
                    .to_string();
                let mut drafts = self.drafts.lock().unwrap();
                let queue = drafts.get_mut(&path).ok_or(SynthesisError::EmptyResponse)?;
                if queue.len() > 1 {
                    queue.pop_front().ok_or(SynthesisError::EmptyResponse)
                } else {
                    queue.front().cloned().ok_or(SynthesisError::EmptyResponse)
                }
            }
        }
    }
}

fn kind_of(directive: &str, content: &str) -> &'static str {
    if directive.contains("software architect") {
        "plan"
    } else if directive.contains("code reviewer") {
        "review"
    } else if directive.contains("diagnose") {
        "diagnose"
    } else if directive.contains("READMEs") {
        "readme"
    } else if content.starts_with("The program FAILED") {
        "patch"
    } else {
        "develop"
    }
}

#[async_trait]
impl Synthesizer for ScriptedBackend {
    async fn synthesize(&self, model: &str, directive: &str, content: &str) -> Result<Synthesis, SynthesisError> {
        let kind = kind_of(directive, content);
        self.calls.lock().unwrap().push(Call {
            kind,
            model: model.to_string(),
            content: content.to_string(),
        });
        let text = self.reply(kind, content)?;
        Ok(Synthesis {
            text,
            model: model.to_string(),
            input_tokens: self.input_tokens,
            output_tokens: 0,
        })
    }
}

/// Sandbox that replays canned results; succeeds once the script runs out
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    pub results: Mutex<VecDeque<SandboxResult>>,
    pub runs: Mutex<Vec<PathBuf>>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<SandboxResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            runs: Mutex::default(),
        }
    }

    pub fn always(result: SandboxResult, times: usize) -> Self {
        Self::new(vec![result; times])
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxRunner for ScriptedSandbox {
    async fn run(&self, project_dir: &Path, _: &str) -> SandboxResult {
        self.runs.lock().unwrap().push(project_dir.to_path_buf());
        self.results.lock().unwrap().pop_front().unwrap_or_else(success)
    }

    fn boundary_name(&self) -> &'static str {
        "scripted"
    }
}

const TIMEOUT: Duration = Duration::from_secs(30);

pub fn success() -> SandboxResult {
    SandboxResult::classify(
        RUN,
        RawOutcome::Exited {
            code: Some(0),
            stdout: "ready\n".into(),
            stderr: String::new(),
        },
        TIMEOUT,
    )
}

pub fn crash(file: &str) -> SandboxResult {
    SandboxResult::classify(
        RUN,
        RawOutcome::Exited {
            code: Some(1),
            stdout: String::new(),
            stderr: format!(
                "Traceback (most recent call last):\n  File \"{}\", line 3, in <module>\nNameError: name 'clock' is not defined\n",
                file
            ),
        },
        TIMEOUT,
    )
}

pub fn hang() -> SandboxResult {
    SandboxResult::classify(
        RUN,
        RawOutcome::TimedOut {
            stdout: String::new(),
            stderr: String::new(),
        },
        TIMEOUT,
    )
}

pub fn config() -> EngineConfig {
    EngineConfig {
        models: ModelRoster::uniform("gpt-4o", "local/qwen2.5-coder:7b"),
        ..EngineConfig::default()
    }
}

pub fn orchestrator(
    config: EngineConfig,
    backend: &Arc<ScriptedBackend>,
    sandbox: &Arc<ScriptedSandbox>,
    constraints: &Arc<ConstraintMemory>,
) -> BuildOrchestrator {
    BuildOrchestrator::new(config, backend.clone(), sandbox.clone(), constraints.clone()).unwrap()
}
