//! Forge Sandbox - isolated execution of generated projects
//!
//! The [`SandboxSupervisor`] runs a project's run command inside an
//! [`ExecutionBoundary`] (a resource-limited container when one is
//! available, a local process in a scratch copy otherwise), enforces a
//! wall-clock limit and classifies the outcome as exactly one of
//! `SUCCESS`, `RUNTIME_ERROR`, `TIMEOUT` or `HANG`.
//!
//! Dependencies listed in the project's dependency file are installed in a
//! separate step before the run. That step may use the network; the run
//! itself never does unless configured otherwise.

#![deny(unsafe_code)]

pub mod boundary;
pub mod classify;
pub mod error;
pub mod workspace;

pub use boundary::{
    ContainerBoundary, ExecutionBoundary, ExecutionRequest, ProcessBoundary, ResourceLimits,
};
pub use classify::{extract_error_summary, RawOutcome, SandboxClassification, SandboxResult};
pub use error::{Result, SandboxError};
pub use workspace::ScratchWorkspace;

use async_trait::async_trait;
use forge_core::platform::PlatformProfile;
use forge_core::state::content_hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Directory (inside the project) holding per-cycle run logs
pub const LOG_DIR: &str = "logs";

/// Which boundary the supervisor should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Container when the runtime answers, local process otherwise
    #[default]
    Auto,
    /// Always a container
    Container,
    /// Always a local process
    Process,
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Boundary selection
    pub mode: SandboxMode,
    /// Container runtime binary
    pub runtime: String,
    /// Container image
    pub image: String,
    /// Limits for the program run
    pub limits: ResourceLimits,
    /// Wall-clock limit for the program run
    pub timeout: Duration,
    /// Wall-clock limit for the dependency install
    pub install_timeout: Duration,
    /// Dependency file checked before each run
    pub dependency_file: Option<String>,
    /// Command installing from `dependency_file`
    pub install_command: Option<String>,
    /// Environment for the program run
    pub env: BTreeMap<String, String>,
}

impl SandboxConfig {
    /// Settings matching a platform profile
    pub fn for_profile(profile: &PlatformProfile) -> Self {
        Self {
            image: profile.container_image.clone(),
            dependency_file: Some(profile.dependency_file.clone()),
            install_command: Some(profile.install_command.clone()),
            env: profile.run_env.clone(),
            ..Self::default()
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Auto,
            runtime: "docker".into(),
            image: "python:3.12-slim".into(),
            limits: ResourceLimits::default(),
            timeout: Duration::from_secs(30),
            install_timeout: Duration::from_secs(120),
            dependency_file: None,
            install_command: None,
            env: BTreeMap::new(),
        }
    }
}

/// Anything that can execute a project and classify the outcome
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Run `command` against the project in `project_dir`
    async fn run(&self, project_dir: &Path, command: &str) -> SandboxResult;

    /// Short label of the execution boundary
    fn boundary_name(&self) -> &'static str;
}

/// Runs generated projects behind an execution boundary
#[derive(Debug)]
pub struct SandboxSupervisor {
    config: SandboxConfig,
    boundary: Arc<dyn ExecutionBoundary>,
    /// Hash of the dependency file at the last successful install
    installed: Mutex<Option<String>>,
}

impl SandboxSupervisor {
    /// Resolve the boundary from the configured mode
    pub async fn detect(config: SandboxConfig) -> Result<Self> {
        let container = ContainerBoundary::new(&config.runtime, &config.image);
        let boundary: Arc<dyn ExecutionBoundary> = match config.mode {
            SandboxMode::Process => Arc::new(ProcessBoundary::new()),
            SandboxMode::Container => {
                if !container.is_available().await {
                    return Err(SandboxError::RuntimeUnavailable(config.runtime.clone()));
                }
                Arc::new(container)
            }
            SandboxMode::Auto => {
                if container.is_available().await {
                    Arc::new(container)
                } else {
                    tracing::warn!(
                        runtime = %config.runtime,
                        "Container runtime unavailable - falling back to local process execution"
                    );
                    Arc::new(ProcessBoundary::new())
                }
            }
        };
        tracing::info!(boundary = boundary.name(), "Sandbox boundary selected");
        Ok(Self::with_boundary(config, boundary))
    }

    /// Supervisor over an explicit boundary
    pub fn with_boundary(config: SandboxConfig, boundary: Arc<dyn ExecutionBoundary>) -> Self {
        Self {
            config,
            boundary,
            installed: Mutex::new(None),
        }
    }

    /// Active settings
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn isolates_in_scratch(&self) -> bool {
        self.boundary.name() == "process"
    }

    /// Install dependencies when the dependency file changed since the last install
    async fn install_dependencies(&self, project_dir: &Path) {
        let (Some(file), Some(command)) =
            (&self.config.dependency_file, &self.config.install_command)
        else {
            return;
        };
        let Ok(content) = tokio::fs::read_to_string(project_dir.join(file)).await else {
            return;
        };
        if content.trim().is_empty() {
            return;
        }

        let hash = content_hash(&content);
        let mut installed = self.installed.lock().await;
        if installed.as_deref() == Some(hash.as_str()) {
            return;
        }

        tracing::info!(file = %file, "Installing dependencies");
        let request = ExecutionRequest {
            command: command.clone(),
            working_directory: project_dir.to_path_buf(),
            limits: ResourceLimits {
                network: true,
                ..self.config.limits.clone()
            },
            timeout: self.config.install_timeout,
            env: BTreeMap::new(),
        };
        match self.boundary.execute(&request).await {
            Ok(RawOutcome::Exited { code: Some(0), .. }) => {
                *installed = Some(hash);
            }
            Ok(RawOutcome::Exited { stderr, .. }) => {
                tracing::warn!(
                    "Dependency install failed, running anyway: {}",
                    extract_error_summary(&stderr)
                );
            }
            Ok(RawOutcome::TimedOut { .. }) => {
                tracing::warn!(
                    timeout_secs = self.config.install_timeout.as_secs(),
                    "Dependency install timed out, running anyway"
                );
            }
            Err(e) => tracing::warn!("Dependency install could not start: {}", e),
        }
    }

    async fn execute(&self, project_dir: &Path, command: &str) -> Result<RawOutcome> {
        self.install_dependencies(project_dir).await;

        let scratch = if self.isolates_in_scratch() {
            Some(ScratchWorkspace::mirror(project_dir)?)
        } else {
            None
        };
        let working_directory = scratch
            .as_ref()
            .map(|s| s.root_path.clone())
            .unwrap_or_else(|| project_dir.to_path_buf());

        let request = ExecutionRequest {
            command: command.to_string(),
            working_directory,
            limits: self.config.limits.clone(),
            timeout: self.config.timeout,
            env: self.config.env.clone(),
        };
        self.boundary.execute(&request).await
    }
}

#[async_trait]
impl SandboxRunner for SandboxSupervisor {
    async fn run(&self, project_dir: &Path, command: &str) -> SandboxResult {
        tracing::info!(command = %command, boundary = self.boundary.name(), "Executing project");
        let result = match self.execute(project_dir, command).await {
            Ok(raw) => SandboxResult::classify(command, raw, self.config.timeout),
            Err(e) => {
                tracing::error!("Sandbox boundary failure: {}", e);
                SandboxResult::boundary_failure(command, format!("Sandbox failure: {}", e))
            }
        };
        tracing::info!(classification = %result.classification, "Execution finished");
        result
    }

    fn boundary_name(&self) -> &'static str {
        self.boundary.name()
    }
}

/// Persist the full output of one run attempt to `logs/error_cycle_<n>.log`
pub async fn write_cycle_log(
    project_dir: &Path,
    cycle: u32,
    result: &SandboxResult,
) -> std::io::Result<PathBuf> {
    let dir = project_dir.join(LOG_DIR);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("error_cycle_{}.log", cycle));

    let return_code = result
        .return_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    let body = format!(
        "=== RUN CYCLE {cycle} ({time}) ===\n\
         Command: {command}\n\
         Return code: {return_code}\n\
         Classification: {classification}\n\n\
         STDOUT:\n{stdout}\n\n\
         STDERR:\n{stderr}\n\n\
         ERROR SUMMARY:\n{summary}\n",
        time = chrono::Utc::now().to_rfc3339(),
        command = result.command,
        classification = result.classification,
        stdout = result.stdout,
        stderr = result.stderr,
        summary = result.error_summary,
    );
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_supervisor(timeout: Duration) -> SandboxSupervisor {
        let config = SandboxConfig {
            mode: SandboxMode::Process,
            timeout,
            ..SandboxConfig::default()
        };
        SandboxSupervisor::with_boundary(config, Arc::new(ProcessBoundary::new()))
    }

    #[tokio::test]
    async fn test_success_in_scratch_copy() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("run.sh"), "echo built > made.txt; echo ok").unwrap();

        let supervisor = process_supervisor(Duration::from_secs(10));
        let result = supervisor.run(project.path(), "sh run.sh").await;

        assert!(result.success);
        assert_eq!(result.stdout.trim(), "ok");
        // the run happened in a copy
        assert!(!project.path().join("made.txt").exists());
    }

    #[tokio::test]
    async fn test_runtime_error_summary() {
        let project = tempfile::tempdir().unwrap();
        let supervisor = process_supervisor(Duration::from_secs(10));
        let result = supervisor
            .run(project.path(), "echo 'ERROR: missing token' 1>&2; exit 4")
            .await;

        assert_eq!(result.classification, SandboxClassification::RuntimeError);
        assert_eq!(result.return_code, Some(4));
        assert_eq!(result.error_summary, "ERROR: missing token");
    }

    #[tokio::test]
    async fn test_hang_and_timeout() {
        let project = tempfile::tempdir().unwrap();
        let supervisor = process_supervisor(Duration::from_millis(400));

        let hang = supervisor.run(project.path(), "sleep 20").await;
        assert_eq!(hang.classification, SandboxClassification::Hang);

        let slow = supervisor.run(project.path(), "echo working; sleep 20").await;
        assert_eq!(slow.classification, SandboxClassification::Timeout);
        assert_eq!(slow.stdout.trim(), "working");
    }

    #[tokio::test]
    async fn test_install_runs_once_per_dependency_change() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("deps.txt"), "requests\n").unwrap();

        let config = SandboxConfig {
            mode: SandboxMode::Process,
            dependency_file: Some("deps.txt".into()),
            install_command: Some("echo x >> installs.log".into()),
            ..SandboxConfig::default()
        };
        let supervisor = SandboxSupervisor::with_boundary(config, Arc::new(ProcessBoundary::new()));

        supervisor.run(project.path(), "true").await;
        supervisor.run(project.path(), "true").await;
        let log = std::fs::read_to_string(project.path().join("installs.log")).unwrap();
        assert_eq!(log.lines().count(), 1);

        std::fs::write(project.path().join("deps.txt"), "requests\nrich\n").unwrap();
        supervisor.run(project.path(), "true").await;
        let log = std::fs::read_to_string(project.path().join("installs.log")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_cycle_log_written() {
        let project = tempfile::tempdir().unwrap();
        let result = SandboxResult::classify(
            "python main.py",
            RawOutcome::Exited {
                code: Some(1),
                stdout: "partial".into(),
                stderr: "ValueError: bad".into(),
            },
            Duration::from_secs(30),
        );
        let path = write_cycle_log(project.path(), 2, &result).await.unwrap();

        assert!(path.ends_with("logs/error_cycle_2.log"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("Return code: 1"));
        assert!(text.contains("Classification: RUNTIME_ERROR"));
        assert!(text.contains("ValueError: bad"));
    }

    #[test]
    fn test_config_for_profile() {
        let config = SandboxConfig::for_profile(&PlatformProfile::node());
        assert_eq!(config.image, "node:20-slim");
        assert_eq!(config.dependency_file.as_deref(), Some("package.json"));
        assert!(!config.limits.network);
    }
}
