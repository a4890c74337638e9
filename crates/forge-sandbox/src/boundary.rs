//! Execution boundaries
//!
//! A boundary runs one shell command in a working directory under a
//! wall-clock limit and reports what it saw. Output is drained while the
//! process runs, so whatever was printed before a timeout kill is kept.
//! When the call returns, times out or is cancelled, the whole process
//! group is killed; container runs are also force-removed by name on
//! timeout or cancellation, so nothing outlives the call.

use crate::classify::RawOutcome;
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long output readers may linger after the process is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// Deadline for container housekeeping commands
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource limits applied by the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling (`512m`)
    pub memory: String,
    /// CPU quota (`1`)
    pub cpus: String,
    /// Whether the program may reach the network
    pub network: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "512m".into(),
            cpus: "1".into(),
            network: false,
        }
    }
}

/// One command to execute
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Shell command line
    pub command: String,
    /// Directory the command runs in
    pub working_directory: PathBuf,
    /// Limits for this run
    pub limits: ResourceLimits,
    /// Wall-clock limit
    pub timeout: Duration,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

/// Somewhere a command can run in isolation
#[async_trait]
pub trait ExecutionBoundary: Send + Sync + std::fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Run the request to completion or to its deadline
    async fn execute(&self, request: &ExecutionRequest) -> Result<RawOutcome>;
}

/// Local process boundary (`sh -c`)
#[derive(Debug, Clone)]
pub struct ProcessBoundary {
    shell: String,
}

impl ProcessBoundary {
    /// Boundary using `/bin/sh`
    pub fn new() -> Self {
        Self { shell: "sh".into() }
    }
}

impl Default for ProcessBoundary {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBoundary for ProcessBoundary {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<RawOutcome> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.working_directory)
            .envs(&request.env);
        capture(cmd, request.timeout, None).await
    }
}

/// Container boundary (`docker run --rm`)
#[derive(Debug, Clone)]
pub struct ContainerBoundary {
    runtime: String,
    image: String,
    startup_grace: Duration,
}

impl ContainerBoundary {
    /// Boundary running `image` with the given runtime binary
    pub fn new(runtime: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            startup_grace: Duration::from_secs(60),
        }
    }

    /// Extra time allowed for container start-up on top of the run timeout
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Whether the runtime answers `info` successfully
    pub async fn is_available(&self) -> bool {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(Duration::from_secs(10), cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }

    fn run_args(&self, name: &str, request: &ExecutionRequest) -> Result<Vec<String>> {
        let dir = std::fs::canonicalize(&request.working_directory)?;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if !request.limits.network {
            args.push("--network=none".to_string());
        }
        args.push(format!("--memory={}", request.limits.memory));
        args.push(format!("--cpus={}", request.limits.cpus));
        args.push("-v".to_string());
        args.push(format!("{}:/app", dir.display()));
        args.push("-w".to_string());
        args.push("/app".to_string());
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(request.command.clone());
        Ok(args)
    }
}

#[async_trait]
impl ExecutionBoundary for ContainerBoundary {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<RawOutcome> {
        let name = format!("forge-{}", uuid::Uuid::new_v4().simple());
        let mut cmd = Command::new(&self.runtime);
        cmd.args(self.run_args(&name, request)?);

        let container = ContainerHandle {
            runtime: self.runtime.clone(),
            name,
        };
        capture(cmd, request.timeout + self.startup_grace, Some(container)).await
    }
}

#[derive(Debug)]
struct ContainerHandle {
    runtime: String,
    name: String,
}

impl ContainerHandle {
    async fn force_remove(&self) {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(HOUSEKEEPING_TIMEOUT, cmd.status()).await {
            Ok(Ok(_)) => tracing::debug!(container = %self.name, "Container removed"),
            Ok(Err(e)) => tracing::warn!(container = %self.name, "Container removal failed: {}", e),
            Err(_) => tracing::warn!(container = %self.name, "Container removal timed out"),
        }
    }

    /// Fire-and-forget removal for contexts that cannot await
    fn spawn_remove(&self) {
        let spawned = std::process::Command::new(&self.runtime)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            tracing::warn!(container = %self.name, "Container removal failed: {}", e);
        }
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

async fn drain<R>(mut pipe: R, buffer: SharedBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend_from_slice(&chunk[..n]),
        }
    }
}

fn spawn_drain<R>(pipe: Option<R>, buffer: &SharedBuffer) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|pipe| tokio::spawn(drain(pipe, Arc::clone(buffer))))
}

async fn settle_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

fn take_text(buffer: &SharedBuffer) -> String {
    let bytes = buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    String::from_utf8_lossy(&bytes).to_string()
}

/// Kill every process in group `pgid`
#[cfg(unix)]
async fn kill_group(pgid: u32) {
    let _ = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

/// Cleans up whatever a run started, also when the run future is dropped
#[derive(Debug)]
struct Reaper {
    pgid: Option<u32>,
    container: Option<ContainerHandle>,
    armed: bool,
}

impl Reaper {
    /// Kill the group left behind by a finished run
    async fn reap(mut self, timed_out: bool) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            kill_group(pgid).await;
        }
        if timed_out {
            if let Some(container) = &self.container {
                container.force_remove().await;
            }
        }
        self.armed = false;
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(pgid = ?self.pgid, "Run cancelled - killing process group");
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            let _ = std::process::Command::new("kill")
                .args(["-KILL", "--", &format!("-{}", pgid)])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        if let Some(container) = &self.container {
            container.spawn_remove();
        }
    }
}

async fn capture(
    mut cmd: Command,
    timeout: Duration,
    container: Option<ContainerHandle>,
) -> Result<RawOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    let mut child = cmd
        .spawn()
        .map_err(|source| SandboxError::Spawn { program, source })?;
    let reaper = Reaper {
        pgid: child.id(),
        container,
        armed: true,
    };

    let stdout: SharedBuffer = Arc::default();
    let stderr: SharedBuffer = Arc::default();
    let readers: Vec<JoinHandle<()>> = [
        spawn_drain(child.stdout.take(), &stdout),
        spawn_drain(child.stderr.take(), &stderr),
    ]
    .into_iter()
    .flatten()
    .collect();

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            reaper.reap(false).await;
            let status = status?;
            settle_readers(readers).await;
            Ok(RawOutcome::Exited {
                code: status.code(),
                stdout: take_text(&stdout),
                stderr: take_text(&stderr),
            })
        }
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Deadline reached - killing process group");
            reaper.reap(true).await;
            if let Err(e) = child.kill().await {
                tracing::debug!("Child already gone: {}", e);
            }
            settle_readers(readers).await;
            Ok(RawOutcome::TimedOut {
                stdout: take_text(&stdout),
                stderr: take_text(&stderr),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, timeout: Duration) -> (tempfile::TempDir, ExecutionRequest) {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecutionRequest {
            command: command.to_string(),
            working_directory: dir.path().to_path_buf(),
            limits: ResourceLimits::default(),
            timeout,
            env: BTreeMap::new(),
        };
        (dir, request)
    }

    #[tokio::test]
    async fn test_process_exit_codes() {
        let (_dir, req) = request("echo out; echo err 1>&2; exit 3", Duration::from_secs(10));
        let outcome = ProcessBoundary::new().execute(&req).await.unwrap();
        assert_eq!(
            outcome,
            RawOutcome::Exited {
                code: Some(3),
                stdout: "out\n".into(),
                stderr: "err\n".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_process_timeout_keeps_partial_output() {
        let (_dir, req) = request("echo started; sleep 30", Duration::from_millis(500));
        let outcome = ProcessBoundary::new().execute(&req).await.unwrap();
        match outcome {
            RawOutcome::TimedOut { stdout, .. } => assert_eq!(stdout, "started\n"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_loop_times_out_without_output() {
        let (_dir, req) = request("while true; do :; done", Duration::from_millis(300));
        let outcome = ProcessBoundary::new().execute(&req).await.unwrap();
        assert_eq!(
            outcome,
            RawOutcome::TimedOut {
                stdout: String::new(),
                stderr: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_env_and_working_directory() {
        let (dir, mut req) = request("printf \"$GREETING\" > out.txt", Duration::from_secs(10));
        req.env.insert("GREETING".into(), "hello".into());
        ProcessBoundary::new().execute(&req).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello");
    }

    /// Live, non-zombie process
    #[cfg(target_os = "linux")]
    fn running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().chars().next() != Some('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn gone_soon(pid: &str) -> bool {
        for _ in 0..40 {
            if !running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_children_die_with_the_run() {
        let (dir, req) = request("sleep 30 & echo $! > pid.txt; echo done", Duration::from_secs(10));
        let outcome = ProcessBoundary::new().execute(&req).await.unwrap();
        assert!(matches!(outcome, RawOutcome::Exited { code: Some(0), .. }));

        let pid = std::fs::read_to_string(dir.path().join("pid.txt")).unwrap();
        assert!(gone_soon(pid.trim()).await, "background sleep {} outlived the run", pid.trim());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancelled_run_kills_its_group() {
        let (dir, req) = request("sleep 30 & echo $! > pid.txt; wait", Duration::from_secs(20));
        let boundary = ProcessBoundary::new();
        let cancelled = tokio::time::timeout(Duration::from_millis(500), boundary.execute(&req)).await;
        assert!(cancelled.is_err());

        let pid = std::fs::read_to_string(dir.path().join("pid.txt")).unwrap();
        assert!(gone_soon(pid.trim()).await, "background sleep {} outlived cancellation", pid.trim());
    }

    #[test]
    fn test_container_args() {
        let (_dir, mut req) = request("python main.py", Duration::from_secs(5));
        req.env.insert("PYTHONPATH".into(), ".forge_deps".into());
        let boundary = ContainerBoundary::new("docker", "python:3.12-slim");
        let args = boundary.run_args("forge-test", &req).unwrap();

        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"PYTHONPATH=.forge_deps".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("python main.py"));

        req.limits.network = true;
        let args = boundary.run_args("forge-test", &req).unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--network")));
    }
}
