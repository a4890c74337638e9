//! Scratch workspace
//!
//! A throwaway copy of the generated project that local-process runs
//! execute in, so a misbehaving program cannot scribble over the build
//! state. The directory is removed when the workspace is dropped.

use crate::error::{Result, SandboxError};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Entries never copied into a scratch workspace
const SKIPPED: [&str; 5] = [".git", "logs", "__pycache__", ".forge_state.json", "target"];

/// Ephemeral copy of a project directory
#[derive(Debug)]
pub struct ScratchWorkspace {
    /// Dropped (and deleted) with the workspace
    _temp_dir: TempDir,
    /// Root of the copy
    pub root_path: PathBuf,
}

impl ScratchWorkspace {
    /// Create an empty workspace
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::Builder::new().prefix("forge-sandbox-").tempdir()?;
        Ok(Self {
            root_path: temp_dir.path().to_path_buf(),
            _temp_dir: temp_dir,
        })
    }

    /// Create a workspace holding a filtered copy of `source_root`
    pub fn mirror(source_root: &Path) -> Result<Self> {
        let workspace = Self::new()?;
        workspace.mirror_project(source_root)?;
        Ok(workspace)
    }

    /// Write individual files into the workspace
    pub fn prepare(&self, files: &[(PathBuf, String)]) -> Result<()> {
        for (path, content) in files {
            let full_path = self.root_path.join(path);
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(full_path, content)?;
        }
        Ok(())
    }

    fn mirror_project(&self, source_root: &Path) -> Result<()> {
        for entry in WalkDir::new(source_root).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !SKIPPED.contains(&name.as_ref())
        }) {
            let entry = entry.map_err(|e| SandboxError::Mirror(e.to_string()))?;
            let path = entry.path();
            if path.is_file() {
                let relative_path = path
                    .strip_prefix(source_root)
                    .map_err(|e| SandboxError::Mirror(e.to_string()))?;
                let dest_path = self.root_path.join(relative_path);

                if let Some(parent) = dest_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(path, dest_path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_skips_state_and_logs() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("pkg")).unwrap();
        std::fs::create_dir_all(source.path().join("logs")).unwrap();
        std::fs::write(source.path().join("main.py"), "print(1)").unwrap();
        std::fs::write(source.path().join("pkg/mod.py"), "X = 1").unwrap();
        std::fs::write(source.path().join("logs/error_cycle_1.log"), "boom").unwrap();
        std::fs::write(source.path().join(".forge_state.json"), "{}").unwrap();

        let workspace = ScratchWorkspace::mirror(source.path()).unwrap();
        assert!(workspace.root_path.join("main.py").exists());
        assert!(workspace.root_path.join("pkg/mod.py").exists());
        assert!(!workspace.root_path.join("logs").exists());
        assert!(!workspace.root_path.join(".forge_state.json").exists());

        let root = workspace.root_path.clone();
        drop(workspace);
        assert!(!root.exists());
    }

    #[test]
    fn test_prepare_writes_nested_files() {
        let workspace = ScratchWorkspace::new().unwrap();
        workspace
            .prepare(&[(PathBuf::from("a/b/c.sh"), "echo hi".to_string())])
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(workspace.root_path.join("a/b/c.sh")).unwrap(),
            "echo hi"
        );
    }
}
