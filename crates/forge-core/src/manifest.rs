//! Build manifest
//!
//! The manifest is produced once by the planner and is read-only for the
//! rest of the build. It is persisted next to the generated project as
//! `blueprint.json` so an interrupted build can resume.

use crate::error::{PlanningError, Result};
use crate::platform::PlatformProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};

/// File name of the persisted manifest inside the project directory
pub const MANIFEST_FILE: &str = "blueprint.json";

/// One file the planner wants synthesized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    /// Project-relative path, `/` separated
    pub path: String,
    /// What the file must implement
    pub task: String,
}

/// Structured plan for the target codebase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Project name (also used as directory name)
    pub project_name: String,
    /// Stack descriptors (`python`, `fastapi`, ...)
    #[serde(default)]
    pub stack: Vec<String>,
    /// Optional full tree including non-synthesized entries
    #[serde(default)]
    pub file_tree: Vec<String>,
    /// Files to synthesize, in planner order
    pub files: Vec<FileTask>,
    /// Third-party dependencies
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Command that runs the assembled program
    pub run_command: String,
    /// Optional architecture diagram
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mermaid: Option<String>,
    /// Explicit entry-point file, when the planner names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

/// Lenient shape of what a planner backend returns
#[derive(Debug, Deserialize)]
struct RawBlueprint {
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    stack: serde_json::Value,
    #[serde(default)]
    file_tree: Vec<String>,
    #[serde(default)]
    files: Vec<RawFileTask>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    run_command: Option<String>,
    #[serde(default)]
    mermaid: Option<String>,
    #[serde(default)]
    entry_point: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFileTask {
    path: String,
    #[serde(default, alias = "description")]
    task: String,
}

impl BuildManifest {
    /// Build a validated manifest from a planner JSON object.
    ///
    /// Missing run commands fall back to the platform default. Paths are
    /// normalized (`./` and `\` removed) before uniqueness is checked.
    pub fn from_value(
        value: serde_json::Value,
        profile: &PlatformProfile,
    ) -> std::result::Result<Self, PlanningError> {
        let raw: RawBlueprint = serde_json::from_value(value)
            .map_err(|e| PlanningError::Unparseable(e.to_string()))?;

        let stack = match raw.stack {
            serde_json::Value::String(s) => s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect(),
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let run_command = raw
            .run_command
            .filter(|cmd| !cmd.trim().is_empty())
            .unwrap_or_else(|| profile.run_command.clone());

        let manifest = Self {
            project_name: raw
                .project_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| "forge_project".to_string()),
            stack,
            file_tree: raw.file_tree.iter().map(|p| normalize_path(p)).collect(),
            files: raw
                .files
                .into_iter()
                .map(|f| FileTask {
                    path: normalize_path(&f.path),
                    task: f.task,
                })
                .collect(),
            dependencies: raw.dependencies,
            run_command,
            mermaid: raw.mermaid,
            entry_point: raw.entry_point.map(|p| normalize_path(&p)),
        };

        manifest.validate()?;
        Ok(manifest)
    }

    /// Check structural invariants: non-empty, unique, project-relative paths
    pub fn validate(&self) -> std::result::Result<(), PlanningError> {
        if self.files.is_empty() {
            return Err(PlanningError::EmptyFileList);
        }
        if self.run_command.trim().is_empty() {
            return Err(PlanningError::MissingRunCommand);
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            if !is_safe_relative(&file.path) {
                return Err(PlanningError::UnsafePath(file.path.clone()));
            }
            if !seen.insert(file.path.as_str()) {
                return Err(PlanningError::DuplicatePath(file.path.clone()));
            }
        }
        Ok(())
    }

    /// Whether `path` is one of the planned files
    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// Task for a planned path
    pub fn task_for(&self, path: &str) -> Option<&FileTask> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Entry-point file, synthesized before everything else.
    ///
    /// Resolution order: explicit entry point, the run command argument that
    /// names a planned file, the profile default, the first planned file.
    pub fn entry_point(&self, profile: &PlatformProfile) -> &str {
        if let Some(entry) = self.entry_point.as_deref() {
            if self.contains(entry) {
                return self.task_for(entry).map(|t| t.path.as_str()).unwrap_or(entry);
            }
        }

        for token in self.run_command.split_whitespace() {
            let token = normalize_path(token);
            if let Some(task) = self.task_for(&token) {
                return &task.path;
            }
        }

        if let Some(task) = self.task_for(&profile.entry_point) {
            return &task.path;
        }

        &self.files[0].path
    }

    /// Planned files with the entry point moved to the front
    pub fn ordered_tasks(&self, profile: &PlatformProfile) -> Vec<&FileTask> {
        let entry = self.entry_point(profile);
        let mut ordered: Vec<&FileTask> = Vec::with_capacity(self.files.len());
        if let Some(task) = self.task_for(entry) {
            ordered.push(task);
        }
        ordered.extend(self.files.iter().filter(|f| f.path != entry));
        ordered
    }

    /// Compact plan description used in review and diagnosis prompts
    pub fn summary(&self) -> String {
        let mut out = format!("Project: {}\n", self.project_name);
        if !self.stack.is_empty() {
            out.push_str(&format!("Stack: {}\n", self.stack.join(", ")));
        }
        out.push_str(&format!("Run: {}\nFiles:\n", self.run_command));
        for file in &self.files {
            out.push_str(&format!("  - {}: {}\n", file.path, file.task));
        }
        if !self.dependencies.is_empty() {
            out.push_str(&format!("Dependencies: {}\n", self.dependencies.join(", ")));
        }
        out
    }

    /// Persist as `blueprint.json` inside `project_dir`
    pub async fn save(&self, project_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(project_dir).await?;
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(project_dir.join(MANIFEST_FILE), json).await?;
        Ok(())
    }

    /// Load a previously persisted manifest, if present
    pub async fn load(project_dir: &Path) -> Result<Option<Self>> {
        let path = project_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let manifest: Self = serde_json::from_str(&content)?;
        manifest.validate()?;
        Ok(Some(manifest))
    }
}

/// Normalize a planner path to project-relative `/` form
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}

fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blueprint() -> serde_json::Value {
        json!({
            "project_name": "weather_cli",
            "stack": "python, requests",
            "files": [
                {"path": "./utils.py", "task": "Helpers"},
                {"path": "main.py", "task": "Entry point"},
                {"path": "api\\client.py", "task": "HTTP client"}
            ],
            "dependencies": ["requests"],
            "run_command": "python main.py"
        })
    }

    #[test]
    fn test_from_value_normalizes_paths_and_stack() {
        let manifest = BuildManifest::from_value(blueprint(), &PlatformProfile::python()).unwrap();
        assert_eq!(manifest.stack, vec!["python", "requests"]);
        assert_eq!(manifest.files[0].path, "utils.py");
        assert_eq!(manifest.files[2].path, "api/client.py");
    }

    #[test]
    fn test_entry_point_is_ordered_first() {
        let profile = PlatformProfile::python();
        let manifest = BuildManifest::from_value(blueprint(), &profile).unwrap();
        assert_eq!(manifest.entry_point(&profile), "main.py");

        let order: Vec<&str> = manifest
            .ordered_tasks(&profile)
            .iter()
            .map(|t| t.path.as_str())
            .collect();
        assert_eq!(order, vec!["main.py", "utils.py", "api/client.py"]);
    }

    #[test]
    fn test_missing_run_command_uses_profile_default() {
        let value = json!({"files": [{"path": "index.js", "task": "server"}]});
        let manifest = BuildManifest::from_value(value, &PlatformProfile::node()).unwrap();
        assert_eq!(manifest.run_command, "node index.js");
        assert_eq!(manifest.project_name, "forge_project");
    }

    #[test]
    fn test_rejects_duplicates_and_escapes() {
        let profile = PlatformProfile::python();
        let dup = json!({"files": [{"path": "a.py", "task": ""}, {"path": "./a.py", "task": ""}]});
        assert!(matches!(
            BuildManifest::from_value(dup, &profile),
            Err(PlanningError::DuplicatePath(_))
        ));

        let escape = json!({"files": [{"path": "../etc/passwd", "task": ""}]});
        assert!(matches!(
            BuildManifest::from_value(escape, &profile),
            Err(PlanningError::UnsafePath(_))
        ));

        let empty = json!({"files": []});
        assert!(matches!(
            BuildManifest::from_value(empty, &profile),
            Err(PlanningError::EmptyFileList)
        ));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = BuildManifest::from_value(blueprint(), &PlatformProfile::python()).unwrap();
        manifest.save(dir.path()).await.unwrap();

        let loaded = BuildManifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(BuildManifest::load(&dir.path().join("missing")).await.unwrap().is_none());
    }
}
