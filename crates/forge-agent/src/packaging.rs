//! Packaging: dependency file, README and `.env.example`

use crate::prompts;
use crate::roster::Role;
use crate::session::BuildContext;
use forge_core::error::Result;
use forge_core::manifest::BuildManifest;
use forge_core::platform::PlatformProfile;
use forge_core::state::CodebaseState;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

pub const README_FILE: &str = "README.md";
pub const ENV_EXAMPLE_FILE: &str = ".env.example";

lazy_static! {
    static ref ENV_REFERENCES: Vec<Regex> = vec![
        Regex::new(r#"os\.getenv\(\s*["']([A-Za-z_][A-Za-z0-9_]*)["']"#).unwrap(),
        Regex::new(r#"os\.environ\.get\(\s*["']([A-Za-z_][A-Za-z0-9_]*)["']"#).unwrap(),
        Regex::new(r#"os\.environ\[\s*["']([A-Za-z_][A-Za-z0-9_]*)["']\s*\]"#).unwrap(),
        Regex::new(r"process\.env\.([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
    ];
}

/// What packaging produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackagingReport {
    /// Written dependency file, if any
    pub dependency_file: Option<String>,
    pub readme_synthesized: bool,
    pub env_vars: Vec<String>,
}

/// Deduplicate case-insensitively (first spelling wins) and sort
pub fn normalize_dependencies(deps: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out: Vec<String> = deps
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .filter(|d| seen.insert(d.to_lowercase()))
        .map(str::to_string)
        .collect();
    out.sort_by_key(|d| d.to_lowercase());
    out
}

/// Render the dependency file for `profile`
pub fn render_dependency_file(manifest: &BuildManifest, profile: &PlatformProfile) -> Result<String> {
    let deps = normalize_dependencies(&manifest.dependencies);
    if profile.has_line_dependency_file() {
        let mut text = deps.join("\n");
        text.push('\n');
        return Ok(text);
    }

    let dependencies: serde_json::Map<String, serde_json::Value> = deps
        .into_iter()
        .map(|d| (d, serde_json::Value::String("*".into())))
        .collect();
    let package = serde_json::json!({
        "name": manifest.project_name.replace('_', "-"),
        "version": "1.0.0",
        "private": true,
        "dependencies": dependencies,
    });
    Ok(format!("{}\n", serde_json::to_string_pretty(&package)?))
}

/// Write the dependency file through the state, unless the plan already has one
pub async fn write_dependency_file(
    manifest: &BuildManifest,
    profile: &PlatformProfile,
    state: &mut CodebaseState,
) -> Result<Option<String>> {
    let path = profile.dependency_file.as_str();
    if manifest.contains(path) {
        tracing::debug!(path = %path, "Dependency file was planned, leaving it alone");
        return Ok(None);
    }
    if manifest.dependencies.is_empty() && profile.has_line_dependency_file() {
        return Ok(None);
    }
    let content = render_dependency_file(manifest, profile)?;
    state.write(path, &content, 0).await?;
    tracing::info!(path = %path, count = manifest.dependencies.len(), "Dependency file written");
    Ok(Some(path.to_string()))
}

/// Environment variable names referenced anywhere in the project
pub fn collect_env_vars(state: &CodebaseState) -> Vec<String> {
    let mut names = BTreeSet::new();
    for record in state.records() {
        for pattern in ENV_REFERENCES.iter() {
            for caps in pattern.captures_iter(&record.content) {
                names.insert(caps[1].to_string());
            }
        }
    }
    names.into_iter().collect()
}

fn env_example(project: &str, vars: &[String]) -> String {
    let mut out = format!("# Environment for {}\n", project);
    for var in vars {
        out.push_str(&format!("{}=\n", var));
    }
    out
}

/// README used when synthesis is unavailable
pub fn fallback_readme(manifest: &BuildManifest, profile: &PlatformProfile, env_vars: &[String]) -> String {
    let mut out = format!("# {}\n\n", manifest.project_name);
    if !manifest.stack.is_empty() {
        out.push_str(&format!("Built with {}.\n\n", manifest.stack.join(", ")));
    }
    out.push_str("## Files\n\n");
    for file in &manifest.files {
        out.push_str(&format!("- `{}`: {}\n", file.path, file.task));
    }
    if !manifest.dependencies.is_empty() {
        out.push_str(&format!(
            "\n## Setup\n\nInstall the dependencies listed in `{}`.\n",
            profile.dependency_file
        ));
    }
    out.push_str(&format!("\n## Run\n\n```\n{}\n```\n", manifest.run_command));
    if !env_vars.is_empty() {
        out.push_str(&format!("\n## Environment\n\nCopy `{}` to `.env` and fill in:\n\n", ENV_EXAMPLE_FILE));
        for var in env_vars {
            out.push_str(&format!("- `{}`\n", var));
        }
    }
    out
}

/// README and `.env.example`; failures here never fail the build
#[tracing::instrument(skip_all, fields(project = %manifest.project_name))]
pub async fn finalize(
    ctx: &BuildContext,
    manifest: &BuildManifest,
    profile: &PlatformProfile,
    state: &CodebaseState,
) -> PackagingReport {
    let root = state.root();
    let env_vars = collect_env_vars(state);
    let mut report = PackagingReport {
        env_vars: env_vars.clone(),
        ..PackagingReport::default()
    };

    if !env_vars.is_empty() {
        write_or_warn(root, ENV_EXAMPLE_FILE, &env_example(&manifest.project_name, &env_vars)).await;
    }

    if manifest.contains(README_FILE) {
        return report;
    }
    let content = format!(
        "{}\nEnvironment variables: {}\nDependency file: {}",
        manifest.summary(),
        if env_vars.is_empty() { "none".to_string() } else { env_vars.join(", ") },
        profile.dependency_file
    );
    let readme = match ctx.call(Role::Architect, &prompts::readme_directive(), &content).await {
        Ok(text) if !text.trim().is_empty() => {
            report.readme_synthesized = true;
            text
        }
        Ok(_) => fallback_readme(manifest, profile, &env_vars),
        Err(e) => {
            tracing::warn!(error = %e, "README synthesis failed, using template");
            fallback_readme(manifest, profile, &env_vars)
        }
    };
    write_or_warn(root, README_FILE, &readme).await;
    report
}

async fn write_or_warn(root: &Path, name: &str, content: &str) {
    if let Err(e) = tokio::fs::write(root.join(name), content).await {
        tracing::warn!(file = %name, "Could not write: {}", e);
    }
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
    use std::sync::Arc;

    fn manifest(extra: serde_json::Value) -> BuildManifest {
        let mut value = json!({
            "project_name": "weather_bot",
            "files": [{"path": "main.py", "task": "bot loop"}],
            "dependencies": ["requests", "Flask", "flask", "aiohttp", " Requests "],
            "run_command": "python main.py",
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        BuildManifest::from_value(value, &PlatformProfile::python()).unwrap()
    }

    #[derive(Debug)]
    struct Offline;

    #[async_trait]
    impl Synthesizer for Offline {
        async fn synthesize(&self, _: &str, _: &str, _: &str) -> std::result::Result<Synthesis, SynthesisError> {
            Err(SynthesisError::Timeout(120))
        }
    }

    #[test]
    fn test_dependencies_deduped_and_sorted() {
        let text = render_dependency_file(&manifest(json!({})), &PlatformProfile::python()).unwrap();
        assert_eq!(text, "aiohttp\nFlask\nrequests\n");
    }

    #[test]
    fn test_package_json_for_node() {
        let text = render_dependency_file(&manifest(json!({})), &PlatformProfile::node()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["name"], "weather-bot");
        assert_eq!(value["dependencies"].as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_planned_dependency_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        let planned = manifest(json!({"files": [
            {"path": "main.py", "task": "bot"},
            {"path": "requirements.txt", "task": "pins"}
        ]}));
        let written = write_dependency_file(&planned, &PlatformProfile::python(), &mut state)
            .await
            .unwrap();
        assert!(written.is_none());

        let written = write_dependency_file(&manifest(json!({})), &PlatformProfile::python(), &mut state)
            .await
            .unwrap();
        assert_eq!(written.as_deref(), Some("requirements.txt"));
        assert!(state.contains("requirements.txt"));
    }

    #[tokio::test]
    async fn test_env_example_and_fallback_readme() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        state
            .write(
                "main.py",
                "import os\nTOKEN = os.getenv(\"BOT_TOKEN\")\nKEY = os.environ['OPENWEATHER_KEY']\nDBG = os.environ.get('DEBUG')\n",
                0,
            )
            .await
            .unwrap();
        state.write("web.js", "const port = process.env.PORT;\n", 0).await.unwrap();

        let ctx = BuildContext::new(
            Arc::new(Offline),
            CostGovernor::new(1.0),
            ModelRoster::default(),
            Arc::new(ConstraintMemory::in_memory()),
        );
        let report = finalize(&ctx, &manifest(json!({})), &PlatformProfile::python(), &state).await;

        assert_eq!(report.env_vars, vec!["BOT_TOKEN", "DEBUG", "OPENWEATHER_KEY", "PORT"]);
        assert!(!report.readme_synthesized);
        let env = std::fs::read_to_string(dir.path().join(ENV_EXAMPLE_FILE)).unwrap();
        assert!(env.contains("BOT_TOKEN=\n"));
        let readme = std::fs::read_to_string(dir.path().join(README_FILE)).unwrap();
        assert!(readme.starts_with("# weather_bot"));
        assert!(readme.contains("python main.py"));
        assert!(readme.contains("`OPENWEATHER_KEY`"));
    }
}
