//! Platform profiles
//!
//! A profile tells the planner what kind of project to lay out and tells
//! the sandbox how to install dependencies and which image to run in.

use crate::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Directory dependencies are installed into, inside the project
pub const DEPENDENCY_DIR: &str = ".forge_deps";

/// Target platform for a generated codebase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProfile {
    /// Profile key (`python`, `linux`, `node`)
    pub name: String,
    /// Human label
    pub label: String,
    /// Constraint appended to the planning directive
    pub arch_directive: String,
    /// Extensions the generated sources use
    pub file_extensions: Vec<String>,
    /// Run command used when the manifest omits one
    pub run_command: String,
    /// Dependency manifest file written during packaging
    pub dependency_file: String,
    /// Command that installs dependencies from `dependency_file`
    pub install_command: String,
    /// Container image for the sandbox
    pub container_image: String,
    /// Default entry-point file
    pub entry_point: String,
    /// Environment the program runs with (makes installed dependencies visible)
    #[serde(default)]
    pub run_env: BTreeMap<String, String>,
}

impl PlatformProfile {
    /// Standard Python application (default profile)
    pub fn python() -> Self {
        Self {
            name: "python".into(),
            label: "Python".into(),
            arch_directive: "Target: standard Python 3.11+ application. Entry point: main.py. \
                             Dependencies in requirements.txt."
                .into(),
            file_extensions: vec![".py".into()],
            run_command: "python main.py".into(),
            dependency_file: "requirements.txt".into(),
            install_command: format!(
                "pip install -q --disable-pip-version-check --target {} -r requirements.txt",
                DEPENDENCY_DIR
            ),
            container_image: "python:3.12-slim".into(),
            entry_point: "main.py".into(),
            run_env: BTreeMap::from([("PYTHONPATH".to_string(), DEPENDENCY_DIR.to_string())]),
        }
    }

    /// Linux desktop application written in Python
    pub fn linux() -> Self {
        Self {
            name: "linux".into(),
            label: "Linux Desktop (Python)".into(),
            arch_directive: "Target: native Linux desktop application in Python 3.11+. \
                             Include a .desktop file and an install.sh script. Entry point: main.py."
                .into(),
            file_extensions: vec![".py".into(), ".desktop".into(), ".sh".into()],
            run_command: "python3 main.py".into(),
            ..Self::python()
        }
    }

    /// Node.js service
    pub fn node() -> Self {
        Self {
            name: "node".into(),
            label: "Node.js".into(),
            arch_directive: "Target: Node.js 20 application using CommonJS or ES modules. \
                             Entry point: index.js. Dependencies in package.json."
                .into(),
            file_extensions: vec![".js".into(), ".mjs".into(), ".json".into()],
            run_command: "node index.js".into(),
            dependency_file: "package.json".into(),
            install_command: "npm install --silent".into(),
            container_image: "node:20-slim".into(),
            entry_point: "index.js".into(),
            run_env: BTreeMap::new(),
        }
    }

    /// Look up a profile by name
    pub fn by_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "python" | "" => Ok(Self::python()),
            "linux" => Ok(Self::linux()),
            "node" | "nodejs" => Ok(Self::node()),
            other => Err(ForgeError::UnknownPlatform(other.to_string())),
        }
    }

    /// Whether dependency entries are plain lines that can be deduplicated
    pub fn has_line_dependency_file(&self) -> bool {
        self.dependency_file.ends_with(".txt")
    }
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self::python()
    }
}
