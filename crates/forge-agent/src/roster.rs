//! Model roster: which model serves which pipeline role

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline role issuing a synthesis call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Blueprint planning and packaging prose
    Architect,
    /// File synthesis, lint repair and patches
    Developer,
    /// Review judge
    Reviewer,
    /// Failure diagnosis
    Diagnoser,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Architect => "architect",
            Role::Developer => "developer",
            Role::Reviewer => "reviewer",
            Role::Diagnoser => "diagnoser",
        };
        f.write_str(name)
    }
}

/// Role -> model assignment with a cheap fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRoster {
    pub architect: String,
    pub developer: String,
    pub reviewer: String,
    pub diagnoser: String,
    /// Model every role moves to once the budget is exceeded
    pub fallback: String,
    #[serde(skip)]
    downgraded: bool,
}

impl ModelRoster {
    /// Every role on the same model
    pub fn uniform(model: impl Into<String>, fallback: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            architect: model.clone(),
            developer: model.clone(),
            reviewer: model.clone(),
            diagnoser: model,
            fallback: fallback.into(),
            downgraded: false,
        }
    }

    /// Model serving `role`
    pub fn model_for(&self, role: Role) -> &str {
        match role {
            Role::Architect => &self.architect,
            Role::Developer => &self.developer,
            Role::Reviewer => &self.reviewer,
            Role::Diagnoser => &self.diagnoser,
        }
    }

    /// Move every role to the fallback model; true only the first time
    pub fn downgrade_all(&mut self) -> bool {
        if self.downgraded {
            return false;
        }
        self.architect = self.fallback.clone();
        self.developer = self.fallback.clone();
        self.reviewer = self.fallback.clone();
        self.diagnoser = self.fallback.clone();
        self.downgraded = true;
        true
    }

    /// Whether the roster has been downgraded
    pub fn is_downgraded(&self) -> bool {
        self.downgraded
    }
}

impl Default for ModelRoster {
    fn default() -> Self {
        Self::uniform("gemini-2.0-flash", "local/qwen2.5-coder:7b")
    }
}
