//! Engine configuration
//!
//! Everything has a default, so an empty `forge.toml` (or none at all) is
//! valid. Credentials never live here; they come from the environment.
//!
//! ```toml
//! budget = 2.0
//! max_fix_cycles = 3
//! platform = "python"
//!
//! [models]
//! architect = "gemini-2.0-flash"
//! reviewer = "claude-sonnet-4-20250514"
//! fallback = "local/qwen2.5-coder:7b"
//!
//! [sandbox]
//! mode = "auto"
//! memory = "512m"
//!
//! [providers.ollama]
//! base_url = "http://gpu-box:11434/v1"
//! ```

use crate::client::ClientSettings;
use crate::providers::ProviderRegistry;
use crate::roster::ModelRoster;
use anyhow::{Context, Result};
use forge_core::context::DEFAULT_CONTEXT_BUDGET;
use forge_core::platform::PlatformProfile;
use forge_sandbox::{ResourceLimits, SandboxConfig, SandboxMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default constraint store location
pub const DEFAULT_CONSTRAINTS_PATH: &str = "forge_constraints.json";

/// Sandbox section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub mode: SandboxMode,
    pub runtime: String,
    /// Overrides the platform profile's image
    pub image: Option<String>,
    pub memory: String,
    pub cpus: String,
    pub network: bool,
    pub timeout_secs: u64,
    pub install_timeout_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            mode: SandboxMode::Auto,
            runtime: "docker".into(),
            image: None,
            memory: limits.memory,
            cpus: limits.cpus,
            network: limits.network,
            timeout_secs: 30,
            install_timeout_secs: 120,
        }
    }
}

/// Per-family endpoint override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOverride {
    pub base_url: String,
}

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub models: ModelRoster,
    /// USD ceiling before the roster is downgraded
    pub budget: f64,
    pub max_fix_cycles: u32,
    pub max_review_attempts: u32,
    pub max_lint_attempts: u32,
    pub context_budget_chars: usize,
    pub synthesis_timeout_secs: u64,
    /// Refuse to start once today's spend reaches this
    pub daily_spend_cap: Option<f64>,
    pub platform: String,
    pub sandbox: SandboxSettings,
    pub constraints_path: PathBuf,
    pub providers: BTreeMap<String, ProviderOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models: ModelRoster::default(),
            budget: 5.0,
            max_fix_cycles: 3,
            max_review_attempts: 3,
            max_lint_attempts: 3,
            context_budget_chars: DEFAULT_CONTEXT_BUDGET,
            synthesis_timeout_secs: 120,
            daily_spend_cap: None,
            platform: "python".into(),
            sandbox: SandboxSettings::default(),
            constraints_path: PathBuf::from(DEFAULT_CONSTRAINTS_PATH),
            providers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config at {:?}", path))?;
        Self::from_toml_str(&text).with_context(|| format!("In {:?}", path))
    }

    /// Load `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values no build could run with
    pub fn validate(&self) -> Result<()> {
        if !self.budget.is_finite() || self.budget < 0.0 {
            anyhow::bail!("budget must be a non-negative number, got {}", self.budget);
        }
        if self.max_review_attempts == 0 || self.max_lint_attempts == 0 {
            anyhow::bail!("max_review_attempts and max_lint_attempts must be at least 1");
        }
        if self.sandbox.timeout_secs == 0 {
            anyhow::bail!("sandbox.timeout_secs must be at least 1");
        }
        if let Some(cap) = self.daily_spend_cap {
            if !cap.is_finite() || cap < 0.0 {
                anyhow::bail!("daily_spend_cap must be a non-negative number, got {}", cap);
            }
        }
        Ok(())
    }

    /// Platform profile named by `platform`
    pub fn profile(&self) -> forge_core::Result<PlatformProfile> {
        PlatformProfile::by_name(&self.platform)
    }

    /// Sandbox supervisor settings for `profile`
    pub fn sandbox_config(&self, profile: &PlatformProfile) -> SandboxConfig {
        let mut config = SandboxConfig::for_profile(profile);
        config.mode = self.sandbox.mode;
        config.runtime = self.sandbox.runtime.clone();
        if let Some(image) = &self.sandbox.image {
            config.image = image.clone();
        }
        config.limits = ResourceLimits {
            memory: self.sandbox.memory.clone(),
            cpus: self.sandbox.cpus.clone(),
            network: self.sandbox.network,
        };
        config.timeout = Duration::from_secs(self.sandbox.timeout_secs);
        config.install_timeout = Duration::from_secs(self.sandbox.install_timeout_secs);
        config
    }

    /// Synthesis client settings
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            timeout: Duration::from_secs(self.synthesis_timeout_secs),
            ..ClientSettings::default()
        }
    }

    /// Provider registry with endpoint overrides applied
    pub fn registry(&self) -> ProviderRegistry {
        let overrides: BTreeMap<String, String> = self
            .providers
            .iter()
            .map(|(name, o)| (name.clone(), o.base_url.clone()))
            .collect();
        ProviderRegistry::standard().with_base_urls(&overrides)
    }
}
