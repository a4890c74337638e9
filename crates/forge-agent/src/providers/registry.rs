//! Provider families and model-name routing
//!
//! Every family speaks the OpenAI chat-completions dialect at its own base
//! URL. A model name is routed to the first family (in detection order)
//! owning one of its prefixes; anything unmatched goes to `openai`.

use std::collections::BTreeMap;

/// Family used when no prefix matches
pub const DEFAULT_FAMILY: &str = "openai";

/// Routing prefixes removed before the model name goes on the wire
const LOCAL_PREFIXES: [&str; 2] = ["local/", "ollama/"];

/// One backend family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFamily {
    /// Family id (`openai`, `groq`, ...)
    pub id: String,
    /// Human label for logs
    pub label: String,
    /// Chat-completions base URL (without `/chat/completions`)
    pub base_url: String,
    /// Env stem; keys come from `<STEM>_API_KEYS` or `<STEM>_API_KEY`
    pub env_stem: String,
    /// Lowercase model-name prefixes owned by this family
    pub prefixes: Vec<String>,
    /// Whether a request needs a credential
    pub requires_key: bool,
}

impl ProviderFamily {
    fn new(id: &str, label: &str, base_url: &str, prefixes: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            env_stem: id.to_ascii_uppercase(),
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            requires_key: true,
        }
    }

    fn owns(&self, model: &str) -> bool {
        self.prefixes.iter().any(|p| model.starts_with(p.as_str()))
    }
}

/// Ordered set of provider families
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    families: Vec<ProviderFamily>,
}

impl ProviderRegistry {
    /// The six standard families in detection order
    pub fn standard() -> Self {
        let mut ollama = ProviderFamily::new(
            "ollama",
            "Ollama (local)",
            "http://localhost:11434/v1",
            &["local/", "ollama", "mistral", "phi", "qwen", "codellama"],
        );
        ollama.requires_key = false;

        Self {
            families: vec![
                ProviderFamily::new(
                    "openrouter",
                    "OpenRouter",
                    "https://openrouter.ai/api/v1",
                    &["openrouter/", "meta-llama/", "google/", "mistralai/", "deepseek/"],
                ),
                ProviderFamily::new(
                    "anthropic",
                    "Anthropic",
                    "https://api.anthropic.com/v1",
                    &["claude"],
                ),
                ProviderFamily::new(
                    "gemini",
                    "Google Gemini",
                    "https://generativelanguage.googleapis.com/v1beta/openai",
                    &["gemini"],
                ),
                ProviderFamily::new(
                    "groq",
                    "Groq",
                    "https://api.groq.com/openai/v1",
                    &["llama", "gemma", "mixtral"],
                ),
                ollama,
                ProviderFamily::new(
                    "openai",
                    "OpenAI",
                    "https://api.openai.com/v1",
                    &["gpt-", "o1", "o3", "o4"],
                ),
            ],
        }
    }

    /// Replace base URLs (`family -> url`), ignoring unknown families
    pub fn with_base_urls(mut self, overrides: &BTreeMap<String, String>) -> Self {
        for (id, url) in overrides {
            match self.families.iter_mut().find(|f| &f.id == id) {
                Some(family) => family.base_url = url.trim_end_matches('/').to_string(),
                None => tracing::warn!(family = %id, "Ignoring override for unknown provider family"),
            }
        }
        self
    }

    /// Family owning `model`; unmatched names route to `openai`
    pub fn detect(&self, model: &str) -> Option<&ProviderFamily> {
        let lowered = model.to_ascii_lowercase();
        self.families
            .iter()
            .find(|f| f.owns(&lowered))
            .or_else(|| self.get(DEFAULT_FAMILY))
    }

    /// Family by id
    pub fn get(&self, id: &str) -> Option<&ProviderFamily> {
        self.families.iter().find(|f| f.id == id)
    }

    /// All families in detection order
    pub fn families(&self) -> impl Iterator<Item = &ProviderFamily> {
        self.families.iter()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Model name as the backend expects it (`local/qwen` -> `qwen`)
pub fn wire_model_name(model: &str) -> &str {
    LOCAL_PREFIXES
        .iter()
        .find_map(|prefix| model.strip_prefix(prefix))
        .unwrap_or(model)
}
