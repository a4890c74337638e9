//! Code synthesis client
//!
//! One uniform call, `(model, directive, content) -> text`, over every
//! provider family. The client resolves the family from the model name,
//! takes a key from the shared [`KeyRing`], bounds each call with a
//! timeout and retries only on rate limits, rotating keys and backing off
//! exponentially between attempts.

use crate::key_pool::KeyRing;
use crate::providers::{
    wire_model_name, CompletionBackend, CompletionRequest, OpenAICompatibleBackend, ProviderRegistry,
};
use async_trait::async_trait;
use forge_core::error::SynthesisError;
use forge_core::text::strip_fences;
use std::sync::Arc;
use std::time::Duration;

/// Result of one successful synthesis call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    /// Completion text with code fences removed
    pub text: String,
    /// Model that produced it
    pub model: String,
    /// Prompt tokens (estimated when the backend reports none)
    pub input_tokens: u64,
    /// Completion tokens (estimated when the backend reports none)
    pub output_tokens: u64,
}

/// Anything that can answer a synthesis call
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Run `directive` (system) over `content` (user) on `model`
    async fn synthesize(
        &self,
        model: &str,
        directive: &str,
        content: &str,
    ) -> Result<Synthesis, SynthesisError>;
}

/// Rough token count for backends that omit usage
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Per-call deadline
    pub timeout: Duration,
    /// Extra attempts after a rate limit
    pub max_rate_limit_retries: u32,
    /// First backoff; doubles per attempt
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Sampling temperature
    pub temperature: f64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_rate_limit_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            temperature: 0.1,
        }
    }
}

/// Process-wide synthesis context: registry, key ring and transport
#[derive(Debug, Clone)]
pub struct SynthesisClient {
    registry: ProviderRegistry,
    keys: Arc<KeyRing>,
    backend: Arc<dyn CompletionBackend>,
    settings: ClientSettings,
}

impl SynthesisClient {
    /// Client over the HTTP backend with keys from the environment
    pub fn from_env(registry: ProviderRegistry, settings: ClientSettings) -> Self {
        let keys = Arc::new(KeyRing::from_env(&registry));
        Self::new(registry, keys, Arc::new(OpenAICompatibleBackend::new()), settings)
    }

    /// Client over an explicit backend and key ring
    pub fn new(
        registry: ProviderRegistry,
        keys: Arc<KeyRing>,
        backend: Arc<dyn CompletionBackend>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            registry,
            keys,
            backend,
            settings,
        }
    }

    /// Shared key ring
    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.settings
            .base_backoff
            .saturating_mul(factor)
            .min(self.settings.max_backoff)
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<Synthesis, SynthesisError> {
        let completion = tokio::time::timeout(self.settings.timeout, self.backend.complete(request))
            .await
            .map_err(|_| SynthesisError::Timeout(self.settings.timeout.as_secs()))??;

        let text = strip_fences(completion.text.trim());
        if text.trim().is_empty() {
            return Err(SynthesisError::EmptyResponse);
        }
        Ok(Synthesis {
            input_tokens: completion
                .input_tokens
                .unwrap_or_else(|| estimate_tokens(&request.system) + estimate_tokens(&request.user)),
            output_tokens: completion.output_tokens.unwrap_or_else(|| estimate_tokens(&text)),
            text,
            model: request.model.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for SynthesisClient {
    #[tracing::instrument(skip(self, directive, content), fields(family = tracing::field::Empty))]
    async fn synthesize(
        &self,
        model: &str,
        directive: &str,
        content: &str,
    ) -> Result<Synthesis, SynthesisError> {
        let family = self
            .registry
            .detect(model)
            .ok_or_else(|| SynthesisError::UnknownProvider(model.to_string()))?;
        tracing::Span::current().record("family", family.id.as_str());

        let attempts = 1 + self.settings.max_rate_limit_retries;
        let mut last_error = SynthesisError::EmptyResponse;

        for attempt in 0..attempts {
            let api_key = self.keys.next_key(&family.id);
            if api_key.is_none() && family.requires_key {
                return Err(SynthesisError::MissingCredentials(family.id.clone()));
            }

            let request = CompletionRequest {
                family: family.id.clone(),
                base_url: family.base_url.clone(),
                api_key: api_key.clone(),
                model: wire_model_name(model).to_string(),
                system: directive.to_string(),
                user: content.to_string(),
                temperature: self.settings.temperature,
                max_tokens: None,
            };

            match self.attempt(&request).await {
                Ok(mut synthesis) => {
                    synthesis.model = model.to_string();
                    tracing::debug!(
                        attempt = attempt + 1,
                        input_tokens = synthesis.input_tokens,
                        output_tokens = synthesis.output_tokens,
                        "Synthesis call succeeded"
                    );
                    return Ok(synthesis);
                }
                Err(e) if e.is_rate_limit() => {
                    if let Some(key) = &api_key {
                        self.keys.mark_limited(&family.id, key);
                    }
                    if attempt + 1 == attempts {
                        tracing::warn!(attempts, "Rate limited, retries exhausted");
                        return Err(e);
                    }
                    let wait = self.backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    last_error = e;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Synthesis call failed");
                    return Err(e);
                }
            }
        }
        Err(last_error)
    }
}
