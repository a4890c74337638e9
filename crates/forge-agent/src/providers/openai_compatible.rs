use async_trait::async_trait;
use forge_core::error::SynthesisError;
use serde::{Deserialize, Serialize};

/// One chat-completion request, fully resolved
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Provider family id (for error attribution)
    pub family: String,
    /// Base URL without `/chat/completions`
    pub base_url: String,
    /// Bearer credential, if the family needs one
    pub api_key: Option<String>,
    /// Model name as sent on the wire
    pub model: String,
    /// System message
    pub system: String,
    /// User message
    pub user: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Completion cap
    pub max_tokens: Option<u32>,
}

/// Raw completion text plus reported usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// First choice content
    pub text: String,
    /// Prompt tokens, when reported
    pub input_tokens: Option<u64>,
    /// Completion tokens, when reported
    pub output_tokens: Option<u64>,
}

/// Transport for chat completions
#[async_trait]
pub trait CompletionBackend: Send + Sync + std::fmt::Debug {
    /// Send one request
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, SynthesisError>;
}

/// HTTP backend for any OpenAI-compatible endpoint
#[derive(Debug, Clone, Default)]
pub struct OpenAICompatibleBackend {
    http_client: reqwest::Client,
}

impl OpenAICompatibleBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(base_url: &str) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Map a non-success status to an error; 429 and quota exhaustion are rate limits
fn status_error(family: &str, status: u16, body: String) -> SynthesisError {
    let lowered = body.to_ascii_lowercase();
    if status == 429 || lowered.contains("resource_exhausted") || lowered.contains("rate limit") {
        SynthesisError::RateLimited {
            provider: family.to_string(),
            message: body.chars().take(300).collect(),
        }
    } else {
        SynthesisError::Http {
            provider: family.to_string(),
            status,
            body: body.chars().take(500).collect(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAICompatibleBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, SynthesisError> {
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut builder = self
            .http_client
            .post(Self::endpoint(&request.base_url))
            .header("Content-Type", "application/json");
        if let Some(api_key) = &request.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(&request.family, status.as_u16(), error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| SynthesisError::Transport(format!("Malformed completion body: {}", e)))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: completion.usage.as_ref().and_then(|u| u.prompt_tokens),
            output_tokens: completion.usage.as_ref().and_then(|u| u.completion_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_mapping() {
        assert!(status_error("groq", 429, "slow down".into()).is_rate_limit());
        assert!(status_error("gemini", 400, "{\"status\": \"RESOURCE_EXHAUSTED\"}".into()).is_rate_limit());
        match status_error("openai", 401, "bad key".into()) {
            SynthesisError::Http { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_and_usage_parsing() {
        assert_eq!(
            OpenAICompatibleBackend::endpoint("https://api.groq.com/openai/v1/"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"print(1)"}}],
                "usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("print(1)"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, Some(3));
    }
}
