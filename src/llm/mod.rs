//! Completion client.
//!
//! Wraps an external LLM provider behind the [`CompletionBackend`] seam.
//! Two wire formats are shipped: OpenAI-compatible `/chat/completions` and
//! Anthropic `/v1/messages`. The client layers retries with exponential
//! backoff + jitter, a per-attempt timeout, and the LLM circuit breaker on
//! top of whichever backend is configured.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    breaker::{BreakerError, CallOutcome, CircuitBreaker},
    config::{LlmConfig, LlmProviderKind},
    observability::metrics,
};

/// Message role in a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
}

/// One message of a completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Sampling parameters for one completion.
#[derive(Debug, Clone, Copy)]
pub struct CompletionParams {
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A completed LLM response with the provider-reported token counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Errors from completion calls.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("completion attempt timed out")]
    Timeout,

    #[error("failed to parse completion response: {0}")]
    Parse(String),

    #[error("provider returned no completion")]
    EmptyResponse,

    #[error(transparent)]
    CircuitOpen(#[from] BreakerError),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(_) | LlmError::Timeout => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// How this error counts against the LLM circuit breaker.
    fn breaker_outcome(&self) -> Option<CallOutcome> {
        match self {
            LlmError::Http(_) | LlmError::Timeout => Some(CallOutcome::Failure),
            LlmError::Status { status, .. } => match status {
                429 => Some(CallOutcome::RateLimited),
                500.. => Some(CallOutcome::Failure),
                _ => None,
            },
            LlmError::Parse(_) | LlmError::EmptyResponse | LlmError::CircuitOpen(_) => None,
        }
    }
}

/// Provider adapter seam. Implementations translate the neutral message
/// form into one provider's wire format.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        http: &Client,
        messages: &[ChatMessage],
        params: CompletionParams,
        timeout: Duration,
    ) -> Result<Completion, LlmError>;

    fn name(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-compatible backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct OpenAiBackend {
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(
        &self,
        http: &Client,
        messages: &[ChatMessage],
        params: CompletionParams,
        timeout: Duration,
    ) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAiRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let mut request = http.post(&url).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = send(request).await?;
        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        Ok(Completion {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    fn name(&self) -> &'static str {
        "open_ai"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct AnthropicBackend {
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    async fn complete(
        &self,
        http: &Client,
        messages: &[ChatMessage],
        params: CompletionParams,
        timeout: Duration,
    ) -> Result<Completion, LlmError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        // Anthropic takes the system prompt as a top-level field.
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str());
        let turns: Vec<AnthropicMessage<'_>> = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| AnthropicMessage {
                role: "user",
                content: &m.content,
            })
            .collect();

        let body = AnthropicRequest {
            model: &self.model,
            system,
            messages: turns,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let mut request = http
            .post(&url)
            .timeout(timeout)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = send(request).await?;
        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        let text = parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                AnthropicContent::Text { text } => Some(text),
                AnthropicContent::Other => None,
            })
            .ok_or(LlmError::EmptyResponse)?;

        Ok(Completion {
            text,
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

/// Send a request, folding transport errors and error statuses into
/// [`LlmError`].
async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, LlmError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Status { status, body });
    }

    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Completion client: backend + retry + breaker.
pub struct LlmClient {
    backend: Box<dyn CompletionBackend>,
    http: Client,
    config: LlmConfig,
    breaker: Arc<CircuitBreaker>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, http: Client, breaker: Arc<CircuitBreaker>) -> Self {
        let backend: Box<dyn CompletionBackend> = match config.provider {
            LlmProviderKind::OpenAi => Box::new(OpenAiBackend {
                base_url: config.base_url.clone(),
                api_key: config.api_key.clone(),
                model: config.model.clone(),
            }),
            LlmProviderKind::Anthropic => Box::new(AnthropicBackend {
                base_url: config.base_url.clone(),
                api_key: config.api_key.clone(),
                model: config.model.clone(),
            }),
        };
        Self {
            backend,
            http,
            config,
            breaker,
        }
    }

    /// Run one completion with retries. The breaker is checked once up
    /// front and records one outcome for the whole call.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        params: CompletionParams,
    ) -> Result<Completion, LlmError> {
        self.breaker.check()?;

        let attempt_timeout = Duration::from_secs(self.config.attempt_timeout_secs);
        let max_attempts = self.config.retry.max_retries + 1;
        let start = std::time::Instant::now();

        let mut attempt = 0;
        let result = loop {
            let result = self
                .backend
                .complete(&self.http, messages, params, attempt_timeout)
                .await;

            match result {
                Ok(completion) => break Ok(completion),
                Err(error) => {
                    if error.is_retryable() && attempt + 1 < max_attempts {
                        let delay = self.config.retry.delay_for_attempt(attempt);
                        warn!(
                            provider = self.backend.name(),
                            error = %error,
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "retryable completion error, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    break Err(error);
                }
            }
        };

        let duration = start.elapsed().as_secs_f64();
        match &result {
            Ok(completion) => {
                self.breaker.record(CallOutcome::Success);
                metrics::record_llm_request(
                    self.backend.name(),
                    "success",
                    duration,
                    Some(completion.prompt_tokens),
                    Some(completion.completion_tokens),
                );
                debug!(
                    provider = self.backend.name(),
                    prompt_tokens = completion.prompt_tokens,
                    completion_tokens = completion.completion_tokens,
                    duration_ms = (duration * 1000.0) as u64,
                    "completion succeeded"
                );
            }
            Err(error) => {
                if let Some(outcome) = error.breaker_outcome() {
                    self.breaker.record(outcome);
                }
                metrics::record_llm_request(self.backend.name(), "error", duration, None, None);
            }
        }

        result
    }

    /// Reachability check for readiness probes: any HTTP answer counts,
    /// only transport failures do not.
    pub async fn ping(&self) -> Result<(), LlmError> {
        self.http
            .get(&self.config.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(())
    }

    pub fn provider_name(&self) -> &'static str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    use super::*;
    use crate::config::{BreakerConfig, RetryConfig};

    fn test_client(url: &str, provider: LlmProviderKind) -> LlmClient {
        let config = LlmConfig {
            provider,
            base_url: url.to_string(),
            model: "test-model".to_string(),
            api_key: Some("sk-test".to_string()),
            attempt_timeout_secs: 5,
            retry: RetryConfig {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 4,
                jitter: 0.0,
            },
        };
        let breaker = Arc::new(CircuitBreaker::new("llm", &BreakerConfig::default()));
        LlmClient::new(config, Client::new(), breaker)
    }

    fn params() -> CompletionParams {
        CompletionParams {
            temperature: 0.2,
            max_tokens: 256,
        }
    }

    fn openai_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": text}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 45}
        })
    }

    #[tokio::test]
    async fn openai_completion_maps_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(
                serde_json::json!({"model": "test-model", "temperature": 0.2}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("Reboot it.")))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), LlmProviderKind::OpenAi);
        let completion = client
            .complete(&[ChatMessage::user("printer broken")], params())
            .await
            .unwrap();
        assert_eq!(completion.text, "Reboot it.");
        assert_eq!(completion.prompt_tokens, 120);
        assert_eq!(completion.completion_tokens, 45);
    }

    #[tokio::test]
    async fn anthropic_completion_lifts_system_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(body_partial_json(serde_json::json!({
                "system": "You are a helpdesk assistant.",
                "messages": [{"role": "user", "content": "printer broken"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "Reboot it."}],
                "usage": {"input_tokens": 80, "output_tokens": 12}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), LlmProviderKind::Anthropic);
        let completion = client
            .complete(
                &[
                    ChatMessage::system("You are a helpdesk assistant."),
                    ChatMessage::user("printer broken"),
                ],
                params(),
            )
            .await
            .unwrap();
        assert_eq!(completion.text, "Reboot it.");
        assert_eq!(completion.prompt_tokens, 80);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_up_to_twice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), LlmProviderKind::OpenAi);
        let completion = client
            .complete(&[ChatMessage::user("q")], params())
            .await
            .unwrap();
        assert_eq!(completion.text, "ok");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), LlmProviderKind::OpenAi);
        let err = client
            .complete(&[ChatMessage::user("q")], params())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 400, .. }));
        assert!(err.breaker_outcome().is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), LlmProviderKind::OpenAi);
        let err = client
            .complete(&[ChatMessage::user("q")], params())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_the_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_body("ok")))
            .expect(0)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), LlmProviderKind::OpenAi);
        for _ in 0..5 {
            client.breaker.record(CallOutcome::Failure);
        }
        let err = client
            .complete(&[ChatMessage::user("q")], params())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::CircuitOpen(_)));
    }
}
