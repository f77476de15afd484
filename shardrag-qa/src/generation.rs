//! The language-generation collaborator.
//!
//! [`Generator`] is the seam the orchestrator talks to. [`OpenAiGenerator`] is
//! the production implementation: a non-streaming client for an
//! OpenAI-compatible `/chat/completions` endpoint with a per-call timeout and
//! bounded retry with exponential backoff.

use crate::config::{CONTEXT_PLACEHOLDER, GenerationConfig, ModelPricing};
use crate::error::{QaError, Result};
use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on the context forwarded to the follow-up call, in characters.
pub const FOLLOWUP_CONTEXT_CHARS: usize = 2000;

/// Number of follow-up questions kept.
pub const MAX_FOLLOWUPS: usize = 3;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

/// Token counts as reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One completed generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    /// USD, zero when the model has no pricing entry
    pub cost: f64,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Generation>;

    /// Model identifier, recorded in exported sessions
    fn model(&self) -> &str;
}

/// Messages for the main answer: the system prompt with the context spliced in,
/// followed by the question.
pub fn answer_messages(system_prompt: &str, context: &str, question: &str) -> Vec<ChatMessage> {
    let system = if system_prompt.contains(CONTEXT_PLACEHOLDER) {
        system_prompt.replace(CONTEXT_PLACEHOLDER, context)
    } else {
        format!("{system_prompt}\n\nContext:\n{context}")
    };
    vec![ChatMessage::system(system), ChatMessage::user(question)]
}

/// Messages for the follow-up call. The context is cut to
/// [`FOLLOWUP_CONTEXT_CHARS`] characters.
pub fn followup_messages(question: &str, answer: &str, context: &str) -> Vec<ChatMessage> {
    let context: String = context.chars().take(FOLLOWUP_CONTEXT_CHARS).collect();
    let prompt = format!(
        "Based on the original question: {question}\n\
         And the answer: {answer}\n\
         With context: {context}\n\n\
         Generate {MAX_FOLLOWUPS} most relevant followup questions that would help explore this topic further.\n\
         Format as a simple numbered list:\n\
         1. [first question]\n\
         2. [second question]\n\
         3. [third question]"
    );
    vec![ChatMessage::user(prompt)]
}

/// Non-empty trimmed lines of `text`, at most [`MAX_FOLLOWUPS`] of them.
pub fn parse_followups(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_FOLLOWUPS)
        .map(str::to_string)
        .collect()
}

/// Cost in USD of `usage` under `pricing`.
pub fn estimate_cost(pricing: Option<ModelPricing>, usage: &TokenUsage) -> f64 {
    match pricing {
        Some(p) => {
            usage.prompt_tokens as f64 / 1000.0 * p.prompt_per_1k
                + usage.completion_tokens as f64 / 1000.0 * p.completion_per_1k
        }
        None => 0.0,
    }
}

/// Delay before retry number `attempt` (zero-based): `initial * 2^attempt`, capped.
pub fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    initial
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Client for an OpenAI-compatible chat completion endpoint.
#[derive(Debug)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    url_chat: String,
    model: String,
    temperature: f32,
    timeout: Duration,
    max_retries: u32,
    initial_backoff: Duration,
    pricing: Option<ModelPricing>,
}

impl OpenAiGenerator {
    /// Builds the HTTP client with the bearer token and request timeout.
    pub fn new(config: &GenerationConfig, api_key: &str) -> Result<Self> {
        let endpoint = config.api_base.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(QaError::configuration(format!(
                "generation.api_base must be an http(s) URL, got {endpoint:?}"
            )));
        }

        let mut headers = header::HeaderMap::new();
        let bearer = header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| QaError::configuration(format!("invalid API key header: {e}")))?;
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        let url_chat = format!("{}/chat/completions", endpoint.trim_end_matches('/'));
        let pricing = config.pricing_for(&config.model);
        if pricing.is_none() {
            warn!(model = %config.model, "No pricing entry for model; costs will be reported as 0");
        }

        info!(
            model = %config.model,
            url = %url_chat,
            timeout_secs = timeout.as_secs(),
            max_retries = config.max_retries,
            "Generation client initialized"
        );

        Ok(Self {
            client,
            url_chat,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout,
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            pricing,
        })
    }

    pub fn url(&self) -> &str {
        &self.url_chat
    }

    async fn attempt(&self, body: &ChatCompletionRequest<'_>) -> Result<Generation> {
        let started = Instant::now();
        let resp = self
            .client
            .post(&self.url_chat)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let body: String = text.chars().take(300).collect();
            error!(
                %status,
                url = %self.url_chat,
                latency_ms = started.elapsed().as_millis(),
                "Chat completion returned non-success status"
            );
            return Err(QaError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let out: ChatCompletionResponse = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                QaError::generation(format!(
                    "cannot decode response: {e}; expected `choices[0].message.content`"
                ))
            }
        })?;

        let text = out
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| QaError::generation("response contained no choices"))?;
        let usage = out.usage.unwrap_or_default();
        let cost = estimate_cost(self.pricing, &usage);

        debug!(
            model = %self.model,
            latency_ms = started.elapsed().as_millis(),
            tokens = usage.total_tokens,
            cost,
            "Chat completion finished"
        );

        Ok(Generation { text, usage, cost })
    }

    fn transport_error(&self, e: reqwest::Error) -> QaError {
        if e.is_timeout() {
            QaError::Timeout {
                after: self.timeout,
            }
        } else {
            QaError::from(e)
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Generation> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let mut attempt = 0;
        loop {
            match self.attempt(&body).await {
                Ok(generation) => return Ok(generation),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(self.initial_backoff, attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis(),
                        "Chat completion failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}
