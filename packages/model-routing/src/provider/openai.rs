use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use async_trait::async_trait;
use conductor_error::{ProviderError, ProviderErrorKind};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::policy::{self, ProviderPolicy};
use super::{
    ChatMessage, ChunkStream, CompletionRequest, CompletionResponse, FinishReason, HealthStatus,
    MessageRole, ModelPricing, Provider, RateLimitStatus, StreamChunk, TokenUsage, ToolCall,
};
use crate::types::ProviderId;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const HEALTH_CHECK_MODEL: &str = "gpt-4o-mini";

static PRICING: &[(&str, ModelPricing)] = &[
    (
        "gpt-4o",
        ModelPricing {
            input_per_1m: 2.5,
            output_per_1m: 10.0,
            cached_input_per_1m: Some(1.25),
        },
    ),
    (
        "gpt-4o-mini",
        ModelPricing {
            input_per_1m: 0.15,
            output_per_1m: 0.6,
            cached_input_per_1m: Some(0.075),
        },
    ),
    (
        "text-embedding-3-small",
        ModelPricing {
            input_per_1m: 0.02,
            output_per_1m: 0.0,
            cached_input_per_1m: None,
        },
    ),
    (
        "text-embedding-3-large",
        ModelPricing {
            input_per_1m: 0.13,
            output_per_1m: 0.0,
            cached_input_per_1m: None,
        },
    ),
];

/// Chat-completions adapter. Also the base flow for OpenAI-compatible
/// vendors, which swap the base URL, pricing table, and identity.
pub struct OpenAiProvider {
    pub(super) provider_id: ProviderId,
    pub(super) label: &'static str,
    client: Client,
    base_url: String,
    policy: ProviderPolicy,
    pricing: &'static [(&'static str, ModelPricing)],
    model_prefixes: &'static [&'static str],
    health_check_model: &'static str,
    supports_embeddings: bool,
    rate_limit: Mutex<RateLimitStatus>,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            provider_id: ProviderId::Openai,
            label: "openai",
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            policy: ProviderPolicy::default(),
            pricing: PRICING,
            model_prefixes: &["gpt-", "o1-", "o3-"],
            health_check_model: HEALTH_CHECK_MODEL,
            supports_embeddings: true,
            rate_limit: Mutex::new(RateLimitStatus::default()),
        }
    }

    /// Constructor for OpenAI-compatible vendors.
    pub(super) fn compatible(
        provider_id: ProviderId,
        label: &'static str,
        base_url: String,
        pricing: &'static [(&'static str, ModelPricing)],
        model_prefixes: &'static [&'static str],
        health_check_model: &'static str,
        supports_embeddings: bool,
    ) -> Self {
        Self {
            provider_id,
            label,
            client: Client::new(),
            base_url,
            policy: ProviderPolicy::default(),
            pricing,
            model_prefixes,
            health_check_model,
            supports_embeddings,
            rate_limit: Mutex::new(RateLimitStatus::default()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_policy(mut self, policy: ProviderPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn embeddings_endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
        let messages = request
            .messages
            .iter()
            .map(|message| WireMessage {
                role: match message.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::Tool => "tool",
                },
                content: message.content.clone(),
            })
            .collect();

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect()
        });

        ChatRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            stream,
        }
    }

    async fn complete_once(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self
            .client
            .post(self.chat_endpoint())
            .bearer_auth(api_key)
            .json(&self.build_request(request, false))
            .send()
            .await
            .map_err(|err| ProviderError::network(self.label, err.to_string()))?;

        self.record_rate_limit(response.headers());
        if !response.status().is_success() {
            return Err(map_error_response(self.label, response).await);
        }

        let body: ChatResponse = response.json().await.map_err(|err| {
            ProviderError::network(self.label, format!("bad response body: {err}"))
        })?;
        parse_response(self.label, body)
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        let mut status = self.rate_limit.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = header_u64(headers, "x-ratelimit-remaining-requests") {
            status.requests_remaining = Some(value);
        }
        if let Some(value) = header_u64(headers, "x-ratelimit-remaining-tokens") {
            status.tokens_remaining = Some(value);
        }
        if let Some(value) = header_string(headers, "x-ratelimit-reset-requests") {
            status.requests_reset = Some(value);
        }
        if let Some(value) = header_string(headers, "x-ratelimit-reset-tokens") {
            status.tokens_reset = Some(value);
        }
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        self.provider_id
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        policy::validate_request(self.label, request)?;
        let started = Instant::now();
        let mut response =
            policy::with_retry(&self.policy, self.label, || self.complete_once(request, api_key))
                .await?;
        response.latency_ms = started.elapsed().as_millis() as u64;
        response.cost = self.calculate_cost(&request.model, &response.usage);
        Ok(response)
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<ChunkStream, ProviderError> {
        policy::validate_request(self.label, request)?;
        let label = self.label;
        let response = policy::with_timeout(label, self.policy.timeout, async {
            self.client
                .post(self.chat_endpoint())
                .bearer_auth(api_key)
                .json(&self.build_request(request, true))
                .send()
                .await
                .map_err(|err| ProviderError::network(label, err.to_string()))
        })
        .await?;

        self.record_rate_limit(response.headers());
        if !response.status().is_success() {
            return Err(map_error_response(label, response).await);
        }

        let mut events = response.bytes_stream().eventsource();
        let stream = try_stream! {
            while let Some(event) = events.next().await {
                let event =
                    event.map_err(|err| ProviderError::network(label, err.to_string()))?;
                if event.data == "[DONE]" {
                    break;
                }
                let frame: StreamFrame = serde_json::from_str(&event.data).map_err(|err| {
                    ProviderError::network(label, format!("bad stream frame: {err}"))
                })?;
                if let Some(choice) = frame.choices.into_iter().next() {
                    let finish_reason = choice.finish_reason.as_deref().map(map_finish_reason);
                    let delta = choice.delta.content.unwrap_or_default();
                    if !delta.is_empty() || finish_reason.is_some() {
                        yield StreamChunk { delta, finish_reason };
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(
        &self,
        text: &str,
        model: &str,
        api_key: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        if !self.supports_embeddings {
            return Err(ProviderError::invalid_request(
                self.label,
                format!("{} does not offer an embeddings API", self.label),
            ));
        }

        let label = self.label;
        policy::with_retry(&self.policy, label, || async {
            let response = self
                .client
                .post(self.embeddings_endpoint())
                .bearer_auth(api_key)
                .json(&serde_json::json!({ "model": model, "input": text }))
                .send()
                .await
                .map_err(|err| ProviderError::network(label, err.to_string()))?;

            if !response.status().is_success() {
                return Err(map_error_response(label, response).await);
            }
            let body: EmbeddingsResponse = response.json().await.map_err(|err| {
                ProviderError::network(label, format!("bad response body: {err}"))
            })?;
            body.data
                .into_iter()
                .next()
                .map(|row| row.embedding)
                .ok_or_else(|| ProviderError::network(label, "empty embeddings response"))
        })
        .await
    }

    async fn health_check(&self, api_key: &str) -> HealthStatus {
        let probe = CompletionRequest {
            model: self.health_check_model.to_string(),
            messages: vec![ChatMessage::user("ping")],
            max_tokens: 1,
            temperature: None,
            tools: None,
        };
        let started = Instant::now();
        let result = policy::with_timeout(
            self.label,
            Duration::from_secs(10),
            self.complete_once(&probe, api_key),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(_) => HealthStatus {
                provider: self.provider_id,
                healthy: true,
                latency_ms,
                error: None,
            },
            // A rate-limited key is a working key.
            Err(err) if err.status == Some(429) => HealthStatus {
                provider: self.provider_id,
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(err) => HealthStatus {
                provider: self.provider_id,
                healthy: false,
                latency_ms,
                error: Some(err.to_string()),
            },
        }
    }

    fn supports_model(&self, model_id: &str) -> bool {
        self.pricing.iter().any(|(id, _)| *id == model_id)
            || self
                .model_prefixes
                .iter()
                .any(|prefix| model_id.starts_with(prefix))
    }

    fn model_pricing(&self, model_id: &str) -> Option<ModelPricing> {
        self.pricing
            .iter()
            .find(|(id, _)| *id == model_id)
            .map(|(_, pricing)| *pricing)
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireToolCallFunction,
}

#[derive(Debug, Deserialize)]
struct WireToolCallFunction {
    name: String,
    /// The vendor serializes arguments as a JSON string.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn parse_response(
    label: &'static str,
    body: ChatResponse,
) -> Result<CompletionResponse, ProviderError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::network(label, "no choices in response"))?;

    let mut tool_calls = Vec::new();
    for call in choice.message.tool_calls.unwrap_or_default() {
        // Arguments come as a JSON string; keep the raw text when it does
        // not parse so nothing is silently lost.
        let arguments = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::String(call.function.arguments));
        tool_calls.push(ToolCall {
            id: call.id,
            name: call.function.name,
            arguments,
        });
    }

    let usage = body.usage.map(|usage| TokenUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cached_input_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
    });

    Ok(CompletionResponse {
        model: body.model,
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(map_finish_reason)
            .unwrap_or(FinishReason::EndTurn),
        usage: usage.unwrap_or_default(),
        cost: None,
        latency_ms: 0,
    })
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::EndTurn,
        "length" => FinishReason::MaxTokens,
        "tool_calls" => FinishReason::ToolUse,
        "content_filter" => FinishReason::Error,
        _ => FinishReason::EndTurn,
    }
}

async fn map_error_response(label: &'static str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = policy::retry_after_from_headers(response.headers());
    let body = response.text().await.unwrap_or_default();

    let mut err = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            let message = envelope.error.message;
            let code = envelope.error.code.unwrap_or_default();
            let kind = if status == 401 || status == 403 {
                ProviderErrorKind::Authentication
            } else if status == 429 {
                ProviderErrorKind::RateLimit
            } else if status == 404 || code == "model_not_found" {
                ProviderErrorKind::ModelNotFound
            } else if status == 400
                && (message.to_lowercase().contains("context length")
                    || code == "context_length_exceeded")
            {
                ProviderErrorKind::ContextLength
            } else if envelope.error.kind.as_deref() == Some("insufficient_quota") {
                ProviderErrorKind::RateLimit
            } else if status >= 500 {
                ProviderErrorKind::Server
            } else if status == 400 || status == 422 {
                ProviderErrorKind::InvalidRequest
            } else {
                ProviderErrorKind::Unknown
            };
            ProviderError::new(kind, label, message).with_status(status)
        }
        Err(_) => policy::classify_status(label, status, body),
    };
    if let Some(retry_after) = retry_after {
        err = err.with_retry_after(retry_after);
    }
    err
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}
