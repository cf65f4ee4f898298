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

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
/// Cheapest known-good model, used for the health probe.
const HEALTH_CHECK_MODEL: &str = "claude-3-5-haiku-20241022";

static PRICING: &[(&str, ModelPricing)] = &[
    (
        "claude-opus-4-20250514",
        ModelPricing {
            input_per_1m: 15.0,
            output_per_1m: 75.0,
            cached_input_per_1m: Some(1.5),
        },
    ),
    (
        "claude-sonnet-4-20250514",
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
            cached_input_per_1m: Some(0.3),
        },
    ),
    (
        "claude-3-5-sonnet-20241022",
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
            cached_input_per_1m: Some(0.3),
        },
    ),
    (
        "claude-3-5-haiku-20241022",
        ModelPricing {
            input_per_1m: 0.8,
            output_per_1m: 4.0,
            cached_input_per_1m: Some(0.08),
        },
    ),
];

/// Messages-API adapter. The system preamble is a top-level field, tool
/// calls arrive as content blocks, and embeddings are not offered.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    policy: ProviderPolicy,
    rate_limit: Mutex<RateLimitStatus>,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            policy: ProviderPolicy::default(),
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

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> MessagesRequest {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                MessageRole::System => system_parts.push(message.content.clone()),
                MessageRole::Assistant => messages.push(WireMessage {
                    role: "assistant",
                    content: message.content.clone(),
                }),
                // Tool results ride back on the user turn.
                MessageRole::User | MessageRole::Tool => messages.push(WireMessage {
                    role: "user",
                    content: message.content.clone(),
                }),
            }
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| WireTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect()
        });

        MessagesRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            messages,
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
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.build_request(request, false))
            .send()
            .await
            .map_err(|err| ProviderError::network(PROVIDER, err.to_string()))?;

        self.record_rate_limit(response.headers());

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::network(PROVIDER, format!("bad response body: {err}")))?;
        Ok(parse_response(body))
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        let mut status = self.rate_limit.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = header_u64(headers, "anthropic-ratelimit-requests-remaining") {
            status.requests_remaining = Some(value);
        }
        if let Some(value) = header_u64(headers, "anthropic-ratelimit-tokens-remaining") {
            status.tokens_remaining = Some(value);
        }
        if let Some(value) = header_string(headers, "anthropic-ratelimit-requests-reset") {
            status.requests_reset = Some(value);
        }
        if let Some(value) = header_string(headers, "anthropic-ratelimit-tokens-reset") {
            status.tokens_reset = Some(value);
        }
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        policy::validate_request(PROVIDER, request)?;
        let started = Instant::now();
        let mut response =
            policy::with_retry(&self.policy, PROVIDER, || self.complete_once(request, api_key))
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
        policy::validate_request(PROVIDER, request)?;
        let response = policy::with_timeout(PROVIDER, self.policy.timeout, async {
            self.client
                .post(self.endpoint())
                .header("x-api-key", api_key)
                .header("anthropic-version", API_VERSION)
                .json(&self.build_request(request, true))
                .send()
                .await
                .map_err(|err| ProviderError::network(PROVIDER, err.to_string()))
        })
        .await?;

        self.record_rate_limit(response.headers());
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let mut events = response.bytes_stream().eventsource();
        let stream = try_stream! {
            while let Some(event) = events.next().await {
                let event = event
                    .map_err(|err| ProviderError::network(PROVIDER, err.to_string()))?;
                match event.event.as_str() {
                    "content_block_delta" => {
                        let data: StreamDelta = serde_json::from_str(&event.data).map_err(
                            |err| ProviderError::network(PROVIDER, format!("bad stream frame: {err}")),
                        )?;
                        if let Some(text) = data.delta.text {
                            yield StreamChunk { delta: text, finish_reason: None };
                        }
                    }
                    "message_delta" => {
                        let data: MessageDelta = serde_json::from_str(&event.data).map_err(
                            |err| ProviderError::network(PROVIDER, format!("bad stream frame: {err}")),
                        )?;
                        if let Some(stop_reason) = data.delta.stop_reason {
                            yield StreamChunk {
                                delta: String::new(),
                                finish_reason: Some(map_stop_reason(Some(&stop_reason))),
                            };
                        }
                    }
                    "message_stop" => break,
                    _ => {}
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(
        &self,
        _text: &str,
        _model: &str,
        _api_key: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::invalid_request(
            PROVIDER,
            "anthropic does not offer an embeddings API",
        ))
    }

    /// Issues a one-token generation against a cheap model. Being rate
    /// limited or overloaded still proves the key is valid.
    async fn health_check(&self, api_key: &str) -> HealthStatus {
        let probe = CompletionRequest {
            model: HEALTH_CHECK_MODEL.to_string(),
            messages: vec![ChatMessage::user("ping")],
            max_tokens: 1,
            temperature: None,
            tools: None,
        };
        let started = Instant::now();
        let result = policy::with_timeout(
            PROVIDER,
            Duration::from_secs(10),
            self.complete_once(&probe, api_key),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(_) => HealthStatus {
                provider: ProviderId::Anthropic,
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(err) if matches!(err.status, Some(429) | Some(529)) => HealthStatus {
                provider: ProviderId::Anthropic,
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(err) => HealthStatus {
                provider: ProviderId::Anthropic,
                healthy: false,
                latency_ms,
                error: Some(err.to_string()),
            },
        }
    }

    fn supports_model(&self, model_id: &str) -> bool {
        PRICING.iter().any(|(id, _)| *id == model_id) || model_id.starts_with("claude-")
    }

    fn model_pricing(&self, model_id: &str) -> Option<ModelPricing> {
        PRICING
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
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
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
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    delta: StreamDeltaBody,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaBody {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

fn parse_response(body: MessagesResponse) -> CompletionResponse {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in body.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input,
            }),
            ContentBlock::Unknown => {}
        }
    }

    CompletionResponse {
        model: body.model,
        content: text_parts.join(""),
        tool_calls,
        finish_reason: map_stop_reason(body.stop_reason.as_deref()),
        usage: TokenUsage {
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
            cached_input_tokens: body.usage.cache_read_input_tokens,
        },
        cost: None,
        latency_ms: 0,
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | None => FinishReason::EndTurn,
        Some("max_tokens") => FinishReason::MaxTokens,
        Some("stop_sequence") => FinishReason::StopSequence,
        Some("tool_use") => FinishReason::ToolUse,
        Some(_) => FinishReason::EndTurn,
    }
}

async fn map_error_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = policy::retry_after_from_headers(response.headers());
    let body = response.text().await.unwrap_or_default();

    let mut err = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            let message = envelope.error.message;
            let kind = match envelope.error.kind.as_str() {
                "authentication_error" | "permission_error" => ProviderErrorKind::Authentication,
                "not_found_error" => ProviderErrorKind::ModelNotFound,
                "rate_limit_error" => ProviderErrorKind::RateLimit,
                "overloaded_error" => ProviderErrorKind::Server,
                "invalid_request_error" => {
                    if message.contains("prompt is too long") {
                        ProviderErrorKind::ContextLength
                    } else {
                        ProviderErrorKind::InvalidRequest
                    }
                }
                _ => return policy::classify_status(PROVIDER, status, message),
            };
            ProviderError::new(kind, PROVIDER, message).with_status(status)
        }
        Err(_) => policy::classify_status(PROVIDER, status, body),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_the_top_level_field() {
        let provider = AnthropicProvider::new();
        let request = CompletionRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("hello"),
                ChatMessage::assistant("hi"),
            ],
            max_tokens: 64,
            temperature: None,
            tools: None,
        };
        let wire = provider.build_request(&request, false);
        assert_eq!(wire.system.as_deref(), Some("be terse"));
        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.messages[1].role, "assistant");
    }

    #[test]
    fn tool_use_blocks_become_tool_calls() {
        let body: MessagesResponse = serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "a.rs"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 30}
        }))
        .expect("decode");
        let response = parse_response(body);
        assert_eq!(response.content, "Let me check.");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "read_file");
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
    }

    #[test]
    fn stop_reasons_map_onto_the_unified_form() {
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::EndTurn);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::MaxTokens);
        assert_eq!(
            map_stop_reason(Some("stop_sequence")),
            FinishReason::StopSequence
        );
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolUse);
    }

    #[test]
    fn known_models_have_pricing() {
        let provider = AnthropicProvider::new();
        let pricing = provider
            .model_pricing("claude-sonnet-4-20250514")
            .expect("pricing");
        assert_eq!(pricing.input_per_1m, 3.0);
        assert_eq!(pricing.output_per_1m, 15.0);
        assert!(provider.supports_model("claude-opus-4-20250514"));
        assert!(provider.supports_model("claude-future-model"));
        assert!(!provider.supports_model("gpt-4o"));
    }
}
