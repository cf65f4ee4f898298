use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use async_trait::async_trait;
use conductor_error::{ProviderError, ProviderErrorKind};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::policy::{self, ProviderPolicy};
use super::{
    ChatMessage, ChunkStream, CompletionRequest, CompletionResponse, FinishReason, HealthStatus,
    MessageRole, ModelPricing, Provider, RateLimitStatus, StreamChunk, TokenUsage, ToolCall,
};
use crate::types::ProviderId;

const PROVIDER: &str = "google";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const HEALTH_CHECK_MODEL: &str = "gemini-2.0-flash";
/// Embeddings run against a dedicated model id, not the chat models.
pub const EMBEDDING_MODEL: &str = "text-embedding-004";

static PRICING: &[(&str, ModelPricing)] = &[
    (
        "gemini-2.0-flash",
        ModelPricing {
            input_per_1m: 0.1,
            output_per_1m: 0.4,
            cached_input_per_1m: Some(0.025),
        },
    ),
    (
        "gemini-2.0-pro",
        ModelPricing {
            input_per_1m: 1.25,
            output_per_1m: 5.0,
            cached_input_per_1m: Some(0.31),
        },
    ),
    (
        "text-embedding-004",
        ModelPricing {
            input_per_1m: 0.01,
            output_per_1m: 0.0,
            cached_input_per_1m: None,
        },
    ),
];

/// Gemini adapter. The system preamble travels as a separate system
/// instruction, assistant turns are remapped to the `model` role, and a
/// SAFETY finish is surfaced as a content-filter error.
pub struct GoogleProvider {
    client: Client,
    base_url: String,
    policy: ProviderPolicy,
    rate_limit: Mutex<RateLimitStatus>,
}

impl GoogleProvider {
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

    fn endpoint(&self, model: &str, streaming: bool) -> String {
        let method = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    fn embed_endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:embedContent", self.base_url, model)
    }

    fn build_request(&self, request: &CompletionRequest) -> GenerateRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for message in &request.messages {
            match message.role {
                MessageRole::System => system_parts.push(message.content.clone()),
                MessageRole::Assistant => contents.push(WireContent {
                    role: "model",
                    parts: vec![WirePart {
                        text: message.content.clone(),
                    }],
                }),
                MessageRole::User | MessageRole::Tool => contents.push(WireContent {
                    role: "user",
                    parts: vec![WirePart {
                        text: message.content.clone(),
                    }],
                }),
            }
        }

        let tools = request.tools.as_ref().map(|tools| {
            vec![WireTools {
                function_declarations: tools
                    .iter()
                    .map(|tool| WireFunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            }]
        });

        GenerateRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(SystemInstruction {
                    parts: vec![WirePart {
                        text: system_parts.join("\n\n"),
                    }],
                })
            },
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
            tools,
        }
    }

    async fn complete_once(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self
            .client
            .post(self.endpoint(&request.model, false))
            .header("x-goog-api-key", api_key)
            .json(&self.build_request(request))
            .send()
            .await
            .map_err(|err| ProviderError::network(PROVIDER, err.to_string()))?;

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::network(PROVIDER, format!("bad response body: {err}")))?;
        parse_response(&request.model, body)
    }
}

impl Default for GoogleProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Google
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
                .post(self.endpoint(&request.model, true))
                .header("x-goog-api-key", api_key)
                .json(&self.build_request(request))
                .send()
                .await
                .map_err(|err| ProviderError::network(PROVIDER, err.to_string()))
        })
        .await?;

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let mut events = response.bytes_stream().eventsource();
        let stream = try_stream! {
            while let Some(event) = events.next().await {
                let event =
                    event.map_err(|err| ProviderError::network(PROVIDER, err.to_string()))?;
                let frame: GenerateResponse =
                    serde_json::from_str(&event.data).map_err(|err| {
                        ProviderError::network(PROVIDER, format!("bad stream frame: {err}"))
                    })?;
                if let Some(candidate) = frame.candidates.into_iter().next() {
                    if candidate.finish_reason.as_deref() == Some("SAFETY") {
                        Err(ProviderError::new(
                            ProviderErrorKind::ContentFilter,
                            PROVIDER,
                            "generation blocked by safety filters",
                        ))?;
                    }
                    let delta: String = candidate
                        .content
                        .map(|content| {
                            content
                                .parts
                                .into_iter()
                                .filter_map(|part| part.text)
                                .collect::<Vec<_>>()
                                .join("")
                        })
                        .unwrap_or_default();
                    let finish_reason = candidate
                        .finish_reason
                        .as_deref()
                        .map(map_finish_reason);
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
        let model = if model.is_empty() { EMBEDDING_MODEL } else { model };
        let url = self.embed_endpoint(model);
        let payload = serde_json::json!({ "content": { "parts": [{ "text": text }] } });

        policy::with_retry(&self.policy, PROVIDER, || async {
            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&payload)
                .send()
                .await
                .map_err(|err| ProviderError::network(PROVIDER, err.to_string()))?;

            if !response.status().is_success() {
                return Err(map_error_response(response).await);
            }
            let body: EmbedResponse = response.json().await.map_err(|err| {
                ProviderError::network(PROVIDER, format!("bad response body: {err}"))
            })?;
            Ok(body.embedding.values)
        })
        .await
    }

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
                provider: ProviderId::Google,
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(err) if err.status == Some(429) => HealthStatus {
                provider: ProviderId::Google,
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(err) => HealthStatus {
                provider: ProviderId::Google,
                healthy: false,
                latency_ms,
                error: Some(err.to_string()),
            },
        }
    }

    fn supports_model(&self, model_id: &str) -> bool {
        PRICING.iter().any(|(id, _)| *id == model_id) || model_id.starts_with("gemini-")
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
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTools>>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WirePart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools {
    function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    cached_content_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    message: String,
    #[serde(default)]
    status: Option<String>,
}

fn parse_response(
    model: &str,
    body: GenerateResponse,
) -> Result<CompletionResponse, ProviderError> {
    let candidate = body
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::network(PROVIDER, "no candidates in response"))?;

    // Safety blocks never surface as ordinary completions.
    if candidate.finish_reason.as_deref() == Some("SAFETY") {
        return Err(ProviderError::new(
            ProviderErrorKind::ContentFilter,
            PROVIDER,
            "generation blocked by safety filters",
        ));
    }

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            text_parts.push(text);
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                id: Uuid::new_v4().to_string(),
                name: call.name,
                arguments: call.args,
            });
        }
    }

    let usage = body
        .usage_metadata
        .map(|usage| TokenUsage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            cached_input_tokens: usage.cached_content_token_count,
        })
        .unwrap_or_default();

    let finish_reason = if tool_calls.is_empty() {
        candidate
            .finish_reason
            .as_deref()
            .map(map_finish_reason)
            .unwrap_or(FinishReason::EndTurn)
    } else {
        FinishReason::ToolUse
    };

    Ok(CompletionResponse {
        model: model.to_string(),
        content: text_parts.join(""),
        tool_calls,
        finish_reason,
        usage,
        cost: None,
        latency_ms: 0,
    })
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::EndTurn,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        _ => FinishReason::EndTurn,
    }
}

async fn map_error_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = policy::retry_after_from_headers(response.headers());
    let body = response.text().await.unwrap_or_default();

    let mut err = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            let message = envelope.error.message;
            let code = envelope.error.code.unwrap_or(status);
            let kind = match envelope.error.status.as_deref() {
                Some("UNAUTHENTICATED") | Some("PERMISSION_DENIED") => {
                    ProviderErrorKind::Authentication
                }
                Some("RESOURCE_EXHAUSTED") => ProviderErrorKind::RateLimit,
                Some("NOT_FOUND") => ProviderErrorKind::ModelNotFound,
                Some("INVALID_ARGUMENT") => {
                    if message.contains("API key") {
                        ProviderErrorKind::Authentication
                    } else {
                        ProviderErrorKind::InvalidRequest
                    }
                }
                _ => return policy::classify_status(PROVIDER, code, message),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_becomes_system_instruction() {
        let provider = GoogleProvider::new();
        let request = CompletionRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                ChatMessage::system("be helpful"),
                ChatMessage::user("hello"),
                ChatMessage::assistant("hi there"),
            ],
            max_tokens: 32,
            temperature: None,
            tools: None,
        };
        let wire = provider.build_request(&request);
        assert!(wire.system_instruction.is_some());
        assert_eq!(wire.contents.len(), 2);
        assert_eq!(wire.contents[0].role, "user");
        // Assistant turns are remapped to the vendor's `model` role.
        assert_eq!(wire.contents[1].role, "model");
    }

    #[test]
    fn safety_finish_surfaces_as_content_filter() {
        let body: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "SAFETY"}]
        }))
        .expect("decode");
        let err = parse_response("gemini-2.0-flash", body).expect_err("blocked");
        assert_eq!(err.kind, ProviderErrorKind::ContentFilter);
    }

    #[test]
    fn function_calls_get_generated_ids() {
        let body: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"name": "lookup", "args": {"q": "rust"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 4}
        }))
        .expect("decode");
        let response = parse_response("gemini-2.0-flash", body).expect("parse");
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.tool_calls.len(), 1);
        assert!(!response.tool_calls[0].id.is_empty());
        assert_eq!(response.usage.input_tokens, 7);
    }

    #[test]
    fn gemini_prefix_is_supported() {
        let provider = GoogleProvider::new();
        assert!(provider.supports_model("gemini-2.0-pro"));
        assert!(provider.supports_model("text-embedding-004"));
        assert!(!provider.supports_model("text-embedding-3-small"));
    }
}
