use std::collections::HashMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Workload categories the router can place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Coding,
    Planning,
    Review,
    Summarization,
    Embedding,
    SimpleChat,
    ComplexReasoning,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Planning => "planning",
            Self::Review => "review",
            Self::Summarization => "summarization",
            Self::Embedding => "embedding",
            Self::SimpleChat => "simple_chat",
            Self::ComplexReasoning => "complex_reasoning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "coding" => Some(Self::Coding),
            "planning" => Some(Self::Planning),
            "review" => Some(Self::Review),
            "summarization" => Some(Self::Summarization),
            "embedding" => Some(Self::Embedding),
            "simple_chat" => Some(Self::SimpleChat),
            "complex_reasoning" => Some(Self::ComplexReasoning),
            _ => None,
        }
    }

    pub fn all() -> &'static [TaskType] {
        &[
            Self::Coding,
            Self::Planning,
            Self::Review,
            Self::Summarization,
            Self::Embedding,
            Self::SimpleChat,
            Self::ComplexReasoning,
        ]
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Economy,
    Standard,
    Premium,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    /// Ordering used by the `quality` preset: premium > standard > economy.
    pub fn priority(self) -> u8 {
        match self {
            Self::Economy => 0,
            Self::Standard => 1,
            Self::Premium => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    Openai,
    Google,
    Deepseek,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
            Self::Google => "google",
            Self::Deepseek => "deepseek",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::Openai),
            "google" => Some(Self::Google),
            "deepseek" => Some(Self::Deepseek),
            _ => None,
        }
    }

    pub fn all() -> &'static [ProviderId] {
        &[Self::Anthropic, Self::Openai, Self::Google, Self::Deepseek]
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog row describing one routable model. Read-only from the router's
/// point of view.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub model_id: String,
    pub provider: ProviderId,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_embedding: bool,
    pub context_window: u64,
    pub max_output_tokens: u64,
    #[serde(rename = "inputPricePer1M")]
    pub input_price_per_1m: f64,
    #[serde(rename = "outputPricePer1M")]
    pub output_price_per_1m: f64,
    #[serde(default, rename = "cachedInputPricePer1M", skip_serializing_if = "Option::is_none")]
    pub cached_input_price_per_1m: Option<f64>,
    pub quality_tier: QualityTier,
    #[serde(default)]
    pub suitable_for: Vec<TaskType>,
    #[serde(default)]
    pub available: bool,
}

impl Model {
    pub fn is_suitable_for(&self, task_type: TaskType) -> bool {
        self.suitable_for.contains(&task_type)
    }

    /// Models listed only for embedding never serve chat-shaped tasks.
    pub fn is_embedding_only(&self) -> bool {
        self.suitable_for == [TaskType::Embedding]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPreset {
    #[default]
    Auto,
    Economy,
    Quality,
    Balanced,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
}

/// Per-workspace routing policy, shaped by which BYOK credentials exist.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRoutingConfig {
    pub workspace_id: String,
    pub enabled_providers: Vec<ProviderId>,
    #[serde(default)]
    pub preset: RoutingPreset,
    #[serde(default)]
    pub task_overrides: HashMap<TaskType, TaskOverride>,
}

impl WorkspaceRoutingConfig {
    pub fn new(workspace_id: impl Into<String>, enabled_providers: Vec<ProviderId>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            enabled_providers,
            preset: RoutingPreset::Auto,
            task_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskRoutingRequest {
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_output_tokens: Option<u64>,
    #[serde(default)]
    pub requires_tools: bool,
    #[serde(default)]
    pub requires_vision: bool,
    #[serde(default)]
    pub requires_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size_tokens: Option<u64>,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_provider: Option<ProviderId>,
}

impl TaskRoutingRequest {
    pub fn new(task_type: TaskType, workspace_id: impl Into<String>) -> Self {
        Self {
            task_type,
            estimated_input_tokens: None,
            estimated_output_tokens: None,
            requires_tools: false,
            requires_vision: false,
            requires_streaming: false,
            context_size_tokens: None,
            workspace_id: workspace_id.into(),
            project_id: None,
            force_model: None,
            force_provider: None,
        }
    }
}

/// A candidate the router considered and rejected, with why.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingAlternative {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    /// `-1.0` when pricing was unknown at rejection time.
    pub estimated_cost: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub selected_model: String,
    pub provider: ProviderId,
    pub reason: String,
    pub estimated_cost: f64,
    pub alternatives: Vec<RoutingAlternative>,
}

/// Ordered candidate list for one task type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub quality_tier_preference: QualityTier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_round_trips() {
        for provider in ProviderId::all() {
            assert_eq!(ProviderId::parse(provider.as_str()), Some(*provider));
        }
        assert_eq!(ProviderId::parse("mistral"), None);
    }

    #[test]
    fn tier_priority_orders_quality_presets() {
        assert!(QualityTier::Premium.priority() > QualityTier::Standard.priority());
        assert!(QualityTier::Standard.priority() > QualityTier::Economy.priority());
    }

    #[test]
    fn model_wire_format_uses_catalog_field_names() {
        let json = serde_json::json!({
            "modelId": "gpt-4o",
            "provider": "openai",
            "supportsTools": true,
            "supportsVision": true,
            "supportsStreaming": true,
            "supportsEmbedding": false,
            "contextWindow": 128000,
            "maxOutputTokens": 16384,
            "inputPricePer1M": 2.5,
            "outputPricePer1M": 10.0,
            "qualityTier": "standard",
            "suitableFor": ["coding", "planning"],
            "available": true
        });
        let model: Model = serde_json::from_value(json).expect("decode");
        assert_eq!(model.provider, ProviderId::Openai);
        assert!(model.is_suitable_for(TaskType::Coding));
        assert!(!model.is_embedding_only());
        assert_eq!(model.cached_input_price_per_1m, None);
    }

    #[test]
    fn embedding_only_detection() {
        let json = serde_json::json!({
            "modelId": "text-embedding-3-small",
            "provider": "openai",
            "supportsEmbedding": true,
            "contextWindow": 8191,
            "maxOutputTokens": 0,
            "inputPricePer1M": 0.02,
            "outputPricePer1M": 0.0,
            "qualityTier": "economy",
            "suitableFor": ["embedding"],
            "available": true
        });
        let model: Model = serde_json::from_value(json).expect("decode");
        assert!(model.is_embedding_only());
    }
}
