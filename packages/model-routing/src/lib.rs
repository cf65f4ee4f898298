//! Task-to-model routing: the provider abstraction layer, the catalog
//! client, the provider registry, and the multi-stage task router.

pub mod catalog;
pub mod provider;
pub mod registry;
pub mod router;
pub mod types;

pub use catalog::{CatalogConfig, CatalogError, ModelCatalogClient, ModelFilters};
pub use provider::{
    AnthropicProvider, ChatMessage, ChunkStream, CompletionRequest, CompletionResponse,
    CostBreakdown, DeepSeekProvider, FinishReason, GoogleProvider, HealthStatus, MessageRole,
    ModelPricing, OpenAiProvider, Provider, ProviderPolicy, RateLimitStatus, StreamChunk,
    TokenUsage, ToolCall, ToolDefinition,
};
pub use registry::ProviderRegistry;
pub use router::{default_rules, RoutingError, TaskRouter};
pub use types::{
    Model, ProviderId, QualityTier, RoutingAlternative, RoutingDecision, RoutingPreset,
    RoutingRule, TaskOverride, TaskRoutingRequest, TaskType, WorkspaceRoutingConfig,
};
