use async_trait::async_trait;
use conductor_error::ProviderError;

use super::openai::OpenAiProvider;
use super::policy::ProviderPolicy;
use super::{
    ChunkStream, CompletionRequest, CompletionResponse, HealthStatus, ModelPricing, Provider,
    RateLimitStatus,
};
use crate::types::ProviderId;

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";

static PRICING: &[(&str, ModelPricing)] = &[
    (
        "deepseek-chat",
        ModelPricing {
            input_per_1m: 0.27,
            output_per_1m: 1.1,
            cached_input_per_1m: Some(0.07),
        },
    ),
    (
        "deepseek-reasoner",
        ModelPricing {
            input_per_1m: 0.55,
            output_per_1m: 2.19,
            cached_input_per_1m: Some(0.14),
        },
    ),
];

/// OpenAI-compatible vendor: the chat flow is the OpenAI one with a vendor
/// base URL, its own pricing table, and no embeddings endpoint.
pub struct DeepSeekProvider {
    inner: OpenAiProvider,
}

impl DeepSeekProvider {
    pub fn new() -> Self {
        Self {
            inner: OpenAiProvider::compatible(
                ProviderId::Deepseek,
                "deepseek",
                DEFAULT_BASE_URL.to_string(),
                PRICING,
                &["deepseek-"],
                "deepseek-chat",
                false,
            ),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.inner = self.inner.with_base_url(base_url);
        self
    }

    pub fn with_policy(mut self, policy: ProviderPolicy) -> Self {
        self.inner = self.inner.with_policy(policy);
        self
    }
}

impl Default for DeepSeekProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for DeepSeekProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Deepseek
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        self.inner.complete(request, api_key).await
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<ChunkStream, ProviderError> {
        self.inner.stream(request, api_key).await
    }

    async fn embed(
        &self,
        text: &str,
        model: &str,
        api_key: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        self.inner.embed(text, model, api_key).await
    }

    async fn health_check(&self, api_key: &str) -> HealthStatus {
        self.inner.health_check(api_key).await
    }

    fn supports_model(&self, model_id: &str) -> bool {
        self.inner.supports_model(model_id)
    }

    fn model_pricing(&self, model_id: &str) -> Option<ModelPricing> {
        self.inner.model_pricing(model_id)
    }

    fn rate_limit_status(&self) -> RateLimitStatus {
        self.inner.rate_limit_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepseek_models_only() {
        let provider = DeepSeekProvider::new();
        assert!(provider.supports_model("deepseek-chat"));
        assert!(provider.supports_model("deepseek-reasoner"));
        assert!(!provider.supports_model("gpt-4o"));
        assert_eq!(provider.id(), ProviderId::Deepseek);
    }

    #[tokio::test]
    async fn embeddings_are_not_offered() {
        let provider = DeepSeekProvider::new();
        let err = provider
            .embed("hello", "deepseek-embed", "key")
            .await
            .expect_err("no embeddings");
        assert_eq!(err.kind, conductor_error::ProviderErrorKind::InvalidRequest);
    }
}
