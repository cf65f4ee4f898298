use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{Model, ProviderId, QualityTier, TaskType};

const MODELS_PATH: &str = "api/model-registry/models";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(String),
    #[error("catalog returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("catalog response decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    /// Per-entry cache expiry.
    pub cache_ttl: Duration,
    /// Bounded cache size; overflow evicts oldest-insertion-first.
    pub cache_capacity: usize,
    pub request_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            auth_token: None,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Optional query filters for the model listing.
#[derive(Debug, Clone, Default)]
pub struct ModelFilters {
    pub provider: Option<ProviderId>,
    pub quality_tier: Option<QualityTier>,
    pub task_type: Option<TaskType>,
    pub available: Option<bool>,
    pub supports_tools: Option<bool>,
    pub supports_vision: Option<bool>,
    pub supports_embedding: Option<bool>,
}

impl ModelFilters {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(provider) = self.provider {
            pairs.push(("provider", provider.as_str().to_string()));
        }
        if let Some(tier) = self.quality_tier {
            pairs.push(("qualityTier", tier.as_str().to_string()));
        }
        if let Some(task_type) = self.task_type {
            pairs.push(("taskType", task_type.as_str().to_string()));
        }
        if let Some(available) = self.available {
            pairs.push(("available", available.to_string()));
        }
        if let Some(tools) = self.supports_tools {
            pairs.push(("supportsTools", tools.to_string()));
        }
        if let Some(vision) = self.supports_vision {
            pairs.push(("supportsVision", vision.to_string()));
        }
        if let Some(embedding) = self.supports_embedding {
            pairs.push(("supportsEmbedding", embedding.to_string()));
        }
        pairs
    }
}

#[derive(Clone)]
enum CachedValue {
    List(Vec<Model>),
    Single(Option<Model>),
}

struct CacheEntry {
    expires_at: Instant,
    value: CachedValue,
}

/// Small in-process cache keyed by full request URL. Expired entries are
/// skimmed before capacity eviction so the working set stays small.
struct CatalogCache {
    entries: HashMap<String, CacheEntry>,
    insertion_order: VecDeque<String>,
    capacity: usize,
}

impl CatalogCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, url: &str) -> Option<CachedValue> {
        match self.entries.get(url) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(url);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, url: String, value: CachedValue, ttl: Duration) {
        if !self.entries.contains_key(&url) && self.entries.len() >= self.capacity {
            self.evict_expired();
            while self.entries.len() >= self.capacity {
                match self.insertion_order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
        if !self.entries.contains_key(&url) {
            self.insertion_order.push_back(url.clone());
        }
        self.entries.insert(
            url,
            CacheEntry {
                expires_at: Instant::now() + ttl,
                value,
            },
        );
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.insertion_order
            .retain(|url| self.entries.contains_key(url));
    }
}

/// Either shape the catalog service serves for list endpoints.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelsPayload {
    Wrapped { models: Vec<Model> },
    Bare(Vec<Model>),
}

impl From<ModelsPayload> for Vec<Model> {
    fn from(payload: ModelsPayload) -> Self {
        match payload {
            ModelsPayload::Wrapped { models } => models,
            ModelsPayload::Bare(models) => models,
        }
    }
}

/// Read-only client for the external model-catalog service.
pub struct ModelCatalogClient {
    client: reqwest::Client,
    config: CatalogConfig,
    cache: Mutex<CatalogCache>,
}

impl ModelCatalogClient {
    pub fn new(config: CatalogConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            cache: Mutex::new(CatalogCache::new(config.cache_capacity)),
            config,
        }
    }

    fn models_url(&self, filters: &ModelFilters) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = format!("{base}/{MODELS_PATH}");
        let pairs = filters.query_pairs();
        if !pairs.is_empty() {
            let query: Vec<String> = pairs
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    fn model_url(&self, model_id: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{base}/{MODELS_PATH}/{model_id}")
    }

    pub async fn list_models(&self, filters: &ModelFilters) -> Result<Vec<Model>, CatalogError> {
        let url = self.models_url(filters);
        if let Some(CachedValue::List(models)) = self.cache.lock().await.get(&url) {
            return Ok(models);
        }

        let payload: ModelsPayload = self.fetch_json(&url).await?;
        let models: Vec<Model> = payload.into();
        self.cache.lock().await.insert(
            url,
            CachedValue::List(models.clone()),
            self.config.cache_ttl,
        );
        Ok(models)
    }

    /// Single-model lookup; a 404 is a legitimate miss, not an error.
    pub async fn get_model(&self, model_id: &str) -> Result<Option<Model>, CatalogError> {
        let url = self.model_url(model_id);
        if let Some(CachedValue::Single(model)) = self.cache.lock().await.get(&url) {
            return Ok(model);
        }

        let response = self.send(&url).await?;
        let model = if response.status().as_u16() == 404 {
            None
        } else if !response.status().is_success() {
            return Err(CatalogError::Status {
                status: response.status().as_u16(),
                url,
            });
        } else {
            Some(
                response
                    .json::<Model>()
                    .await
                    .map_err(|err| CatalogError::Decode(err.to_string()))?,
            )
        };

        self.cache.lock().await.insert(
            url,
            CachedValue::Single(model.clone()),
            self.config.cache_ttl,
        );
        Ok(model)
    }

    pub async fn models_by_provider(
        &self,
        provider: ProviderId,
    ) -> Result<Vec<Model>, CatalogError> {
        let base = self.config.base_url.trim_end_matches('/');
        let url = format!("{base}/{MODELS_PATH}/provider/{}", provider.as_str());
        self.cached_list(url).await
    }

    pub async fn models_by_task(&self, task_type: TaskType) -> Result<Vec<Model>, CatalogError> {
        let base = self.config.base_url.trim_end_matches('/');
        let url = format!("{base}/{MODELS_PATH}/task/{}", task_type.as_str());
        self.cached_list(url).await
    }

    async fn cached_list(&self, url: String) -> Result<Vec<Model>, CatalogError> {
        if let Some(CachedValue::List(models)) = self.cache.lock().await.get(&url) {
            return Ok(models);
        }
        let payload: ModelsPayload = self.fetch_json(&url).await?;
        let models: Vec<Model> = payload.into();
        self.cache.lock().await.insert(
            url,
            CachedValue::List(models.clone()),
            self.config.cache_ttl,
        );
        Ok(models)
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, CatalogError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, CatalogError> {
        let response = self.send(url).await?;
        if !response.status().is_success() {
            return Err(CatalogError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| CatalogError::Decode(err.to_string()))
    }
}
