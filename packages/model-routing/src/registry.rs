use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::provider::{HealthStatus, Provider};
use crate::types::ProviderId;

#[derive(Debug, Error)]
#[error("provider not registered: {0}")]
pub struct UnknownProvider(pub ProviderId);

/// In-process provider directory. Registration enables a provider until it
/// is explicitly disabled.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderId, Arc<dyn Provider>>>,
    enabled: RwLock<HashSet<ProviderId>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let id = provider.id();
        self.providers.write().await.insert(id, provider);
        self.enabled.write().await.insert(id);
    }

    pub async fn get(&self, id: ProviderId) -> Option<Arc<dyn Provider>> {
        self.providers.read().await.get(&id).cloned()
    }

    pub async fn get_required(&self, id: ProviderId) -> Result<Arc<dyn Provider>, UnknownProvider> {
        self.get(id).await.ok_or(UnknownProvider(id))
    }

    pub async fn all(&self) -> Vec<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        ProviderId::all()
            .iter()
            .filter_map(|id| providers.get(id).cloned())
            .collect()
    }

    pub async fn enabled(&self) -> Vec<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let enabled = self.enabled.read().await;
        ProviderId::all()
            .iter()
            .filter(|id| enabled.contains(id))
            .filter_map(|id| providers.get(id).cloned())
            .collect()
    }

    pub async fn enable(&self, id: ProviderId) {
        if self.providers.read().await.contains_key(&id) {
            self.enabled.write().await.insert(id);
        }
    }

    pub async fn disable(&self, id: ProviderId) {
        self.enabled.write().await.remove(&id);
    }

    pub async fn is_enabled(&self, id: ProviderId) -> bool {
        self.enabled.read().await.contains(&id)
    }

    /// First enabled provider claiming the model, in stable provider order.
    pub async fn provider_for_model(&self, model_id: &str) -> Option<Arc<dyn Provider>> {
        for provider in self.enabled().await {
            if provider.supports_model(model_id) {
                return Some(provider);
            }
        }
        None
    }

    /// Probes every enabled provider concurrently. A provider without a key
    /// reports synthetically unhealthy instead of being skipped.
    pub async fn health_check_all(
        &self,
        api_keys: &HashMap<ProviderId, String>,
    ) -> HashMap<ProviderId, HealthStatus> {
        let providers = self.enabled().await;
        let checks = providers.iter().map(|provider| {
            let id = provider.id();
            let key = api_keys.get(&id).cloned();
            async move {
                match key {
                    Some(key) => (id, provider.health_check(&key).await),
                    None => (id, HealthStatus::unhealthy(id, "no API key configured")),
                }
            }
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }
}
