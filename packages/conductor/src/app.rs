use std::sync::Arc;

use conductor_error::ConductorError;
use conductor_model_routing::{
    AnthropicProvider, DeepSeekProvider, GoogleProvider, ModelCatalogClient, OpenAiProvider,
    ProviderRegistry, TaskRouter,
};
use conductor_session_management::{
    HealthMonitor, SessionNotification, SessionStore, SessionSupervisor,
};
use conductor_streaming::{HistoryBuffer, RedisPublishBackend, StreamPublisher};
use tokio::task::JoinHandle;

use crate::config::Config;

/// Singleton wiring: store, supervisor, publisher, monitor, providers,
/// catalog, router. Owns the bridge task that feeds supervisor output into
/// the publisher.
pub struct App {
    pub supervisor: SessionSupervisor,
    pub publisher: StreamPublisher,
    pub history: HistoryBuffer,
    pub registry: Arc<ProviderRegistry>,
    pub catalog: Arc<ModelCatalogClient>,
    pub router: Arc<TaskRouter>,
    monitor: JoinHandle<()>,
    bridge: JoinHandle<()>,
}

impl App {
    pub async fn start(config: Config) -> Result<Self, ConductorError> {
        let client = redis::Client::open(config.redis_url())
            .map_err(|err| ConductorError::store(format!("redis client: {err}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|err| ConductorError::store(format!("redis connection: {err}")))?;

        let store = SessionStore::new(conn.clone(), config.store.clone());
        let supervisor = SessionSupervisor::new(store, config.supervisor.clone());

        let history = HistoryBuffer::new(conn.clone(), config.history.clone());
        let backend = Arc::new(RedisPublishBackend::new(conn));
        let publisher = StreamPublisher::new(
            backend,
            Some(history.clone()),
            config.publisher.clone(),
        );

        let bridge = spawn_event_bridge(&supervisor, publisher.clone());
        let monitor =
            HealthMonitor::new(supervisor.clone(), config.health.clone()).spawn();

        let registry = Arc::new(ProviderRegistry::new());
        {
            let mut anthropic =
                AnthropicProvider::new().with_policy(config.provider_policy.clone());
            if let Some(base_url) = &config.anthropic_base_url {
                anthropic = anthropic.with_base_url(base_url);
            }
            registry.register(Arc::new(anthropic)).await;

            let mut openai = OpenAiProvider::new().with_policy(config.provider_policy.clone());
            if let Some(base_url) = &config.openai_base_url {
                openai = openai.with_base_url(base_url);
            }
            registry.register(Arc::new(openai)).await;

            let mut google = GoogleProvider::new().with_policy(config.provider_policy.clone());
            if let Some(base_url) = &config.google_base_url {
                google = google.with_base_url(base_url);
            }
            registry.register(Arc::new(google)).await;

            let mut deepseek =
                DeepSeekProvider::new().with_policy(config.provider_policy.clone());
            if let Some(base_url) = &config.deepseek_base_url {
                deepseek = deepseek.with_base_url(base_url);
            }
            registry.register(Arc::new(deepseek)).await;
        }

        let catalog = Arc::new(ModelCatalogClient::new(config.catalog.clone()));
        let router = Arc::new(TaskRouter::new(catalog.clone(), registry.clone()));

        tracing::info!("conductor started");
        Ok(Self {
            supervisor,
            publisher,
            history,
            registry,
            catalog,
            router,
            monitor,
            bridge,
        })
    }

    /// Shutdown cascade: stop the health monitor, drain the publisher,
    /// terminate every session, then let the store connection drop.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.monitor.abort();
        self.publisher.shutdown().await;
        self.supervisor.terminate_all_sessions().await;
        self.bridge.abort();
        tracing::info!("shutdown complete");
    }
}

fn spawn_event_bridge(supervisor: &SessionSupervisor, publisher: StreamPublisher) -> JoinHandle<()> {
    let mut notifications = supervisor.subscribe_notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(SessionNotification::Output {
                    workspace_id,
                    project_id,
                    event,
                }) => {
                    publisher.enqueue(&workspace_id, &project_id, &event).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event bridge lagged, output events skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
