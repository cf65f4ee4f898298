use async_trait::async_trait;
use conductor_error::ConductorError;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

/// Sink for serialized stream events. The production sink is the shared
/// store's pub/sub; the in-memory sink backs tests and embedded use.
#[async_trait]
pub trait PublishBackend: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ConductorError>;
}

#[derive(Clone)]
pub struct RedisPublishBackend {
    conn: ConnectionManager,
}

impl RedisPublishBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PublishBackend for RedisPublishBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ConductorError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| ConductorError::store(err.to_string()))
    }
}

/// Collects published messages in order.
#[derive(Default)]
pub struct InMemoryPublishBackend {
    messages: Mutex<Vec<(String, String)>>,
}

impl InMemoryPublishBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl PublishBackend for InMemoryPublishBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ConductorError> {
        self.messages
            .lock()
            .await
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}
