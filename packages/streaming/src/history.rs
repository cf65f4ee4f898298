use conductor_error::ConductorError;
use redis::aio::ConnectionManager;

use crate::events::StreamEvent;

pub fn history_key(session_id: &str) -> String {
    format!("cli:history:{session_id}")
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub max_lines: usize,
    pub ttl_seconds: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_lines: 1_000,
            ttl_seconds: 86_400,
        }
    }
}

/// Bounded per-session replay list in the shared store, newest-first on the
/// wire, chronological on read.
#[derive(Clone)]
pub struct HistoryBuffer {
    conn: ConnectionManager,
    config: HistoryConfig,
}

impl HistoryBuffer {
    pub fn new(conn: ConnectionManager, config: HistoryConfig) -> Self {
        Self { conn, config }
    }

    pub async fn append(&self, event: &StreamEvent) -> Result<(), ConductorError> {
        let payload = serde_json::to_string(event)
            .map_err(|err| ConductorError::store(format!("history serialization: {err}")))?;
        let key = history_key(&event.session_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(self.config.max_lines as isize - 1)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.ttl_seconds)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    /// Up to `count` events (default: the buffer bound), oldest first.
    /// Entries that fail to parse are skipped with a log.
    pub async fn get_history(
        &self,
        session_id: &str,
        count: Option<usize>,
    ) -> Result<Vec<StreamEvent>, ConductorError> {
        let count = count.unwrap_or(self.config.max_lines);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(history_key(session_id))
            .arg(0)
            .arg(count as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        let mut events = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<StreamEvent>(&entry) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(session_id, error = %err, "skipping unreadable history entry");
                }
            }
        }
        // Stored newest-first; replay is chronological.
        events.reverse();
        Ok(events)
    }

    /// Read variant for paths where history is advisory: swallows every
    /// error and hands back an empty replay.
    pub async fn get_history_safe(&self, session_id: &str, count: Option<usize>) -> Vec<StreamEvent> {
        match self.get_history(session_id, count).await {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(session_id, error = %err, "history read failed");
                Vec::new()
            }
        }
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), ConductorError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(history_key(session_id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    pub async fn len(&self, session_id: &str) -> Result<usize, ConductorError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(history_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }
}

fn store_err(err: redis::RedisError) -> ConductorError {
    ConductorError::store(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_key_matches_wire_format() {
        assert_eq!(history_key("s1"), "cli:history:s1");
    }
}
