use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conductor_error::ConductorError;
use redis::aio::ConnectionManager;

use crate::record::{SessionRecord, SessionStatus};

const SESSION_KEY_PREFIX: &str = "cli:session:";
const SCAN_PAGE_SIZE: usize = 100;

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

pub fn workspace_key(workspace_id: &str) -> String {
    format!("cli:workspace:{workspace_id}:sessions")
}

pub fn agent_key(agent_id: &str) -> String {
    format!("cli:agent:{agent_id}")
}

#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// TTL applied to session records, refreshed on every heartbeat.
    pub ttl_seconds: i64,
    /// Hard cap on iterative key enumeration.
    pub max_scan_results: usize,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 86_400,
            max_scan_results: 10_000,
        }
    }
}

/// Cross-replica session index over the shared key-value store.
#[derive(Clone)]
pub struct SessionStore {
    conn: ConnectionManager,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(conn: ConnectionManager, config: SessionStoreConfig) -> Self {
        Self { conn, config }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.config.ttl_seconds
    }

    pub async fn store_session(&self, record: &SessionRecord) -> Result<(), ConductorError> {
        let mut conn = self.conn.clone();
        let key = session_key(&record.session_id);

        let mut hset = redis::cmd("HSET");
        hset.arg(&key);
        for (field, value) in record.to_field_pairs() {
            hset.arg(field).arg(value);
        }

        let mut pipe = redis::pipe();
        pipe.add_command(hset)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.ttl_seconds)
            .cmd("SADD")
            .arg(workspace_key(&record.workspace_id))
            .arg(&record.session_id)
            .cmd("SET")
            .arg(agent_key(&record.agent_id))
            .arg(&record.session_id);
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, ConductorError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(session_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        SessionRecord::from_field_map(&fields).map(Some)
    }

    /// Reads the record first so the workspace set and agent pointer can be
    /// cleaned alongside the hash. Best effort; the health monitor reconciles
    /// anything a crashed replica leaves behind.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ConductorError> {
        let record = self.get_session(session_id).await?;
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(session_key(session_id));
        if let Some(record) = &record {
            pipe.cmd("SREM")
                .arg(workspace_key(&record.workspace_id))
                .arg(session_id)
                .cmd("DEL")
                .arg(agent_key(&record.agent_id));
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn update_heartbeat(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ConductorError> {
        let mut conn = self.conn.clone();
        let key = session_key(session_id);
        redis::pipe()
            .cmd("HSET")
            .arg(&key)
            .arg("lastHeartbeat")
            .arg(at.to_rfc3339())
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.ttl_seconds)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), ConductorError> {
        let mut conn = self.conn.clone();
        let key = session_key(session_id);
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key).arg("status").arg(status.as_str());
        if status == SessionStatus::Terminated {
            cmd.arg("terminatedAt").arg(Utc::now().to_rfc3339());
        }
        cmd.query_async::<()>(&mut conn).await.map_err(store_err)?;
        Ok(())
    }

    pub async fn get_workspace_sessions(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<String>, ConductorError> {
        let mut conn = self.conn.clone();
        redis::cmd("SMEMBERS")
            .arg(workspace_key(workspace_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    pub async fn get_workspace_session_count(
        &self,
        workspace_id: &str,
    ) -> Result<usize, ConductorError> {
        let mut conn = self.conn.clone();
        redis::cmd("SCARD")
            .arg(workspace_key(workspace_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    pub async fn get_agent_session_id(
        &self,
        agent_id: &str,
    ) -> Result<Option<String>, ConductorError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(agent_key(agent_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    pub async fn get_session_by_agent(
        &self,
        agent_id: &str,
    ) -> Result<Option<SessionRecord>, ConductorError> {
        match self.get_agent_session_id(agent_id).await? {
            Some(session_id) => self.get_session(&session_id).await,
            None => Ok(None),
        }
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool, ConductorError> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(session_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(exists > 0)
    }

    /// Iterative SCAN over session keys. Bounded by `max_results` (falling
    /// back to the configured cap) so a runaway keyspace cannot stall a
    /// health pass.
    pub async fn get_all_session_ids(
        &self,
        max_results: Option<usize>,
    ) -> Result<Vec<String>, ConductorError> {
        let cap = max_results.unwrap_or(self.config.max_scan_results);
        let mut conn = self.conn.clone();
        let mut ids = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{SESSION_KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;

            for key in keys {
                if let Some(id) = key.strip_prefix(SESSION_KEY_PREFIX) {
                    ids.push(id.to_string());
                    if ids.len() >= cap {
                        return Ok(ids);
                    }
                }
            }

            cursor = next;
            if cursor == 0 {
                return Ok(ids);
            }
        }
    }
}

fn store_err(err: redis::RedisError) -> ConductorError {
    ConductorError::store(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_families_match_wire_format() {
        assert_eq!(session_key("abc"), "cli:session:abc");
        assert_eq!(workspace_key("ws-1"), "cli:workspace:ws-1:sessions");
        assert_eq!(agent_key("agent-1"), "cli:agent:agent-1");
    }
}
