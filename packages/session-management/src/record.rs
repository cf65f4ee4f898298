use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conductor_error::ConductorError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// Bookkeeping record for one live child process. The supervisor owns the
/// in-memory copy; the store owns the persisted hash.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub pid: u32,
    pub status: SessionStatus,
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Field pairs for the store hash. Every value is a string; integers are
    /// formatted explicitly so the round trip through the store is lossless.
    pub fn to_field_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("sessionId".to_string(), self.session_id.clone()),
            ("workspaceId".to_string(), self.workspace_id.clone()),
            ("projectId".to_string(), self.project_id.clone()),
            ("agentId".to_string(), self.agent_id.clone()),
            ("pid".to_string(), self.pid.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("task".to_string(), self.task.clone()),
            ("startedAt".to_string(), self.started_at.to_rfc3339()),
            ("lastHeartbeat".to_string(), self.last_heartbeat.to_rfc3339()),
        ];
        if let Some(terminated_at) = self.terminated_at {
            pairs.push(("terminatedAt".to_string(), terminated_at.to_rfc3339()));
        }
        pairs
    }

    pub fn from_field_map(fields: &HashMap<String, String>) -> Result<Self, ConductorError> {
        let get = |name: &str| {
            fields.get(name).cloned().ok_or_else(|| {
                ConductorError::store(format!("session record missing field {name}"))
            })
        };

        let pid = get("pid")?
            .parse::<u32>()
            .map_err(|err| ConductorError::store(format!("bad pid field: {err}")))?;
        let status_raw = get("status")?;
        let status = SessionStatus::parse(&status_raw)
            .ok_or_else(|| ConductorError::store(format!("bad status field: {status_raw}")))?;
        let terminated_at = fields
            .get("terminatedAt")
            .map(|raw| parse_timestamp("terminatedAt", raw))
            .transpose()?;

        Ok(Self {
            session_id: get("sessionId")?,
            workspace_id: get("workspaceId")?,
            project_id: get("projectId")?,
            agent_id: get("agentId")?,
            pid,
            status,
            task: get("task")?,
            started_at: parse_timestamp("startedAt", &get("startedAt")?)?,
            last_heartbeat: parse_timestamp("lastHeartbeat", &get("lastHeartbeat")?)?,
            terminated_at,
        })
    }
}

fn parse_timestamp(name: &str, raw: &str) -> Result<DateTime<Utc>, ConductorError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| ConductorError::store(format!("bad {name} field: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            session_id: "3e9f4a92-9d14-4b2e-bf61-0a3c0e6d8f11".to_string(),
            workspace_id: "ws-1".to_string(),
            project_id: "prj-1".to_string(),
            agent_id: "agent-1".to_string(),
            pid: 4242,
            status: SessionStatus::Running,
            task: "do x".to_string(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            terminated_at: None,
        }
    }

    #[test]
    fn field_map_round_trip_preserves_record() {
        let original = record();
        let fields: HashMap<String, String> = original.to_field_pairs().into_iter().collect();
        let restored = SessionRecord::from_field_map(&fields).expect("restore");

        assert_eq!(restored.session_id, original.session_id);
        assert_eq!(restored.pid, 4242);
        assert_eq!(restored.status, SessionStatus::Running);
        assert_eq!(restored.started_at, original.started_at);
        assert!(restored.terminated_at.is_none());
    }

    #[test]
    fn terminated_at_round_trips_when_set() {
        let mut original = record();
        original.status = SessionStatus::Terminated;
        original.terminated_at = Some(Utc::now());
        let fields: HashMap<String, String> = original.to_field_pairs().into_iter().collect();
        let restored = SessionRecord::from_field_map(&fields).expect("restore");
        assert_eq!(restored.terminated_at, original.terminated_at);
    }

    #[test]
    fn missing_field_is_a_store_error() {
        let mut fields: HashMap<String, String> = record().to_field_pairs().into_iter().collect();
        fields.remove("pid");
        let err = SessionRecord::from_field_map(&fields).expect_err("must fail");
        assert!(err.to_string().contains("pid"));
    }
}
