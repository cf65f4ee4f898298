use std::time::Duration;

use chrono::Utc;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::events::{HealthSnapshot, SessionNotification};
use crate::record::SessionStatus;
use crate::store::SessionStore;
use crate::supervisor::SessionSupervisor;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    /// Sessions whose heartbeat is older than this are reclaimed.
    pub stale_threshold: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(300),
        }
    }
}

/// Periodic staleness sweep over the store. Every error is swallowed into
/// logs; the monitor must outlive anything it observes.
pub struct HealthMonitor {
    store: SessionStore,
    supervisor: SessionSupervisor,
    notifications: broadcast::Sender<SessionNotification>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(supervisor: SessionSupervisor, config: HealthMonitorConfig) -> Self {
        Self {
            store: supervisor.store().clone(),
            notifications: supervisor.notification_sender(),
            supervisor,
            config,
        }
    }

    /// Runs the sweep loop until the returned handle is aborted. The first
    /// pass happens immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.check_interval);
            loop {
                ticker.tick().await;
                let snapshot = self.run_pass().await;
                tracing::debug!(
                    total = snapshot.total_sessions,
                    active = snapshot.active_sessions,
                    stale = snapshot.stale_sessions,
                    terminated = snapshot.terminated_sessions,
                    "health pass complete"
                );
            }
        })
    }

    /// One full sweep. Exposed separately so the pass is drivable in tests
    /// and ad-hoc tooling.
    pub async fn run_pass(&self) -> HealthSnapshot {
        let session_ids = match self.store.get_all_session_ids(None).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err, "session enumeration failed, skipping pass");
                Vec::new()
            }
        };

        let mut total = 0usize;
        let mut active = 0usize;
        let mut stale = 0usize;
        let mut terminated = 0usize;
        let now = Utc::now();

        for session_id in session_ids {
            let record = match self.store.get_session(&session_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(session_id, error = %err, "session read failed");
                    continue;
                }
            };
            total += 1;

            if record.status == SessionStatus::Terminated {
                terminated += 1;
                continue;
            }

            let age = now.signed_duration_since(record.last_heartbeat);
            let threshold =
                chrono::Duration::from_std(self.config.stale_threshold).unwrap_or_default();
            if age <= threshold {
                active += 1;
                continue;
            }

            stale += 1;
            tracing::warn!(
                session_id,
                agent_id = record.agent_id,
                last_heartbeat = %record.last_heartbeat,
                "reclaiming stale session"
            );
            let _ = self.notifications.send(SessionNotification::Stale {
                session_id: session_id.clone(),
                agent_id: record.agent_id.clone(),
                last_heartbeat: record.last_heartbeat,
            });

            self.reclaim(&session_id).await;
        }

        let snapshot = HealthSnapshot {
            total_sessions: total,
            active_sessions: active,
            stale_sessions: stale,
            terminated_sessions: terminated,
            memory_bytes: process_memory_bytes(),
            timestamp: Utc::now(),
        };
        let _ = self
            .notifications
            .send(SessionNotification::HealthCheckComplete(snapshot.clone()));
        snapshot
    }

    async fn reclaim(&self, session_id: &str) {
        // A session from a dead replica has no local handle; terminate_session
        // would succeed silently without touching the record, so write the
        // terminal status straight to the store in that case.
        if self.supervisor.get_session(session_id).await.is_none() {
            if let Err(err) = self
                .store
                .update_status(session_id, SessionStatus::Terminated)
                .await
            {
                tracing::warn!(session_id, error = %err, "failed to mark stale session terminated");
            }
            return;
        }

        if let Err(err) = self.supervisor.terminate_session(session_id).await {
            tracing::warn!(session_id, error = %err, "stale termination failed, forcing status");
            if let Err(err) = self
                .store
                .update_status(session_id, SessionStatus::Terminated)
                .await
            {
                tracing::warn!(session_id, error = %err, "failed to mark stale session terminated");
            }
        }
    }
}

fn process_memory_bytes() -> u64 {
    let pid = Pid::from_u32(std::process::id());
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
    );
    system.process(pid).map(|p| p.memory()).unwrap_or_default()
}
