use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_error::ConductorError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use uuid::Uuid;

use crate::events::{
    OutputEvent, OutputEventType, SessionEventBus, SessionNotification, SessionSubscription,
    EVENT_RING_CAPACITY,
};
use crate::record::{SessionRecord, SessionStatus};
use crate::store::SessionStore;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1_024;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Hard admission gate per workspace.
    pub max_sessions_per_workspace: usize,
    pub heartbeat_interval: Duration,
    /// Window between SIGTERM and SIGKILL during termination.
    pub termination_grace: Duration,
    pub spawn_program: String,
    /// Leading arguments; the task string is appended as the final argument.
    pub spawn_args: Vec<String>,
    pub ring_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_workspace: 10,
            heartbeat_interval: Duration::from_secs(30),
            termination_grace: Duration::from_secs(5),
            spawn_program: "claude".to_string(),
            spawn_args: vec!["--print".to_string()],
            ring_capacity: EVENT_RING_CAPACITY,
        }
    }
}

/// Snapshot of one supervised session as returned by the query operations.
pub type SessionHandle = SessionRecord;

#[derive(Debug)]
struct ManagedSession {
    record: SessionRecord,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    bus: SessionEventBus,
    line_counter: Arc<AtomicU64>,
    heartbeat: Option<JoinHandle<()>>,
    terminating: bool,
}

struct SupervisorInner {
    config: SupervisorConfig,
    store: SessionStore,
    sessions: RwLock<HashMap<String, Arc<Mutex<ManagedSession>>>>,
    agents: RwLock<HashMap<String, String>>,
    notifications: broadcast::Sender<SessionNotification>,
}

/// Owns every live child process and its bookkeeping record. All map
/// mutation happens here; external readers get consistent snapshots.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl SessionSupervisor {
    pub fn new(store: SessionStore, config: SupervisorConfig) -> Self {
        let (notifications, _rx) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                store,
                sessions: RwLock::new(HashMap::new()),
                agents: RwLock::new(HashMap::new()),
                notifications,
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<SessionNotification> {
        self.inner.notifications.subscribe()
    }

    pub(crate) fn notification_sender(&self) -> broadcast::Sender<SessionNotification> {
        self.inner.notifications.clone()
    }

    pub async fn create_session(
        &self,
        agent_id: &str,
        task: &str,
        workspace_id: &str,
        project_id: &str,
        working_directory: Option<PathBuf>,
    ) -> Result<SessionHandle, ConductorError> {
        validate_create_inputs(agent_id, task, workspace_id, project_id)?;

        // One live session per agent. The in-memory map is authoritative for
        // this replica; the store pointer covers the others.
        if self.inner.agents.read().await.contains_key(agent_id) {
            return Err(ConductorError::invalid_argument(format!(
                "agent {agent_id} already has an active session"
            )));
        }
        match self.inner.store.get_agent_session_id(agent_id).await {
            Ok(Some(existing)) => {
                return Err(ConductorError::invalid_argument(format!(
                    "agent {agent_id} already has an active session ({existing})"
                )));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(agent_id, error = %err, "agent pointer lookup failed, admitting");
            }
        }

        // Read-then-spawn admission gate. A concurrent create can slip one
        // session past the cap; the documented tradeoff.
        let workspace_count = match self
            .inner
            .store
            .get_workspace_session_count(workspace_id)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(workspace_id, error = %err, "workspace count lookup failed, admitting");
                0
            }
        };
        if workspace_count >= self.inner.config.max_sessions_per_workspace {
            return Err(ConductorError::ConcurrencyExceeded {
                workspace_id: workspace_id.to_string(),
                limit: self.inner.config.max_sessions_per_workspace,
            });
        }

        let session_id = Uuid::new_v4().to_string();
        let cwd = working_directory
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut command = Command::new(&self.inner.config.spawn_program);
        command
            .args(&self.inner.config.spawn_args)
            .arg(task)
            .current_dir(&cwd)
            .env("TERM", "xterm-256color")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| ConductorError::SpawnFailed {
            message: format!(
                "{} {:?}: {err}",
                self.inner.config.spawn_program, self.inner.config.spawn_args
            ),
        })?;

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        // Spawn succeeded, so the record is born past the idle state.
        let now = Utc::now();
        let record = SessionRecord {
            session_id: session_id.clone(),
            workspace_id: workspace_id.to_string(),
            project_id: project_id.to_string(),
            agent_id: agent_id.to_string(),
            pid,
            status: SessionStatus::Running,
            task: task.to_string(),
            started_at: now,
            last_heartbeat: now,
            terminated_at: None,
        };

        if let Err(err) = self.inner.store.store_session(&record).await {
            tracing::warn!(session_id, error = %err, "failed to persist session record");
        }

        let line_counter = Arc::new(AtomicU64::new(0));
        let managed = Arc::new(Mutex::new(ManagedSession {
            record: record.clone(),
            child: Some(child),
            stdin,
            bus: SessionEventBus::new(self.inner.config.ring_capacity),
            line_counter: line_counter.clone(),
            heartbeat: None,
            terminating: false,
        }));

        self.inner
            .sessions
            .write()
            .await
            .insert(session_id.clone(), managed.clone());
        self.inner
            .agents
            .write()
            .await
            .insert(agent_id.to_string(), session_id.clone());

        let stdout_task = stdout.map(|stream| {
            self.spawn_line_reader(
                stream,
                OutputEventType::Stdout,
                &record,
                managed.clone(),
                line_counter.clone(),
            )
        });
        let stderr_task = stderr.map(|stream| {
            self.spawn_line_reader(
                stream,
                OutputEventType::Stderr,
                &record,
                managed.clone(),
                line_counter.clone(),
            )
        });
        self.spawn_exit_monitor(&record, managed.clone(), stdout_task, stderr_task);
        self.spawn_heartbeat(&session_id, managed.clone()).await;

        tracing::info!(session_id, agent_id, workspace_id, pid, "session started");
        Ok(record)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionHandle> {
        let managed = self.inner.sessions.read().await.get(session_id).cloned()?;
        let guard = managed.lock().await;
        Some(guard.record.clone())
    }

    pub async fn get_session_by_agent(&self, agent_id: &str) -> Option<SessionHandle> {
        let session_id = self.inner.agents.read().await.get(agent_id).cloned()?;
        self.get_session(&session_id).await
    }

    pub async fn get_all_sessions(&self) -> Vec<SessionHandle> {
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(sessions.len());
        for managed in sessions {
            records.push(managed.lock().await.record.clone());
        }
        records
    }

    /// Replay snapshot plus a live receiver for one session's output.
    pub async fn subscribe_output(&self, session_id: &str) -> Option<SessionSubscription> {
        let managed = self.inner.sessions.read().await.get(session_id).cloned()?;
        let guard = managed.lock().await;
        Some(guard.bus.subscribe())
    }

    /// Writes one command line to the child's stdin and echoes it on the
    /// event stream with a fresh line number.
    pub async fn send_command(&self, session_id: &str, line: &str) -> Result<(), ConductorError> {
        let managed = self
            .inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound {
                session_id: session_id.to_string(),
            })?;

        let mut guard = managed.lock().await;
        if guard.record.status != SessionStatus::Running {
            return Err(ConductorError::NotRunning {
                session_id: session_id.to_string(),
            });
        }
        let stdin = guard
            .stdin
            .as_mut()
            .ok_or_else(|| ConductorError::StdinClosed {
                session_id: session_id.to_string(),
            })?;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if write.await.is_err() {
            guard.stdin = None;
            return Err(ConductorError::StdinClosed {
                session_id: session_id.to_string(),
            });
        }

        let event = OutputEvent {
            session_id: guard.record.session_id.clone(),
            agent_id: guard.record.agent_id.clone(),
            event_type: OutputEventType::Command,
            content: line.to_string(),
            timestamp: Utc::now(),
            line_number: guard.line_counter.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let workspace_id = guard.record.workspace_id.clone();
        let project_id = guard.record.project_id.clone();
        guard.bus.push(event.clone());
        drop(guard);

        let _ = self.inner.notifications.send(SessionNotification::Output {
            workspace_id,
            project_id,
            event,
        });
        Ok(())
    }

    /// Graceful-then-forced termination. Unknown ids succeed silently.
    pub async fn terminate_session(&self, session_id: &str) -> Result<(), ConductorError> {
        let managed = match self.inner.sessions.read().await.get(session_id).cloned() {
            Some(managed) => managed,
            None => return Ok(()),
        };

        let mut notifications = self.inner.notifications.subscribe();
        {
            let mut guard = managed.lock().await;
            guard.terminating = true;
            match guard.child.as_ref() {
                Some(child) => {
                    let pid = child.id().unwrap_or(guard.record.pid);
                    send_graceful_signal(pid);
                }
                // Exit monitor is already finalizing this session.
                None => return Ok(()),
            }
        }

        if self
            .await_terminated(session_id, &mut notifications, self.inner.config.termination_grace)
            .await
        {
            return Ok(());
        }

        tracing::warn!(session_id, "grace window elapsed, killing process");
        {
            let mut guard = managed.lock().await;
            if let Some(child) = guard.child.as_mut() {
                if let Err(err) = child.start_kill() {
                    tracing::warn!(session_id, error = %err, "kill failed");
                }
            }
        }
        self.await_terminated(session_id, &mut notifications, self.inner.config.termination_grace)
            .await;
        Ok(())
    }

    pub async fn terminate_all_sessions(&self) {
        let ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        let terminations = ids.iter().map(|id| self.terminate_session(id));
        for result in futures::future::join_all(terminations).await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "termination failed during shutdown");
            }
        }
    }

    async fn await_terminated(
        &self,
        session_id: &str,
        notifications: &mut broadcast::Receiver<SessionNotification>,
        deadline: Duration,
    ) -> bool {
        let wait = async {
            loop {
                match notifications.recv().await {
                    Ok(SessionNotification::Terminated {
                        session_id: terminated,
                        ..
                    }) if terminated == session_id => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // May have missed the terminated event; fall back to
                        // the map.
                        if !self.inner.sessions.read().await.contains_key(session_id) {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        timeout(deadline, wait).await.unwrap_or(false)
    }

    fn spawn_line_reader<R>(
        &self,
        stream: R,
        event_type: OutputEventType,
        record: &SessionRecord,
        managed: Arc<Mutex<ManagedSession>>,
        counter: Arc<AtomicU64>,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let notifications = self.inner.notifications.clone();
        let session_id = record.session_id.clone();
        let agent_id = record.agent_id.clone();
        let workspace_id = record.workspace_id.clone();
        let project_id = record.project_id.clone();

        tokio::spawn(async move {
            // `lines` splits on `\n` and strips a trailing `\r`, so CRLF and
            // LF input behave identically and no line is split mid-way.
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(content)) => {
                        // The counter advances before buffering, so the two
                        // stream readers may each observe non-contiguous
                        // numbers; ordering within one stream still holds.
                        let event = OutputEvent {
                            session_id: session_id.clone(),
                            agent_id: agent_id.clone(),
                            event_type,
                            content,
                            timestamp: Utc::now(),
                            line_number: counter.fetch_add(1, Ordering::SeqCst) + 1,
                        };
                        managed.lock().await.bus.push(event.clone());
                        let _ = notifications.send(SessionNotification::Output {
                            workspace_id: workspace_id.clone(),
                            project_id: project_id.clone(),
                            event,
                        });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(session_id, error = %err, "output stream read failed");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_exit_monitor(
        &self,
        record: &SessionRecord,
        managed: Arc<Mutex<ManagedSession>>,
        stdout_task: Option<JoinHandle<()>>,
        stderr_task: Option<JoinHandle<()>>,
    ) {
        let supervisor = self.clone();
        let record = record.clone();
        tokio::spawn(async move {
            let status = loop {
                let status = {
                    let mut guard = managed.lock().await;
                    let Some(child) = guard.child.as_mut() else {
                        return;
                    };
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            guard.child = None;
                            Some(status)
                        }
                        Ok(None) => None,
                        Err(err) => {
                            tracing::warn!(
                                session_id = record.session_id,
                                error = %err,
                                "exit wait failed"
                            );
                            guard.child = None;
                            return;
                        }
                    }
                };
                match status {
                    Some(status) => break status,
                    None => sleep(EXIT_POLL_INTERVAL).await,
                }
            };

            // Let the readers flush buffered output so the synthetic exit
            // event trails the final lines. Orphaned grandchildren can hold
            // the pipes open indefinitely; the window is bounded for that.
            let mut stdout_task = stdout_task;
            let mut stderr_task = stderr_task;
            let drain = async {
                if let Some(task) = stdout_task.as_mut() {
                    let _ = task.await;
                }
                if let Some(task) = stderr_task.as_mut() {
                    let _ = task.await;
                }
            };
            if timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
                tracing::debug!(
                    session_id = record.session_id,
                    "output streams still open after exit, closing readers"
                );
                if let Some(task) = &stdout_task {
                    task.abort();
                }
                if let Some(task) = &stderr_task {
                    task.abort();
                }
            }

            supervisor
                .finalize_session(&record.session_id, &managed, status)
                .await;
        });
    }

    async fn finalize_session(
        &self,
        session_id: &str,
        managed: &Arc<Mutex<ManagedSession>>,
        status: std::process::ExitStatus,
    ) {
        let code = status.code();
        let signal = exit_signal(&status);

        let (agent_id, was_terminating) = {
            let mut guard = managed.lock().await;
            guard.record.status = SessionStatus::Terminated;
            guard.record.terminated_at = Some(Utc::now());
            if let Some(heartbeat) = guard.heartbeat.take() {
                heartbeat.abort();
            }
            guard.stdin = None;

            let event = OutputEvent {
                session_id: session_id.to_string(),
                agent_id: guard.record.agent_id.clone(),
                event_type: OutputEventType::Exit,
                content: format!(
                    "Process exited with code {}, signal {}",
                    format_opt(code),
                    format_opt(signal)
                ),
                timestamp: Utc::now(),
                line_number: guard.line_counter.fetch_add(1, Ordering::SeqCst) + 1,
            };
            guard.bus.push(event.clone());
            let _ = self.inner.notifications.send(SessionNotification::Output {
                workspace_id: guard.record.workspace_id.clone(),
                project_id: guard.record.project_id.clone(),
                event,
            });

            (guard.record.agent_id.clone(), guard.terminating)
        };

        if !was_terminating && code != Some(0) {
            let _ = self.inner.notifications.send(SessionNotification::Crashed {
                session_id: session_id.to_string(),
                agent_id: agent_id.clone(),
                exit_code: code,
            });
        }

        self.inner.sessions.write().await.remove(session_id);
        {
            let mut agents = self.inner.agents.write().await;
            if agents.get(&agent_id).map(String::as_str) == Some(session_id) {
                agents.remove(&agent_id);
            }
        }
        if let Err(err) = self.inner.store.delete_session(session_id).await {
            tracing::warn!(session_id, error = %err, "failed to delete session record");
        }

        let _ = self
            .inner
            .notifications
            .send(SessionNotification::Terminated {
                session_id: session_id.to_string(),
                agent_id,
                code,
                signal,
                terminated: true,
            });

        tracing::info!(session_id, code, signal, "session terminated");
    }

    async fn spawn_heartbeat(&self, session_id: &str, managed: Arc<Mutex<ManagedSession>>) {
        let store = self.inner.store.clone();
        let session_id = session_id.to_string();
        let period = self.inner.config.heartbeat_interval;
        let beat_target = managed.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            // The record was persisted with a fresh heartbeat moments ago.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                {
                    let mut guard = beat_target.lock().await;
                    if guard.record.status != SessionStatus::Running {
                        break;
                    }
                    guard.record.last_heartbeat = now;
                }
                if let Err(err) = store.update_heartbeat(&session_id, now).await {
                    tracing::warn!(session_id, error = %err, "heartbeat write failed");
                }
            }
        });
        managed.lock().await.heartbeat = Some(handle);
    }
}

fn validate_create_inputs(
    agent_id: &str,
    task: &str,
    workspace_id: &str,
    project_id: &str,
) -> Result<(), ConductorError> {
    for (name, value) in [
        ("agentId", agent_id),
        ("task", task),
        ("workspaceId", workspace_id),
        ("projectId", project_id),
    ] {
        if value.trim().is_empty() {
            return Err(ConductorError::invalid_argument(format!(
                "{name} must not be empty"
            )));
        }
    }
    for (name, value) in [
        ("agentId", agent_id),
        ("workspaceId", workspace_id),
        ("projectId", project_id),
    ] {
        validate_canonical_shape(name, value)?;
    }
    Ok(())
}

/// Ids are free-form, but one that already looks like the canonical
/// 36-character hyphenated form must actually parse as one.
fn validate_canonical_shape(name: &str, value: &str) -> Result<(), ConductorError> {
    let looks_canonical = value.len() == 36 && value.bytes().filter(|b| *b == b'-').count() == 4;
    if looks_canonical && Uuid::parse_str(value).is_err() {
        return Err(ConductorError::invalid_argument(format!(
            "{name} resembles a canonical id but is malformed: {value}"
        )));
    }
    Ok(())
}

fn format_opt(value: Option<i32>) -> String {
    value.map_or_else(|| "null".to_string(), |v| v.to_string())
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32) {
    // SIGTERM first; the kill escalation happens after the grace window.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_pid: u32) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_inputs() {
        let err = validate_create_inputs("", "task", "ws", "prj").expect_err("empty agent");
        assert!(err.to_string().contains("agentId"));
        let err = validate_create_inputs("agent", "  ", "ws", "prj").expect_err("blank task");
        assert!(err.to_string().contains("task"));
    }

    #[test]
    fn canonical_looking_ids_must_parse() {
        // Right length and hyphen count, invalid hex.
        let almost = "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz";
        assert_eq!(almost.len(), 36);
        let err =
            validate_create_inputs("agent-1", "task", almost, "prj-1").expect_err("malformed");
        assert!(err.to_string().contains("workspaceId"));

        let canonical = Uuid::new_v4().to_string();
        validate_create_inputs("agent-1", "task", &canonical, "prj-1").expect("valid uuid");
    }

    #[test]
    fn short_ids_skip_shape_validation() {
        validate_create_inputs("agent-1", "task", "ws-1", "prj-1").expect("free-form ids pass");
    }

    #[test]
    fn exit_content_formats_missing_values_as_null() {
        assert_eq!(format_opt(Some(0)), "0");
        assert_eq!(format_opt(None), "null");
    }
}
