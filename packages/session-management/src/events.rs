use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Per-line emission from the supervisor, before tenancy enrichment.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub session_id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: OutputEventType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub line_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputEventType {
    Stdout,
    Stderr,
    Command,
    Exit,
}

/// Supervisor-wide fan-out. Output events carry the session's tenancy so
/// downstream consumers (publisher, history) never have to re-read the store.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    Output {
        workspace_id: String,
        project_id: String,
        event: OutputEvent,
    },
    Terminated {
        session_id: String,
        agent_id: String,
        code: Option<i32>,
        signal: Option<i32>,
        terminated: bool,
    },
    Crashed {
        session_id: String,
        agent_id: String,
        exit_code: Option<i32>,
    },
    Stale {
        session_id: String,
        agent_id: String,
        last_heartbeat: DateTime<Utc>,
    },
    HealthCheckComplete(HealthSnapshot),
}

/// End-of-pass summary emitted by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub stale_sessions: usize,
    pub terminated_sessions: usize,
    pub memory_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Replay snapshot plus a live receiver, handed to late joiners.
#[derive(Debug)]
pub struct SessionSubscription {
    pub initial_events: Vec<OutputEvent>,
    pub receiver: broadcast::Receiver<OutputEvent>,
}

pub(crate) const EVENT_RING_CAPACITY: usize = 1_000;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bounded ring of recent events plus a broadcast channel for live
/// subscribers. One per session.
#[derive(Debug)]
pub(crate) struct SessionEventBus {
    sender: broadcast::Sender<OutputEvent>,
    ring: VecDeque<OutputEvent>,
    capacity: usize,
}

impl SessionEventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            ring: VecDeque::with_capacity(capacity.min(EVENT_RING_CAPACITY)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, event: OutputEvent) {
        self.ring.push_back(event.clone());
        while self.ring.len() > self.capacity {
            self.ring.pop_front();
        }
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> SessionSubscription {
        SessionSubscription {
            initial_events: self.ring.iter().cloned().collect(),
            receiver: self.sender.subscribe(),
        }
    }

    #[cfg(test)]
    pub(crate) fn ring_len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line_number: u64) -> OutputEvent {
        OutputEvent {
            session_id: "s-1".to_string(),
            agent_id: "a-1".to_string(),
            event_type: OutputEventType::Stdout,
            content: format!("line {line_number}"),
            timestamp: Utc::now(),
            line_number,
        }
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let mut bus = SessionEventBus::new(3);
        for n in 1..=5 {
            bus.push(event(n));
        }
        assert_eq!(bus.ring_len(), 3);
        let snapshot = bus.subscribe().initial_events;
        let numbers: Vec<u64> = snapshot.iter().map(|e| e.line_number).collect();
        assert_eq!(numbers, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn subscribers_receive_pushed_events() {
        let mut bus = SessionEventBus::new(10);
        bus.push(event(1));
        let mut sub = bus.subscribe();
        assert_eq!(sub.initial_events.len(), 1);
        bus.push(event(2));
        let live = sub.receiver.recv().await.expect("live event");
        assert_eq!(live.line_number, 2);
    }

    #[test]
    fn output_event_wire_format_is_camel_case() {
        let json = serde_json::to_value(event(7)).expect("serialize");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["type"], "stdout");
        assert_eq!(json["lineNumber"], 7);
    }
}
