use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conductor_session_management::{OutputEvent, OutputEventType};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::backend::PublishBackend;
use crate::events::{
    channel_for_workspace, OutputKind, StreamEvent, StreamEventMetadata, StreamEventType,
};
use crate::history::HistoryBuffer;
use crate::parser::classify_line;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_batch_size: usize,
    /// Rolling window measured from the first enqueue of a batch.
    pub batch_window: Duration,
    pub retry_attempts: u32,
    /// Base for the exponential backoff between attempts.
    pub retry_delay: Duration,
    /// Deadline each individual publish races against.
    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            batch_window: Duration::from_millis(100),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            publish_timeout: Duration::from_millis(500),
        }
    }
}

/// Read-only observation snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherMetrics {
    pub events_published: u64,
    pub batches_published: u64,
    pub avg_batch_size: f64,
    pub avg_publish_latency_ms: f64,
    pub publish_failures: u64,
    pub last_publish_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct PendingMessage {
    channel: String,
    payload: String,
}

#[derive(Default)]
struct BatchState {
    pending: Vec<PendingMessage>,
    timer: Option<JoinHandle<()>>,
    draining: bool,
}

#[derive(Default)]
struct MetricsState {
    events_published: u64,
    batches_published: u64,
    batch_size_sum: u64,
    latency_sum_ms: f64,
    publish_failures: u64,
    last_publish_at: Option<DateTime<Utc>>,
}

struct PublisherInner {
    backend: Arc<dyn PublishBackend>,
    history: Option<HistoryBuffer>,
    config: PublisherConfig,
    state: Mutex<BatchState>,
    /// Single-flight guard: at most one flush touches the backend at a time.
    flush_lock: Mutex<()>,
    metrics: Mutex<MetricsState>,
}

/// Transforms supervisor output into tenancy-tagged stream events and
/// publishes them, batched, to `cli-events:{workspaceId}`. Delivery is
/// fire-and-forget: exhausted messages are dropped and counted, never
/// surfaced to the producer path.
#[derive(Clone)]
pub struct StreamPublisher {
    inner: Arc<PublisherInner>,
}

impl StreamPublisher {
    pub fn new(
        backend: Arc<dyn PublishBackend>,
        history: Option<HistoryBuffer>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                backend,
                history,
                config,
                state: Mutex::new(BatchState::default()),
                flush_lock: Mutex::new(()),
                metrics: Mutex::new(MetricsState::default()),
            }),
        }
    }

    /// Enriches and enqueues one output event. Never fails; all delivery
    /// problems surface as metrics and logs.
    pub async fn enqueue(&self, workspace_id: &str, project_id: &str, event: &OutputEvent) {
        let stream_event = transform(workspace_id, project_id, event);

        if let Some(history) = &self.inner.history {
            if let Err(err) = history.append(&stream_event).await {
                tracing::warn!(
                    session_id = stream_event.session_id,
                    error = %err,
                    "history append failed"
                );
            }
        }

        let payload = match serde_json::to_string(&stream_event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "stream event serialization failed");
                self.inner.metrics.lock().await.publish_failures += 1;
                return;
            }
        };
        let message = PendingMessage {
            channel: channel_for_workspace(workspace_id),
            payload,
        };

        let flush_now = {
            let mut state = self.inner.state.lock().await;
            if state.draining {
                drop(state);
                // Drained publishers schedule nothing; account for the drop.
                self.inner.metrics.lock().await.publish_failures += 1;
                return;
            }
            state.pending.push(message);
            if state.pending.len() >= self.inner.config.max_batch_size {
                true
            } else {
                if state.timer.is_none() {
                    let publisher = self.clone();
                    let window = self.inner.config.batch_window;
                    state.timer = Some(tokio::spawn(async move {
                        sleep(window).await;
                        // Drop our own handle first: flush aborts whatever
                        // timer is registered, and that must not be us.
                        publisher.inner.state.lock().await.timer = None;
                        publisher.flush().await;
                    }));
                }
                false
            }
        };

        if flush_now {
            let publisher = self.clone();
            tokio::spawn(async move {
                publisher.flush().await;
            });
        }
    }

    /// Drains the current batch. Concurrent callers serialize on the flush
    /// lock; arrivals during the in-flight publish get a follow-up flush.
    pub fn flush(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.flush_inner())
    }

    async fn flush_inner(&self) {
        let _guard = self.inner.flush_lock.lock().await;

        let batch = {
            let mut state = self.inner.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }

        let started = Instant::now();
        let mut published = 0u64;
        let mut failed = 0u64;
        for message in &batch {
            if self.publish_with_retry(message).await {
                published += 1;
            } else {
                failed += 1;
            }
        }
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        {
            let mut metrics = self.inner.metrics.lock().await;
            metrics.events_published += published;
            metrics.publish_failures += failed;
            metrics.batches_published += 1;
            metrics.batch_size_sum += batch.len() as u64;
            metrics.latency_sum_ms += elapsed_ms;
            if published > 0 {
                metrics.last_publish_at = Some(Utc::now());
            }
        }
        drop(_guard);

        let follow_up = {
            let state = self.inner.state.lock().await;
            !state.pending.is_empty()
        };
        if follow_up {
            let publisher = self.clone();
            tokio::spawn(async move {
                publisher.flush().await;
            });
        }
    }

    async fn publish_with_retry(&self, message: &PendingMessage) -> bool {
        let config = &self.inner.config;
        for attempt in 0..config.retry_attempts {
            let result = timeout(
                config.publish_timeout,
                self.inner.backend.publish(&message.channel, &message.payload),
            )
            .await;
            match result {
                Ok(Ok(())) => return true,
                Ok(Err(err)) => {
                    tracing::debug!(
                        channel = message.channel,
                        attempt,
                        error = %err,
                        "publish attempt failed"
                    );
                }
                Err(_) => {
                    let err = conductor_error::ConductorError::PublishTimeout {
                        elapsed_ms: config.publish_timeout.as_millis() as u64,
                    };
                    tracing::debug!(
                        channel = message.channel,
                        attempt,
                        error = %err,
                        "publish attempt timed out"
                    );
                }
            }
            sleep(config.retry_delay * 2u32.pow(attempt)).await;
        }
        tracing::warn!(channel = message.channel, "dropping message after retries");
        false
    }

    /// Marks the publisher drained, cancels the pending batch timer, and
    /// performs one final flush.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.draining = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        self.flush().await;
    }

    pub async fn metrics(&self) -> PublisherMetrics {
        let metrics = self.inner.metrics.lock().await;
        let batches = metrics.batches_published;
        PublisherMetrics {
            events_published: metrics.events_published,
            batches_published: batches,
            avg_batch_size: if batches > 0 {
                metrics.batch_size_sum as f64 / batches as f64
            } else {
                0.0
            },
            avg_publish_latency_ms: if batches > 0 {
                metrics.latency_sum_ms / batches as f64
            } else {
                0.0
            },
            publish_failures: metrics.publish_failures,
            last_publish_at: metrics.last_publish_at,
        }
    }
}

/// Pure enrichment: classification refines the type (commands are preserved
/// as-is) and only the matching metadata facet is attached.
pub fn transform(workspace_id: &str, project_id: &str, event: &OutputEvent) -> StreamEvent {
    let (event_type, metadata) = match event.event_type {
        OutputEventType::Command => (StreamEventType::Command, None),
        source => {
            let classification = classify_line(&event.content);
            let metadata = match classification.event_type {
                StreamEventType::Output => output_metadata(source),
                _ => classification.metadata,
            };
            (classification.event_type, metadata)
        }
    };

    StreamEvent {
        session_id: event.session_id.clone(),
        agent_id: event.agent_id.clone(),
        project_id: project_id.to_string(),
        workspace_id: workspace_id.to_string(),
        event_type,
        content: event.content.clone(),
        timestamp: event.timestamp,
        line_number: event.line_number,
        metadata: metadata.filter(|m| !m.is_empty()),
    }
}

fn output_metadata(source: OutputEventType) -> Option<StreamEventMetadata> {
    let output_type = match source {
        OutputEventType::Stdout => Some(OutputKind::Stdout),
        OutputEventType::Stderr => Some(OutputKind::Stderr),
        _ => None,
    }?;
    Some(StreamEventMetadata {
        output_type: Some(output_type),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryPublishBackend;
    use crate::events::TestStatus;
    use async_trait::async_trait;
    use conductor_error::ConductorError;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn output_event(event_type: OutputEventType, content: &str, line_number: u64) -> OutputEvent {
        OutputEvent {
            session_id: "s-1".to_string(),
            agent_id: "agent-1".to_string(),
            event_type,
            content: content.to_string(),
            timestamp: Utc::now(),
            line_number,
        }
    }

    #[test]
    fn transform_tags_plain_stdout_with_output_type() {
        let event = output_event(OutputEventType::Stdout, "Building project...", 1);
        let stream = transform("ws-1", "prj-1", &event);
        assert_eq!(stream.event_type, StreamEventType::Output);
        assert_eq!(stream.workspace_id, "ws-1");
        assert_eq!(stream.project_id, "prj-1");
        assert_eq!(
            stream.metadata.expect("metadata").output_type,
            Some(OutputKind::Stdout)
        );
    }

    #[test]
    fn transform_refines_test_results_without_output_type() {
        let event = output_event(OutputEventType::Stdout, "PASS src/x.spec.ts", 2);
        let stream = transform("ws-1", "prj-1", &event);
        assert_eq!(stream.event_type, StreamEventType::TestResult);
        let metadata = stream.metadata.expect("metadata");
        assert_eq!(metadata.test_name.as_deref(), Some("x.spec.ts"));
        assert_eq!(metadata.test_status, Some(TestStatus::Passed));
        assert_eq!(metadata.file_path.as_deref(), Some("src/x.spec.ts"));
        assert!(metadata.output_type.is_none());
    }

    #[test]
    fn transform_preserves_command_source() {
        // The injected command itself, not a shell prompt line.
        let event = output_event(OutputEventType::Command, "run the tests", 3);
        let stream = transform("ws-1", "prj-1", &event);
        assert_eq!(stream.event_type, StreamEventType::Command);
        assert!(stream.metadata.is_none());
    }

    #[test]
    fn transform_leaves_exit_events_bare() {
        let event = output_event(
            OutputEventType::Exit,
            "Process exited with code 0, signal null",
            4,
        );
        let stream = transform("ws-1", "prj-1", &event);
        assert_eq!(stream.event_type, StreamEventType::Output);
        assert!(stream.metadata.is_none());
    }

    #[tokio::test]
    async fn batch_window_groups_two_arrivals_into_one_publish() {
        let backend = Arc::new(InMemoryPublishBackend::new());
        let publisher = StreamPublisher::new(backend.clone(), None, PublisherConfig::default());

        publisher
            .enqueue(
                "ws-1",
                "prj-1",
                &output_event(OutputEventType::Stdout, "Building project...", 1),
            )
            .await;
        sleep(Duration::from_millis(50)).await;
        publisher
            .enqueue(
                "ws-1",
                "prj-1",
                &output_event(OutputEventType::Stdout, "PASS src/x.spec.ts", 2),
            )
            .await;

        // Window is 100ms from the first arrival.
        sleep(Duration::from_millis(120)).await;

        let messages = backend.messages().await;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|(channel, _)| channel == "cli-events:ws-1"));
        let first: StreamEvent = serde_json::from_str(&messages[0].1).expect("first");
        let second: StreamEvent = serde_json::from_str(&messages[1].1).expect("second");
        assert_eq!(first.event_type, StreamEventType::Output);
        assert_eq!(second.event_type, StreamEventType::TestResult);

        let metrics = publisher.metrics().await;
        assert_eq!(metrics.batches_published, 1);
        assert_eq!(metrics.events_published, 2);
        assert!((metrics.avg_batch_size - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reaching_max_batch_size_flushes_without_waiting() {
        let backend = Arc::new(InMemoryPublishBackend::new());
        let config = PublisherConfig {
            max_batch_size: 3,
            batch_window: Duration::from_secs(60),
            ..Default::default()
        };
        let publisher = StreamPublisher::new(backend.clone(), None, config);

        for n in 1..=3 {
            publisher
                .enqueue(
                    "ws-1",
                    "prj-1",
                    &output_event(OutputEventType::Stdout, "line", n),
                )
                .await;
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.len().await, 3);
    }

    #[tokio::test]
    async fn publish_order_follows_enqueue_order() {
        let backend = Arc::new(InMemoryPublishBackend::new());
        let publisher = StreamPublisher::new(backend.clone(), None, PublisherConfig::default());
        for n in 1..=5u64 {
            publisher
                .enqueue(
                    "ws-1",
                    "prj-1",
                    &output_event(OutputEventType::Stdout, &format!("line {n}"), n),
                )
                .await;
        }
        publisher.shutdown().await;

        let numbers: Vec<u64> = backend
            .messages()
            .await
            .iter()
            .map(|(_, payload)| {
                serde_json::from_str::<StreamEvent>(payload)
                    .expect("event")
                    .line_number
            })
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    struct FailingBackend {
        attempts: AtomicU64,
    }

    #[async_trait]
    impl PublishBackend for FailingBackend {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), ConductorError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ConductorError::store("connection refused"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_and_count_the_message() {
        let backend = Arc::new(FailingBackend {
            attempts: AtomicU64::new(0),
        });
        let publisher = StreamPublisher::new(backend.clone(), None, PublisherConfig::default());
        publisher
            .enqueue(
                "ws-1",
                "prj-1",
                &output_event(OutputEventType::Stdout, "doomed", 1),
            )
            .await;
        publisher.shutdown().await;

        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
        let metrics = publisher.metrics().await;
        assert_eq!(metrics.publish_failures, 1);
        assert_eq!(metrics.events_published, 0);
        assert!(metrics.last_publish_at.is_none());
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_dropped_and_counted() {
        let backend = Arc::new(InMemoryPublishBackend::new());
        let publisher = StreamPublisher::new(backend.clone(), None, PublisherConfig::default());
        publisher.shutdown().await;
        publisher
            .enqueue(
                "ws-1",
                "prj-1",
                &output_event(OutputEventType::Stdout, "late", 1),
            )
            .await;
        sleep(Duration::from_millis(150)).await;

        assert!(backend.is_empty().await);
        assert_eq!(publisher.metrics().await.publish_failures, 1);
    }

    #[tokio::test]
    async fn arrivals_during_flush_get_a_follow_up() {
        struct SlowBackend {
            inner: InMemoryPublishBackend,
        }

        #[async_trait]
        impl PublishBackend for SlowBackend {
            async fn publish(&self, channel: &str, payload: &str) -> Result<(), ConductorError> {
                sleep(Duration::from_millis(30)).await;
                self.inner.publish(channel, payload).await
            }
        }

        let backend = Arc::new(SlowBackend {
            inner: InMemoryPublishBackend::new(),
        });
        let config = PublisherConfig {
            batch_window: Duration::from_millis(10),
            ..Default::default()
        };
        let publisher = StreamPublisher::new(backend.clone(), None, config);

        publisher
            .enqueue(
                "ws-1",
                "prj-1",
                &output_event(OutputEventType::Stdout, "first", 1),
            )
            .await;
        sleep(Duration::from_millis(20)).await;
        // First flush is now in flight; this one lands in the next batch.
        publisher
            .enqueue(
                "ws-1",
                "prj-1",
                &output_event(OutputEventType::Stdout, "second", 2),
            )
            .await;
        sleep(Duration::from_millis(150)).await;

        assert_eq!(backend.inner.len().await, 2);
        assert!(publisher.metrics().await.batches_published >= 2);
    }
}
