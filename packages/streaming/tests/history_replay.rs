//! History buffer tests against a live redis. Gated on
//! `CONDUCTOR_TEST_REDIS_URL`; each test skips silently when unset.

use chrono::Utc;
use uuid::Uuid;

use conductor_streaming::{
    HistoryBuffer, HistoryConfig, OutputKind, StreamEvent, StreamEventMetadata, StreamEventType,
};

async fn test_history(config: HistoryConfig) -> Option<HistoryBuffer> {
    let url = match std::env::var("CONDUCTOR_TEST_REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("CONDUCTOR_TEST_REDIS_URL unset, skipping");
            return None;
        }
    };
    let client = redis::Client::open(url).expect("redis client");
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .expect("redis connection");
    Some(HistoryBuffer::new(conn, config))
}

fn event(session_id: &str, line_number: u64) -> StreamEvent {
    StreamEvent {
        session_id: session_id.to_string(),
        agent_id: "agent-1".to_string(),
        project_id: "prj-1".to_string(),
        workspace_id: "ws-1".to_string(),
        event_type: StreamEventType::Output,
        content: format!("line {line_number}"),
        timestamp: Utc::now(),
        line_number,
        metadata: Some(StreamEventMetadata {
            output_type: Some(OutputKind::Stdout),
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn replay_is_chronological_oldest_first() {
    let Some(history) = test_history(HistoryConfig::default()).await else { return };
    let session_id = format!("s-{}", Uuid::new_v4());

    for n in 1..=5 {
        history.append(&event(&session_id, n)).await.expect("append");
    }

    let replay = history
        .get_history(&session_id, None)
        .await
        .expect("read");
    let numbers: Vec<u64> = replay.iter().map(|e| e.line_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

    history.clear(&session_id).await.expect("clear");
    assert_eq!(history.len(&session_id).await.expect("len"), 0);
}

#[tokio::test]
async fn the_buffer_is_bounded() {
    let config = HistoryConfig {
        max_lines: 10,
        ..Default::default()
    };
    let Some(history) = test_history(config).await else { return };
    let session_id = format!("s-{}", Uuid::new_v4());

    for n in 1..=25 {
        history.append(&event(&session_id, n)).await.expect("append");
    }

    assert_eq!(history.len(&session_id).await.expect("len"), 10);
    let replay = history
        .get_history(&session_id, None)
        .await
        .expect("read");
    // Only the newest ten survive, still oldest-first.
    let numbers: Vec<u64> = replay.iter().map(|e| e.line_number).collect();
    assert_eq!(numbers, (16..=25).collect::<Vec<u64>>());

    history.clear(&session_id).await.expect("cleanup");
}

#[tokio::test]
async fn reads_cap_at_the_requested_count() {
    let Some(history) = test_history(HistoryConfig::default()).await else { return };
    let session_id = format!("s-{}", Uuid::new_v4());

    for n in 1..=8 {
        history.append(&event(&session_id, n)).await.expect("append");
    }

    let replay = history
        .get_history(&session_id, Some(3))
        .await
        .expect("read");
    // The newest three, chronological.
    let numbers: Vec<u64> = replay.iter().map(|e| e.line_number).collect();
    assert_eq!(numbers, vec![6, 7, 8]);

    history.clear(&session_id).await.expect("cleanup");
}

#[tokio::test]
async fn safe_reads_swallow_missing_sessions() {
    let Some(history) = test_history(HistoryConfig::default()).await else { return };
    let replay = history
        .get_history_safe(&format!("s-{}", Uuid::new_v4()), None)
        .await;
    assert!(replay.is_empty());
}
