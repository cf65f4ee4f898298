use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Refined event type carried on the pub/sub channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Output,
    Command,
    FileChange,
    TestResult,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Edited,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// Counts from a test-runner summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
}

/// Discriminated enrichment fields; only the facet matching the event type
/// is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamEventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<TestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_type: Option<OutputKind>,
}

impl StreamEventMetadata {
    pub fn is_empty(&self) -> bool {
        self.file_name.is_none()
            && self.file_path.is_none()
            && self.change_type.is_none()
            && self.test_name.is_none()
            && self.test_status.is_none()
            && self.summary.is_none()
            && self.error_type.is_none()
            && self.error_code.is_none()
            && self.output_type.is_none()
    }
}

/// Enriched, tenancy-tagged event as serialized onto
/// `cli-events:{workspaceId}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub session_id: String,
    pub agent_id: String,
    pub project_id: String,
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub line_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StreamEventMetadata>,
}

pub fn channel_for_workspace(workspace_id: &str) -> String {
    format!("cli-events:{workspace_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_omitted_when_absent() {
        let event = StreamEvent {
            session_id: "s".into(),
            agent_id: "a".into(),
            project_id: "p".into(),
            workspace_id: "w".into(),
            event_type: StreamEventType::Output,
            content: "hello".into(),
            timestamp: Utc::now(),
            line_number: 1,
            metadata: None,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert!(json.get("metadata").is_none());
        assert_eq!(json["type"], "output");
        assert_eq!(json["workspaceId"], "w");
    }

    #[test]
    fn metadata_serializes_only_populated_facet() {
        let metadata = StreamEventMetadata {
            test_name: Some("x.spec.ts".into()),
            test_status: Some(TestStatus::Passed),
            file_path: Some("src/x.spec.ts".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&metadata).expect("serialize");
        assert_eq!(json["testName"], "x.spec.ts");
        assert_eq!(json["testStatus"], "passed");
        assert!(json.get("changeType").is_none());
        assert!(json.get("outputType").is_none());
    }

    #[test]
    fn channel_name_is_workspace_scoped() {
        assert_eq!(channel_for_workspace("ws-1"), "cli-events:ws-1");
    }
}
