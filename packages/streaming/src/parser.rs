use std::sync::LazyLock;

use regex::Regex;

use crate::events::{
    ChangeType, StreamEventMetadata, StreamEventType, TestStatus, TestSummary,
};

/// Classification of a single raw output line.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub event_type: StreamEventType,
    pub metadata: Option<StreamEventMetadata>,
}

impl Classification {
    fn plain(event_type: StreamEventType) -> Self {
        Self {
            event_type,
            metadata: None,
        }
    }

    fn with_metadata(event_type: StreamEventType, metadata: StreamEventMetadata) -> Self {
        Self {
            event_type,
            metadata: Some(metadata),
        }
    }
}

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ansi regex"));
static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\$\s+.+").expect("command regex"));
static FILE_CHANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^>\s*(Creating|Writing|Adding|Editing|Modifying|Updating|Deleting|Removing)\s+(.+?)\s*$")
        .expect("file change regex")
});
static FILE_RESULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(PASS|FAIL)\s+(\S+)").expect("file result regex"));
static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Tests:\s+(.+)$").expect("summary regex"));
static SUMMARY_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(passed|failed|skipped|total)").expect("summary part regex"));
static TAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(not\s+)?ok\s+\d+\s*-\s*(.+)$").expect("tap regex"));
static MARK_PASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[✓✔]\s+(.+?)(?:\s+\(\d+(?:\.\d+)?\s*m?s\))?$").expect("pass mark regex")
});
static MARK_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[✕✗✘×]\s+(.+)$").expect("fail mark regex"));
static RUNTIME_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(SyntaxError|TypeError|ReferenceError|RangeError|URIError|EvalError|Error):\s*(.+)$")
        .expect("runtime error regex")
});
static TS_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"error\s+TS(\d+):\s*(.+)$").expect("ts error regex"));
static NPM_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^npm ERR!\s+(.+)$").expect("npm error regex"));

/// Classifies one raw line. Deterministic, first match wins; the caller keeps
/// the original content and only consumes the classification.
pub fn classify_line(line: &str) -> Classification {
    if COMMAND_RE.is_match(line) {
        return Classification::plain(StreamEventType::Command);
    }

    if let Some(classification) = match_file_change(line) {
        return classification;
    }

    // Test runners color their output heavily; match against stripped text.
    let stripped = strip_ansi(line);
    if let Some(classification) = match_test_result(&stripped) {
        return classification;
    }

    if let Some(classification) = match_error(line) {
        return classification;
    }

    Classification::plain(StreamEventType::Output)
}

pub fn strip_ansi(line: &str) -> String {
    ANSI_RE.replace_all(line, "").into_owned()
}

fn match_file_change(line: &str) -> Option<Classification> {
    let captures = FILE_CHANGE_RE.captures(line)?;
    let verb = captures.get(1)?.as_str();
    let mut path = captures.get(2)?.as_str();

    // Progress lines often trail off with an ellipsis.
    path = path
        .trim_end_matches('…')
        .trim_end_matches("...")
        .trim_end();

    // The candidate must look like a file, not a directory.
    let file_name = path.rsplit('/').next()?;
    if !file_name.contains('.') {
        return None;
    }

    let change_type = match verb {
        "Creating" | "Writing" | "Adding" => ChangeType::Created,
        "Editing" | "Modifying" | "Updating" => ChangeType::Edited,
        _ => ChangeType::Deleted,
    };

    Some(Classification::with_metadata(
        StreamEventType::FileChange,
        StreamEventMetadata {
            file_name: Some(file_name.to_string()),
            file_path: Some(path.to_string()),
            change_type: Some(change_type),
            ..Default::default()
        },
    ))
}

fn match_test_result(line: &str) -> Option<Classification> {
    if let Some(captures) = FILE_RESULT_RE.captures(line) {
        let status = if captures.get(1)?.as_str() == "PASS" {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };
        let path = captures.get(2)?.as_str();
        let name = path.rsplit('/').next().unwrap_or(path);
        return Some(Classification::with_metadata(
            StreamEventType::TestResult,
            StreamEventMetadata {
                test_name: Some(name.to_string()),
                test_status: Some(status),
                file_path: Some(path.to_string()),
                ..Default::default()
            },
        ));
    }

    if let Some(captures) = SUMMARY_RE.captures(line) {
        let mut summary = TestSummary::default();
        let mut matched = false;
        for part in SUMMARY_PART_RE.captures_iter(captures.get(1)?.as_str()) {
            let count: u32 = part.get(1)?.as_str().parse().ok()?;
            matched = true;
            match part.get(2)?.as_str() {
                "passed" => summary.passed = count,
                "failed" => summary.failed = count,
                "skipped" => summary.skipped = count,
                _ => summary.total = count,
            }
        }
        if matched {
            let status = if summary.failed > 0 {
                TestStatus::Failed
            } else {
                TestStatus::Passed
            };
            return Some(Classification::with_metadata(
                StreamEventType::TestResult,
                StreamEventMetadata {
                    test_status: Some(status),
                    summary: Some(summary),
                    ..Default::default()
                },
            ));
        }
    }

    if let Some(captures) = TAP_RE.captures(line) {
        let status = if captures.get(1).is_some() {
            TestStatus::Failed
        } else {
            TestStatus::Passed
        };
        return Some(Classification::with_metadata(
            StreamEventType::TestResult,
            StreamEventMetadata {
                test_name: Some(captures.get(2)?.as_str().to_string()),
                test_status: Some(status),
                ..Default::default()
            },
        ));
    }

    if let Some(captures) = MARK_PASS_RE.captures(line) {
        return Some(Classification::with_metadata(
            StreamEventType::TestResult,
            StreamEventMetadata {
                test_name: Some(captures.get(1)?.as_str().to_string()),
                test_status: Some(TestStatus::Passed),
                ..Default::default()
            },
        ));
    }

    if let Some(captures) = MARK_FAIL_RE.captures(line) {
        return Some(Classification::with_metadata(
            StreamEventType::TestResult,
            StreamEventMetadata {
                test_name: Some(captures.get(1)?.as_str().to_string()),
                test_status: Some(TestStatus::Failed),
                ..Default::default()
            },
        ));
    }

    None
}

fn match_error(line: &str) -> Option<Classification> {
    if let Some(captures) = RUNTIME_ERROR_RE.captures(line) {
        return Some(Classification::with_metadata(
            StreamEventType::Error,
            StreamEventMetadata {
                error_type: Some(captures.get(1)?.as_str().to_string()),
                ..Default::default()
            },
        ));
    }

    if let Some(captures) = TS_ERROR_RE.captures(line) {
        return Some(Classification::with_metadata(
            StreamEventType::Error,
            StreamEventMetadata {
                error_type: Some("typescript".to_string()),
                error_code: Some(format!("TS{}", captures.get(1)?.as_str())),
                ..Default::default()
            },
        ));
    }

    if let Some(captures) = NPM_ERROR_RE.captures(line) {
        let rest = captures.get(1)?.as_str();
        let error_code = rest
            .strip_prefix("code ")
            .map(|code| code.trim().to_string());
        return Some(Classification::with_metadata(
            StreamEventType::Error,
            StreamEventMetadata {
                error_type: Some("npm".to_string()),
                error_code,
                ..Default::default()
            },
        ));
    }

    None
}
