#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{TimeZone, Utc};
use conductor_core::*;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// 1. Generated ids
// ---------------------------------------------------------------------------

#[test]
fn test_generated_ids_carry_prefix_and_timestamp() {
    let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
    let task = TaskId::generate(now);
    let goal = GoalId::generate(now);

    let expected = format!("task-{}-", now.timestamp_millis());
    assert!(task.as_str().starts_with(&expected));
    assert!(goal.as_str().starts_with("goal-"));

    let suffix = task.as_str().rsplit('-').next().unwrap();
    assert_eq!(suffix.len(), 9);
    assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
}

#[test]
fn test_generated_ids_are_unique_within_one_millisecond() {
    let now = Utc::now();
    let ids: HashSet<TaskId> = (0..1000).map(|_| TaskId::generate(now)).collect();
    assert_eq!(ids.len(), 1000);
}

// ---------------------------------------------------------------------------
// 2. Ids on the wire
// ---------------------------------------------------------------------------

#[test]
fn test_ids_are_plain_json_strings() {
    let agent = AgentId::from("validator-1");
    assert_eq!(serde_json::to_string(&agent).unwrap(), "\"validator-1\"");

    let parsed: TaskId = serde_json::from_str("\"task-1-abc\"").unwrap();
    assert_eq!(parsed, TaskId::new("task-1-abc"));
    assert_eq!(parsed.to_string(), "task-1-abc");
}

// ---------------------------------------------------------------------------
// 3. Errors
// ---------------------------------------------------------------------------

#[test]
fn test_error_display_and_conversions() {
    let err = ConductorError::InvalidTransition {
        task_id: "task-1".into(),
        from: "pending".into(),
        to: "completed".into(),
    };
    assert_eq!(
        err.to_string(),
        "Invalid transition for task task-1: pending -> completed"
    );

    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: ConductorError = json_err.into();
    assert!(matches!(err, ConductorError::Json(_)));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: ConductorError = io_err.into();
    assert!(err.to_string().starts_with("IO error"));
}

#[test]
fn test_result_alias_propagates_with_question_mark() {
    fn parse(raw: &str) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::from_str(raw)?)
    }
    assert!(parse("{\"ok\":true}").is_ok());
    assert!(matches!(parse("nope"), Err(ConductorError::Json(_))));
}
