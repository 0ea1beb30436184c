use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::outcome::JobOutcome;

/// Free-form JSON object carried through unchanged.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Per-problem feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemResult {
    pub status: JobOutcome,
    #[serde(default)]
    pub text: String,
}

/// What an agent reports when a job ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingReport {
    pub result: JobOutcome,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub grade: Option<f64>,
    #[serde(default)]
    pub problems: BTreeMap<String, ProblemResult>,
    #[serde(default)]
    pub tests: JsonMap,
    #[serde(default)]
    pub custom: JsonMap,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub archive: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl GradingReport {
    /// A report produced by the platform itself (no grader output).
    pub fn synthesized(result: JobOutcome, text: impl Into<String>) -> Self {
        Self {
            result,
            text: text.into(),
            grade: Some(0.0),
            problems: BTreeMap::new(),
            tests: JsonMap::new(),
            custom: JsonMap::new(),
            state: String::new(),
            archive: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Result shape handed to the caller's completion callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub result: JobOutcome,
    pub text: String,
    pub grade: f64,
    pub problems: BTreeMap<String, ProblemResult>,
    pub tests: JsonMap,
    pub custom: JsonMap,
    pub state: String,
    pub archive: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

/// Connection details for an interactive debugging session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshDebugInfo {
    pub job_id: JobId,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key: String,
}

/// A job currently assigned to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJobInfo {
    pub job_id: JobId,
    pub agent: String,
    pub course_id: String,
    pub task_id: String,
    pub environment: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub time_limit_s: u64,
}

/// A job waiting for a free slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingJobInfo {
    pub job_id: JobId,
    pub course_id: String,
    pub task_id: String,
    pub environment: String,
    pub submitted_at: DateTime<Utc>,
}

/// Point-in-time view of the dispatcher queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub running: Vec<RunningJobInfo>,
    pub waiting: Vec<WaitingJobInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_minimal_json_uses_defaults() {
        let report: GradingReport = serde_json::from_str(r#"{"result":"failed"}"#).unwrap();
        assert_eq!(report.result, JobOutcome::Failed);
        assert!(report.grade.is_none());
        assert!(report.problems.is_empty());
        assert!(report.archive.is_none());
    }

    #[test]
    fn synthesized_report_has_zero_grade() {
        let report = GradingReport::synthesized(JobOutcome::Crash, "boom");
        assert_eq!(report.grade, Some(0.0));
        assert_eq!(report.text, "boom");
    }

    #[test]
    fn problems_keep_status_and_text() {
        let json = r#"{"result":"success","problems":{"q1":{"status":"success","text":"ok"}}}"#;
        let report: GradingReport = serde_json::from_str(json).unwrap();
        let q1 = report.problems.get("q1").unwrap();
        assert_eq!(q1.status, JobOutcome::Success);
        assert_eq!(q1.text, "ok");
    }
}
