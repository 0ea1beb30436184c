//! Callback layer: turn a job's final report into the caller-facing result
//! and hand it to the callback supplied at submit time.

use std::panic::AssertUnwindSafe;

use ggd_types::{GradingReport, Job, JobId, JobOutcome, JobResult};
use tokio::sync::oneshot;
use tracing::{error, info};

/// Completion callback; invoked exactly once per submitted job.
pub type JobCallback = Box<dyn FnOnce(JobResult) + Send + 'static>;

/// Feedback used when the report carries no text of its own.
pub fn default_text(outcome: JobOutcome, soft_time_s: u64) -> String {
    match outcome {
        JobOutcome::Success | JobOutcome::Failed => String::new(),
        JobOutcome::Timeout => format!(
            "Your code took too much time to execute (limit: {soft_time_s} seconds)"
        ),
        JobOutcome::Overflow => "Your code took too much memory or disk".to_string(),
        JobOutcome::Killed => "The job was killed".to_string(),
        JobOutcome::Crash => "An unknown internal error occured".to_string(),
    }
}

/// Grade in `[0, 100]`, rounded to two decimals.
pub fn normalize_grade(grade: Option<f64>, outcome: JobOutcome) -> f64 {
    let raw = grade.unwrap_or(if outcome.is_success() { 100.0 } else { 0.0 });
    if raw.is_nan() {
        return 0.0;
    }
    (raw.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

/// Build the caller-facing result for a finished job.
pub fn finalize(job: &Job, report: GradingReport) -> JobResult {
    let text = if report.text.is_empty() {
        default_text(report.result, job.limits.time_s)
    } else {
        report.text
    };
    JobResult {
        job_id: job.job_id.clone(),
        result: report.result,
        text,
        grade: normalize_grade(report.grade, report.result),
        problems: report.problems,
        tests: report.tests,
        custom: report.custom,
        state: report.state,
        archive: report.archive,
        stdout: report.stdout,
        stderr: report.stderr,
    }
}

/// Result produced by the platform itself, for jobs no agent reported on.
pub fn synthesize(job: &Job, outcome: JobOutcome, text: impl Into<String>) -> JobResult {
    finalize(job, GradingReport::synthesized(outcome, text))
}

/// Run a callback, containing any panic inside it.
pub fn deliver(callback: JobCallback, result: JobResult) {
    let job_id: JobId = result.job_id.clone();
    let outcome = result.result;
    match std::panic::catch_unwind(AssertUnwindSafe(move || callback(result))) {
        Ok(()) => info!(job_id = %job_id, %outcome, "Job result delivered"),
        Err(_) => error!(job_id = %job_id, "Job callback panicked"),
    }
}

/// A callback that forwards the result into a oneshot channel.
pub fn callback_channel() -> (JobCallback, oneshot::Receiver<JobResult>) {
    let (tx, rx) = oneshot::channel();
    let callback: JobCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ggd_types::{JobRequest, Limits};

    fn job() -> Job {
        JobRequest::new("c", "t", "py")
            .with_limits(Limits::new(64, 7, None))
            .into_job(JobId::new("job-1"))
    }

    #[test]
    fn grade_defaults_and_clamping() {
        assert_eq!(normalize_grade(None, JobOutcome::Success), 100.0);
        assert_eq!(normalize_grade(None, JobOutcome::Failed), 0.0);
        assert_eq!(normalize_grade(Some(150.0), JobOutcome::Success), 100.0);
        assert_eq!(normalize_grade(Some(-3.0), JobOutcome::Failed), 0.0);
        assert_eq!(normalize_grade(Some(66.666), JobOutcome::Failed), 66.67);
        assert_eq!(normalize_grade(Some(f64::NAN), JobOutcome::Success), 0.0);
    }

    #[test]
    fn timeout_text_mentions_soft_limit() {
        let result = synthesize(&job(), JobOutcome::Timeout, "");
        assert_eq!(result.result, JobOutcome::Timeout);
        assert!(result.text.contains("7 seconds"));
        assert_eq!(result.grade, 0.0);
    }

    #[test]
    fn grader_text_is_kept() {
        let mut report = GradingReport::synthesized(JobOutcome::Success, "Well done");
        report.grade = Some(90.0);
        let result = finalize(&job(), report);
        assert_eq!(result.text, "Well done");
        assert_eq!(result.grade, 90.0);
        assert_eq!(result.job_id.as_str(), "job-1");
    }

    #[tokio::test]
    async fn channel_callback_receives_result() {
        let (callback, rx) = callback_channel();
        deliver(callback, synthesize(&job(), JobOutcome::Killed, ""));
        let result = rx.await.unwrap();
        assert_eq!(result.result, JobOutcome::Killed);
        assert_eq!(result.text, "The job was killed");
    }

    #[test]
    fn panicking_callback_is_contained() {
        let callback: JobCallback = Box::new(|_| panic!("caller bug"));
        deliver(callback, synthesize(&job(), JobOutcome::Crash, "x"));
    }
}
