use std::collections::{BTreeMap, HashMap};

use ggd_types::{
    DebugMode, GradingReport, Job, JobId, JobOutcome, KillReason, Limits, ProblemResult,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::framing::SandboxMessage;
use crate::workspace::{is_valid_id, JobWorkspace};

pub const UNREADABLE_OUTPUT: &str = "The grader did not return a readable output";

/// Retval sent to the grader when a student container could not be run.
pub const RETVAL_NOT_STARTED: i32 = 254;
pub const RETVAL_TIMEOUT: i32 = 253;
pub const RETVAL_OVERFLOW: i32 = 252;

/// Progress of one job on this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Received,
    EnvironmentValidated,
    ContainerCreated,
    ContainerStarted,
    Running,
}

impl JobState {
    pub fn has_started_container(&self) -> bool {
        *self >= Self::ContainerStarted
    }
}

/// Who a tracked container belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOwner {
    Main(JobId),
    Student {
        job_id: JobId,
        socket_id: String,
    },
}

#[derive(Debug, Default)]
pub struct StudentSlot {
    pub container_id: Option<String>,
    pub started: bool,
    pub oom: bool,
}

/// Everything the agent tracks about one job.
pub struct AgentJob {
    pub job: Job,
    pub state: JobState,
    pub container_id: Option<String>,
    pub workspace: Option<JobWorkspace>,
    pub input: Option<mpsc::UnboundedSender<SandboxMessage>>,
    pub result: Option<GradingReport>,
    pub unreadable: bool,
    pub kill_reason: Option<KillReason>,
    pub kill_requested: bool,
    pub start_error: Option<String>,
    pub exit_code: Option<i32>,
    pub output_closed: bool,
    pub stderr: String,
    pub students: HashMap<String, StudentSlot>,
    pub deadline: Option<JoinHandle<()>>,
}

impl AgentJob {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            state: JobState::Received,
            container_id: None,
            workspace: None,
            input: None,
            result: None,
            unreadable: false,
            kill_reason: None,
            kill_requested: false,
            start_error: None,
            exit_code: None,
            output_closed: false,
            stderr: String::new(),
            students: HashMap::new(),
            deadline: None,
        }
    }

    /// Record a reason unless one is already set.
    pub fn mark(&mut self, reason: KillReason) {
        self.kill_reason.get_or_insert(reason);
    }

    /// Both the die event and the end of output were seen.
    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some() && self.output_closed
    }

    /// Write a message to the grader's stdin, if it is attached.
    pub fn send_to_sandbox(&self, msg: SandboxMessage) -> bool {
        self.input.as_ref().map(|tx| tx.send(msg).is_ok()).unwrap_or(false)
    }

    /// Record the first `result` message; later ones are ignored.
    pub fn accept_result(&mut self, msg: SandboxMessage) {
        if self.result.is_some() || self.unreadable {
            return;
        }
        match report_from_message(msg) {
            Some(report) => self.result = Some(report),
            None => self.unreadable = true,
        }
    }
}

/// Limits actually applied to a job's main container.
///
/// Returns an error text when the request cannot be honoured.
pub fn effective_limits(
    job: &Job,
    slot_memory_mb: Option<u64>,
    ssh_time_limit_s: u64,
) -> Result<Limits, String> {
    let mut limits = job.limits.normalized();
    if job.debug == DebugMode::Ssh {
        limits.time_s = ssh_time_limit_s;
        limits.hard_time_s = Some(ssh_time_limit_s);
    }
    if let Some(ceiling) = slot_memory_mb {
        if limits.memory_mb > ceiling {
            return Err(format!(
                "The task requests {} MB of memory but an execution slot only has {} MB",
                limits.memory_mb, ceiling
            ));
        }
    }
    Ok(limits)
}

/// Turn a grader's `result` message into a report; `None` if it is unreadable.
pub fn report_from_message(msg: SandboxMessage) -> Option<GradingReport> {
    let SandboxMessage::Result {
        result,
        text,
        grade,
        problems,
        tests,
        custom,
        state,
        archive,
        stdout,
        stderr,
    } = msg
    else {
        return None;
    };

    let outcome = match JobOutcome::parse(&result)? {
        o @ (JobOutcome::Success | JobOutcome::Failed) => o,
        _ => JobOutcome::Crash,
    };

    let mut parsed = BTreeMap::new();
    for (problem_id, (status, problem_text)) in problems {
        if !is_valid_id(&problem_id) {
            return None;
        }
        let status = JobOutcome::parse(&status)?;
        parsed.insert(
            problem_id,
            ProblemResult {
                status,
                text: problem_text,
            },
        );
    }

    if grade.is_some_and(|g| !g.is_finite()) {
        return None;
    }
    let grade = grade.or(Some(if outcome.is_success() { 100.0 } else { 0.0 }));

    Some(GradingReport {
        result: outcome,
        text,
        grade,
        problems: parsed,
        tests,
        custom,
        state,
        archive,
        stdout,
        stderr,
    })
}

/// Final classification of a closed job.
///
/// Precedence: a limit breach seen by the watcher, then the agent's own
/// reason, then a failed start, then the grader's result; crash otherwise.
pub struct Closing {
    pub watcher_reason: Option<KillReason>,
    pub kill_reason: Option<KillReason>,
    pub start_error: Option<String>,
    pub unreadable: bool,
    pub result: Option<GradingReport>,
    pub exit_code: Option<i32>,
}

impl Closing {
    pub fn classify(self) -> GradingReport {
        let reason = self
            .watcher_reason
            .filter(KillReason::is_limit_breach)
            .or(self.kill_reason);
        if let Some(reason) = reason {
            return GradingReport::synthesized(reason.into(), "");
        }
        if let Some(text) = self.start_error {
            return GradingReport::synthesized(JobOutcome::Crash, text);
        }
        if self.unreadable {
            return GradingReport::synthesized(JobOutcome::Crash, UNREADABLE_OUTPUT);
        }
        if let Some(report) = self.result {
            return report;
        }
        let text = match self.exit_code {
            Some(-1) => "The grading container was lost".to_string(),
            Some(code) => format!("The grader did not return a result (exit code {code})"),
            None => "The grader did not return a result".to_string(),
        };
        GradingReport::synthesized(JobOutcome::Crash, text)
    }
}

/// Retval relayed to the grader for a finished student container.
pub fn student_retval(watcher_reason: Option<KillReason>, oom: bool, exit_code: i32) -> i32 {
    match watcher_reason {
        Some(KillReason::Timeout) => RETVAL_TIMEOUT,
        Some(KillReason::Overflow) => RETVAL_OVERFLOW,
        _ if oom => RETVAL_OVERFLOW,
        _ => exit_code,
    }
}

/// Plain socket names only; anything path-like is refused.
pub fn valid_socket_id(socket_id: &str) -> bool {
    !socket_id.contains('/') && is_valid_id(socket_id)
}
