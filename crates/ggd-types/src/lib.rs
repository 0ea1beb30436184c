pub mod error;
pub mod job;
pub mod outcome;
pub mod protocol;
pub mod report;

// Re-exports for convenience
pub use error::{GradeGridError, Result};
pub use job::{DebugMode, Job, JobId, JobRequest, Limits, MIN_MEMORY_MB};
pub use outcome::{JobOutcome, KillReason};
pub use protocol::{AgentMessage, DispatcherMessage};
pub use report::{
    GradingReport, JobResult, JsonMap, ProblemResult, QueueSnapshot, RunningJobInfo,
    SshDebugInfo, WaitingJobInfo,
};
