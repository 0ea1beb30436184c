use serde::{Deserialize, Serialize};

/// Memory floor applied to every container, in MB.
pub const MIN_MEMORY_MB: u64 = 20;
/// Memory limit used when a task does not specify one, in MB.
pub const DEFAULT_MEMORY_MB: u64 = 200;
/// Soft time limit used when a task does not specify one, in seconds.
pub const DEFAULT_TIME_S: u64 = 30;
/// Hard limit multiplier applied to the soft limit when no hard limit is set.
pub const HARD_TIME_FACTOR: u64 = 3;

/// Opaque, unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Resource limits of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_time_s")]
    pub time_s: u64,
    #[serde(default)]
    pub hard_time_s: Option<u64>,
}

fn default_memory_mb() -> u64 {
    DEFAULT_MEMORY_MB
}

fn default_time_s() -> u64 {
    DEFAULT_TIME_S
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            time_s: DEFAULT_TIME_S,
            hard_time_s: None,
        }
    }
}

impl Limits {
    pub fn new(memory_mb: u64, time_s: u64, hard_time_s: Option<u64>) -> Self {
        Self {
            memory_mb,
            time_s,
            hard_time_s,
        }
    }

    /// Effective hard limit in seconds (defaults to 3x the soft limit).
    pub fn hard_time(&self) -> u64 {
        self.hard_time_s
            .unwrap_or(self.time_s.saturating_mul(HARD_TIME_FACTOR))
    }

    /// Apply the memory floor and resolve the hard limit.
    pub fn normalized(self) -> Self {
        Self {
            memory_mb: self.memory_mb.max(MIN_MEMORY_MB),
            time_s: self.time_s,
            hard_time_s: Some(self.hard_time()),
        }
    }

    /// Limits for a nested container: each requested value is capped by the parent's.
    pub fn capped_by(
        parent: &Limits,
        memory_mb: Option<u64>,
        time_s: Option<u64>,
        hard_time_s: Option<u64>,
    ) -> Self {
        let memory_mb = memory_mb.unwrap_or(parent.memory_mb).min(parent.memory_mb);
        let time_s = time_s.unwrap_or(parent.time_s).min(parent.time_s);
        let hard = hard_time_s
            .unwrap_or(time_s.saturating_mul(HARD_TIME_FACTOR))
            .min(parent.hard_time());
        Self {
            memory_mb: memory_mb.max(MIN_MEMORY_MB),
            time_s,
            hard_time_s: Some(hard),
        }
    }
}

/// How much debugging access the submitter asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugMode {
    #[default]
    Off,
    Debug,
    Ssh,
}

impl DebugMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// A grading job as it travels from dispatcher to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub course_id: String,
    pub task_id: String,
    pub environment: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub debug: DebugMode,
}

/// A job as submitted by the caller, before an id is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub course_id: String,
    pub task_id: String,
    pub environment: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub debug: DebugMode,
}

impl JobRequest {
    pub fn new(
        course_id: impl Into<String>,
        task_id: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            job_id: None,
            course_id: course_id.into(),
            task_id: task_id.into(),
            environment: environment.into(),
            input: serde_json::Value::Object(Default::default()),
            limits: Limits::default(),
            debug: DebugMode::Off,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_debug(mut self, debug: DebugMode) -> Self {
        self.debug = debug;
        self
    }

    /// Attach the final id.
    pub fn into_job(self, job_id: JobId) -> Job {
        Job {
            job_id,
            course_id: self.course_id,
            task_id: self.task_id,
            environment: self.environment,
            input: self.input,
            limits: self.limits,
            debug: self.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_time_defaults_to_three_times_soft() {
        let limits = Limits::new(100, 10, None);
        assert_eq!(limits.hard_time(), 30);
        assert_eq!(Limits::new(100, 10, Some(12)).hard_time(), 12);
    }

    #[test]
    fn normalized_applies_memory_floor() {
        let limits = Limits::new(5, 2, None).normalized();
        assert_eq!(limits.memory_mb, MIN_MEMORY_MB);
        assert_eq!(limits.hard_time_s, Some(6));
    }

    #[test]
    fn capped_by_never_exceeds_parent() {
        let parent = Limits::new(128, 10, Some(20));
        let student = Limits::capped_by(&parent, Some(512), Some(60), Some(120));
        assert_eq!(student.memory_mb, 128);
        assert_eq!(student.time_s, 10);
        assert_eq!(student.hard_time_s, Some(20));

        let inherited = Limits::capped_by(&parent, None, Some(2), None);
        assert_eq!(inherited.memory_mb, 128);
        assert_eq!(inherited.time_s, 2);
        assert_eq!(inherited.hard_time_s, Some(6));
    }

    #[test]
    fn limits_missing_fields_use_defaults() {
        let limits: Limits = serde_json::from_str("{}").unwrap();
        assert_eq!(limits, Limits::default());
    }

    #[test]
    fn request_builder_into_job() {
        let job = JobRequest::new("course", "task", "python3")
            .with_limits(Limits::new(64, 5, None))
            .with_debug(DebugMode::Debug)
            .into_job(JobId::new("job-1"));
        assert_eq!(job.job_id.as_str(), "job-1");
        assert_eq!(job.limits.memory_mb, 64);
        assert!(job.debug.is_enabled());
    }

    #[test]
    fn job_id_is_transparent_on_the_wire() {
        let json = serde_json::to_string(&JobId::new("job-7")).unwrap();
        assert_eq!(json, "\"job-7\"");
    }
}
