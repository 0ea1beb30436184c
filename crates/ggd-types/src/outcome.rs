use serde::{Deserialize, Serialize};

/// Terminal classification of a job (or of a single problem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Failed,
    Crash,
    Timeout,
    Overflow,
    Killed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Crash => "crash",
            Self::Timeout => "timeout",
            Self::Overflow => "overflow",
            Self::Killed => "killed",
        }
    }

    /// Parse a status string; unknown strings are `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "crash" | "error" => Some(Self::Crash),
            "timeout" => Some(Self::Timeout),
            "overflow" => Some(Self::Overflow),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a container was stopped by the platform rather than exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillReason {
    Timeout,
    Overflow,
    Killed,
    Crash,
}

impl KillReason {
    /// Timeout and overflow come from limit enforcement.
    pub fn is_limit_breach(&self) -> bool {
        matches!(self, Self::Timeout | Self::Overflow)
    }
}

impl From<KillReason> for JobOutcome {
    fn from(reason: KillReason) -> Self {
        match reason {
            KillReason::Timeout => Self::Timeout,
            KillReason::Overflow => Self::Overflow,
            KillReason::Killed => Self::Killed,
            KillReason::Crash => Self::Crash,
        }
    }
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        JobOutcome::from(*self).fmt(f)
    }
}
