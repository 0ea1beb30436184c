//! Messages exchanged between the dispatcher and its agents.
//!
//! Both families are closed, internally tagged unions (`"type"` field).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::report::{GradingReport, SshDebugInfo};

/// Dispatcher to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatcherMessage {
    NewJob {
        job: Job,
    },
    NewBatchJob {
        job_id: JobId,
        environment: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    KillJob {
        job_id: JobId,
    },
    Ping,
}

impl DispatcherMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewJob { .. } => "new_job",
            Self::NewBatchJob { .. } => "new_batch_job",
            Self::KillJob { .. } => "kill_job",
            Self::Ping => "ping",
        }
    }
}

/// Agent to dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Hello {
        friendly_name: String,
        slots: usize,
        /// Environment name to image id.
        environments: BTreeMap<String, String>,
        #[serde(default)]
        batch_environments: BTreeMap<String, String>,
    },
    JobStarted {
        job_id: JobId,
    },
    JobDone {
        job_id: JobId,
        report: GradingReport,
    },
    JobSshDebug {
        info: SshDebugInfo,
    },
    Pong,
}

impl AgentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::JobStarted { .. } => "job_started",
            Self::JobDone { .. } => "job_done",
            Self::JobSshDebug { .. } => "job_ssh_debug",
            Self::Pong => "pong",
        }
    }
}
