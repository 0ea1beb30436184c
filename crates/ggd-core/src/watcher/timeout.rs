use std::collections::HashMap;
use std::sync::Arc;

use ggd_types::KillReason;
use tokio::time::Instant;
use tracing::info;

use super::{spawn_kill, Breach, WatcherRegistration, WatcherStage};
use crate::runtime::SandboxRuntime;

struct Entry {
    deadline: Instant,
    breach: Option<Breach>,
}

/// Kills containers that outlive their hard time limit.
#[derive(Default)]
pub struct TimeoutStage {
    entries: HashMap<String, Entry>,
}

impl TimeoutStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatcherStage for TimeoutStage {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn register(&mut self, registration: &WatcherRegistration) {
        self.entries
            .entry(registration.container_id.clone())
            .or_insert_with(|| Entry {
                deadline: Instant::now() + registration.hard_time,
                breach: None,
            });
    }

    fn poll(&mut self, runtime: &Arc<dyn SandboxRuntime>) {
        let now = Instant::now();
        for (container_id, entry) in self.entries.iter_mut() {
            if entry.breach.is_some() || now < entry.deadline {
                continue;
            }
            entry.breach = Some(Breach {
                reason: KillReason::Timeout,
                at: entry.deadline,
            });
            info!(container_id = %container_id, "Hard time limit reached, killing container");
            spawn_kill(runtime, container_id.clone(), KillReason::Timeout);
        }
    }

    fn take_verdict(&mut self, container_id: &str) -> Option<Breach> {
        self.entries.remove(container_id).and_then(|e| e.breach)
    }

    fn watched(&self) -> usize {
        self.entries.len()
    }
}
