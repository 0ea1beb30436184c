//! Resource watcher pipeline.
//!
//! A static chain of stages runs on its own task and timer. The agent talks to
//! it only through [`WatcherHandle`]: `register` a container when it starts,
//! `killed_status` once when it ends. Every stage consumes its entry on query
//! and the earliest breach across stages wins.
//!
//! Stages never await the container engine on the pipeline task. Samples and
//! kills run on spawned tasks, so a slow `stats` call cannot hold back a hard
//! time limit or a `killed_status` reply.

mod memory;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use ggd_types::KillReason;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::runtime::SandboxRuntime;

pub use memory::{MemoryStage, NoopStage};
pub use timeout::TimeoutStage;

/// Limits under which a container is watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherRegistration {
    pub container_id: String,
    pub memory_limit_mb: u64,
    /// Reported in feedback only; enforcement uses the hard limit.
    pub soft_time: Duration,
    pub hard_time: Duration,
}

/// A limit a stage saw broken, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breach {
    pub reason: KillReason,
    pub at: Instant,
}

impl Breach {
    pub fn now(reason: KillReason) -> Self {
        Self {
            reason,
            at: Instant::now(),
        }
    }
}

/// Requests accepted by the pipeline task.
#[derive(Debug)]
pub enum WatcherRequest {
    Register(WatcherRegistration),
    KilledStatus {
        container_id: String,
        reply: oneshot::Sender<Option<KillReason>>,
    },
}

/// One enforcement stage.
pub trait WatcherStage: Send {
    fn name(&self) -> &'static str;

    /// Start watching; registering an already watched container changes nothing.
    fn register(&mut self, registration: &WatcherRegistration);

    /// Check watched containers and start killing the ones over their limit.
    /// Runtime calls go to spawned tasks; this never waits on the engine.
    fn poll(&mut self, runtime: &Arc<dyn SandboxRuntime>);

    /// Forget the container and return its breach, if any.
    fn take_verdict(&mut self, container_id: &str) -> Option<Breach>;

    fn watched(&self) -> usize;
}

/// Kill a container in the background.
pub(crate) fn spawn_kill(runtime: &Arc<dyn SandboxRuntime>, container_id: String, reason: KillReason) {
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        if let Err(e) = runtime.kill(&container_id).await {
            warn!(container_id = %container_id, %reason, error = %e, "Failed to kill container");
        }
    });
}

/// Cheap, cloneable access to a running pipeline.
#[derive(Clone)]
pub struct WatcherHandle {
    tx: mpsc::UnboundedSender<WatcherRequest>,
}

impl WatcherHandle {
    pub fn register(&self, registration: WatcherRegistration) {
        if self.tx.send(WatcherRequest::Register(registration)).is_err() {
            debug!("Watcher pipeline is gone, registration dropped");
        }
    }

    /// Ask why a container died. Answers once; later queries return `None`.
    pub async fn killed_status(&self, container_id: &str) -> Option<KillReason> {
        let (reply, rx) = oneshot::channel();
        let request = WatcherRequest::KilledStatus {
            container_id: container_id.to_string(),
            reply,
        };
        if self.tx.send(request).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }
}

/// The pipeline task.
pub struct WatcherPipeline {
    stages: Vec<Box<dyn WatcherStage>>,
    runtime: Arc<dyn SandboxRuntime>,
    poll_interval: Duration,
}

impl WatcherPipeline {
    /// Default chain: timeout, then memory (no-op when the runtime has no stats).
    pub fn new(runtime: Arc<dyn SandboxRuntime>, poll_interval: Duration, memory_watch: bool) -> Self {
        let memory: Box<dyn WatcherStage> = if memory_watch && runtime.supports_resource_stats() {
            Box::new(MemoryStage::new())
        } else {
            info!("Resource statistics unavailable, memory watching disabled");
            Box::new(NoopStage)
        };
        Self::with_stages(
            runtime,
            poll_interval,
            vec![Box::new(TimeoutStage::new()), memory],
        )
    }

    pub fn with_stages(
        runtime: Arc<dyn SandboxRuntime>,
        poll_interval: Duration,
        stages: Vec<Box<dyn WatcherStage>>,
    ) -> Self {
        Self {
            stages,
            runtime,
            poll_interval,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Spawn the pipeline; it stops when every handle is dropped.
    pub fn spawn(self) -> (WatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (WatcherHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WatcherRequest>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = ticker.tick() => {
                    for stage in self.stages.iter_mut() {
                        stage.poll(&self.runtime);
                    }
                }
            }
        }
        debug!("Watcher pipeline stopped");
    }

    fn handle(&mut self, request: WatcherRequest) {
        match request {
            WatcherRequest::Register(registration) => {
                debug!(
                    container_id = %registration.container_id,
                    memory_mb = registration.memory_limit_mb,
                    hard_secs = registration.hard_time.as_secs_f64(),
                    "Watching container"
                );
                for stage in self.stages.iter_mut() {
                    stage.register(&registration);
                }
            }
            WatcherRequest::KilledStatus {
                container_id,
                reply,
            } => {
                // Every stage must forget the container, so no short-circuit here.
                let mut earliest: Option<Breach> = None;
                for stage in self.stages.iter_mut() {
                    if let Some(breach) = stage.take_verdict(&container_id) {
                        if earliest.map_or(true, |e| breach.at < e.at) {
                            earliest = Some(breach);
                        }
                    }
                }
                let verdict = earliest.map(|b| b.reason);
                if let Some(reason) = verdict {
                    debug!(container_id = %container_id, %reason, "Watcher verdict");
                }
                let _ = reply.send(verdict);
            }
        }
    }
}
