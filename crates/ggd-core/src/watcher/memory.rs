use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ggd_types::KillReason;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{spawn_kill, Breach, WatcherRegistration, WatcherStage};
use crate::runtime::SandboxRuntime;

struct Entry {
    limit_bytes: u64,
    high_water: u64,
    breach: Option<Breach>,
}

/// Result of one background `stats` call; `None` when the engine had no answer.
struct Sample {
    container_id: String,
    memory_bytes: Option<u64>,
}

/// Tracks the memory high-water mark and kills containers that reach their limit.
///
/// Each poll folds in the samples that arrived since the last one and starts a
/// new sample for every container without one in flight.
pub struct MemoryStage {
    entries: HashMap<String, Entry>,
    sampling: HashSet<String>,
    samples_tx: mpsc::UnboundedSender<Sample>,
    samples_rx: mpsc::UnboundedReceiver<Sample>,
}

impl Default for MemoryStage {
    fn default() -> Self {
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        Self {
            entries: HashMap::new(),
            sampling: HashSet::new(),
            samples_tx,
            samples_rx,
        }
    }
}

impl MemoryStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest usage seen so far, in bytes.
    pub fn high_water(&self, container_id: &str) -> Option<u64> {
        self.entries.get(container_id).map(|e| e.high_water)
    }

    /// Containers with a `stats` call still running.
    pub fn sampling(&self) -> usize {
        self.sampling.len()
    }

    fn record(&mut self, runtime: &Arc<dyn SandboxRuntime>, container_id: &str, usage: u64) {
        // Gone if the verdict was taken while the sample was running.
        let Some(entry) = self.entries.get_mut(container_id) else {
            return;
        };
        if entry.breach.is_some() {
            return;
        }
        entry.high_water = entry.high_water.max(usage);
        if entry.high_water < entry.limit_bytes {
            return;
        }
        entry.breach = Some(Breach::now(KillReason::Overflow));
        info!(
            container_id = %container_id,
            usage_bytes = entry.high_water,
            limit_bytes = entry.limit_bytes,
            "Memory limit reached, killing container"
        );
        spawn_kill(runtime, container_id.to_string(), KillReason::Overflow);
    }
}

impl WatcherStage for MemoryStage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn register(&mut self, registration: &WatcherRegistration) {
        self.entries
            .entry(registration.container_id.clone())
            .or_insert_with(|| Entry {
                limit_bytes: registration.memory_limit_mb * 1024 * 1024,
                high_water: 0,
                breach: None,
            });
    }

    fn poll(&mut self, runtime: &Arc<dyn SandboxRuntime>) {
        while let Ok(sample) = self.samples_rx.try_recv() {
            self.sampling.remove(&sample.container_id);
            if let Some(usage) = sample.memory_bytes {
                self.record(runtime, &sample.container_id, usage);
            }
        }

        for (container_id, entry) in &self.entries {
            if entry.breach.is_some() || self.sampling.contains(container_id) {
                continue;
            }
            self.sampling.insert(container_id.clone());
            let runtime = Arc::clone(runtime);
            let samples = self.samples_tx.clone();
            let container_id = container_id.clone();
            tokio::spawn(async move {
                let memory_bytes = match runtime.stats(&container_id).await {
                    Ok(stats) => Some(stats.memory_bytes),
                    Err(e) => {
                        // Usually the container is already gone.
                        debug!(container_id = %container_id, error = %e, "No stats for container");
                        None
                    }
                };
                let _ = samples.send(Sample {
                    container_id,
                    memory_bytes,
                });
            });
        }
    }

    fn take_verdict(&mut self, container_id: &str) -> Option<Breach> {
        self.entries.remove(container_id).and_then(|e| e.breach)
    }

    fn watched(&self) -> usize {
        self.entries.len()
    }
}

/// Stand-in used when the runtime cannot report resource usage.
pub struct NoopStage;

impl WatcherStage for NoopStage {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn register(&mut self, _registration: &WatcherRegistration) {}

    fn poll(&mut self, _runtime: &Arc<dyn SandboxRuntime>) {}

    fn take_verdict(&mut self, _container_id: &str) -> Option<Breach> {
        None
    }

    fn watched(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSpec, MockRuntime, SandboxScript};
    use std::time::Duration;

    fn reg(id: &str, memory_mb: u64) -> WatcherRegistration {
        WatcherRegistration {
            container_id: id.to_string(),
            memory_limit_mb: memory_mb,
            soft_time: Duration::from_secs(10),
            hard_time: Duration::from_secs(30),
        }
    }

    /// Start samples, let them land, then fold them in.
    async fn sample(stage: &mut MemoryStage, runtime: &Arc<dyn SandboxRuntime>) {
        stage.poll(runtime);
        tokio::time::sleep(Duration::from_millis(20)).await;
        stage.poll(runtime);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn high_water_mark_and_overflow() {
        let rt = MockRuntime::new().with_environment("hog", SandboxScript::MemoryHog { usage_mb: 50 });
        let id = rt
            .create(&ContainerSpec::new("c", "mock-image-hog", 64))
            .await
            .unwrap();
        rt.start(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let shared: Arc<dyn SandboxRuntime> = Arc::new(rt.clone());

        let mut stage = MemoryStage::new();
        stage.register(&reg(&id, 64));
        sample(&mut stage, &shared).await;
        assert_eq!(stage.high_water(&id), Some(50 * 1024 * 1024));
        assert!(rt.killed().is_empty());

        let mut tight = MemoryStage::new();
        tight.register(&reg(&id, 40));
        sample(&mut tight, &shared).await;
        assert_eq!(rt.killed(), vec![id.clone()]);
        let breach = tight.take_verdict(&id).unwrap();
        assert_eq!(breach.reason, KillReason::Overflow);
    }

    #[tokio::test]
    async fn one_sample_in_flight_per_container() {
        let rt = MockRuntime::new().with_environment("py", SandboxScript::Hang);
        let id = rt
            .create(&ContainerSpec::new("c", "mock-image-py", 64))
            .await
            .unwrap();
        let shared: Arc<dyn SandboxRuntime> = Arc::new(rt);

        let mut stage = MemoryStage::new();
        stage.register(&reg(&id, 64));
        stage.poll(&shared);
        stage.poll(&shared);
        assert_eq!(stage.sampling(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        stage.poll(&shared);
        // The landed sample was folded in and a fresh one started.
        assert_eq!(stage.sampling(), 1);
        assert_eq!(stage.high_water(&id), Some(0));
    }

    #[tokio::test]
    async fn missing_container_is_skipped() {
        let shared: Arc<dyn SandboxRuntime> = Arc::new(MockRuntime::new());
        let mut stage = MemoryStage::new();
        stage.register(&reg("ghost", 64));
        sample(&mut stage, &shared).await;
        assert_eq!(stage.take_verdict("ghost"), None);
    }

    #[tokio::test]
    async fn late_sample_after_verdict_is_ignored() {
        let rt = MockRuntime::new().with_environment("hog", SandboxScript::MemoryHog { usage_mb: 50 });
        let id = rt
            .create(&ContainerSpec::new("c", "mock-image-hog", 64))
            .await
            .unwrap();
        rt.start(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let shared: Arc<dyn SandboxRuntime> = Arc::new(rt.clone());

        let mut stage = MemoryStage::new();
        stage.register(&reg(&id, 10));
        stage.poll(&shared);
        assert_eq!(stage.take_verdict(&id), None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        stage.poll(&shared);
        assert_eq!(stage.watched(), 0);
        assert_eq!(stage.sampling(), 0);
        assert!(rt.killed().is_empty());
    }

    #[tokio::test]
    async fn noop_never_reports() {
        let shared: Arc<dyn SandboxRuntime> = Arc::new(MockRuntime::new());
        let mut stage = NoopStage;
        stage.register(&reg("x", 1));
        stage.poll(&shared);
        assert_eq!(stage.watched(), 0);
        assert_eq!(stage.take_verdict("x"), None);
    }
}
