use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ggd_types::Result;

use super::{
    AttachedStreams, ContainerLogs, ContainerSpec, ContainerStats, EventStream, SandboxRuntime,
};
use crate::utils::WorkerPool;

/// Routes every adapter call through a bounded [`WorkerPool`].
pub struct PooledRuntime {
    inner: Arc<dyn SandboxRuntime>,
    pool: WorkerPool,
}

impl PooledRuntime {
    pub fn new(inner: Arc<dyn SandboxRuntime>, pool: WorkerPool) -> Self {
        Self { inner, pool }
    }
}

#[async_trait]
impl SandboxRuntime for PooledRuntime {
    async fn list_environments(&self) -> Result<BTreeMap<String, String>> {
        self.pool.run(self.inner.list_environments()).await
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.pool.run(self.inner.create(spec)).await
    }

    async fn attach(&self, container_id: &str) -> Result<AttachedStreams> {
        self.pool.run(self.inner.attach(container_id)).await
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.pool.run(self.inner.start(container_id)).await
    }

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs> {
        self.pool.run(self.inner.logs(container_id)).await
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        self.pool.run(self.inner.stats(container_id)).await
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        self.pool.run(self.inner.kill(container_id)).await
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.pool.run(self.inner.remove(container_id)).await
    }

    async fn list_running(&self) -> Result<Vec<String>> {
        self.pool.run(self.inner.list_running()).await
    }

    async fn events(&self) -> Result<EventStream> {
        // The subscription is long-lived; it does not hold a permit.
        self.inner.events().await
    }

    fn supports_resource_stats(&self) -> bool {
        self.inner.supports_resource_stats()
    }
}
