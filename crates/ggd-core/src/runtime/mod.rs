//! Sandbox runtime adapter.
//!
//! A thin contract over the container engine: create, start, attach, inspect,
//! kill and remove containers, and stream their lifecycle events. It carries no
//! grading logic and never retries; every failure is returned to the caller.

pub mod docker;
pub mod mock;
pub mod pooled;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use ggd_types::Result;
use tokio::io::{AsyncRead, AsyncWrite};

pub use docker::DockerCliRuntime;
pub use mock::{MockRuntime, SandboxScript};
pub use pooled::PooledRuntime;

/// Label put on every container this platform creates.
pub const MANAGED_LABEL: &str = "org.gradegrid.managed";
/// Label carrying the owning job id.
pub const JOB_LABEL: &str = "org.gradegrid.job";

/// Lifecycle notification from the container engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Died { container_id: String, exit_code: i32 },
    Oom { container_id: String },
}

impl RuntimeEvent {
    pub fn container_id(&self) -> &str {
        match self {
            Self::Died { container_id, .. } | Self::Oom { container_id } => container_id,
        }
    }
}

/// Stream of runtime events, in engine order.
pub type EventStream = Pin<Box<dyn Stream<Item = RuntimeEvent> + Send>>;

/// Network namespace of a new container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    None,
    Bridge,
    /// Join the namespace of another container.
    Container(String),
}

/// Host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub memory_mb: u64,
    pub network: NetworkMode,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub command: Vec<String>,
    /// Keep stdin open so the host can talk to the grading process.
    pub interactive: bool,
    pub run_as_root: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, memory_mb: u64) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        Self {
            name: name.into(),
            image: image.into(),
            memory_mb,
            network: NetworkMode::None,
            mounts: Vec::new(),
            env: Vec::new(),
            labels,
            command: Vec::new(),
            interactive: false,
            run_as_root: false,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_mount(mut self, host: PathBuf, target: &str, read_only: bool) -> Self {
        self.mounts.push(Mount {
            host,
            target: target.to_string(),
            read_only,
        });
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }
}

/// Resource usage sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub memory_bytes: u64,
}

/// Captured output of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Host side of an attached container.
///
/// `output` yields multiplexed `{type, length}` chunks; `input` feeds stdin.
pub struct AttachedStreams {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for AttachedStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedStreams").finish_non_exhaustive()
    }
}

/// Container engine contract.
#[async_trait]
pub trait SandboxRuntime: Send + Sync + 'static {
    /// Grading environments available locally: name to image id.
    async fn list_environments(&self) -> Result<BTreeMap<String, String>>;

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Attach to a created container's standard streams.
    async fn attach(&self, container_id: &str) -> Result<AttachedStreams>;

    /// Start a created container.
    async fn start(&self, container_id: &str) -> Result<()>;

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs>;

    async fn stats(&self, container_id: &str) -> Result<ContainerStats>;

    /// Kill a container; killing one that already stopped succeeds.
    async fn kill(&self, container_id: &str) -> Result<()>;

    /// Remove a container; removing one that is already gone succeeds.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Ids of running managed containers.
    async fn list_running(&self) -> Result<Vec<String>>;

    /// Subscribe to die / oom events of managed containers.
    async fn events(&self) -> Result<EventStream>;

    /// Whether `stats` reports real memory usage.
    fn supports_resource_stats(&self) -> bool {
        true
    }
}
