pub mod callback;
pub mod framing;
pub mod logging;
pub mod transport;
pub mod utils;
pub mod workspace;

// Runtime side: sandboxes, limits, agents
pub mod agent;
pub mod runtime;
pub mod watcher;

// Pool side
pub mod dispatcher;

pub use callback::{callback_channel, default_text, finalize, normalize_grade, JobCallback};
pub use framing::{read_message, write_message, MessageBuffer, SandboxMessage};
pub use logging::init_logging;
pub use utils::{with_retry, Backoff, GracefulShutdown, RetryConfig, WorkerPool};
pub use workspace::{is_valid_id, task_bundle_path, JobWorkspace};

pub use agent::Agent;
pub use dispatcher::server::ServerSettings;
pub use dispatcher::{AgentId, Dispatcher, SshDebugHook};
pub use runtime::{
    ContainerSpec, DockerCliRuntime, MockRuntime, PooledRuntime, RuntimeEvent, SandboxRuntime,
    SandboxScript,
};
pub use transport::{spawn_agent_link, AgentLink, LinkEvent, LinkSettings};
pub use watcher::{WatcherHandle, WatcherPipeline, WatcherRegistration};
