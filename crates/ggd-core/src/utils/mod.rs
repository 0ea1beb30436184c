pub mod retry;
pub mod shutdown;
pub mod worker_pool;

pub use retry::{with_retry, Backoff, RetryConfig};
pub use shutdown::GracefulShutdown;
pub use worker_pool::WorkerPool;
