use std::future::Future;
use std::sync::Arc;

use ggd_types::{GradeGridError, Result};
use tokio::sync::Semaphore;

/// Bounded pool for blocking filesystem work and sandbox runtime calls.
///
/// At most `size` operations run at once; further callers wait for a permit.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking closure on the blocking thread pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GradeGridError::Other("worker pool closed".to_string()))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| GradeGridError::Other(format!("blocking task failed: {e}")))?
    }

    /// Run an async operation while holding a permit.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GradeGridError::Other("worker pool closed".to_string()))?;
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_blocking_returns_value() {
        let pool = WorkerPool::new(2);
        let v = pool.run_blocking(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn run_blocking_propagates_error() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run_blocking(|| -> Result<()> { Err(GradeGridError::Workspace("nope".into())) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }
}
