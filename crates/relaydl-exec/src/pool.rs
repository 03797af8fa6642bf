use crate::FetchError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::warn;

/// Bounded pool for extractor jobs. At most `workers` jobs run at once; each
/// job is cancelled when it exceeds the per-job timeout.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
    job_timeout: Duration,
}

impl WorkerPool {
    pub fn new(workers: usize, job_timeout: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            job_timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `job` on its own task once a slot frees up. On timeout the task is
    /// aborted and awaited, so child processes spawned with `kill_on_drop`
    /// are gone before this returns.
    pub async fn run<F, T>(&self, job: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::PoolClosed)?;

        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            job.await
        });

        match timeout(self.job_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(FetchError::Worker(e.to_string())),
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                warn!(timeout_secs = self.job_timeout.as_secs(), "Worker job timed out");
                Err(FetchError::Timeout(self.job_timeout.as_secs()))
            }
        }
    }

    pub fn close(&self) {
        self.permits.close();
    }
}
