//! CPU-bound executor for the process stage.
//!
//! Analysis runs on a dedicated rayon pool sized to the process worker count;
//! the submitting task awaits a oneshot, so the async runtime never blocks on
//! pixel work.

use crate::PipelineError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};

pub struct AnalysisExecutor {
    pool: RwLock<Option<Arc<rayon::ThreadPool>>>,
    threads: usize,
}

impl AnalysisExecutor {
    /// Build the pool. Failure here is the one fatal setup error of a run.
    pub fn new(threads: usize) -> Result<Self, PipelineError> {
        if threads == 0 {
            return Err(PipelineError::Setup(
                "analysis pool needs at least one thread".to_string(),
            ));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("analysis-{i}"))
            .build()?;

        info!("Analysis pool started with {} threads", threads);
        Ok(Self {
            pool: RwLock::new(Some(Arc::new(pool))),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `job` on the pool and await its result.
    ///
    /// A panic inside `job` comes back as an analysis error instead of
    /// tearing down the pool thread's caller.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| PipelineError::analysis("analysis pool is shut down"))?;

        let (tx, rx) = oneshot::channel();
        pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(PipelineError::analysis(format!("analysis job panicked: {reason}")))
            });
            // The receiver is gone only if the submitting task was cancelled.
            let _ = tx.send(outcome);
        });

        rx.await
            .map_err(|_| PipelineError::analysis("analysis job dropped before completing"))?
    }

    /// Stop accepting work. Jobs already queued on the pool still run.
    pub async fn shutdown(&self) {
        if self.pool.write().await.take().is_some() {
            debug!("Analysis pool shut down");
        }
    }

    pub async fn is_shut_down(&self) -> bool {
        self.pool.read().await.is_none()
    }
}
