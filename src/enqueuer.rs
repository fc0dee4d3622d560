// Bounded worker pool for pipeline runs.

use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("worker pool is closed")]
    Closed,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was aborted")]
    Aborted,
}

pub type Task = BoxFuture<'static, ()>;

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    inner: JoinHandle<Result<(), EnqueueError>>,
}

impl TaskHandle {
    /// Waits for the task, including any time spent queued for a worker.
    pub async fn join(self) -> Result<(), EnqueueError> {
        match self.inner.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(EnqueueError::Panicked(panic_message(err))),
            Err(_) => Err(EnqueueError::Aborted),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn abort(&self) {
        self.inner.abort();
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub trait Enqueuer: Send + Sync {
    /// Submits `task` and returns at once. The task waits for a free worker
    /// when all of them are busy.
    fn enqueue(&self, task: Task) -> Result<TaskHandle, EnqueueError>;
}

/// `tokio` tasks gated by a semaphore with one permit per worker.
#[derive(Debug, Clone)]
pub struct TokioEnqueuer {
    workers: Arc<Semaphore>,
    size: usize,
}

impl TokioEnqueuer {
    pub fn new(workers: usize) -> Self {
        let size = workers.max(1);
        Self {
            workers: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.workers)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Rejects new submissions. Queued tasks are dropped without running;
    /// running tasks finish normally.
    pub fn close(&self) {
        self.workers.close();
    }
}

impl Enqueuer for TokioEnqueuer {
    fn enqueue(&self, task: Task) -> Result<TaskHandle, EnqueueError> {
        if self.workers.is_closed() {
            return Err(EnqueueError::Closed);
        }
        let workers = self.workers.clone();
        let inner = tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                warn!("Worker pool closed before queued task could start");
                return Err(EnqueueError::Closed);
            };
            debug!("Task acquired a worker");
            task.await;
            Ok(())
        });
        Ok(TaskHandle { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn pool_size_comes_from_engine_config() {
        let config = EngineConfig {
            workers: 3,
            ..EngineConfig::default()
        };
        assert_eq!(TokioEnqueuer::from_config(&config).size(), 3);
        assert_eq!(TokioEnqueuer::new(0).size(), 1);
    }

    #[tokio::test]
    async fn enqueued_task_runs() {
        let enqueuer = TokioEnqueuer::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();

        let handle = enqueuer
            .enqueue(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();

        handle.join().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(enqueuer.idle_workers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_n_tasks_run_at_once() {
        let enqueuer = TokioEnqueuer::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                enqueuer
                    .enqueue(
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        }
                        .boxed(),
                    )
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.join().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let enqueuer = TokioEnqueuer::new(1);
        let handle = enqueuer
            .enqueue(async { panic!("thesis exploded"); }.boxed())
            .unwrap();

        assert_eq!(
            handle.join().await,
            Err(EnqueueError::Panicked("thesis exploded".into()))
        );
        assert_eq!(enqueuer.idle_workers(), 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_submissions() {
        let enqueuer = TokioEnqueuer::new(1);
        enqueuer.close();
        assert!(matches!(
            enqueuer.enqueue(async {}.boxed()),
            Err(EnqueueError::Closed)
        ));
    }
}
