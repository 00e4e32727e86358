//! Supervision of fire-and-forget index tasks.

use crate::Result;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::task::JoinSet;

/// Owns background tasks so their failures are logged and counted instead
/// of vanishing with a dropped handle.
///
/// Spawning never blocks the caller. Finished tasks are reaped
/// opportunistically on each spawn; [`TaskSupervisor::drain`] waits for the
/// rest.
#[derive(Debug, Default)]
pub struct TaskSupervisor {
    tasks: Mutex<JoinSet<()>>,
    spawned: AtomicUsize,
    failures: Arc<AtomicUsize>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the background. An `Err` result is logged under `label`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        let failures = self.failures.clone();
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let mut tasks = self.tasks.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                tracing::error!("Index task aborted: {}", e);
            }
        }

        tasks.spawn(async move {
            let start = Instant::now();
            let result = task.await;
            histogram!("index_task_duration_seconds").record(start.elapsed().as_secs_f64());

            if let Err(e) = result {
                tracing::warn!("{} failed: {}", label, e);
                counter!("index_task_failures_total").increment(1);
                failures.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    /// Tasks not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Tasks spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Tasks that returned an error.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait for every task spawned before this call. Returns how many were
    /// awaited.
    pub async fn drain(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut drained = 0usize;
        while let Some(finished) = tasks.join_next().await {
            drained += 1;
            if let Err(e) = finished {
                tracing::error!("Index task aborted: {}", e);
            }
        }
        drained
    }
}
