//! Bounded worker pool for the per-file phases.
//!
//! At most `workers` jobs run at once and at most `max_in_flight` are queued; the
//! submitter waits on finished jobs before queueing more. A failing job is logged
//! with its label and yields `None`; it never stops the batch.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};

const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

type Finished<T> = Result<(usize, String, Result<T>), JoinError>;

struct Progress<'a, T> {
    phase: &'a str,
    total: usize,
    done: usize,
    failed: usize,
    results: Vec<Option<T>>,
}

impl<T> Progress<'_, T> {
    fn record(&mut self, finished: Finished<T>) {
        self.done += 1;
        match finished {
            Ok((index, _, Ok(value))) => self.results[index] = Some(value),
            Ok((_, label, Err(err))) => {
                self.failed += 1;
                warn!(phase = self.phase, item = %label, error = %format!("{err:#}"), "job failed; skipping");
            }
            Err(err) => {
                self.failed += 1;
                warn!(phase = self.phase, error = %err, "job panicked or was cancelled");
            }
        }
        if self.done % PROGRESS_EVERY == 0 || self.done == self.total {
            info!(phase = self.phase, done = self.done, total = self.total, "{} {}/{} files", self.phase, self.done, self.total);
        }
    }
}

impl WorkerPool {
    pub fn new(workers: usize, max_in_flight: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            max_in_flight: max_in_flight.max(workers),
        }
    }

    /// Run `job` over every item. Results line up with `items`.
    pub async fn run<I, T, F, Fut>(&self, phase: &str, items: Vec<I>, job: F) -> Vec<Option<T>>
    where
        I: Display + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = items.len();
        let mut progress = Progress {
            phase,
            total,
            done: 0,
            failed: 0,
            results: (0..total).map(|_| None).collect(),
        };
        let mut tasks = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            while tasks.len() >= self.max_in_flight {
                match tasks.join_next().await {
                    Some(finished) => progress.record(finished),
                    None => break,
                }
            }
            let label = item.to_string();
            let permits = Arc::clone(&self.permits);
            let fut = job(item);
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => fut.await,
                    Err(err) => Err(err.into()),
                };
                (index, label, outcome)
            });
        }
        while let Some(finished) = tasks.join_next().await {
            progress.record(finished);
        }
        if progress.failed > 0 {
            warn!(phase, failed = progress.failed, total, "some jobs failed; they will be retried next run");
        }
        progress.results
    }
}

/// Run CPU-bound work off the async workers.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn results_follow_input_order_and_failures_become_none() {
        let pool = WorkerPool::new(2, 3);
        let results = pool
            .run("test", (0..10u32).collect(), |n| async move {
                if n == 4 {
                    anyhow::bail!("four is unlucky");
                }
                Ok(n * 10)
            })
            .await;
        assert_eq!(results.len(), 10);
        assert_eq!(results[3], Some(30));
        assert_eq!(results[4], None);
        assert_eq!(results[9], Some(90));
    }

    #[tokio::test]
    async fn never_exceeds_worker_count() {
        let pool = WorkerPool::new(2, 8);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        pool.run("test", (0..12u32).collect(), |_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn blocking_work_propagates_errors() {
        assert_eq!(blocking(|| Ok(2 + 2)).await.unwrap(), 4);
        assert!(blocking(|| -> Result<()> { anyhow::bail!("boom") }).await.is_err());
    }
}
