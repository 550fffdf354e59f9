//! Bounded worker pools over a set of work items.
//!
//! A job takes a named lock, skips items that already have stored results, and fans the
//! rest out over `pool_size` workers. Successful outputs are stored as they arrive and
//! failed items have their stale records removed. Callers either wait for the whole run
//! or get back what was already known while the rest finishes in the background.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::lockmanager::{KeyGuard, LockManager};
use crate::core::metrics::JOB_ITEMS;

#[derive(Debug, Error)]
pub(crate) enum JobError<I: Ord, O> {
    #[error("job '{0}' is already running")]
    Locked(String),
    #[error("pool size must be positive, got {0}")]
    InvalidPoolSize(usize),
    /// The caller waited and the run was canceled. Holds whatever finished first.
    #[error("job '{job}' was canceled with {} item(s) unfinished", .partial.remaining)]
    Canceled { job: String, partial: Box<JobOutput<I, O>> },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// The per-item work plus optional persistence hooks.
#[async_trait]
pub(crate) trait JobWork<I, O>: Send + Sync + 'static
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Must return promptly once `cancel` fires.
    async fn work(&self, cancel: &CancellationToken, item: &I) -> anyhow::Result<O>;

    /// Results computed by an earlier run. Only asked about non-empty item sets.
    async fn retrieve(&self, _items: &[I]) -> anyhow::Result<BTreeMap<I, O>> {
        Ok(BTreeMap::new())
    }

    async fn store(&self, _outputs: &[O]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _items: &[I]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct JobOptions {
    pub(crate) wait_for_completion: bool,
    /// Compute but store nothing.
    pub(crate) dry_run: bool,
    /// Drop stored results first and recompute every item.
    pub(crate) overwrite_records: bool,
    /// Keep the caller's cancellation for a detached run instead of the background one.
    pub(crate) retain_context: bool,
}

pub(crate) struct Job<I, O> {
    pub(crate) name: String,
    pub(crate) lock_key: String,
    pub(crate) pool_size: usize,
    pub(crate) work_items: Vec<I>,
    pub(crate) options: JobOptions,
    pub(crate) work: Arc<dyn JobWork<I, O>>,
    pub(crate) cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobOutput<I: Ord, O> {
    pub(crate) results: BTreeMap<I, O>,
    /// Items still being computed when the call returned.
    pub(crate) remaining: usize,
    pub(crate) work_errors: BTreeMap<I, String>,
    pub(crate) canceled: bool,
}

impl<I: Ord, O> Default for JobOutput<I, O> {
    fn default() -> Self {
        Self { results: BTreeMap::new(), remaining: 0, work_errors: BTreeMap::new(), canceled: false }
    }
}

impl<I, O> Job<I, O>
where
    I: Clone + Ord + Debug + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Run the job. `background` replaces the caller's cancellation for detached runs.
    pub(crate) async fn run(
        self,
        locks: &LockManager,
        background: CancellationToken,
    ) -> Result<JobOutput<I, O>, JobError<I, O>> {
        if self.pool_size == 0 {
            return Err(JobError::InvalidPoolSize(self.pool_size));
        }

        let guard = if self.lock_key.is_empty() {
            None
        } else {
            Some(locks.try_lock(&self.lock_key).ok_or_else(|| JobError::Locked(self.lock_key.clone()))?)
        };

        let mut items = self.work_items.clone();
        items.sort();
        items.dedup();

        let mut known = BTreeMap::new();
        if !items.is_empty() {
            if self.options.overwrite_records {
                if !self.options.dry_run {
                    self.work.remove(&items).await?;
                }
            } else {
                known = self.work.retrieve(&items).await?;
            }
        }

        let to_compute: Vec<I> = items.into_iter().filter(|item| !known.contains_key(item)).collect();
        tracing::debug!(
            job = %self.name,
            known = known.len(),
            to_compute = to_compute.len(),
            "Starting job"
        );

        if self.options.wait_for_completion {
            let total = to_compute.len();
            let mut output = self.execute(to_compute, self.cancel.clone(), guard).await;
            if output.canceled {
                output.remaining = total.saturating_sub(output.results.len() + output.work_errors.len());
                output.results.extend(known);
                return Err(JobError::Canceled { job: self.name.clone(), partial: Box::new(output) });
            }
            output.results.extend(known);
            return Ok(output);
        }

        let remaining = to_compute.len();
        let cancel = if self.options.retain_context { self.cancel.clone() } else { background };
        let name = self.name.clone();
        tokio::spawn(async move {
            let output = self.execute(to_compute, cancel, guard).await;
            tracing::info!(
                job = %name,
                completed = output.results.len(),
                failed = output.work_errors.len(),
                canceled = output.canceled,
                "Background job finished"
            );
        });

        Ok(JobOutput { results: known, remaining, ..JobOutput::default() })
    }

    async fn execute(
        &self,
        to_compute: Vec<I>,
        cancel: CancellationToken,
        _guard: Option<KeyGuard>,
    ) -> JobOutput<I, O> {
        let mut output = JobOutput::default();
        if to_compute.is_empty() {
            return output;
        }

        let (item_tx, item_rx) = mpsc::channel::<I>(self.pool_size);
        let (result_tx, mut result_rx) = mpsc::channel::<(I, anyhow::Result<O>)>(self.pool_size);
        let item_rx = Arc::new(Mutex::new(item_rx));

        let feed_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for item in to_compute {
                tokio::select! {
                    _ = feed_cancel.cancelled() => break,
                    sent = item_tx.send(item) => if sent.is_err() { break },
                }
            }
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.pool_size {
            let item_rx = item_rx.clone();
            let result_tx = result_tx.clone();
            let work = self.work.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let next = tokio::select! {
                        _ = cancel.cancelled() => None,
                        item = async { item_rx.lock().await.recv().await } => item,
                    };
                    let Some(item) = next else {
                        break;
                    };

                    let result = work.work(&cancel, &item).await;
                    if result_tx.send((item, result)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        while let Some((item, result)) = result_rx.recv().await {
            match result {
                Ok(value) => {
                    if !self.options.dry_run && !cancel.is_cancelled() {
                        if let Err(err) = self.work.store(std::slice::from_ref(&value)).await {
                            output
                                .work_errors
                                .insert(item, format!("Failed to store result: {err:#}"));
                            continue;
                        }
                    }
                    metrics::counter!(JOB_ITEMS, "job" => self.name.clone(), "outcome" => "ok").increment(1);
                    output.results.insert(item, value);
                }
                Err(err) => {
                    tracing::debug!(job = %self.name, item = ?item, error = %format!("{err:#}"), "Job item failed");
                    if !self.options.dry_run {
                        if let Err(remove_err) = self.work.remove(std::slice::from_ref(&item)).await {
                            tracing::warn!(job = %self.name, error = %remove_err, "Failed to remove stale record");
                        }
                    }
                    metrics::counter!(JOB_ITEMS, "job" => self.name.clone(), "outcome" => "error").increment(1);
                    output.work_errors.insert(item, format!("{err:#}"));
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(job = %self.name, error = %err, "Job worker panicked");
            }
        }
        feeder.abort();

        output.canceled = cancel.is_cancelled();
        output
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Squares {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        stored: StdMutex<Vec<u64>>,
        removed: StdMutex<Vec<u64>>,
        known: BTreeMap<u64, u64>,
        delay_ms: u64,
    }

    #[async_trait]
    impl JobWork<u64, u64> for Squares {
        async fn work(&self, cancel: &CancellationToken, item: &u64) -> anyhow::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if *item == 13 {
                anyhow::bail!("unlucky");
            }
            Ok(item * item)
        }

        async fn retrieve(&self, items: &[u64]) -> anyhow::Result<BTreeMap<u64, u64>> {
            Ok(items.iter().filter_map(|item| self.known.get(item).map(|value| (*item, *value))).collect())
        }

        async fn store(&self, outputs: &[u64]) -> anyhow::Result<()> {
            self.stored.lock().expect("lock").extend_from_slice(outputs);
            Ok(())
        }

        async fn remove(&self, items: &[u64]) -> anyhow::Result<()> {
            self.removed.lock().expect("lock").extend_from_slice(items);
            Ok(())
        }
    }

    fn job(work: Arc<Squares>, items: Vec<u64>, pool_size: usize, wait: bool) -> Job<u64, u64> {
        Job {
            name: String::from("squares"),
            lock_key: String::from("job::squares"),
            pool_size,
            work_items: items,
            options: JobOptions { wait_for_completion: wait, ..JobOptions::default() },
            work,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn waiting_job_returns_every_result_and_error() {
        let locks = LockManager::new();
        let work = Arc::new(Squares {
            known: BTreeMap::from([(2, 4)]),
            delay_ms: 5,
            ..Squares::default()
        });

        let output = job(work.clone(), vec![1, 2, 3, 13, 3], 2, true)
            .run(&locks, CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(output.results, BTreeMap::from([(1, 1), (2, 4), (3, 9)]));
        assert_eq!(output.remaining, 0);
        assert!(output.work_errors.get(&13).is_some_and(|err| err.contains("unlucky")));
        assert!(!output.canceled);

        assert_eq!(work.calls.load(Ordering::SeqCst), 3);
        assert!(work.max_active.load(Ordering::SeqCst) <= 2);
        let mut stored = work.stored.lock().expect("lock").clone();
        stored.sort();
        assert_eq!(stored, vec![1, 9]);
        assert_eq!(*work.removed.lock().expect("lock"), vec![13]);
        assert!(!locks.is_locked("job::squares"));
    }

    #[tokio::test]
    async fn detached_job_returns_known_results_right_away() {
        let locks = LockManager::new();
        let work = Arc::new(Squares {
            known: BTreeMap::from([(5, 25)]),
            delay_ms: 50,
            ..Squares::default()
        });

        let output = job(work.clone(), vec![4, 5, 6], 1, false)
            .run(&locks, CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(output.results, BTreeMap::from([(5, 25)]));
        assert_eq!(output.remaining, 2);

        // The background run holds the lock until it is done.
        assert!(locks.is_locked("job::squares"));
        let err = job(work.clone(), vec![4], 1, true)
            .run(&locks, CancellationToken::new())
            .await
            .expect_err("locked");
        assert!(matches!(err, JobError::Locked(_)));

        for _ in 0..100 {
            if !locks.is_locked("job::squares") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!locks.is_locked("job::squares"));
        assert_eq!(work.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn canceled_job_stops_pulling_items() {
        let locks = LockManager::new();
        let work = Arc::new(Squares { delay_ms: 10_000, ..Squares::default() });
        let mut job = job(work.clone(), (1..=10).collect(), 1, true);
        let cancel = job.cancel.clone();
        job.options.dry_run = true;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = job.run(&locks, CancellationToken::new()).await.expect_err("canceled");
        let JobError::Canceled { job, partial } = err else {
            panic!("expected a canceled job, got {err}");
        };
        assert_eq!(job, "squares");
        assert!(partial.canceled);
        assert!(partial.remaining >= 8);
        assert!(work.calls.load(Ordering::SeqCst) <= 2);
        assert!(work.stored.lock().expect("lock").is_empty());
        assert!(!locks.is_locked("job::squares"));
    }

    #[tokio::test]
    async fn canceled_job_keeps_results_finished_before_the_cancel() {
        let locks = LockManager::new();
        let work = Arc::new(Squares { known: BTreeMap::from([(2, 4)]), delay_ms: 10_000, ..Squares::default() });
        let job = job(work.clone(), vec![2, 3], 1, true);
        job.cancel.cancel();

        let err = job.run(&locks, CancellationToken::new()).await.expect_err("canceled");
        let JobError::Canceled { partial, .. } = err else {
            panic!("expected a canceled job, got {err}");
        };
        assert_eq!(partial.results, BTreeMap::from([(2, 4)]));
        assert_eq!(partial.remaining, 1);
    }

    #[tokio::test]
    async fn overwrite_removes_before_computing() {
        let locks = LockManager::new();
        let work = Arc::new(Squares { known: BTreeMap::from([(3, 0)]), ..Squares::default() });
        let mut job = job(work.clone(), vec![3], 1, true);
        job.options.overwrite_records = true;

        let output = job.run(&locks, CancellationToken::new()).await.expect("run");
        assert_eq!(output.results, BTreeMap::from([(3, 9)]));
        assert_eq!(*work.removed.lock().expect("lock"), vec![3]);
    }

    #[tokio::test]
    async fn zero_pool_is_rejected() {
        let locks = LockManager::new();
        let err = job(Arc::new(Squares::default()), vec![1], 0, true)
            .run(&locks, CancellationToken::new())
            .await
            .expect_err("pool");
        assert!(matches!(err, JobError::InvalidPoolSize(0)));
    }
}
