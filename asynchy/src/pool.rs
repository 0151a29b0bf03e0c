//! Fixed-size pool that runs transfer jobs and reports their progress.
//!
//! Concurrency is bounded by a semaphore, task lifetimes are tracked so that
//! [`JobPool::shutdown`] can wait for in-flight work, and a single
//! cancellation token is shared by every job the pool ever runs.

use crate::error::{AsynchyResult, TransferError};
use crate::metrics::Metrics;
use crate::outcome::Outcome;
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything a job needs from the pool while it runs.
pub struct JobContext {
    pub id: Uuid,
    pub cancel: CancellationToken,
    pub progress: ProgressSender,
}

/// Producer side of the shared progress channel.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<u64>,
    metrics: Metrics,
}

impl ProgressSender {
    /// Post a delta of bytes transferred. Zero deltas are dropped.
    pub fn send(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        self.metrics.record_bytes(delta);
        // The receiver lives as long as the pool, so a send error only
        // happens while the pool itself is being dropped.
        let _ = self.tx.send(delta);
    }
}

/// Consumer side of the shared progress channel.
///
/// Deltas from different jobs arrive interleaved in no particular order;
/// only their sum is meaningful.
#[derive(Clone)]
pub struct Progress {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<u64>>>,
}

impl Progress {
    /// Take every pending delta without blocking and return their sum.
    pub fn drain(&self) -> u64 {
        let mut rx = self.rx.lock();
        let mut total = 0u64;
        while let Ok(delta) = rx.try_recv() {
            total = total.saturating_add(delta);
        }
        total
    }
}

/// Handle to a job (or batch of jobs) submitted to the pool.
pub struct TransferHandle<T> {
    inner: JoinHandle<Outcome<T>>,
}

impl<T: Send + 'static> TransferHandle<T> {
    /// Resolve immediately with `outcome`, still routing it through `callback`.
    fn resolved<C>(outcome: Outcome<T>, callback: C) -> Self
    where
        C: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let inner = tokio::spawn(async move {
            callback(&outcome);
            outcome
        });
        Self { inner }
    }

    /// True once the job has resolved and its callback has returned.
    pub fn is_ready(&self) -> bool {
        self.inner.is_finished()
    }

    pub async fn wait(self) -> Outcome<T> {
        match self.inner.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failure(TransferError::Worker {
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct JobPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    progress_tx: mpsc::UnboundedSender<u64>,
    progress: Progress,
    metrics: Metrics,
}

impl JobPool {
    pub fn new(size: usize) -> AsynchyResult<Self> {
        if size == 0 {
            return Err(TransferError::ConfigInvalid {
                field: "threads".to_string(),
                reason: "the worker pool needs at least one slot".to_string(),
            }
            .into());
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let inner = PoolInner {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            progress_tx,
            progress: Progress {
                rx: Arc::new(Mutex::new(progress_rx)),
            },
            metrics: Metrics::new()?,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn progress(&self) -> Progress {
        self.inner.progress.clone()
    }

    #[cfg(test)]
    pub(crate) fn progress_sender(&self) -> ProgressSender {
        ProgressSender {
            tx: self.inner.progress_tx.clone(),
            metrics: self.inner.metrics.clone(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Number of jobs submitted but not yet resolved.
    pub fn pending(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Queue one job. `callback` runs exactly once, after `work` resolves and
    /// before the returned handle reports ready.
    pub fn submit<T, W, Fut, C>(&self, work: W, callback: C) -> TransferHandle<T>
    where
        T: Send + 'static,
        W: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
        C: FnOnce(&Outcome<T>) + Send + 'static,
    {
        if self.is_cancelled() {
            debug!("Rejecting job submitted after shutdown");
            return TransferHandle::resolved(Outcome::Failure(TransferError::PoolClosed), callback);
        }

        self.inner.metrics.record_job_submitted();
        let inner = self.inner.clone();
        let handle = self.inner.tracker.spawn(async move {
            let outcome = inner.execute(work).await;
            callback(&outcome);
            outcome
        });

        TransferHandle { inner: handle }
    }

    /// Queue several jobs and resolve once all of them have. The batch only
    /// fails as a whole when the pool refuses the submission.
    pub fn submit_batch<T, W, Fut, C>(&self, works: Vec<W>, callback: C) -> TransferHandle<Vec<Outcome<T>>>
    where
        T: Send + 'static,
        W: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
        C: FnOnce(&Outcome<Vec<Outcome<T>>>) + Send + 'static,
    {
        if self.is_cancelled() {
            return TransferHandle::resolved(Outcome::Failure(TransferError::PoolClosed), callback);
        }

        let handles: Vec<_> = works
            .into_iter()
            .map(|work| self.submit(work, |_: &Outcome<T>| {}))
            .collect();

        let handle = self.inner.tracker.spawn(async move {
            let results = join_all(handles.into_iter().map(TransferHandle::wait)).await;
            let outcome = Outcome::Success(results);
            callback(&outcome);
            outcome
        });

        TransferHandle { inner: handle }
    }

    /// Cancel every job, refuse new ones and wait for in-flight workers to
    /// finish. Returns `true` once the pool has drained.
    pub async fn shutdown(&self) -> bool {
        info!("Cancelling transfers; waiting for {} outstanding jobs", self.pending());
        self.inner.cancel.cancel();
        self.inner.permits.close();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Transfer pool drained");
        true
    }
}

impl PoolInner {
    async fn execute<T, W, Fut>(&self, work: W) -> Outcome<T>
    where
        W: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };

        let Some(_permit) = permit else {
            self.metrics.record_job_cancelled(false);
            return Outcome::Failure(TransferError::Cancelled);
        };

        let context = JobContext {
            id: Uuid::new_v4(),
            cancel: self.cancel.clone(),
            progress: ProgressSender {
                tx: self.progress_tx.clone(),
                metrics: self.metrics.clone(),
            },
        };

        self.metrics.record_job_started();
        let started = Instant::now();
        let outcome = work(context).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &outcome {
            Outcome::Success(_) => self.metrics.record_job_completed(elapsed),
            Outcome::Failure(TransferError::Cancelled) => self.metrics.record_job_cancelled(true),
            Outcome::Failure(_) => self.metrics.record_job_failed(elapsed),
        }

        outcome
    }
}
