//! A [`Transfer`] that pretends to copy, for exercising the scheduler without
//! rsync or a network.

use crate::counter::AtomicCounter;
use crate::error::{AsynchyResult, TransferError};
use crate::outcome::Outcome;
use crate::pool::{JobContext, JobPool, Progress, TransferHandle};
use crate::transfer::{Transfer, TransferResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct MockSettings {
    /// Bytes every successful job reports.
    pub bytes_per_job: u64,
    pub chunks: u64,
    pub chunk_delay: Duration,
    /// Sources that fail with the given exit code after sending their chunks.
    pub failures: HashMap<String, i32>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            bytes_per_job: 100,
            chunks: 4,
            chunk_delay: Duration::from_millis(5),
            failures: HashMap::new(),
        }
    }
}

#[derive(Clone)]
pub struct MockTransfer {
    settings: Arc<MockSettings>,
    pool: JobPool,
}

impl MockTransfer {
    pub fn new(threads: usize, settings: MockSettings) -> AsynchyResult<Self> {
        Ok(Self {
            settings: Arc::new(settings),
            pool: JobPool::new(threads)?,
        })
    }

    pub fn pool(&self) -> &JobPool {
        &self.pool
    }

    fn work(&self, source: &str, destination: &Path) -> impl FnOnce(JobContext) -> MockJobFuture + Send + 'static {
        let settings = self.settings.clone();
        let source = source.to_string();
        let destination = destination.to_path_buf();
        move |ctx: JobContext| {
            let span = info_span!("mock_job", id = %ctx.id, source = %source);
            let job: MockJobFuture = Box::pin(simulate(settings, source, destination, ctx).instrument(span));
            job
        }
    }
}

type MockJobFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Outcome<TransferResult>> + Send>>;

async fn simulate(
    settings: Arc<MockSettings>,
    source: String,
    destination: PathBuf,
    ctx: JobContext,
) -> Outcome<TransferResult> {
    let counter = AtomicCounter::default();
    let chunks = settings.chunks.max(1);
    let chunk = settings.bytes_per_job / chunks;

    for i in 0..chunks {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("Cancelled after {} bytes", counter.value());
                return Outcome::Failure(TransferError::Cancelled);
            }
            _ = tokio::time::sleep(settings.chunk_delay) => {}
        }

        // The last chunk carries the remainder.
        let bytes = if i + 1 == chunks {
            settings.bytes_per_job - chunk * (chunks - 1)
        } else {
            chunk
        };
        counter.increment(bytes);
        ctx.progress.send(bytes);
    }

    if let Some(&exit_code) = settings.failures.get(&source) {
        return Outcome::Failure(TransferError::Failed { exit_code });
    }

    Outcome::Success(TransferResult {
        source,
        destination,
        bytes_transferred: counter.value(),
    })
}

impl Transfer for MockTransfer {
    fn transfer<C>(&self, source: &str, destination: &Path, callback: C) -> TransferHandle<TransferResult>
    where
        C: FnOnce(&Outcome<TransferResult>) + Send + 'static,
    {
        self.pool.submit(self.work(source, destination), callback)
    }

    fn transfer_batch<C>(
        &self,
        sources: &[String],
        destination: &Path,
        callback: C,
    ) -> TransferHandle<Vec<Outcome<TransferResult>>>
    where
        C: FnOnce(&Outcome<Vec<Outcome<TransferResult>>>) + Send + 'static,
    {
        let works = sources
            .iter()
            .map(|source| self.work(source, destination))
            .collect();
        self.pool.submit_batch(works, callback)
    }

    fn progress(&self) -> Progress {
        self.pool.progress()
    }

    async fn cancel(&self) -> bool {
        self.pool.shutdown().await
    }
}
