use crate::outcome::Outcome;
use crate::pool::{Progress, TransferHandle};
use std::future::Future;
use std::path::{Path, PathBuf};

/// What a successful job moved.
///
/// `bytes_transferred` is best effort: it is whatever the copy tool reported,
/// including any per-entry overhead it counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub source: String,
    pub destination: PathBuf,
    pub bytes_transferred: u64,
}

/// A way of moving files or directories from a source to a local destination.
///
/// Every job's result is delivered as an [`Outcome`], both to the completion
/// callback and through the returned handle.
pub trait Transfer: Send + Sync {
    /// Schedule one transfer without blocking. `callback` is invoked exactly
    /// once, when the job resolves.
    fn transfer<C>(&self, source: &str, destination: &Path, callback: C) -> TransferHandle<TransferResult>
    where
        C: FnOnce(&Outcome<TransferResult>) + Send + 'static;

    /// Schedule several transfers into the same destination. The callback
    /// receives a failure only if the batch could not be submitted at all.
    fn transfer_batch<C>(
        &self,
        sources: &[String],
        destination: &Path,
        callback: C,
    ) -> TransferHandle<Vec<Outcome<TransferResult>>>
    where
        C: FnOnce(&Outcome<Vec<Outcome<TransferResult>>>) + Send + 'static;

    /// Byte deltas posted by every running job. The deltas sum to the total
    /// reported by all jobs.
    fn progress(&self) -> Progress;

    /// Cancel all outstanding work and wait until it has drained.
    fn cancel(&self) -> impl Future<Output = bool> + Send;
}
