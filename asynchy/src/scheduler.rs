//! Drives one repatriation run: pick pending items from the catalog, hand
//! them to a [`Transfer`], follow progress and record what finished.

use crate::catalog::{Catalog, PendingItem, SortOrder};
use crate::error::{AsynchyResult, TransferError};
use crate::outcome::Outcome;
use crate::pool::TransferHandle;
use crate::transfer::{Transfer, TransferResult};
use futures::future::join_all;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Where the progress of a run is shown.
pub trait ProgressSink: Send {
    /// Called once with the expected number of bytes.
    fn start(&mut self, total: u64);
    fn advance(&mut self, delta: u64);
    fn finish(&mut self);
}

/// Progress reported through `tracing`, for runs without a terminal.
#[derive(Debug, Default)]
pub struct LogProgress {
    total: u64,
    done: u64,
    last_percent: u64,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn done(&self) -> u64 {
        self.done
    }
}

impl ProgressSink for LogProgress {
    fn start(&mut self, total: u64) {
        self.total = total;
        info!("Expecting to transfer {} bytes", total);
    }

    fn advance(&mut self, delta: u64) {
        self.done = self.done.saturating_add(delta);
        if self.total == 0 {
            return;
        }

        let percent = (self.done.saturating_mul(100) / self.total).min(100);
        if percent >= self.last_percent + 10 {
            self.last_percent = percent - percent % 10;
            info!("Transferred {} of {} bytes ({}%)", self.done, self.total, percent);
        }
    }

    fn finish(&mut self) {
        info!("Transferred {} bytes in total", self.done);
    }
}

/// Settings for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub destination_root: PathBuf,
    /// Joined with each item key to form the source path.
    pub source_prefix: String,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub poll_interval: Duration,
}

impl RunOptions {
    pub fn new(destination_root: impl Into<PathBuf>, source_prefix: impl Into<String>) -> Self {
        Self {
            destination_root: destination_root.into(),
            source_prefix: source_prefix.into(),
            order: SortOrder::Asc,
            limit: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Counts over the outcomes of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes: u64,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Incomplete items in `order`, at most `limit` of them, and the sum of their
/// expected sizes.
pub fn get_items<C>(catalog: &C, order: SortOrder, limit: Option<usize>) -> AsynchyResult<(Vec<PendingItem>, u64)>
where
    C: Catalog + ?Sized,
{
    let items = catalog.list_incomplete(order, limit)?;
    let total = items
        .iter()
        .fold(0u64, |sum, item| sum.saturating_add(item.expected_size));
    Ok((items, total))
}

/// Source path for an item key. An absolute key replaces the prefix.
pub fn source_path(prefix: &str, key: &str) -> String {
    Path::new(prefix).join(key).to_string_lossy().into_owned()
}

pub fn summarize(outcomes: &[Outcome<TransferResult>]) -> RunSummary {
    outcomes
        .iter()
        .fold(RunSummary::default(), |mut summary, outcome| {
            match outcome {
                Outcome::Success(result) => {
                    summary.succeeded += 1;
                    summary.bytes = summary.bytes.saturating_add(result.bytes_transferred);
                }
                Outcome::Failure(TransferError::Cancelled) => summary.cancelled += 1,
                Outcome::Failure(_) => summary.failed += 1,
            }
            summary
        })
}

/// Where a completion callback leaves a catalog write failure for the driver.
type CatalogFailure = Arc<Mutex<Option<TransferError>>>;

/// Completion callback for one item: record a success in the catalog, log a
/// failure. A success whose catalog write fails is reported through `failure`.
fn completion_handler<C>(
    catalog: Arc<C>,
    key: String,
    failure: CatalogFailure,
) -> impl FnOnce(&Outcome<TransferResult>) + Send + 'static
where
    C: Catalog + 'static,
{
    move |outcome: &Outcome<TransferResult>| {
        let recorded = outcome.as_ref().map(|result| {
            catalog.mark_complete(&key, result.bytes_transferred)?;
            debug!("Marked {} complete ({} bytes)", key, result.bytes_transferred);
            Ok::<_, crate::AsynchyError>(())
        });

        if outcome.is_success() {
            if let Some(cause) = recorded.cause() {
                *failure.lock() = Some(cause.clone());
            }
        }

        let _ = recorded.handle_error(|cause| {
            match &cause {
                TransferError::Cancelled => debug!("{}: {}", key, cause),
                TransferError::Catalog { .. } => error!("{}: {}", key, cause),
                _ => warn!("{}: {}", key, cause),
            }
            Err::<(), _>(cause)
        });
    }
}

/// Run until every item has resolved. The first Ctrl-C cancels outstanding
/// transfers and lets them drain; a second one exits immediately.
pub async fn run<T, C, S>(
    transfer: &T,
    catalog: Arc<C>,
    options: &RunOptions,
    sink: &mut S,
) -> AsynchyResult<Vec<Outcome<TransferResult>>>
where
    T: Transfer,
    C: Catalog + 'static,
    S: ProgressSink + ?Sized,
{
    let stop = CancellationToken::new();
    let interrupts = tokio::spawn(watch_interrupts(stop.clone()));

    let outcomes = run_until(transfer, catalog, options, sink, stop).await;
    interrupts.abort();
    outcomes
}

async fn watch_interrupts(stop: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("Interrupt received; cancelling transfers (press Ctrl-C again to exit now)");
    stop.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        error!("Second interrupt received; exiting without waiting for transfers");
        std::process::exit(1);
    }
}

/// Same as [`run`], with the stop request supplied by the caller.
pub async fn run_until<T, C, S>(
    transfer: &T,
    catalog: Arc<C>,
    options: &RunOptions,
    sink: &mut S,
    stop: CancellationToken,
) -> AsynchyResult<Vec<Outcome<TransferResult>>>
where
    T: Transfer,
    C: Catalog + 'static,
    S: ProgressSink + ?Sized,
{
    let (items, expected) = get_items(catalog.as_ref(), options.order, options.limit)?;
    info!(
        "Transferring {} items ({} bytes expected) into {}",
        items.len(),
        expected,
        options.destination_root.display()
    );

    let progress = transfer.progress();
    sink.start(expected);

    let failures: Vec<CatalogFailure> = items.iter().map(|_| CatalogFailure::default()).collect();
    let handles: Vec<TransferHandle<TransferResult>> = items
        .into_iter()
        .zip(&failures)
        .map(|(item, failure)| {
            let source = source_path(&options.source_prefix, &item.key);
            transfer.transfer(
                &source,
                &options.destination_root,
                completion_handler(catalog.clone(), item.key, failure.clone()),
            )
        })
        .collect();

    let mut ticker = tokio::time::interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cancelled = false;

    loop {
        advance(sink, progress.drain());
        if handles.iter().all(TransferHandle::is_ready) {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.cancelled(), if !cancelled => {
                cancelled = true;
                info!("Stop requested; cancelling outstanding transfers");
                transfer.cancel().await;
            }
        }
    }

    advance(sink, progress.drain());
    sink.finish();

    // An item whose row could not be marked complete is still pending.
    let outcomes: Vec<_> = join_all(handles.into_iter().map(TransferHandle::wait))
        .await
        .into_iter()
        .zip(&failures)
        .map(|(outcome, failure)| match failure.lock().take() {
            Some(cause) => Outcome::Failure(cause),
            None => outcome,
        })
        .collect();
    let summary = summarize(&outcomes);
    info!(
        "Run finished: {} succeeded, {} failed, {} cancelled, {} bytes",
        summary.succeeded, summary.failed, summary.cancelled, summary.bytes
    );

    Ok(outcomes)
}

fn advance<S: ProgressSink + ?Sized>(sink: &mut S, delta: u64) {
    if delta > 0 {
        sink.advance(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Item, SqliteCatalog};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn catalog_with_sizes(sizes: &[u64]) -> SqliteCatalog {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2018, 11, 5, 9, 0, 0).unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let item = Item::new(format!("epn-{}", size), *size, base + ChronoDuration::hours(i as i64));
            catalog.upsert_item(&item).unwrap();
        }
        catalog
    }

    #[test]
    fn test_get_items_limit_ascending() {
        let catalog = catalog_with_sizes(&[10, 20, 30]);
        let (items, total) = get_items(&catalog, SortOrder::Asc, Some(2)).unwrap();

        let keys: Vec<_> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["epn-10", "epn-20"]);
        assert_eq!(total, 30);
    }

    #[test]
    fn test_get_items_descending_without_limit() {
        let catalog = catalog_with_sizes(&[10, 20, 30]);
        let (items, total) = get_items(&catalog, SortOrder::Desc, None).unwrap();
        assert_eq!(items[0].key, "epn-30");
        assert_eq!(total, 60);
    }

    #[test]
    fn test_source_path() {
        assert_eq!(source_path("/data", "mx/12345"), "/data/mx/12345");
        assert_eq!(source_path("/data/", "12345"), "/data/12345");
        assert_eq!(source_path("", "12345"), "12345");
        assert_eq!(source_path("/data", "/abs/12345"), "/abs/12345");
    }

    #[test]
    fn test_summarize() {
        let ok = |bytes| {
            Outcome::Success(TransferResult {
                source: "a".to_string(),
                destination: PathBuf::from("/b"),
                bytes_transferred: bytes,
            })
        };
        let outcomes = vec![
            ok(5),
            ok(7),
            Outcome::Failure(TransferError::Cancelled),
            Outcome::Failure(TransferError::Failed { exit_code: 23 }),
        ];

        let summary = summarize(&outcomes);
        assert_eq!(
            summary,
            RunSummary {
                succeeded: 2,
                failed: 1,
                cancelled: 1,
                bytes: 12
            }
        );
        assert_eq!(summary.total(), 4);
        assert!(!summary.is_clean());
    }

    #[test]
    fn test_completion_handler_records_only_success() {
        let catalog = Arc::new(catalog_with_sizes(&[10, 20]));

        completion_handler(catalog.clone(), "epn-10".to_string(), CatalogFailure::default())(&Outcome::Success(TransferResult {
            source: "/data/epn-10".to_string(),
            destination: PathBuf::from("/dest"),
            bytes_transferred: 11,
        }));
        completion_handler(catalog.clone(), "epn-20".to_string(), CatalogFailure::default())(&Outcome::Failure(TransferError::Failed {
            exit_code: 23,
        }));

        let done = catalog.get_item("epn-10").unwrap().unwrap();
        assert!(done.complete);
        assert_eq!(done.bytes_transferred, 11);
        assert!(!catalog.get_item("epn-20").unwrap().unwrap().complete);
    }

    struct ReadOnlyCatalog;

    impl Catalog for ReadOnlyCatalog {
        fn list_incomplete(&self, _order: SortOrder, _limit: Option<usize>) -> AsynchyResult<Vec<PendingItem>> {
            Ok(Vec::new())
        }

        fn mark_complete(&self, _key: &str, _bytes_transferred: u64) -> AsynchyResult<()> {
            Err(TransferError::Catalog {
                reason: "attempt to write a readonly database".to_string(),
            }
            .into())
        }
    }

    #[test]
    fn test_completion_handler_reports_catalog_write_failure() {
        let failure = CatalogFailure::default();
        completion_handler(Arc::new(ReadOnlyCatalog), "epn-10".to_string(), failure.clone())(&Outcome::Success(
            TransferResult {
                source: "/data/epn-10".to_string(),
                destination: PathBuf::from("/dest"),
                bytes_transferred: 11,
            },
        ));
        assert!(matches!(*failure.lock(), Some(TransferError::Catalog { .. })));

        let untouched = CatalogFailure::default();
        completion_handler(Arc::new(ReadOnlyCatalog), "epn-20".to_string(), untouched.clone())(&Outcome::Failure(
            TransferError::Failed { exit_code: 23 },
        ));
        assert!(untouched.lock().is_none());
    }

    #[test]
    fn test_log_progress_accumulates() {
        let mut sink = LogProgress::new();
        sink.start(100);
        sink.advance(30);
        sink.advance(75);
        sink.finish();
        assert_eq!(sink.done(), 105);
    }
}
