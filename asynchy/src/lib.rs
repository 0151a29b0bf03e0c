pub mod catalog;
pub mod config;
pub mod counter;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod outcome;
pub mod pool;
pub mod rsync;
pub mod scheduler;
pub mod transfer;

// Re-export commonly used types
pub use catalog::{Catalog, Item, PendingItem, SortOrder, SqliteCatalog};
pub use config::{expand_home, Config, RemoteTarget, TransferConfig};
pub use counter::AtomicCounter;
pub use error::{AsynchyError, AsynchyResult, ErrorSeverity, TransferError};
pub use metrics::Metrics;
pub use mock::{MockSettings, MockTransfer};
pub use outcome::Outcome;
pub use pool::{JobContext, JobPool, Progress, ProgressSender, TransferHandle};
pub use rsync::{RsyncTransfer, TransferRegistry};
pub use scheduler::{LogProgress, ProgressSink, RunOptions, RunSummary};
pub use transfer::{Transfer, TransferResult};
