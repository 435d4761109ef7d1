//! Path record storage.
//!
//! This module provides the record store used by crawler and evaluator:
//! - `snapshot` - immutable, indexed view of all records (copy-on-write)
//! - `journal` - append-only log of mutations (incremental persistence)
//! - `persistence` - compressed full snapshot file
//! - `store` - the `PathStore` API tying the three together

mod journal;
mod persistence;
mod snapshot;
mod store;

pub use journal::JournalOp;
pub use persistence::STORE_FORMAT_VERSION;
pub use snapshot::{ScanIter, StoreSnapshot, StoredRecord};
pub use store::{CommitStats, PathStore, JOURNAL_FILE_NAME, SNAPSHOT_FILE_NAME};

pub(crate) use snapshot::StoredScan;
