//! Local file-path indexing and incremental search.
//!
//! This crate provides the indexing and search core of a desktop
//! "find by name" tool:
//! - A copy-on-write path record store with a snapshot + journal on disk
//! - A parallel filesystem crawler that prunes excluded subtrees
//! - A prefix-tree exclusion set shared by crawler and evaluator
//! - A compact query language (wildcards, `-term` exclusion, `a|b` groups)
//! - A lazy, ranked, cancellable evaluator
//! - A debouncing search controller for search-as-you-type

pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod exclusion;
pub mod indexer;
mod path;
pub mod query;
pub mod search;
pub mod storage;
pub mod types;
pub mod volume;

// Re-export main types
pub use cancel::{CancellationToken, SearchVersionTracker};
pub use config::{ConfigPaths, IndexerConfig};
pub use context::{CrawlTrigger, IndexContext};
pub use error::{IndexError, QuerySyntaxError, Result};
pub use exclusion::{ExclusionRules, ExclusionSet};
pub use indexer::{CrawlOutcome, CrawlProgress, CrawlSummary, Crawler};
pub use query::{CompiledQuery, QueryCache, QueryNode};
pub use search::{
    evaluate, Evaluation, MatchIter, MatchRank, SearchController, SearchEvent, SearchEvents,
    SearchHit, SearchScope, SearchSettings, SearchState,
};
pub use storage::{PathStore, StoreSnapshot};
pub use types::{IndexStatus, PathRecord, RootStatus};
pub use volume::{VolumeId, VolumeInfo, VolumeTable};
