//! Query evaluation and incremental search.
//!
//! This module provides:
//! - `engine` - lazy, ranked, cancellable evaluation over a store snapshot
//! - `controller` - debouncing search-as-you-type state machine

mod controller;
mod engine;

pub use controller::{SearchController, SearchEvent, SearchEvents, SearchSettings, SearchState};
pub use engine::{evaluate, Evaluation, MatchIter, MatchRank, SearchHit, SearchScope};
