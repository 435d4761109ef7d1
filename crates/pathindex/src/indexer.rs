//! Filesystem crawling.
//!
//! - `build` - crawl progress counters and summaries
//! - `walk` - parallel directory walk producing path records
//! - `crawler` - per-root crawl orchestration and store commit

mod build;
mod crawler;
mod walk;

pub use build::{CrawlOutcome, CrawlProgress, CrawlSummary, ProgressSnapshot};
pub use crawler::Crawler;
