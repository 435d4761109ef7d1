//! Crawl progress tracking and summaries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::volume::VolumeId;

/// How a crawl request ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CrawlOutcome {
    /// Walked and committed.
    Completed,
    /// Root not reachable (unmounted volume). Existing records untouched.
    Unreachable,
    /// Another crawl of the same root was running. Nothing done.
    AlreadyRunning,
    /// Cancelled before commit. Nothing written.
    Cancelled,
}

impl CrawlOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Unreachable => "unreachable",
            Self::AlreadyRunning => "already_running",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Counters a running crawl updates and observers read.
#[derive(Debug, Default)]
pub struct CrawlProgress {
    files: AtomicUsize,
    dirs: AtomicUsize,
    skipped: AtomicUsize,
    /// Unix seconds; zero while unset.
    started_at: AtomicU64,
    finished_at: AtomicU64,
}

impl CrawlProgress {
    pub fn begin(&self) {
        for counter in [&self.files, &self.dirs, &self.skipped] {
            counter.store(0, Ordering::Relaxed);
        }
        self.started_at.store(unix_now_secs(), Ordering::Relaxed);
        self.finished_at.store(0, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.finished_at.store(unix_now_secs(), Ordering::Relaxed);
    }

    pub fn count_entry(&self, is_directory: bool) {
        let counter = if is_directory { &self.dirs } else { &self.files };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let stamp = |value: &AtomicU64| Some(value.load(Ordering::Relaxed)).filter(|secs| *secs != 0);
        ProgressSnapshot {
            files: self.files.load(Ordering::Relaxed),
            dirs: self.dirs.load(Ordering::Relaxed),
            skipped: self.skipped(),
            started_at: stamp(&self.started_at),
            finished_at: stamp(&self.finished_at),
        }
    }
}

/// Point-in-time copy of [`CrawlProgress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub files: usize,
    pub dirs: usize,
    /// Entries skipped after a permission or IO error.
    pub skipped: usize,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

/// Result of one crawl request.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub root: String,
    pub volume_id: Option<VolumeId>,
    pub outcome: CrawlOutcome,
    /// Records confirmed by the crawl.
    pub written: usize,
    /// New or changed records among `written`.
    pub changed: usize,
    /// Stale records pruned under the root.
    pub removed: usize,
    /// Entries skipped after an error.
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// First few entry errors, for display.
    pub errors: Vec<String>,
}

impl CrawlSummary {
    /// Summary of a crawl that did no work.
    pub fn idle(root: String, outcome: CrawlOutcome) -> Self {
        Self {
            root,
            volume_id: None,
            outcome,
            written: 0,
            changed: 0,
            removed: 0,
            skipped: 0,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            errors: Vec::new(),
        }
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs())
}

/// Modification time of `metadata` as Unix seconds.
pub fn modified_secs(metadata: &std::fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
        .and_then(|value| i64::try_from(value.as_secs()).ok())
}
