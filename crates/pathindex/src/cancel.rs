//! Generation-stamped cancellation for search evaluation.
//!
//! Every submitted search gets a generation number from a shared counter.
//! A [`CancellationToken`] remembers the generation it was minted for and
//! goes stale as soon as the counter moves on, so starting a search
//! implicitly cancels all older ones. Evaluators poll between records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Records examined between two reads of the shared counter.
/// Power of two so the check is a mask.
pub const CANCEL_CHECK_INTERVAL: usize = 0x400;

/// Shared search generation counter.
///
/// Clones share the counter, so the controller and the event receiver
/// agree on which generation is live.
#[derive(Debug, Default, Clone)]
pub struct SearchVersionTracker {
    live: Arc<AtomicU64>,
}

impl SearchVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation, staling every outstanding token.
    pub fn next_version(&self) -> u64 {
        self.live.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current_version() == generation
    }

    /// Token that stays live while `generation` is current.
    pub fn token_for_version(&self, generation: u64) -> CancellationToken {
        CancellationToken {
            live: self.live.clone(),
            generation,
        }
    }
}

/// Cooperative cancellation handle for one search generation.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    live: Arc<AtomicU64>,
    generation: u64,
}

impl CancellationToken {
    /// A token nothing can cancel.
    pub fn noop() -> Self {
        Self {
            live: Arc::new(AtomicU64::new(0)),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `Some(())` while live, `None` once superseded, for use with `?`.
    #[inline]
    pub fn is_cancelled(&self) -> Option<()> {
        (self.live.load(Ordering::Relaxed) == self.generation).then_some(())
    }

    /// Like [`is_cancelled`](Self::is_cancelled), but reads the counter only
    /// when `examined` is a multiple of [`CANCEL_CHECK_INTERVAL`].
    #[inline]
    pub fn is_cancelled_sparse(&self, examined: usize) -> Option<()> {
        if examined & (CANCEL_CHECK_INTERVAL - 1) != 0 {
            return Some(());
        }
        self.is_cancelled()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::noop()
    }
}
