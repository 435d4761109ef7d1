//! Search-as-you-type controller.
//!
//! Every keystroke calls [`SearchController::submit_search`], which bumps the
//! search generation and cancels whatever was running. A background task
//! waits out the debounce window, so a burst of keystrokes starts a single
//! evaluation for the last string. Evaluation runs on the blocking pool and
//! streams results back as [`SearchEvent`]s.
//!
//! When the new string refines the previous one and nothing changed in
//! between, the previous complete result set seeds the evaluation instead
//! of the whole store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cancel::{CancellationToken, SearchVersionTracker};
use crate::config::IndexerConfig;
use crate::error::{IndexError, Result};
use crate::exclusion::ExclusionSet;
use crate::query::{is_refinement, CompiledQuery, QueryCache};
use crate::storage::PathStore;

use super::engine::{evaluate, SearchHit, SearchScope};

/// Where the controller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    /// A string was submitted and the debounce window is open.
    Pending,
    Evaluating,
}

/// Tunables for one controller.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub debounce: Duration,
    pub max_results: usize,
    pub batch_size: usize,
    pub case_sensitive: bool,
}

impl SearchSettings {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            debounce: config.debounce(),
            max_results: config.max_results(),
            batch_size: config.batch_size(),
            case_sensitive: config.case_sensitive,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self::from_config(&IndexerConfig::default())
    }
}

/// Output of a search generation.
#[derive(Debug)]
pub enum SearchEvent {
    /// Next slice of ranked hits.
    Batch { generation: u64, hits: Vec<SearchHit> },
    /// The generation delivered everything it will deliver.
    Finished {
        generation: u64,
        total: usize,
        /// More matches existed past the result limit.
        truncated: bool,
        /// Evaluated from the previous result set.
        refined: bool,
    },
    /// The query could not be compiled.
    Failed { generation: u64, error: IndexError },
}

impl SearchEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Batch { generation, .. }
            | Self::Finished { generation, .. }
            | Self::Failed { generation, .. } => *generation,
        }
    }
}

/// Receiving side of a controller. Drops events from superseded generations.
pub struct SearchEvents {
    rx: mpsc::UnboundedReceiver<SearchEvent>,
    tracker: SearchVersionTracker,
}

impl SearchEvents {
    /// Next event of the current generation, or `None` once the controller
    /// has shut down.
    pub async fn recv(&mut self) -> Option<SearchEvent> {
        loop {
            let event = self.rx.recv().await?;
            if self.tracker.is_current(event.generation()) {
                return Some(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SearchEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if self.tracker.is_current(event.generation()) {
                return Some(event);
            }
        }
        None
    }
}

struct SearchRequest {
    generation: u64,
    raw: String,
}

/// A complete, untruncated result set and what it was computed against.
struct PreviousResults {
    query: Arc<CompiledQuery>,
    hits: Arc<[SearchHit]>,
    store_generation: u64,
    exclusion_generation: u64,
}

struct Shared {
    store: Arc<PathStore>,
    exclusions: Arc<ExclusionSet>,
    cache: Arc<QueryCache>,
    settings: SearchSettings,
    tracker: SearchVersionTracker,
    /// Serializes generation bumps against event delivery, so nothing from
    /// an older generation is sent once `submit_search` returns.
    session: Mutex<SearchState>,
    previous: Mutex<Option<PreviousResults>>,
    events: mpsc::UnboundedSender<SearchEvent>,
    evaluations: AtomicU64,
}

/// Handle used by the UI to drive searches.
pub struct SearchController {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<SearchRequest>,
}

impl SearchController {
    /// Starts the controller on the current Tokio runtime.
    pub fn spawn(
        store: Arc<PathStore>,
        exclusions: Arc<ExclusionSet>,
        cache: Arc<QueryCache>,
        settings: SearchSettings,
    ) -> Result<(Self, SearchEvents)> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|error| {
            IndexError::Internal(format!("search controller needs a tokio runtime: {error}"))
        })?;
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let tracker = SearchVersionTracker::new();

        let shared = Arc::new(Shared {
            store,
            exclusions,
            cache,
            settings,
            tracker: tracker.clone(),
            session: Mutex::new(SearchState::Idle),
            previous: Mutex::new(None),
            events,
            evaluations: AtomicU64::new(0),
        });
        runtime.spawn(request_loop(shared.clone(), request_rx));

        Ok((
            Self { shared, requests },
            SearchEvents {
                rx: events_rx,
                tracker,
            },
        ))
    }

    /// Starts a new search generation for `raw` and returns its number.
    ///
    /// The previous generation is cancelled before this returns.
    pub fn submit_search(&self, raw: impl Into<String>) -> u64 {
        let generation = {
            let mut state = self.shared.session.lock();
            *state = SearchState::Pending;
            self.shared.tracker.next_version()
        };
        let request = SearchRequest {
            generation,
            raw: raw.into(),
        };
        if self.requests.send(request).is_err() {
            log::warn!("search request dropped generation={} reason=loop_stopped", generation);
        }
        generation
    }

    /// Cancels the running or pending search. No further events are
    /// delivered for it.
    pub fn cancel_current_search(&self) {
        let mut state = self.shared.session.lock();
        let cancelled = self.shared.tracker.current_version();
        self.shared.tracker.next_version();
        *state = SearchState::Idle;
        log::debug!("search cancelled generation={}", cancelled);
    }

    pub fn state(&self) -> SearchState {
        *self.shared.session.lock()
    }

    pub fn current_generation(&self) -> u64 {
        self.shared.tracker.current_version()
    }

    /// Number of evaluations actually started since spawn.
    pub fn evaluations_started(&self) -> u64 {
        self.shared.evaluations.load(Ordering::Relaxed)
    }

    /// Forgets the seed kept for refinement.
    pub fn reset_refinement(&self) {
        self.shared.previous.lock().take();
    }
}

async fn request_loop(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<SearchRequest>) {
    let mut pending: Option<SearchRequest> = None;
    loop {
        let Some(request) = pending.take() else {
            match requests.recv().await {
                Some(request) => {
                    pending = Some(request);
                    continue;
                }
                None => break,
            }
        };

        // A newer request restarts the window.
        tokio::select! {
            newer = requests.recv() => match newer {
                Some(newer) => pending = Some(newer),
                None => break,
            },
            _ = tokio::time::sleep(shared.settings.debounce) => {
                if shared.tracker.is_current(request.generation) {
                    let shared = shared.clone();
                    tokio::task::spawn_blocking(move || shared.run(request));
                }
            }
        }
    }
    log::debug!("search request loop stopped");
}

impl Shared {
    fn run(&self, request: SearchRequest) {
        let generation = request.generation;
        let token = self.tracker.token_for_version(generation);
        if !self.transition(&token, SearchState::Evaluating) {
            return;
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let query = match self
            .cache
            .get_or_compile(&request.raw, self.settings.case_sensitive)
        {
            Ok(query) => query,
            Err(error) => {
                log::info!("search failed generation={} error={}", generation, error);
                self.complete(&token, SearchEvent::Failed { generation, error }, None);
                return;
            }
        };

        // Generations are read before the data they describe, so a racing
        // mutation can only make the recorded generation stale.
        let exclusion_generation = self.exclusions.generation();
        let rules = self.exclusions.snapshot();
        let snapshot = self.store.snapshot();
        let store_generation = snapshot.generation();

        let seed = self.seed_for(&query, store_generation, exclusion_generation);
        let refined = seed.is_some();
        let scope = seed.map(SearchScope::Seeded).unwrap_or_default();
        let evaluation = evaluate(snapshot, query.clone(), rules, scope, token.clone());

        let limit = self.settings.max_results;
        let batch_size = self.settings.batch_size.max(1);
        let mut collected: Vec<SearchHit> = Vec::new();
        let mut batch = Vec::with_capacity(batch_size.min(limit));
        let mut truncated = false;
        let mut matches = evaluation.iter();
        for hit in matches.by_ref() {
            if collected.len() == limit {
                truncated = true;
                break;
            }
            collected.push(hit.clone());
            batch.push(hit);
            if batch.len() == batch_size {
                let hits = std::mem::take(&mut batch);
                if !self.deliver(&token, SearchEvent::Batch { generation, hits }) {
                    return;
                }
            }
        }
        if matches.was_cancelled() {
            log::debug!("search superseded generation={}", generation);
            return;
        }
        if !batch.is_empty() && !self.deliver(&token, SearchEvent::Batch { generation, hits: batch }) {
            return;
        }

        let total = collected.len();
        let previous = (!truncated).then(|| PreviousResults {
            query,
            hits: collected.into(),
            store_generation,
            exclusion_generation,
        });
        let finished = SearchEvent::Finished {
            generation,
            total,
            truncated,
            refined,
        };
        if self.complete(&token, finished, previous) {
            log::info!(
                "search finished generation={} total={} truncated={} refined={} elapsed_ms={}",
                generation,
                total,
                truncated,
                refined,
                started.elapsed().as_millis()
            );
        }
    }

    fn seed_for(
        &self,
        query: &CompiledQuery,
        store_generation: u64,
        exclusion_generation: u64,
    ) -> Option<Arc<[SearchHit]>> {
        let previous = self.previous.lock();
        let previous = previous.as_ref()?;
        let unchanged = previous.store_generation == store_generation
            && previous.exclusion_generation == exclusion_generation;
        (unchanged && is_refinement(&previous.query, query)).then(|| previous.hits.clone())
    }

    fn transition(&self, token: &CancellationToken, state: SearchState) -> bool {
        let mut current = self.session.lock();
        if token.is_cancelled().is_none() {
            return false;
        }
        *current = state;
        true
    }

    fn deliver(&self, token: &CancellationToken, event: SearchEvent) -> bool {
        let _session = self.session.lock();
        if token.is_cancelled().is_none() {
            return false;
        }
        self.events.send(event).is_ok()
    }

    /// Sends the final event of a generation and records its results for
    /// refinement.
    fn complete(
        &self,
        token: &CancellationToken,
        event: SearchEvent,
        previous: Option<PreviousResults>,
    ) -> bool {
        let mut state = self.session.lock();
        if token.is_cancelled().is_none() {
            return false;
        }
        *self.previous.lock() = previous;
        *state = SearchState::Idle;
        self.events.send(event).is_ok()
    }
}
