//! Process-wide index context.
//!
//! Owns the settings, the store, the shared exclusion set, the volume table
//! and the crawl registry. Presentation layers talk to this type only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;

use crate::config::{ConfigPaths, IndexerConfig};
use crate::error::{IndexError, Result};
use crate::exclusion::{ExclusionRules, ExclusionSet};
use crate::indexer::{CrawlSummary, Crawler};
use crate::path::{is_same_or_descendant, rebase_path};
use crate::query::QueryCache;
use crate::search::{SearchController, SearchEvents, SearchSettings};
use crate::storage::PathStore;
use crate::types::{IndexStatus, PathRecord, RootStatus};
use crate::volume::{VolumeId, VolumeTable};

/// Result of [`IndexContext::trigger_crawl`].
#[derive(Debug)]
pub enum CrawlTrigger {
    Started(thread::JoinHandle<Result<CrawlSummary>>),
    AlreadyRunning,
}

/// The pieces a background crawl thread needs.
#[derive(Clone)]
struct CrawlDriver {
    store: Arc<PathStore>,
    volumes: Arc<VolumeTable>,
    crawler: Arc<Crawler>,
}

impl CrawlDriver {
    fn crawl(&self, root: &Path) -> Result<CrawlSummary> {
        self.relocate_if_remounted(root)?;
        self.crawler.crawl(root)
    }

    /// Moves stored records of the root's volume onto its current mount
    /// point when the volume was remounted somewhere else.
    fn relocate_if_remounted(&self, root: &Path) -> Result<()> {
        self.volumes.refresh();
        let Some(mount) = self.volumes.mount_for(root) else {
            return Ok(());
        };
        let snapshot = self.store.snapshot();
        let Some(known) = snapshot.volume(&mount.volume_id) else {
            return Ok(());
        };
        if known.last_mount_point == mount.mount_point {
            return Ok(());
        }
        drop(snapshot);
        self.store
            .relocate_volume(&mount.volume_id, &mount.mount_point)
            .map(|_| ())
    }
}

/// Entry point of the indexer.
pub struct IndexContext {
    paths: ConfigPaths,
    config: RwLock<IndexerConfig>,
    exclusions: Arc<ExclusionSet>,
    queries: Arc<QueryCache>,
    driver: CrawlDriver,
}

impl IndexContext {
    /// Loads settings and the persisted store, reading the system mount table.
    pub fn open(paths: ConfigPaths) -> Result<Self> {
        Self::open_with_volumes(paths, VolumeTable::load())
    }

    /// Like [`open`](Self::open) with an explicit volume table.
    pub fn open_with_volumes(paths: ConfigPaths, volumes: VolumeTable) -> Result<Self> {
        let config = IndexerConfig::load_or_create(&paths.settings_file())?;
        let store = Arc::new(PathStore::open(
            &paths.store_dir(),
            config.journal_compact_threshold,
        )?);
        let exclusions = Arc::new(ExclusionSet::new(ExclusionRules::from_prefixes(
            &config.exclusions,
        )));
        let volumes = Arc::new(volumes);
        let crawler = Arc::new(Crawler::new(
            store.clone(),
            exclusions.clone(),
            volumes.clone(),
        ));

        log::info!(
            "index_opened config={} records={} roots={} exclusions={}",
            paths.settings_file().display(),
            store.len(),
            config.roots.len(),
            config.exclusions.len()
        );

        Ok(Self {
            paths,
            config: RwLock::new(config),
            exclusions,
            queries: Arc::new(QueryCache::default()),
            driver: CrawlDriver {
                store,
                volumes,
                crawler,
            },
        })
    }

    pub fn config(&self) -> IndexerConfig {
        self.config.read().clone()
    }

    pub fn store(&self) -> &Arc<PathStore> {
        &self.driver.store
    }

    pub fn exclusion_set(&self) -> &Arc<ExclusionSet> {
        &self.exclusions
    }

    pub fn volumes(&self) -> &Arc<VolumeTable> {
        &self.driver.volumes
    }

    pub fn crawler(&self) -> &Arc<Crawler> {
        &self.driver.crawler
    }

    /// Starts crawling `root` on a background thread.
    pub fn trigger_crawl(&self, root: &Path) -> Result<CrawlTrigger> {
        if self.driver.crawler.is_crawling(root) {
            return Ok(CrawlTrigger::AlreadyRunning);
        }
        let driver = self.driver.clone();
        let root = root.to_path_buf();
        let handle = thread::Builder::new()
            .name("pathindex-crawl".to_string())
            .spawn(move || driver.crawl(&root))
            .map_err(|error| IndexError::Internal(format!("failed to spawn crawl thread: {error}")))?;
        Ok(CrawlTrigger::Started(handle))
    }

    /// Crawls `root` on the calling thread.
    pub fn crawl_now(&self, root: &Path) -> Result<CrawlSummary> {
        self.driver.crawl(root)
    }

    /// Adds `root` to the configured roots. Returns false if already present.
    pub fn add_root(&self, root: &Path) -> Result<bool> {
        let key = Crawler::root_key(root);
        let mut config = self.config.write();
        if config.roots.contains(&key) {
            return Ok(false);
        }
        config.roots.push(key);
        config.save(&self.paths.settings_file())?;
        Ok(true)
    }

    /// Drops `root` from the configured roots and purges its records, unless
    /// another configured root still covers them.
    pub fn remove_root(&self, root: &Path) -> Result<bool> {
        let key = Crawler::root_key(root);
        let mut config = self.config.write();
        let before = config.roots.len();
        config.roots.retain(|existing| existing != &key);
        if config.roots.len() == before {
            return Ok(false);
        }
        config.save(&self.paths.settings_file())?;
        let covered = config
            .roots
            .iter()
            .any(|other| is_same_or_descendant(&key, other));
        drop(config);

        if !covered {
            self.driver.crawler.cancel(root);
            let purged = self.driver.store.remove_under(&key)?;
            log::info!("root_removed root={} purged={}", key, purged);
        }
        Ok(true)
    }

    /// Crawls every configured root in turn.
    pub fn rescan_all(&self) -> Result<Vec<CrawlSummary>> {
        let roots = self.config.read().roots.clone();
        roots
            .iter()
            .map(|root| self.driver.crawl(Path::new(root)))
            .collect()
    }

    /// Crawls every configured root that lives on `volume`.
    pub fn rescan_volume(&self, volume: &VolumeId) -> Result<Vec<CrawlSummary>> {
        self.driver.volumes.refresh();
        let roots = self.config.read().roots.clone();
        roots
            .iter()
            .map(Path::new)
            .filter(|root| &self.driver.volumes.volume_for(root) == volume)
            .map(|root| self.driver.crawl(root))
            .collect()
    }

    /// Purges every record of `volume`. Returns the number removed.
    pub fn forget_volume(&self, volume: &VolumeId) -> Result<usize> {
        let removed = self.driver.store.remove_volume(volume)?;
        log::info!("volume_forgotten volume={} removed={}", volume, removed);
        Ok(removed)
    }

    /// Adds an exclusion prefix and persists it. Returns false if present.
    pub fn add_exclusion(&self, prefix: &str) -> Result<bool> {
        if !self.exclusions.add(prefix)? {
            return Ok(false);
        }
        self.persist_exclusions()?;
        Ok(true)
    }

    /// Removes an exclusion prefix and persists the change.
    pub fn remove_exclusion(&self, prefix: &str) -> Result<bool> {
        if !self.exclusions.remove(prefix) {
            return Ok(false);
        }
        self.persist_exclusions()?;
        Ok(true)
    }

    pub fn exclusions(&self) -> Vec<String> {
        self.exclusions.prefixes()
    }

    fn persist_exclusions(&self) -> Result<()> {
        let mut config = self.config.write();
        config.exclusions = self.exclusions.prefixes();
        config.save(&self.paths.settings_file())
    }

    /// Drops every record, in memory and on disk. Roots and exclusions stay.
    pub fn clear_all(&self) -> Result<()> {
        self.driver.store.clear()?;
        self.queries.clear();
        log::info!("index_cleared store_dir={}", self.paths.store_dir().display());
        Ok(())
    }

    pub fn status(&self) -> IndexStatus {
        let store = &self.driver.store;
        let crawler = &self.driver.crawler;
        let roots = self
            .config
            .read()
            .roots
            .iter()
            .map(|root| {
                let path = Path::new(root);
                let last = crawler.last_summary(path);
                RootStatus {
                    root: root.clone(),
                    last_outcome: last.as_ref().map(|summary| summary.outcome.as_str().to_string()),
                    last_written: last.as_ref().map_or(0, |summary| summary.written),
                    last_removed: last.as_ref().map_or(0, |summary| summary.removed),
                    last_skipped: last.as_ref().map_or(0, |summary| summary.skipped),
                    crawling: crawler.is_crawling(path),
                }
            })
            .collect();

        IndexStatus {
            indexed_entries: store.len(),
            generation: store.generation(),
            roots,
            excluded_paths: self.exclusions.prefixes(),
            journal_ops: store.journal_ops(),
            store_dir: store.dir().map(|dir| dir.display().to_string()),
        }
    }

    /// Starts a search controller over this index. Needs a Tokio runtime.
    pub fn search_controller(&self) -> Result<(SearchController, SearchEvents)> {
        let settings = SearchSettings::from_config(&self.config.read());
        SearchController::spawn(
            self.driver.store.clone(),
            self.exclusions.clone(),
            self.queries.clone(),
            settings,
        )
    }

    /// True if the record's volume is mounted right now.
    pub fn volume_mounted(&self, record: &PathRecord) -> bool {
        self.driver.volumes.is_mounted(&record.volume_id)
    }

    /// Where the record lives now, following a remount of its volume.
    pub fn current_path(&self, record: &PathRecord) -> PathBuf {
        let stored = PathBuf::from(&record.full_path);
        let snapshot = self.driver.store.snapshot();
        let Some(known) = snapshot.volume(&record.volume_id) else {
            return stored;
        };
        match self.driver.volumes.mount_point(&record.volume_id) {
            Some(now) if now != known.last_mount_point => {
                rebase_path(&record.full_path, &known.last_mount_point, &now)
                    .map(PathBuf::from)
                    .unwrap_or(stored)
            }
            _ => stored,
        }
    }
}
