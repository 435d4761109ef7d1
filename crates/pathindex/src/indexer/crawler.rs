//! Per-root crawl orchestration.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::Mutex;

use super::build::{CrawlOutcome, CrawlProgress, CrawlSummary, ProgressSnapshot};
use super::walk::{walk_root, WalkData};
use crate::error::{canonicalize_existing_path, IndexError, Result};
use crate::exclusion::ExclusionSet;
use crate::path::path_to_key;
use crate::storage::PathStore;
use crate::volume::{VolumeInfo, VolumeTable};

#[derive(Debug, Default)]
struct ActiveCrawl {
    progress: CrawlProgress,
    cancel: AtomicBool,
}

/// Crawls roots into the store. At most one crawl per root runs at a time.
pub struct Crawler {
    store: Arc<PathStore>,
    exclusions: Arc<ExclusionSet>,
    volumes: Arc<VolumeTable>,
    active: Mutex<FnvHashMap<String, Arc<ActiveCrawl>>>,
    last: Mutex<FnvHashMap<String, CrawlSummary>>,
}

/// Unregisters a running crawl when dropped.
struct ActiveGuard<'a> {
    crawler: &'a Crawler,
    root: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.crawler.active.lock().remove(&self.root);
    }
}

impl Crawler {
    pub fn new(
        store: Arc<PathStore>,
        exclusions: Arc<ExclusionSet>,
        volumes: Arc<VolumeTable>,
    ) -> Self {
        Self {
            store,
            exclusions,
            volumes,
            active: Mutex::new(FnvHashMap::default()),
            last: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Normalized key under which `root` is crawled and tracked.
    pub fn root_key(root: &Path) -> String {
        path_to_key(&canonicalize_existing_path(root.to_path_buf()))
    }

    /// Crawls `root` and commits the result.
    ///
    /// Entry errors and an unreachable root are reported in the summary.
    /// Only a store failure is returned as an error.
    pub fn crawl(&self, root: &Path) -> Result<CrawlSummary> {
        let key = Self::root_key(root);
        let Some((guard, active)) = self.register(&key) else {
            log::info!("crawl_skipped root={} reason=already_running", key);
            return Ok(CrawlSummary::idle(key, CrawlOutcome::AlreadyRunning));
        };

        let summary = self.crawl_registered(&key, root, &active);
        drop(guard);
        let summary = summary?;
        self.last.lock().insert(key, summary.clone());
        Ok(summary)
    }

    /// Requests cancellation of a running crawl. Returns false if none runs.
    pub fn cancel(&self, root: &Path) -> bool {
        let key = Self::root_key(root);
        match self.active.lock().get(&key) {
            Some(active) => {
                active.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_crawling(&self, root: &Path) -> bool {
        self.active.lock().contains_key(&Self::root_key(root))
    }

    /// Progress of a running crawl of `root`.
    pub fn progress(&self, root: &Path) -> Option<ProgressSnapshot> {
        self.active
            .lock()
            .get(&Self::root_key(root))
            .map(|active| active.progress.snapshot())
    }

    /// Summary of the last finished crawl of `root`.
    pub fn last_summary(&self, root: &Path) -> Option<CrawlSummary> {
        self.last.lock().get(&Self::root_key(root)).cloned()
    }

    fn register(&self, key: &str) -> Option<(ActiveGuard<'_>, Arc<ActiveCrawl>)> {
        let mut active = self.active.lock();
        if active.contains_key(key) {
            return None;
        }
        let crawl = Arc::new(ActiveCrawl::default());
        active.insert(key.to_string(), crawl.clone());
        Some((
            ActiveGuard {
                crawler: self,
                root: key.to_string(),
            },
            crawl,
        ))
    }

    fn crawl_registered(&self, key: &str, root: &Path, active: &ActiveCrawl) -> Result<CrawlSummary> {
        let started_at = Utc::now();
        let clock = Instant::now();
        active.progress.begin();

        let metadata = match fs::metadata(root) {
            Ok(metadata) => metadata,
            Err(source) => {
                let error = IndexError::VolumeUnreachable(root.to_path_buf());
                log::warn!("crawl_root_unreachable root={} error={}", key, source);
                let mut summary = CrawlSummary::idle(key.to_string(), CrawlOutcome::Unreachable);
                summary.started_at = started_at;
                summary.elapsed = clock.elapsed();
                summary.errors.push(format!("{error}: {source}"));
                active.progress.finish();
                return Ok(summary);
            }
        };

        self.volumes.refresh();
        let volume_id = self.volumes.volume_for(root);
        self.store.remember_volume(VolumeInfo::new(
            volume_id.clone(),
            &self.volumes.mount_point_for(root),
        ))?;

        let stamp = self.store.next_crawl_stamp();
        let rules = self.exclusions.snapshot();
        log::info!("crawl_started root={} volume={} stamp={}", key, volume_id, stamp);

        let data = WalkData::new(&active.progress, &rules, &self.volumes, stamp)
            .with_cancel(&active.cancel);
        let Some(output) = walk_root(root, &metadata, data) else {
            log::info!("crawl_cancelled root={}", key);
            let mut summary = CrawlSummary::idle(key.to_string(), CrawlOutcome::Cancelled);
            summary.volume_id = Some(volume_id);
            summary.started_at = started_at;
            summary.elapsed = clock.elapsed();
            active.progress.finish();
            return Ok(summary);
        };

        let mut walked = vec![volume_id.clone()];
        for nested in &output.nested_volumes {
            self.store
                .remember_volume(VolumeInfo::new(nested.volume_id.clone(), &nested.mount_point))?;
            if !walked.contains(&nested.volume_id) {
                walked.push(nested.volume_id.clone());
            }
        }

        let skipped = active.progress.skipped();
        let errors = output
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let stats = self.store.commit_crawl(
            key,
            stamp,
            output.records,
            output.unreadable_dirs,
            walked,
        )?;
        active.progress.finish();

        let summary = CrawlSummary {
            root: key.to_string(),
            volume_id: Some(volume_id),
            outcome: CrawlOutcome::Completed,
            written: stats.written,
            changed: stats.changed,
            removed: stats.removed,
            skipped,
            started_at,
            elapsed: clock.elapsed(),
            errors,
        };
        log::info!(
            "crawl_finished root={} written={} changed={} removed={} skipped={} elapsed_ms={}",
            key,
            summary.written,
            summary.changed,
            summary.removed,
            summary.skipped,
            summary.elapsed.as_millis()
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("active", &self.active.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusion::ExclusionRules;
    use crate::types::PathRecord;
    use crate::volume::{MountEntry, VolumeId};
    use std::fs::File;
    use tempfile::TempDir;

    fn crawler_with(exclusions: ExclusionRules) -> (Crawler, Arc<PathStore>) {
        let store = Arc::new(PathStore::in_memory());
        let crawler = Crawler::new(
            store.clone(),
            Arc::new(ExclusionSet::new(exclusions)),
            Arc::new(VolumeTable::from_mounts(Vec::new())),
        );
        (crawler, store)
    }

    fn fixture() -> TempDir {
        let temp = TempDir::new().expect("tempdir");
        fs::create_dir_all(temp.path().join("docs/drafts")).expect("mkdir");
        fs::create_dir_all(temp.path().join("build/cache")).expect("mkdir");
        File::create(temp.path().join("docs/report.csv")).expect("create");
        File::create(temp.path().join("docs/drafts/report_draft.csv")).expect("create");
        File::create(temp.path().join("build/cache/blob.o")).expect("create");
        File::create(temp.path().join("notes.txt")).expect("create");
        temp
    }

    fn content(store: &PathStore) -> Vec<(String, bool, u64)> {
        let mut records = store
            .scan()
            .map(|r| (r.full_path.clone(), r.is_directory, r.size_bytes))
            .collect::<Vec<_>>();
        records.sort();
        records
    }

    fn fs_entries(root: &Path) -> Vec<String> {
        fn visit(dir: &Path, out: &mut Vec<String>) {
            for entry in fs::read_dir(dir).expect("read_dir") {
                let path = entry.expect("entry").path();
                out.push(path_to_key(&path));
                if path.is_dir() {
                    visit(&path, out);
                }
            }
        }
        let mut out = vec![path_to_key(root)];
        visit(root, &mut out);
        out.sort();
        out
    }

    #[test]
    fn crawl_records_every_entry_exactly_once() {
        let temp = fixture();
        let (crawler, store) = crawler_with(ExclusionRules::new());
        let summary = crawler.crawl(temp.path()).expect("crawl");

        assert_eq!(summary.outcome, CrawlOutcome::Completed);
        let stored = content(&store).into_iter().map(|(p, _, _)| p).collect::<Vec<_>>();
        assert_eq!(stored, fs_entries(&canonicalize_existing_path(temp.path().to_path_buf())));
        assert_eq!(summary.written, store.len());
    }

    #[test]
    fn excluded_subtrees_have_no_records() {
        let temp = fixture();
        let root = Crawler::root_key(temp.path());
        let excluded = format!("{root}/build");
        let (crawler, store) = crawler_with(ExclusionRules::from_prefixes([excluded.as_str()]));
        crawler.crawl(temp.path()).expect("crawl");

        let paths = content(&store).into_iter().map(|(p, _, _)| p).collect::<Vec<_>>();
        assert!(paths.iter().all(|p| !p.starts_with(&excluded)));
        assert!(paths.contains(&format!("{root}/docs/report.csv")));
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn recrawl_is_idempotent_and_detects_deletions() {
        let temp = fixture();
        let (crawler, store) = crawler_with(ExclusionRules::new());
        crawler.crawl(temp.path()).expect("first crawl");
        let first = content(&store);

        let second = crawler.crawl(temp.path()).expect("second crawl");
        assert_eq!(content(&store), first);
        assert_eq!(second.changed, 0);
        assert_eq!(second.removed, 0);

        fs::remove_file(temp.path().join("notes.txt")).expect("remove");
        let third = crawler.crawl(temp.path()).expect("third crawl");
        assert_eq!(third.removed, 1);
        let root = Crawler::root_key(temp.path());
        assert!(store.get(&format!("{root}/notes.txt")).is_none());
        assert_eq!(store.len(), first.len() - 1);
    }

    #[test]
    fn unreachable_root_keeps_existing_records() {
        let parent = TempDir::new().expect("tempdir");
        let mount = parent.path().join("usb");
        fs::create_dir(&mount).expect("mkdir");
        File::create(mount.join("photo.jpg")).expect("create");

        let (crawler, store) = crawler_with(ExclusionRules::new());
        crawler.crawl(&mount).expect("crawl");
        let before = content(&store);
        assert_eq!(before.len(), 2);

        let key = Crawler::root_key(&mount);
        fs::rename(&mount, parent.path().join("elsewhere")).expect("unmount");
        let summary = crawler.crawl(Path::new(&key)).expect("crawl unreachable");

        assert_eq!(summary.outcome, CrawlOutcome::Unreachable);
        assert_eq!(summary.written, 0);
        assert_eq!(content(&store), before);
        assert_eq!(
            crawler.last_summary(Path::new(&key)).map(|s| s.outcome),
            Some(CrawlOutcome::Unreachable)
        );
    }

    #[test]
    fn recrawl_keeps_records_of_unmounted_nested_volume() {
        let temp = fixture();
        fs::create_dir(temp.path().join("usb")).expect("mkdir");
        File::create(temp.path().join("usb/photo.jpg")).expect("create");
        let root = Crawler::root_key(temp.path());
        let usb = VolumeId::new("uuid:usb");

        let store = Arc::new(PathStore::in_memory());
        let volumes = Arc::new(VolumeTable::from_mounts(vec![MountEntry {
            mount_point: format!("{root}/usb"),
            volume_id: usb.clone(),
        }]));
        let crawler = Crawler::new(
            store.clone(),
            Arc::new(ExclusionSet::new(ExclusionRules::new())),
            volumes.clone(),
        );
        crawler.crawl(temp.path()).expect("first crawl");
        let photo = format!("{root}/usb/photo.jpg");
        assert_eq!(store.get(&photo).map(|r| r.volume_id.clone()), Some(usb.clone()));
        assert!(store
            .volumes()
            .iter()
            .any(|info| info.id == usb && info.last_mount_point == format!("{root}/usb")));

        // Unmounted: the mount point stays behind as an empty directory.
        fs::remove_file(temp.path().join("usb/photo.jpg")).expect("remove");
        volumes.replace(Vec::new());
        let summary = crawler.crawl(temp.path()).expect("second crawl");

        assert_eq!(summary.removed, 0);
        assert!(store.get(&photo).is_some());
        assert!(store.get(&format!("{root}/usb")).is_some());

        // Forgetting the volume is what removes its records.
        assert_eq!(store.remove_volume(&usb).expect("forget"), 1);
        assert!(store.get(&photo).is_none());
    }

    #[test]
    fn second_crawl_of_running_root_is_a_no_op() {
        let temp = fixture();
        let (crawler, store) = crawler_with(ExclusionRules::new());
        let key = Crawler::root_key(temp.path());

        let registration = crawler.register(&key).expect("first registration");
        assert!(crawler.is_crawling(temp.path()));
        let summary = crawler.crawl(temp.path()).expect("crawl");
        assert_eq!(summary.outcome, CrawlOutcome::AlreadyRunning);
        assert!(store.is_empty());
        assert!(crawler.progress(temp.path()).is_some());

        drop(registration);
        assert!(!crawler.is_crawling(temp.path()));
        assert!(!crawler.cancel(temp.path()));
        assert_eq!(
            crawler.crawl(temp.path()).expect("crawl").outcome,
            CrawlOutcome::Completed
        );
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_keeps_its_subtree() {
        use std::os::unix::fs::PermissionsExt;

        let temp = fixture();
        let (crawler, store) = crawler_with(ExclusionRules::new());
        crawler.crawl(temp.path()).expect("first crawl");
        let root = Crawler::root_key(temp.path());
        let locked = temp.path().join("docs/drafts");

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read_dir(&locked).is_ok() {
            // Running with privileges that ignore permissions.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }
        let summary = crawler.crawl(temp.path()).expect("second crawl");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.removed, 0);
        let kept: Option<Arc<PathRecord>> = store.get(&format!("{root}/docs/drafts/report_draft.csv"));
        assert!(kept.is_some());
    }
}
