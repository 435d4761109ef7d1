//! The shared path record store.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::journal::{Journal, JournalOp};
use super::persistence::{load_store_snapshot, write_store_snapshot};
use super::snapshot::{ScanIter, StoreSnapshot};
use crate::error::{IndexError, Result};
use crate::path::is_descendant_path;
use crate::types::PathRecord;
use crate::volume::{VolumeId, VolumeInfo};

pub const SNAPSHOT_FILE_NAME: &str = "index.bin.zst";
pub const JOURNAL_FILE_NAME: &str = "index.journal";

/// Counts reported by [`PathStore::commit_crawl`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Records confirmed by the crawl.
    pub written: usize,
    /// New or changed records among them.
    pub changed: usize,
    /// Records under the root that were not seen and got pruned.
    pub removed: usize,
}

struct StoreFiles {
    dir: PathBuf,
    snapshot_path: PathBuf,
    journal: Journal,
}

struct StoreWriter {
    files: Option<StoreFiles>,
    compact_threshold: usize,
}

/// Thread-safe record store.
///
/// Readers grab the current [`StoreSnapshot`] and never block writers.
/// Writers are serialized: each mutation is appended to the journal first
/// and only then applied to a copy of the snapshot that replaces the
/// current one. A failed journal write leaves memory untouched.
pub struct PathStore {
    current: RwLock<Arc<StoreSnapshot>>,
    writer: Mutex<StoreWriter>,
    last_stamp: AtomicI64,
}

impl PathStore {
    /// Store without any files, for tests and ephemeral use.
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Arc::new(StoreSnapshot::default())),
            writer: Mutex::new(StoreWriter {
                files: None,
                compact_threshold: usize::MAX,
            }),
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Opens the store in `dir`, replaying the journal on top of the snapshot.
    pub fn open(dir: &Path, compact_threshold: usize) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|error| {
            IndexError::StoreIo(format!(
                "failed to create store directory {}: {error}",
                dir.display()
            ))
        })?;
        let snapshot_path = dir.join(SNAPSHOT_FILE_NAME);
        let (mut snapshot, mut last_stamp) = load_store_snapshot(&snapshot_path)?.unwrap_or_default();

        let (journal, ops) = Journal::open(&dir.join(JOURNAL_FILE_NAME))?;
        for op in &ops {
            if let JournalOp::CommitCrawl { stamp, .. } = op {
                last_stamp = last_stamp.max(*stamp);
            }
            snapshot.apply(op);
        }
        last_stamp = last_stamp.max(snapshot.max_last_seen());

        log::info!(
            "store_opened dir={} records={} replayed_ops={}",
            dir.display(),
            snapshot.len(),
            ops.len()
        );

        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(StoreWriter {
                files: Some(StoreFiles {
                    dir: dir.to_path_buf(),
                    snapshot_path,
                    journal,
                }),
                compact_threshold: compact_threshold.max(1),
            }),
            last_stamp: AtomicI64::new(last_stamp),
        })
    }

    /// Current immutable view.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.current.read().clone()
    }

    /// Lazy iterator over the view current at call time.
    pub fn scan(&self) -> ScanIter {
        self.snapshot().scan()
    }

    pub fn get(&self, path: &str) -> Option<Arc<PathRecord>> {
        self.current.read().get(path)
    }

    /// Direct children of `parent`, in path order.
    pub fn lookup_children(&self, parent: &str) -> Vec<Arc<PathRecord>> {
        self.current
            .read()
            .children(parent)
            .into_iter()
            .map(|stored| stored.record().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation()
    }

    pub fn volumes(&self) -> Vec<VolumeInfo> {
        self.current.read().volumes()
    }

    /// Ops waiting in the journal for the next compaction.
    pub fn journal_ops(&self) -> usize {
        self.writer
            .lock()
            .files
            .as_ref()
            .map(|files| files.journal.len())
            .unwrap_or(0)
    }

    /// Store directory, `None` for an in-memory store.
    pub fn dir(&self) -> Option<PathBuf> {
        self.writer.lock().files.as_ref().map(|files| files.dir.clone())
    }

    /// Returns a crawl stamp strictly greater than any stamp handed out before.
    pub fn next_crawl_stamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut previous = self.last_stamp.load(Ordering::Acquire);
        loop {
            let next = now.max(previous.saturating_add(1));
            match self.last_stamp.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    /// Inserts or replaces the record with the same `full_path`.
    pub fn upsert(&self, record: PathRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        self.commit(&mut writer, JournalOp::Upsert(record))?;
        Ok(())
    }

    /// Removes one record. Returns whether it existed.
    pub fn remove_path(&self, path: &str) -> Result<bool> {
        let mut writer = self.writer.lock();
        if self.get(path).is_none() {
            return Ok(false);
        }
        self.commit(&mut writer, JournalOp::RemovePath(path.to_string()))?;
        Ok(true)
    }

    /// Removes every record of a volume and forgets the volume.
    pub fn remove_volume(&self, id: &VolumeId) -> Result<usize> {
        let mut writer = self.writer.lock();
        self.commit(&mut writer, JournalOp::RemoveVolume(id.clone()))
    }

    /// Remembers where a volume was mounted. No-op if nothing changed.
    pub fn remember_volume(&self, info: VolumeInfo) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.current.read().volume(&info.id) == Some(&info) {
            return Ok(());
        }
        self.commit(&mut writer, JournalOp::RememberVolume(info))?;
        Ok(())
    }

    /// Re-bases every record of `id` from its last mount point onto `to`.
    ///
    /// Returns the number of records moved. Unknown volumes move nothing.
    pub fn relocate_volume(&self, id: &VolumeId, to: &str) -> Result<usize> {
        let mut writer = self.writer.lock();
        let Some(from) = self
            .current
            .read()
            .volume(id)
            .map(|info| info.last_mount_point.clone())
        else {
            return Ok(0);
        };
        if from == to {
            return Ok(0);
        }
        let moved = self.commit(
            &mut writer,
            JournalOp::RelocateVolume {
                id: id.clone(),
                from: from.clone(),
                to: to.to_string(),
            },
        )?;
        log::info!("volume_relocated volume={} from={} to={} records={}", id, from, to, moved);
        Ok(moved)
    }

    /// Commits the result of one completed crawl of `root`.
    ///
    /// Every record in `records` is stamped with `stamp`. Records under
    /// `root` that the crawl did not produce are removed, except those
    /// below a `preserved` directory (one the crawl could not read) and
    /// those of a volume outside `volumes`, the volumes the walk went
    /// through. Records of an unmounted volume therefore stay until that
    /// volume is crawled again or forgotten.
    pub fn commit_crawl(
        &self,
        root: &str,
        stamp: i64,
        mut records: Vec<PathRecord>,
        preserved: Vec<String>,
        volumes: Vec<VolumeId>,
    ) -> Result<CommitStats> {
        let mut writer = self.writer.lock();
        let snapshot = self.snapshot();

        let removed = {
            let seen = records
                .iter()
                .map(|record| record.full_path.as_str())
                .collect::<HashSet<_>>();
            snapshot
                .records_under(root)
                .into_iter()
                .filter(|stored| volumes.contains(&stored.record().volume_id))
                .map(|stored| stored.path().to_string())
                .filter(|path| !seen.contains(path.as_str()))
                .filter(|path| !preserved.iter().any(|dir| is_descendant_path(path, dir)))
                .collect::<Vec<_>>()
        };

        let written = records.len();
        for record in &mut records {
            record.last_seen_time = stamp;
        }
        let upserts = records
            .into_iter()
            .filter(|record| {
                snapshot
                    .get(&record.full_path)
                    .map_or(true, |existing| !existing.same_content(record))
            })
            .collect::<Vec<_>>();

        let stats = CommitStats {
            written,
            changed: upserts.len(),
            removed: removed.len(),
        };
        drop(snapshot);

        self.commit(
            &mut writer,
            JournalOp::CommitCrawl {
                root: root.to_string(),
                stamp,
                upserts,
                removed,
                preserved,
                volumes,
            },
        )?;
        Ok(stats)
    }

    /// Removes every record equal to or below `root`, on any volume.
    pub fn remove_under(&self, root: &str) -> Result<usize> {
        let mut writer = self.writer.lock();
        if self.current.read().records_under(root).is_empty() {
            return Ok(0);
        }
        self.commit(&mut writer, JournalOp::RemoveUnder(root.to_string()))
    }

    /// Drops every record and volume, on disk too.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.commit(&mut writer, JournalOp::Clear)?;
        self.compact_locked(&mut writer)
    }

    /// Folds the journal into a fresh snapshot file.
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.compact_locked(&mut writer)
    }

    /// Forces pending journal writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        match writer.files.as_mut() {
            Some(files) => files.journal.sync(),
            None => Ok(()),
        }
    }

    fn commit(&self, writer: &mut StoreWriter, op: JournalOp) -> Result<usize> {
        if let Some(files) = writer.files.as_mut() {
            files.journal.append(&op)?;
        }

        // Writers are serialized by `writer`, so the view cannot move
        // between the copy and the swap. Readers only wait for the swap.
        let mut next = self.snapshot();
        let affected = Arc::make_mut(&mut next).apply(&op);
        *self.current.write() = next;

        let over_threshold = writer
            .files
            .as_ref()
            .is_some_and(|files| files.journal.len() >= writer.compact_threshold);
        if over_threshold {
            if let Err(error) = self.compact_locked(writer) {
                log::warn!("store_compaction_failed error={}", error);
            }
        }
        Ok(affected)
    }

    fn compact_locked(&self, writer: &mut StoreWriter) -> Result<()> {
        let Some(files) = writer.files.as_mut() else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        let folded = files.journal.len();
        write_store_snapshot(
            &files.snapshot_path,
            &snapshot,
            self.last_stamp.load(Ordering::Acquire),
        )?;
        files.journal.reset()?;
        log::info!(
            "store_compacted records={} folded_ops={}",
            snapshot.len(),
            folded
        );
        Ok(())
    }
}

impl std::fmt::Debug for PathStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathStore")
            .field("records", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(path: &str, size: u64) -> PathRecord {
        PathRecord::from_key(path.to_string(), VolumeId::new("v1"), false, size, Some(7), 0)
    }

    fn v1() -> Vec<VolumeId> {
        vec![VolumeId::new("v1")]
    }

    fn paths(store: &PathStore) -> Vec<String> {
        let mut paths = store
            .scan()
            .map(|record| record.full_path.clone())
            .collect::<Vec<_>>();
        paths.sort();
        paths
    }

    #[test]
    fn writes_survive_reopen_through_journal() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = PathStore::open(dir.path(), 1_000).expect("open");
            store.upsert(record("/a", 1)).expect("upsert");
            store.upsert(record("/b", 2)).expect("upsert");
            assert!(store.remove_path("/a").expect("remove"));
            assert!(!store.remove_path("/missing").expect("remove missing"));
            assert_eq!(store.journal_ops(), 3);
        }
        let store = PathStore::open(dir.path(), 1_000).expect("reopen");
        assert_eq!(paths(&store), vec!["/b"]);
        assert_eq!(store.get("/b").map(|r| r.size_bytes), Some(2));
    }

    #[test]
    fn compaction_folds_journal_into_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = PathStore::open(dir.path(), 2).expect("open");
            store.upsert(record("/a", 1)).expect("upsert");
            store.upsert(record("/b", 1)).expect("upsert");
            assert_eq!(store.journal_ops(), 0);
            store.upsert(record("/c", 1)).expect("upsert");
            assert_eq!(store.journal_ops(), 1);
        }
        assert!(dir.path().join(SNAPSHOT_FILE_NAME).exists());
        let store = PathStore::open(dir.path(), 2).expect("reopen");
        assert_eq!(paths(&store), vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn crawl_stamps_strictly_increase() {
        let store = PathStore::in_memory();
        let first = store.next_crawl_stamp();
        let second = store.next_crawl_stamp();
        let third = store.next_crawl_stamp();
        assert!(first < second && second < third);
    }

    #[test]
    fn commit_crawl_prunes_unseen_and_keeps_preserved() {
        let store = PathStore::in_memory();
        let first = store.next_crawl_stamp();
        store
            .commit_crawl(
                "/r",
                first,
                vec![
                    record("/r", 0),
                    record("/r/a.txt", 1),
                    record("/r/b.txt", 1),
                    record("/r/locked", 0),
                    record("/r/locked/inner.txt", 1),
                ],
                Vec::new(),
                vec![VolumeId::new("v1")],
            )
            .expect("first crawl");
        store.upsert(record("/elsewhere", 1)).expect("upsert");

        let second = store.next_crawl_stamp();
        let stats = store
            .commit_crawl(
                "/r",
                second,
                vec![record("/r", 0), record("/r/a.txt", 5), record("/r/locked", 0)],
                vec!["/r/locked".to_string()],
                vec![VolumeId::new("v1")],
            )
            .expect("second crawl");

        assert_eq!(stats, CommitStats { written: 3, changed: 1, removed: 1 });
        assert_eq!(
            paths(&store),
            vec!["/elsewhere", "/r", "/r/a.txt", "/r/locked", "/r/locked/inner.txt"]
        );
        assert_eq!(store.get("/r").map(|r| r.last_seen_time), Some(second));
        assert_eq!(store.get("/r/a.txt").map(|r| r.size_bytes), Some(5));
        assert_eq!(
            store.get("/r/locked/inner.txt").map(|r| r.last_seen_time),
            Some(first)
        );
    }

    #[test]
    fn commit_crawl_keeps_records_of_volumes_it_did_not_walk() {
        let store = PathStore::in_memory();
        let mut photo = record("/r/usb/photo.jpg", 3);
        photo.volume_id = VolumeId::new("uuid:usb");
        let first = store.next_crawl_stamp();
        store
            .commit_crawl(
                "/r",
                first,
                vec![record("/r", 0), record("/r/usb", 0), photo],
                Vec::new(),
                vec![VolumeId::new("v1"), VolumeId::new("uuid:usb")],
            )
            .expect("first crawl");

        // The usb volume is gone; its mount point is an empty directory.
        let second = store.next_crawl_stamp();
        let stats = store
            .commit_crawl("/r", second, vec![record("/r", 0), record("/r/usb", 0)], Vec::new(), v1())
            .expect("second crawl");

        assert_eq!(stats.removed, 0);
        let kept = store.get("/r/usb/photo.jpg").expect("usb record kept");
        assert_eq!(kept.volume_id, VolumeId::new("uuid:usb"));
        assert_eq!(kept.last_seen_time, first);
    }

    #[test]
    fn remove_under_purges_all_volumes() {
        let store = PathStore::in_memory();
        let mut photo = record("/r/usb/photo.jpg", 3);
        photo.volume_id = VolumeId::new("uuid:usb");
        for entry in [record("/r", 0), record("/r/a", 1), record("/rest", 1), photo] {
            store.upsert(entry).expect("upsert");
        }

        assert_eq!(store.remove_under("/r").expect("remove"), 3);
        assert_eq!(store.remove_under("/r").expect("remove again"), 0);
        assert_eq!(paths(&store), vec!["/rest"]);
    }

    #[test]
    fn unchanged_crawl_changes_nothing() {
        let store = PathStore::in_memory();
        let crawl = || vec![record("/r", 0), record("/r/a.txt", 1)];
        let first = store.next_crawl_stamp();
        store.commit_crawl("/r", first, crawl(), Vec::new(), v1()).expect("first");
        let second = store.next_crawl_stamp();
        let stats = store.commit_crawl("/r", second, crawl(), Vec::new(), v1()).expect("second");
        assert_eq!(stats, CommitStats { written: 2, changed: 0, removed: 0 });
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("/r/a.txt").map(|r| r.last_seen_time), Some(second));
    }

    #[test]
    fn crawl_commit_replays_after_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let stamp;
        {
            let store = PathStore::open(dir.path(), 1_000).expect("open");
            stamp = store.next_crawl_stamp();
            store
                .commit_crawl("/r", stamp, vec![record("/r", 0), record("/r/x", 1)], Vec::new(), v1())
                .expect("commit");
        }
        let store = PathStore::open(dir.path(), 1_000).expect("reopen");
        assert_eq!(store.get("/r/x").map(|r| r.last_seen_time), Some(stamp));
        assert!(store.next_crawl_stamp() > stamp);
    }

    #[test]
    fn readers_keep_snapshot_during_writes() {
        let store = PathStore::in_memory();
        store.upsert(record("/a", 1)).expect("upsert");
        let before = store.snapshot();
        store.upsert(record("/b", 1)).expect("upsert");
        store.remove_path("/a").expect("remove");

        assert_eq!(before.len(), 1);
        assert!(before.get("/a").is_some());
        assert_eq!(paths(&store), vec!["/b"]);
        assert!(store.generation() > before.generation());
    }

    #[test]
    fn writes_publish_fresh_snapshots_while_readers_hold_one() {
        let store = Arc::new(PathStore::in_memory());
        store.upsert(record("/seed", 1)).expect("upsert");
        let held = store.snapshot();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.upsert(record(&format!("/w/{i:03}"), 1)).expect("upsert");
                }
            })
        };
        let mut last = 0;
        while !writer.is_finished() {
            let generation = store.generation();
            assert!(generation >= last);
            last = generation;
        }
        writer.join().expect("writer");

        assert_eq!(held.len(), 1);
        assert_eq!(store.len(), 201);
        assert!(!Arc::ptr_eq(&held, &store.snapshot()));
    }

    #[test]
    fn lookup_children_lists_direct_entries() {
        let store = PathStore::in_memory();
        for path in ["/d", "/d/one", "/d/two", "/d/two/deep"] {
            store.upsert(record(path, 1)).expect("upsert");
        }
        let children = store
            .lookup_children("/d")
            .iter()
            .map(|r| r.full_path.clone())
            .collect::<Vec<_>>();
        assert_eq!(children, vec!["/d/one", "/d/two"]);
    }

    #[test]
    fn clear_empties_store_on_disk() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = PathStore::open(dir.path(), 1_000).expect("open");
            store.upsert(record("/a", 1)).expect("upsert");
            store.clear().expect("clear");
            assert!(store.is_empty());
        }
        let store = PathStore::open(dir.path(), 1_000).expect("reopen");
        assert!(store.is_empty());
    }

    #[test]
    fn relocate_moves_records_of_known_volume() {
        let store = PathStore::in_memory();
        store
            .remember_volume(VolumeInfo::new(VolumeId::new("v1"), "/mnt/old"))
            .expect("remember");
        store.upsert(record("/mnt/old/file", 1)).expect("upsert");

        assert_eq!(store.relocate_volume(&VolumeId::new("v1"), "/mnt/new").expect("move"), 1);
        assert!(store.get("/mnt/new/file").is_some());
        assert_eq!(store.relocate_volume(&VolumeId::new("nope"), "/x").expect("unknown"), 0);
        assert_eq!(store.remove_volume(&VolumeId::new("v1")).expect("forget"), 1);
        assert!(store.volumes().is_empty());
    }
}
