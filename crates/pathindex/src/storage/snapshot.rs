//! Immutable indexed view over all path records.
//!
//! A `StoreSnapshot` is shared through an `Arc`. Writers mutate a private
//! copy (`Arc::make_mut`) and swap it in, so a reader that already holds a
//! snapshot keeps iterating a consistent view.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use fnv::FnvHashMap;

use super::journal::JournalOp;
use crate::path::{is_same_or_descendant, path_depth, rebase_path};
use crate::types::PathRecord;
use crate::volume::{VolumeId, VolumeInfo};

/// A record plus the derived keys the evaluator needs.
#[derive(Debug)]
pub struct StoredRecord {
    record: Arc<PathRecord>,
    name_lower: Box<str>,
    depth: u32,
}

impl StoredRecord {
    pub fn new(record: PathRecord) -> Self {
        let name_lower = record.name.to_lowercase().into_boxed_str();
        let depth = path_depth(&record.full_path);
        Self {
            record: Arc::new(record),
            name_lower,
            depth,
        }
    }

    pub fn record(&self) -> &Arc<PathRecord> {
        &self.record
    }

    pub fn name_lower(&self) -> &str {
        &self.name_lower
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn path(&self) -> &str {
        &self.record.full_path
    }
}

/// Scan order key: shallow paths first, then lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ScanKey {
    depth: u32,
    path: Arc<str>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Records keyed by full path.
    records: BTreeMap<Arc<str>, Arc<StoredRecord>>,
    /// Full-table scan order.
    scan_order: BTreeSet<ScanKey>,
    /// Lower-cased name -> paths.
    names: BTreeMap<Box<str>, BTreeSet<Arc<str>>>,
    /// Parent path -> child paths.
    children: FnvHashMap<Box<str>, BTreeSet<Arc<str>>>,
    /// Volumes seen by a crawl.
    volumes: BTreeMap<VolumeId, VolumeInfo>,
    generation: u64,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bumped once per applied mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, path: &str) -> Option<Arc<PathRecord>> {
        self.records.get(path).map(|stored| stored.record.clone())
    }

    pub fn get_stored(&self, path: &str) -> Option<Arc<StoredRecord>> {
        self.records.get(path).cloned()
    }

    /// Lazy full-table scan in (depth, path) order.
    pub fn scan(self: &Arc<Self>) -> ScanIter {
        ScanIter {
            inner: StoredScan::new(self.clone()),
        }
    }

    /// Direct children of `parent`, in path order.
    pub fn children(&self, parent: &str) -> Vec<Arc<StoredRecord>> {
        let Some(paths) = self.children.get(parent) else {
            return Vec::new();
        };
        paths
            .iter()
            .filter_map(|path| self.records.get(path).cloned())
            .collect()
    }

    /// Paths whose lower-cased name equals `name_lower`.
    pub fn paths_named(&self, name_lower: &str) -> Vec<Arc<str>> {
        self.names
            .get(name_lower)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Paths whose lower-cased name starts with `prefix_lower`.
    pub fn paths_with_name_prefix(&self, prefix_lower: &str) -> Vec<Arc<str>> {
        self.names
            .range::<str, _>((Bound::Included(prefix_lower), Bound::Unbounded))
            .take_while(|(name, _)| name.starts_with(prefix_lower))
            .flat_map(|(_, paths)| paths.iter().cloned())
            .collect()
    }

    /// Records equal to or below `root`.
    pub fn records_under(&self, root: &str) -> Vec<Arc<StoredRecord>> {
        self.records
            .range::<str, _>((Bound::Included(root), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(root))
            .filter(|(path, _)| is_same_or_descendant(path, root))
            .map(|(_, stored)| stored.clone())
            .collect()
    }

    pub fn volumes(&self) -> Vec<VolumeInfo> {
        self.volumes.values().cloned().collect()
    }

    pub fn volume(&self, id: &VolumeId) -> Option<&VolumeInfo> {
        self.volumes.get(id)
    }

    /// Latest `last_seen_time` of any record.
    pub fn max_last_seen(&self) -> i64 {
        self.records
            .values()
            .map(|stored| stored.record.last_seen_time)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn all_records(&self) -> impl Iterator<Item = &Arc<PathRecord>> {
        self.records.values().map(|stored| &stored.record)
    }

    /// Applies one mutation and returns the number of records it touched.
    pub fn apply(&mut self, op: &JournalOp) -> usize {
        self.generation += 1;
        match op {
            JournalOp::Upsert(record) => {
                self.insert(record.clone());
                1
            }
            JournalOp::RemovePath(path) => usize::from(self.remove(path).is_some()),
            JournalOp::RemoveVolume(id) => {
                let doomed = self
                    .records
                    .values()
                    .filter(|stored| &stored.record.volume_id == id)
                    .map(|stored| stored.record.full_path.clone())
                    .collect::<Vec<_>>();
                for path in &doomed {
                    self.remove(path);
                }
                self.volumes.remove(id);
                doomed.len()
            }
            JournalOp::CommitCrawl {
                root,
                stamp,
                upserts,
                removed,
                preserved,
                volumes,
            } => {
                for path in removed {
                    self.remove(path);
                }
                for record in upserts {
                    self.insert(record.clone());
                }
                self.touch_under(root, *stamp, preserved, volumes);
                upserts.len() + removed.len()
            }
            JournalOp::RemoveUnder(root) => {
                let doomed = self.records_under(root);
                for stored in &doomed {
                    self.remove(stored.path());
                }
                doomed.len()
            }
            JournalOp::RelocateVolume { id, from, to } => {
                let moved = self
                    .records_under(from)
                    .into_iter()
                    .filter(|stored| &stored.record.volume_id == id)
                    .collect::<Vec<_>>();
                for stored in &moved {
                    let Some(new_path) = rebase_path(stored.path(), from, to) else {
                        continue;
                    };
                    let old = &stored.record;
                    self.remove(&old.full_path);
                    self.insert(PathRecord::from_key(
                        new_path,
                        old.volume_id.clone(),
                        old.is_directory,
                        old.size_bytes,
                        old.modified_time,
                        old.last_seen_time,
                    ));
                }
                if let Some(info) = self.volumes.get_mut(id) {
                    *info = VolumeInfo::new(id.clone(), to);
                }
                moved.len()
            }
            JournalOp::RememberVolume(info) => {
                self.volumes.insert(info.id.clone(), info.clone());
                0
            }
            JournalOp::Clear => {
                let cleared = self.records.len();
                let generation = self.generation;
                *self = Self {
                    generation,
                    ..Self::default()
                };
                cleared
            }
        }
    }

    fn insert(&mut self, record: PathRecord) {
        if self.records.contains_key(record.full_path.as_str()) {
            self.remove(&record.full_path);
        }
        let stored = Arc::new(StoredRecord::new(record));
        let path: Arc<str> = Arc::from(stored.path());

        self.scan_order.insert(ScanKey {
            depth: stored.depth,
            path: path.clone(),
        });
        self.names
            .entry(stored.name_lower.clone())
            .or_default()
            .insert(path.clone());
        self.children
            .entry(stored.record.parent_path.clone().into_boxed_str())
            .or_default()
            .insert(path.clone());
        self.records.insert(path, stored);
    }

    fn remove(&mut self, path: &str) -> Option<Arc<StoredRecord>> {
        let (key, stored) = self.records.remove_entry(path)?;
        self.scan_order.remove(&ScanKey {
            depth: stored.depth,
            path: key.clone(),
        });
        if let Some(paths) = self.names.get_mut(stored.name_lower()) {
            paths.remove(path);
            if paths.is_empty() {
                self.names.remove(stored.name_lower());
            }
        }
        let parent = stored.record.parent_path.as_str();
        if let Some(paths) = self.children.get_mut(parent) {
            paths.remove(path);
            if paths.is_empty() {
                self.children.remove(parent);
            }
        }
        Some(stored)
    }

    /// Marks the records under `root` that live on `volumes` (outside
    /// `preserved`) as seen at `stamp`.
    fn touch_under(&mut self, root: &str, stamp: i64, preserved: &[String], volumes: &[VolumeId]) {
        let stale = self
            .records_under(root)
            .into_iter()
            .filter(|stored| stored.record.last_seen_time != stamp)
            .filter(|stored| volumes.contains(&stored.record.volume_id))
            .filter(|stored| {
                !preserved
                    .iter()
                    .any(|dir| crate::path::is_descendant_path(stored.path(), dir))
            })
            .collect::<Vec<_>>();
        for stored in stale {
            let mut record = (*stored.record).clone();
            record.last_seen_time = stamp;
            let refreshed = Arc::new(StoredRecord {
                record: Arc::new(record),
                name_lower: stored.name_lower.clone(),
                depth: stored.depth,
            });
            if let Some(slot) = self.records.get_mut(stored.path()) {
                *slot = refreshed;
            }
        }
    }
}

/// Cursor-based scan over a snapshot, yielding stored records.
///
/// Holds its own `Arc` of the snapshot, so the view stays fixed for the
/// lifetime of the iterator even while writers publish new snapshots.
#[derive(Debug, Clone)]
pub struct StoredScan {
    snapshot: Arc<StoreSnapshot>,
    cursor: Option<ScanKey>,
}

impl StoredScan {
    pub fn new(snapshot: Arc<StoreSnapshot>) -> Self {
        Self {
            snapshot,
            cursor: None,
        }
    }
}

impl Iterator for StoredScan {
    type Item = Arc<StoredRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next_key = match self.cursor.as_ref() {
                None => self.snapshot.scan_order.iter().next(),
                Some(cursor) => self
                    .snapshot
                    .scan_order
                    .range((Bound::Excluded(cursor), Bound::Unbounded))
                    .next(),
            }?
            .clone();
            let stored = self.snapshot.records.get(&next_key.path).cloned();
            self.cursor = Some(next_key);
            if stored.is_some() {
                return stored;
            }
        }
    }
}

/// Lazy full-table scan yielding path records.
#[derive(Debug, Clone)]
pub struct ScanIter {
    inner: StoredScan,
}

impl Iterator for ScanIter {
    type Item = Arc<PathRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|stored| stored.record.clone())
    }
}
