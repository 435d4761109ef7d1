//! Parallel directory walk producing path records.
//!
//! Children of every directory are walked in parallel with rayon. Excluded
//! paths are pruned before descending, symlinks are recorded but never
//! followed, and an entry that cannot be read is skipped and counted.

use std::fs::{self, Metadata};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;

use super::build::{modified_secs, CrawlProgress};
use crate::error::IndexError;
use crate::exclusion::ExclusionRules;
use crate::path::path_to_key;
use crate::types::PathRecord;
use crate::volume::{MountEntry, VolumeId, VolumeTable};

/// Entry errors kept verbatim for the crawl summary.
const MAX_ERROR_SAMPLES: usize = 16;

/// Data shared by all walker threads of one crawl.
pub struct WalkData<'a> {
    pub progress: &'a CrawlProgress,
    /// Cancellation flag (checked per entry).
    pub cancel: Option<&'a AtomicBool>,
    pub exclusions: &'a ExclusionRules,
    pub volumes: &'a VolumeTable,
    /// Stamp written into every record's `last_seen_time`.
    pub stamp: i64,
    errors: Mutex<Vec<IndexError>>,
    unreadable: Mutex<Vec<String>>,
    nested: Mutex<Vec<MountEntry>>,
}

/// Everything a finished walk found.
#[derive(Debug, Default)]
pub struct WalkOutput {
    pub records: Vec<PathRecord>,
    /// Directories that exist but could not be listed.
    pub unreadable_dirs: Vec<String>,
    /// Other volumes found mounted below the root and walked into.
    pub nested_volumes: Vec<MountEntry>,
    pub errors: Vec<IndexError>,
}

impl<'a> WalkData<'a> {
    pub fn new(
        progress: &'a CrawlProgress,
        exclusions: &'a ExclusionRules,
        volumes: &'a VolumeTable,
        stamp: i64,
    ) -> Self {
        Self {
            progress,
            cancel: None,
            exclusions,
            volumes,
            stamp,
            errors: Mutex::new(Vec::new()),
            unreadable: Mutex::new(Vec::new()),
            nested: Mutex::new(Vec::new()),
        }
    }

    /// Sets the cancellation flag.
    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn skip_entry(&self, path: &Path, source: std::io::Error) {
        self.progress.count_skip();
        log::debug!("crawl_entry_skipped path={} error={}", path.display(), source);
        let mut errors = self.errors.lock();
        if errors.len() < MAX_ERROR_SAMPLES {
            errors.push(IndexError::CrawlEntry {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    fn record(&self, key: String, volume_id: VolumeId, metadata: &Metadata) -> PathRecord {
        let is_directory = metadata.is_dir();
        self.progress.count_entry(is_directory);
        PathRecord::from_key(
            key,
            volume_id,
            is_directory,
            if is_directory { 0 } else { metadata.len() },
            modified_secs(metadata),
            self.stamp,
        )
    }
}

/// Walks `root` (already known to exist) and returns its records.
///
/// The root itself is recorded. Returns `None` if cancelled.
pub fn walk_root(root: &Path, metadata: &Metadata, data: WalkData) -> Option<WalkOutput> {
    let key = path_to_key(root);
    if data.exclusions.is_excluded(&key) {
        return Some(WalkOutput::default());
    }

    let volume_id = data.volumes.volume_for(root);
    let mut records = vec![data.record(key, volume_id.clone(), metadata)];
    if metadata.is_dir() {
        records.extend(walk_dir(root, &volume_id, &data)?);
    }
    if data.is_cancelled() {
        return None;
    }

    Some(WalkOutput {
        records,
        unreadable_dirs: data.unreadable.into_inner(),
        nested_volumes: data.nested.into_inner(),
        errors: data.errors.into_inner(),
    })
}

/// Records of everything below `dir`. `None` means cancelled.
fn walk_dir(dir: &Path, volume_id: &VolumeId, data: &WalkData) -> Option<Vec<PathRecord>> {
    if data.is_cancelled() {
        return None;
    }

    let read_dir = match fs::read_dir(dir) {
        Ok(iter) => iter,
        Err(error) => {
            data.unreadable.lock().push(path_to_key(dir));
            data.skip_entry(dir, error);
            return Some(Vec::new());
        }
    };

    let entries = read_dir
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                data.skip_entry(dir, error);
                None
            }
        })
        .collect::<Vec<_>>();

    let nested = entries
        .into_par_iter()
        .map(|entry| {
            if data.is_cancelled() {
                return None;
            }

            let child_path = entry.path();
            let key = path_to_key(&child_path);
            if data.exclusions.is_excluded(&key) {
                return Some(Vec::new());
            }

            // DirEntry metadata does not traverse symlinks.
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(error) => {
                    data.skip_entry(&child_path, error);
                    return Some(Vec::new());
                }
            };

            if !metadata.is_dir() {
                return Some(vec![data.record(key, volume_id.clone(), &metadata)]);
            }

            let child_volume = match data.volumes.volume_mounted_at(&key) {
                Some(mounted) => {
                    data.nested.lock().push(MountEntry {
                        mount_point: key.clone(),
                        volume_id: mounted.clone(),
                    });
                    mounted
                }
                None => volume_id.clone(),
            };
            let mut records = vec![data.record(key, child_volume.clone(), &metadata)];
            records.extend(walk_dir(&child_path, &child_volume, data)?);
            Some(records)
        })
        .collect::<Option<Vec<Vec<PathRecord>>>>()?;

    Some(nested.into_iter().flatten().collect())
}
