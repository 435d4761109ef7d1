//! Record and status types shared with the presentation layer.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path::{base_name, extension_of_name, parent_of, path_depth, path_to_key};
use crate::volume::VolumeId;

/// One indexed filesystem entry.
///
/// `full_path` is unique across the store. Whether the owning volume is
/// currently mounted is not stored; ask
/// [`IndexContext::volume_mounted`](crate::IndexContext::volume_mounted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRecord {
    /// Absolute, normalized path (`/` separators).
    pub full_path: String,
    /// Base name, the primary match target.
    pub name: String,
    /// Enclosing directory.
    pub parent_path: String,
    /// Stable identifier of the owning volume.
    pub volume_id: VolumeId,
    pub is_directory: bool,
    pub size_bytes: u64,
    /// Modification time as Unix seconds.
    pub modified_time: Option<i64>,
    /// Stamp (Unix nanoseconds) of the last crawl that confirmed this entry.
    pub last_seen_time: i64,
}

impl PathRecord {
    /// Builds a record for `path`, deriving `name` and `parent_path`.
    pub fn new(
        path: &Path,
        volume_id: VolumeId,
        is_directory: bool,
        size_bytes: u64,
        modified_time: Option<i64>,
        last_seen_time: i64,
    ) -> Self {
        Self::from_key(
            path_to_key(path),
            volume_id,
            is_directory,
            size_bytes,
            modified_time,
            last_seen_time,
        )
    }

    /// Builds a record from an already normalized path string.
    pub fn from_key(
        full_path: String,
        volume_id: VolumeId,
        is_directory: bool,
        size_bytes: u64,
        modified_time: Option<i64>,
        last_seen_time: i64,
    ) -> Self {
        let name = base_name(&full_path).to_string();
        let parent_path = parent_of(&full_path);
        Self {
            full_path,
            name,
            parent_path,
            volume_id,
            is_directory,
            size_bytes,
            modified_time,
            last_seen_time,
        }
    }

    /// Lower-cased extension of the name, if any.
    pub fn extension(&self) -> Option<String> {
        if self.is_directory {
            return None;
        }
        extension_of_name(&self.name)
    }

    /// Number of path segments below the filesystem root.
    pub fn depth(&self) -> u32 {
        path_depth(&self.full_path)
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_time
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    /// True if every field except `last_seen_time` is equal.
    pub fn same_content(&self, other: &PathRecord) -> bool {
        self.full_path == other.full_path
            && self.volume_id == other.volume_id
            && self.is_directory == other.is_directory
            && self.size_bytes == other.size_bytes
            && self.modified_time == other.modified_time
    }
}

/// Last crawl result for one configured root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootStatus {
    pub root: String,
    /// Outcome label of the most recent crawl (`completed`, `unreachable`, ...).
    pub last_outcome: Option<String>,
    pub last_written: usize,
    pub last_removed: usize,
    pub last_skipped: usize,
    pub crawling: bool,
}

/// Index status information.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    /// Number of records in the store.
    pub indexed_entries: usize,
    /// Store generation (bumped on every committed change).
    pub generation: u64,
    /// Configured roots and their last crawl.
    pub roots: Vec<RootStatus>,
    /// Active exclusion prefixes.
    pub excluded_paths: Vec<String>,
    /// Mutations waiting in the journal for the next compaction.
    pub journal_ops: usize,
    /// Path of the store directory, if persistent.
    pub store_dir: Option<String>,
}
