//! Full store snapshot read/write.
//!
//! Snapshots are postcard encoded and zstd compressed, written to a temp
//! file in the store directory and atomically renamed into place.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;
use std::thread::available_parallelism;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::journal::JournalOp;
use super::snapshot::StoreSnapshot;
use crate::error::{IndexError, Result};
use crate::types::PathRecord;
use crate::volume::VolumeInfo;

/// Snapshot format version - increment when changing the format.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Largest single string/byte field accepted while decoding.
const DECODE_SCRATCH_BYTES: usize = 64 * 1024;

#[derive(Serialize)]
struct PersistentStorageRef<'a> {
    version: u32,
    saved_at: i64,
    last_stamp: i64,
    volumes: Vec<&'a VolumeInfo>,
    records: Vec<&'a PathRecord>,
}

/// On-disk layout. Must stay field-for-field compatible with
/// `PersistentStorageRef`.
#[derive(Deserialize)]
struct PersistentStorage {
    version: u32,
    saved_at: i64,
    last_stamp: i64,
    volumes: Vec<VolumeInfo>,
    records: Vec<PathRecord>,
}

/// Writes `snapshot` to `path`.
///
/// The records are postcard encoded and compressed with multi-threaded
/// zstd at level 6 into a temp file in the same directory, which is then
/// renamed over `path`.
pub fn write_store_snapshot(path: &Path, snapshot: &StoreSnapshot, last_stamp: i64) -> Result<()> {
    let volumes = snapshot.volumes();
    let storage = PersistentStorageRef {
        version: STORE_FORMAT_VERSION,
        saved_at: chrono::Utc::now().timestamp(),
        last_stamp,
        volumes: volumes.iter().collect(),
        records: snapshot.all_records().map(|record| record.as_ref()).collect(),
    };

    let dir = path
        .parent()
        .ok_or_else(|| IndexError::StoreIo(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|error| {
        IndexError::StoreIo(format!(
            "failed to create store directory {}: {error}",
            dir.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|error| {
        IndexError::StoreIo(format!(
            "failed to create temp snapshot in {}: {error}",
            dir.display()
        ))
    })?;

    {
        let mut encoder = zstd::Encoder::new(BufWriter::new(tmp.as_file_mut()), 6)
            .map_err(|error| IndexError::StoreIo(format!("failed to create zstd encoder: {error}")))?;

        let threads = available_parallelism().map(|x| x.get() as u32).unwrap_or(4);
        encoder.multithread(threads).map_err(|error| {
            IndexError::StoreIo(format!("failed to enable multi-threaded zstd: {error}"))
        })?;

        postcard::to_io(&storage, &mut encoder).map_err(|error| {
            IndexError::Serialization(format!("failed to encode snapshot with postcard: {error}"))
        })?;

        let mut output = encoder
            .finish()
            .map_err(|error| IndexError::StoreIo(format!("failed to finish zstd stream: {error}")))?;
        output
            .flush()
            .map_err(|error| IndexError::StoreIo(format!("failed to flush snapshot: {error}")))?;
    }

    tmp.as_file()
        .sync_all()
        .map_err(|error| IndexError::StoreIo(format!("failed to sync snapshot: {error}")))?;
    tmp.persist(path).map_err(|error| {
        IndexError::StoreIo(format!(
            "failed to finalize snapshot {}: {}",
            path.display(),
            error.error
        ))
    })?;

    log::debug!(
        "snapshot_written path={} records={} volumes={}",
        path.display(),
        snapshot.len(),
        volumes.len()
    );
    Ok(())
}

/// Loads a snapshot written by [`write_store_snapshot`].
///
/// Returns `Ok(None)` when there is no usable snapshot (missing, corrupt
/// or from another format version). Only unexpected IO fails.
pub fn load_store_snapshot(path: &Path) -> Result<Option<(StoreSnapshot, i64)>> {
    let input = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(IndexError::StoreIo(format!(
                "failed to open snapshot {}: {error}",
                path.display()
            )))
        }
    };

    let decoder = match zstd::Decoder::new(input) {
        Ok(decoder) => decoder,
        Err(error) => {
            log::warn!("snapshot_decompress_failed path={} error={}", path.display(), error);
            return Ok(None);
        }
    };

    let mut input = BufReader::new(decoder);
    let mut scratch = vec![0u8; DECODE_SCRATCH_BYTES];
    let storage: PersistentStorage = match postcard::from_io((&mut input, &mut scratch)) {
        Ok((storage, _)) => storage,
        Err(error) => {
            log::warn!("snapshot_decode_failed path={} error={}", path.display(), error);
            return Ok(None);
        }
    };

    if storage.version != STORE_FORMAT_VERSION {
        log::warn!(
            "snapshot_version_mismatch path={} found={} expected={}",
            path.display(),
            storage.version,
            STORE_FORMAT_VERSION
        );
        return Ok(None);
    }

    let mut snapshot = StoreSnapshot::default();
    for info in storage.volumes {
        snapshot.apply(&JournalOp::RememberVolume(info));
    }
    for record in storage.records {
        snapshot.apply(&JournalOp::Upsert(record));
    }

    log::debug!(
        "snapshot_loaded path={} records={} saved_at={}",
        path.display(),
        snapshot.len(),
        storage.saved_at
    );
    Ok(Some((snapshot, storage.last_stamp)))
}
