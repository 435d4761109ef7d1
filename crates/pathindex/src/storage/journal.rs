//! Append-only mutation journal.
//!
//! Each frame is a little-endian `u32` length followed by a postcard
//! encoded [`JournalOp`]. A torn frame at the tail (crash mid-write) is
//! dropped on open and the file is truncated back to the last good frame.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::types::PathRecord;
use crate::volume::{VolumeId, VolumeInfo};

const FRAME_HEADER_LEN: usize = 4;

/// One durable store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    Upsert(PathRecord),
    RemovePath(String),
    RemoveVolume(VolumeId),
    /// Result of one completed crawl of `root`.
    ///
    /// `upserts` only carries new or changed records; every other record
    /// under `root` that lives on one of `volumes` (outside `preserved`) is
    /// marked seen at `stamp`.
    CommitCrawl {
        root: String,
        stamp: i64,
        upserts: Vec<PathRecord>,
        removed: Vec<String>,
        preserved: Vec<String>,
        volumes: Vec<VolumeId>,
    },
    /// Drops every record equal to or below the path, whatever its volume.
    RemoveUnder(String),
    /// A known volume came back under a different mount point.
    RelocateVolume {
        id: VolumeId,
        from: String,
        to: String,
    },
    RememberVolume(VolumeInfo),
    Clear,
}

pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    ops: usize,
}

impl Journal {
    /// Opens (or creates) the journal and returns the ops already in it.
    pub fn open(path: &Path) -> Result<(Self, Vec<JournalOp>)> {
        let (ops, valid_len) = read_frames(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| store_io("open journal", path, e))?;
        let on_disk = file
            .metadata()
            .map_err(|e| store_io("stat journal", path, e))?
            .len();
        if on_disk > valid_len {
            log::warn!(
                "journal_truncated path={} valid_bytes={} dropped_bytes={}",
                path.display(),
                valid_len,
                on_disk - valid_len
            );
            file.set_len(valid_len)
                .map_err(|e| store_io("truncate journal", path, e))?;
        }

        let journal = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            ops: ops.len(),
        };
        Ok((journal, ops))
    }

    /// Appends one op. The frame is handed to the OS before returning.
    pub fn append(&mut self, op: &JournalOp) -> Result<()> {
        let payload = postcard::to_stdvec(op)
            .map_err(|e| IndexError::Serialization(format!("journal op: {e}")))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| IndexError::StoreIo("journal op exceeds 4 GiB".to_string()))?;

        self.writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.writer.write_all(&payload))
            .and_then(|_| self.writer.flush())
            .map_err(|e| store_io("append journal", &self.path, e))?;
        self.ops += 1;
        Ok(())
    }

    /// Forces journal contents to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .and_then(|_| self.writer.get_ref().sync_data())
            .map_err(|e| store_io("sync journal", &self.path, e))
    }

    /// Drops every op (after they were folded into a snapshot).
    pub fn reset(&mut self) -> Result<()> {
        self.writer
            .flush()
            .and_then(|_| self.writer.get_ref().set_len(0))
            .and_then(|_| self.writer.get_ref().sync_data())
            .map_err(|e| store_io("reset journal", &self.path, e))?;
        self.ops = 0;
        Ok(())
    }

    /// Number of ops in the journal.
    pub fn len(&self) -> usize {
        self.ops
    }
}

/// Decodes all complete frames and returns them with the byte length they span.
fn read_frames(path: &Path) -> Result<(Vec<JournalOp>, u64)> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(error) => return Err(store_io("read journal", path, error)),
    };

    let mut ops = Vec::new();
    let mut offset = 0usize;
    while bytes.len() - offset >= FRAME_HEADER_LEN {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&bytes[offset..offset + FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        let start = offset + FRAME_HEADER_LEN;
        let Some(end) = start.checked_add(len).filter(|end| *end <= bytes.len()) else {
            break;
        };
        match postcard::from_bytes::<JournalOp>(&bytes[start..end]) {
            Ok(op) => ops.push(op),
            Err(error) => {
                log::warn!(
                    "journal_frame_invalid path={} offset={} error={}",
                    path.display(),
                    offset,
                    error
                );
                break;
            }
        }
        offset = end;
    }

    Ok((ops, offset as u64))
}

fn store_io(action: &str, path: &Path, error: std::io::Error) -> IndexError {
    IndexError::StoreIo(format!("{action} {}: {error}", path.display()))
}
