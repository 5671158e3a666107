//! Append-only journal of mapping table mutations.
//!
//! A durable [`MappingTable`](crate::MappingTable) appends every mutation here
//! before applying it in memory, and rebuilds itself by replaying the journal
//! on open.
//!
//! On-disk format, one frame per operation:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized MappingOp)]
//! ```
//!
//! Only the final frame may be damaged: it is what a crash mid-append leaves
//! behind, and it is cut off on open. A damaged frame with data after it
//! means the journal itself is corrupt, and opening it fails.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_types::{ObjectKey, ObjectVersion, StoragePath};
use tracing::{debug, error, info, warn};

use crate::error::{MappingResult, MappingStoreError};

/// One journaled mutation of the mapping table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingOp {
    /// Upsert the row for `path`.
    Store {
        path: StoragePath,
        key: ObjectKey,
        version: Option<ObjectVersion>,
        at: DateTime<Utc>,
    },
    /// Soft-delete the active row for `path`.
    MarkDeleted { path: StoragePath, at: DateTime<Utc> },
}

/// When journal writes reach stable storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// `fsync` after every append.
    EveryWrite,
    /// Flush to the OS and let it decide.
    #[default]
    OsDefault,
}

/// Journal configuration.
#[derive(Clone, Debug, Default)]
pub struct JournalConfig {
    pub sync_mode: SyncMode,
}

const HEADER_SIZE: u64 = 8;

struct JournalWriter {
    writer: BufWriter<File>,
    offset: u64,
    /// Set when a failed append could not be undone; every later append
    /// is refused.
    damaged: bool,
}

/// Crash-recoverable mapping journal.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    config: JournalConfig,
    #[cfg(test)]
    fail_next_append: AtomicBool,
}

impl Journal {
    /// Open (or create) the journal at `path` and recover its operations.
    ///
    /// A torn tail left by a crash is cut off so later appends start on a
    /// frame boundary. Damage anywhere else fails with
    /// [`MappingStoreError::Corrupt`].
    pub fn open(path: &Path, config: JournalConfig) -> MappingResult<(Self, Vec<MappingOp>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;

        let (ops, valid_len) = recover(path)?;
        let file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "truncating torn journal tail");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let journal = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(open_writer(path)?),
            config,
            #[cfg(test)]
            fail_next_append: AtomicBool::new(false),
        };
        info!(path = %path.display(), ops = ops.len(), "mapping journal opened");
        Ok((journal, ops))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one operation. The operation is durable per the configured
    /// [`SyncMode`] when this returns.
    ///
    /// A failed append is cut back off the file, so the journal never keeps
    /// a partial frame in front of later ones.
    pub fn append(&self, op: &MappingOp) -> MappingResult<u64> {
        let frame = encode(op)?;
        let mut w = self.lock()?;
        if w.damaged {
            return Err(MappingStoreError::Unavailable(format!(
                "journal {} is damaged by an earlier failed append",
                self.path.display()
            )));
        }
        let offset = w.offset;
        if let Err(e) = self.write_frame(&mut w, &frame) {
            warn!(offset, error = %e, "journal append failed; rolling back");
            if let Err(rollback) = self.roll_back(&mut w, offset) {
                error!(offset, error = %rollback, "journal rollback failed");
                w.damaged = true;
            }
            return Err(e.into());
        }
        w.offset += frame.len() as u64;
        debug!(offset, len = frame.len(), "journal append");
        Ok(offset)
    }

    fn write_frame(&self, w: &mut JournalWriter, frame: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_next_append.swap(false, Ordering::SeqCst) {
            w.writer.write_all(&frame[..frame.len() / 2])?;
            w.writer.flush()?;
            return Err(io::Error::other("injected append failure"));
        }
        w.writer.write_all(frame)?;
        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Cut the file back to `offset` and reopen the writer there. Bytes
    /// still buffered from the failed append are discarded, not flushed.
    fn roll_back(&self, w: &mut JournalWriter, offset: u64) -> MappingResult<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(offset)?;
        file.sync_all()?;
        let fresh = open_writer(&self.path)?;
        let failed = std::mem::replace(w, fresh);
        let (_file, _unflushed) = failed.writer.into_parts();
        Ok(())
    }

    /// Replace the journal with `ops`, typically a snapshot of the live table.
    ///
    /// The snapshot is written next to the journal and renamed over it.
    pub fn rewrite(&self, ops: &[MappingOp]) -> MappingResult<()> {
        let mut w = self.lock()?;
        let tmp = self.path.with_extension("compact");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for op in ops {
                out.write_all(&encode(op)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let fresh = open_writer(&self.path)?;
        let (_file, _unflushed) = std::mem::replace(&mut *w, fresh).writer.into_parts();
        info!(path = %self.path.display(), ops = ops.len(), bytes = w.offset, "journal compacted");
        Ok(())
    }

    /// Current size of the journal in bytes.
    pub fn len(&self) -> MappingResult<u64> {
        Ok(self.lock()?.offset)
    }

    pub fn is_empty(&self) -> MappingResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> MappingResult<std::sync::MutexGuard<'_, JournalWriter>> {
        self.writer
            .lock()
            .map_err(|_| MappingStoreError::Unavailable("journal lock poisoned".into()))
    }
}

fn open_writer(path: &Path) -> MappingResult<JournalWriter> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.metadata()?.len();
    Ok(JournalWriter {
        writer: BufWriter::new(file),
        offset,
        damaged: false,
    })
}

fn encode(op: &MappingOp) -> MappingResult<Vec<u8>> {
    let payload =
        bincode::serialize(op).map_err(|e| MappingStoreError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(HEADER_SIZE as usize + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read every valid frame. Returns the operations and the byte length of the
/// well-formed prefix.
///
/// A frame running past the end of the file, or a damaged final frame, ends
/// recovery. A damaged frame followed by more data is an error.
fn recover(path: &Path) -> MappingResult<(Vec<MappingOp>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut ops = Vec::new();
    let mut offset = 0u64;
    let corrupt = |offset: u64, reason: String| MappingStoreError::Corrupt {
        path: path.display().to_string(),
        offset,
        reason,
    };

    while offset + HEADER_SIZE <= file_len {
        let mut header = [0u8; HEADER_SIZE as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if offset + HEADER_SIZE + u64::from(length) > file_len {
            warn!(offset, length, file_len, "journal frame runs past end of file; stopping recovery");
            break;
        }
        let next = offset + HEADER_SIZE + u64::from(length);
        let is_last = next == file_len;
        if length == 0 {
            if is_last {
                warn!(offset, "empty final journal frame; stopping recovery");
                break;
            }
            return Err(corrupt(offset, "empty frame".into()));
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated journal frame; stopping recovery");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            if is_last {
                warn!(offset, expected = expected_crc, actual = actual_crc, "torn final journal frame; stopping recovery");
                break;
            }
            return Err(corrupt(
                offset,
                format!("CRC mismatch (expected {expected_crc:08x}, found {actual_crc:08x})"),
            ));
        }
        match bincode::deserialize::<MappingOp>(&payload) {
            Ok(op) => ops.push(op),
            Err(e) if is_last => {
                warn!(offset, error = %e, "undecodable final journal frame; stopping recovery");
                break;
            }
            Err(e) => return Err(corrupt(offset, format!("undecodable frame: {e}"))),
        }
        offset = next;
    }

    debug!(recovered = ops.len(), valid_len = offset, "journal recovery complete");
    Ok((ops, offset))
}
