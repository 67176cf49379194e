//! Write-ahead log: a single append-only framed record stream used to
//! rebuild the active memtable after a crash.
//!
//! Single file at `<walDirectory>/wal.log`, opened in create+append+write
//! mode. Every record is framed as `[outerCrc32][payloadLen][payload]`
//! (`src/codec.rs`); recovery tolerates a corrupt or partial tail without
//! losing any earlier, valid frame.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{
    self, CodecError, Record, ValueOrTombstone, WalRecord, WAL_FRAME_HEADER_LEN,
    WAL_MAX_PAYLOAD_LEN,
};
use crate::memtable::Memtable;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Counts produced by [`Wal::recover`], reported rather than raised as
/// an error (spec §9: WAL recovery returns a report, not an error,
/// unless I/O itself fails).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: u64,
    pub corrupted: u64,
}

pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
    next_sequence: AtomicU64,
    sync_immediate: bool,
}

impl Wal {
    pub fn open(wal_directory: impl AsRef<Path>, sync_immediate: bool) -> Result<Self, WalError> {
        let dir = wal_directory.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("wal.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Wal {
            file: Mutex::new(file),
            path,
            next_sequence: AtomicU64::new(1),
            sync_immediate,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Encodes and appends a WAL record; forces to disk when configured
    /// for immediate sync. Returns the sequence number assigned to this
    /// record.
    pub fn append(&self, key: Vec<u8>, value: ValueOrTombstone) -> Result<u64, WalError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let wal_record = WalRecord {
            timestamp: Self::now_millis(),
            sequence,
            record: Record { key, value },
        };
        let payload = codec::encode_wal_payload(&wal_record);
        let frame = codec::encode_wal_frame(&payload);

        let mut file = self.file.lock().expect("wal lock poisoned");
        file.write_all(&frame)?;
        if self.sync_immediate {
            file.sync_all()?;
        }
        Ok(sequence)
    }

    /// Scans from offset 0 applying every well-formed frame to `memtable`.
    /// Stops (without error) on a frame header claiming an out-of-range
    /// length, or on a truncated tail; skips (and counts as corrupted,
    /// then continues) a frame whose payload fails its CRC32 or fails to
    /// decode.
    pub fn recover(&self, memtable: &Memtable) -> Result<RecoveryReport, WalError> {
        let mut report = RecoveryReport::default();

        let mut file = self.file.lock().expect("wal lock poisoned");
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(report);
        }
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(len as usize);
        file.read_to_end(&mut bytes)?;
        // Leave the cursor positioned for subsequent appends.
        file.seek(SeekFrom::End(0))?;
        drop(file);

        let mut offset = 0usize;
        loop {
            if offset + WAL_FRAME_HEADER_LEN > bytes.len() {
                break; // graceful EOF
            }
            let header = codec::decode_wal_frame_header(&bytes[offset..offset + WAL_FRAME_HEADER_LEN])?;
            if header.payload_len == 0 || header.payload_len > WAL_MAX_PAYLOAD_LEN {
                warn!(payload_len = header.payload_len, "wal recovery: rejecting out-of-range frame length, stopping");
                break;
            }
            let payload_start = offset + WAL_FRAME_HEADER_LEN;
            let payload_end = payload_start + header.payload_len;
            if payload_end > bytes.len() {
                debug!("wal recovery: partial tail frame, stopping");
                break;
            }
            let payload = &bytes[payload_start..payload_end];

            if !codec::validate_wal_frame(&header, payload) {
                warn!("wal recovery: frame checksum mismatch, skipping frame");
                report.corrupted += 1;
                offset = payload_end;
                continue;
            }

            match codec::decode_wal_payload(payload) {
                Ok(wal_record) => {
                    match wal_record.record.value {
                        ValueOrTombstone::Value(v) => memtable.put(wal_record.record.key, v),
                        ValueOrTombstone::Tombstone => memtable.delete(wal_record.record.key),
                    }
                    memtable.observe_sequence(wal_record.sequence);
                    report.recovered += 1;
                }
                Err(_) => {
                    warn!("wal recovery: payload failed to decode, skipping frame");
                    report.corrupted += 1;
                }
            }
            offset = payload_end;
        }

        info!(recovered = report.recovered, corrupted = report.corrupted, "wal recovery complete");
        Ok(report)
    }

    /// After a successful flush, forces the channel and truncates to
    /// zero length, if truncation is enabled.
    pub fn truncate(&self) -> Result<(), WalError> {
        let file = self.file.lock().expect("wal lock poisoned");
        file.sync_all()?;
        file.set_len(0)?;
        drop(file);
        let mut file = self.file.lock().expect("wal lock poisoned");
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Copies the current file to `<path>.backup`, then truncates the
    /// live file to zero length.
    pub fn repair(&self) -> Result<PathBuf, WalError> {
        let backup_path = {
            let mut p = self.path.clone().into_os_string();
            p.push(".backup");
            PathBuf::from(p)
        };
        fs::copy(&self.path, &backup_path)?;
        self.truncate()?;
        info!(backup = %backup_path.display(), "wal repaired");
        Ok(backup_path)
    }
}
