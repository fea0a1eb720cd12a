//! Persistent spill buffer for raw oplog frames.
//!
//! A queue is a pair of files under the log directory: `<name>.dat` holds
//! length-and-CRC framed payloads, `<name>.meta.dat` a small JSON record
//! `{name, queryTs}` where `queryTs` is the newest spilled timestamp, i.e.
//! the point the live fetch resumes from after the spill is drained.
//!
//! The writer appends while the document phase runs; the reader replays
//! sequentially from the start. Replaying frames at or before the persisted
//! checkpoint is harmless, the destination apply is idempotent.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{ReplError, Result};

const FRAME_HEADER_LEN: u64 = 8;
const FLUSH_EVERY: usize = 64;

#[derive(Serialize, Deserialize, Debug)]
struct DiskQueueMeta {
    name: String,
    #[serde(rename = "queryTs")]
    query_ts: u64,
}

pub struct DiskQueue {
    name: String,
    dat_path: PathBuf,
    meta_path: PathBuf,
    writer: BufWriter<File>,
    reader: File,
    read_pos: u64,
    flushed_len: u64,
    unflushed: usize,
    newest_ts: u64,
}

fn dat_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.dat", name))
}

/// Length of the longest prefix of `dat` made of whole frames.
fn scan_whole_frames(dat: &Path, file_len: u64) -> Result<u64> {
    let mut scan = File::open(dat)?;
    let mut valid_len = 0u64;
    let mut header = [0u8; 8];
    loop {
        if valid_len + FRAME_HEADER_LEN > file_len {
            break;
        }
        scan.seek(SeekFrom::Start(valid_len))?;
        if scan.read_exact(&mut header).is_err() {
            break;
        }
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        if valid_len + FRAME_HEADER_LEN + len > file_len {
            break;
        }
        valid_len += FRAME_HEADER_LEN + len;
    }
    Ok(valid_len)
}

fn meta_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.meta.dat", name))
}

impl DiskQueue {
    /// Create a fresh queue, truncating any leftover files of the same name.
    pub fn create(log_dir: &Path, name: &str) -> Result<DiskQueue> {
        std::fs::create_dir_all(log_dir)?;
        let dat = dat_path(log_dir, name);
        let meta = meta_path(log_dir, name);
        let write_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&dat)?;
        let read_file = File::open(&dat)?;
        let mut queue = DiskQueue {
            name: name.to_string(),
            dat_path: dat,
            meta_path: meta,
            writer: BufWriter::new(write_file),
            reader: read_file,
            read_pos: 0,
            flushed_len: 0,
            unflushed: 0,
            newest_ts: 0,
        };
        queue.write_meta()?;
        Ok(queue)
    }

    /// Re-attach an existing queue after a restart. The whole spill is
    /// replayed from the beginning.
    pub fn open(log_dir: &Path, name: &str) -> Result<DiskQueue> {
        let dat = dat_path(log_dir, name);
        let meta = meta_path(log_dir, name);
        let meta_doc: DiskQueueMeta = serde_json::from_str(&std::fs::read_to_string(&meta)?)
            .map_err(|_| ReplError::DiskQueueCorrupt {
                name: name.to_string(),
                offset: 0,
            })?;
        let write_file = OpenOptions::new().append(true).open(&dat)?;
        let file_len = write_file.metadata()?.len();
        // a crash mid-write leaves a partial tail frame; it was never
        // acknowledged, so it is cut before new frames append after it
        let flushed_len = scan_whole_frames(&dat, file_len)?;
        if flushed_len < file_len {
            tracing::warn!(
                name,
                offset = flushed_len,
                "disk queue tail is truncated, discarding partial frame"
            );
            write_file.set_len(flushed_len)?;
        }
        let mut read_file = File::open(&dat)?;
        read_file.seek(SeekFrom::Start(0))?;
        Ok(DiskQueue {
            name: name.to_string(),
            dat_path: dat,
            meta_path: meta,
            writer: BufWriter::new(write_file),
            reader: read_file,
            read_pos: 0,
            flushed_len,
            unflushed: 0,
            newest_ts: meta_doc.query_ts,
        })
    }

    /// Whether a queue of this name left its metadata behind.
    pub fn meta_exists(log_dir: &Path, name: &str) -> bool {
        meta_path(log_dir, name).exists()
    }

    /// Resume timestamp recorded in the metadata file; 0 when the queue was
    /// never created or already drained and removed.
    pub fn read_query_ts(log_dir: &Path, name: &str) -> u64 {
        std::fs::read_to_string(meta_path(log_dir, name))
            .ok()
            .and_then(|s| serde_json::from_str::<DiskQueueMeta>(&s).ok())
            .map(|m| m.query_ts)
            .unwrap_or(0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Newest spilled timestamp.
    pub fn query_ts(&self) -> u64 {
        self.newest_ts
    }

    pub fn append(&mut self, raw: &[u8], ts: u64) -> Result<()> {
        let crc = crc32c::crc32c(raw);
        self.writer.write_all(&(raw.len() as u32).to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(raw)?;
        self.newest_ts = ts;
        self.unflushed += 1;
        if self.unflushed >= FLUSH_EVERY {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.unflushed == 0 {
            return Ok(());
        }
        self.writer.flush()?;
        self.flushed_len = self.writer.get_ref().metadata()?.len();
        self.unflushed = 0;
        self.write_meta()
    }

    fn write_meta(&self) -> Result<()> {
        let meta = DiskQueueMeta {
            name: self.name.clone(),
            query_ts: self.newest_ts,
        };
        std::fs::write(&self.meta_path, serde_json::to_string(&meta).unwrap_or_default())?;
        Ok(())
    }

    /// Next frame, or `None` when every flushed frame has been replayed.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_pos + FRAME_HEADER_LEN > self.flushed_len {
            return Ok(None);
        }
        let mut header = [0u8; 8];
        self.reader.read_exact(&mut header)?;
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if self.read_pos + FRAME_HEADER_LEN + len as u64 > self.flushed_len {
            return Err(ReplError::DiskQueueCorrupt {
                name: self.name.clone(),
                offset: self.read_pos,
            });
        }
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        if crc32c::crc32c(&payload) != crc {
            return Err(ReplError::DiskQueueCorrupt {
                name: self.name.clone(),
                offset: self.read_pos,
            });
        }
        self.read_pos += FRAME_HEADER_LEN + len as u64;
        Ok(Some(payload))
    }

    /// Whether the reader has consumed everything, flushed or not.
    pub fn is_drained(&self) -> bool {
        self.unflushed == 0 && self.read_pos >= self.flushed_len
    }

    /// Delete both files. Consumes the queue.
    pub fn remove(self) -> Result<()> {
        drop(self.writer);
        drop(self.reader);
        std::fs::remove_file(&self.dat_path)?;
        std::fs::remove_file(&self.meta_path)?;
        Ok(())
    }
}
