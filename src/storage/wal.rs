//! Append-only log of raw command frames.
//!
//! Every mutating command is appended verbatim and synchronized before
//! the engine advances the checkpoint stored in the meta page. The log
//! is bounded by rotation: once it outgrows the threshold, the bytes
//! past the checkpoint are carried over into a fresh log.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;
use crate::storage::sync::sync_file;

pub struct Wal {
    file: File,
    len: u64,
}

impl Wal {
    pub fn open(path: &Path) -> Result<Wal> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Wal { file, len })
    }

    /// Current log length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one command frame and synchronize. Returns the new log
    /// length, which becomes the checkpoint once the caller stores it.
    pub fn append(&mut self, frame: &[u8]) -> Result<u64> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(frame)?;
        sync_file(&self.file)?;
        self.len += frame.len() as u64;
        Ok(self.len)
    }

    /// Read everything from `offset` to the end of the log.
    pub fn read_from(&mut self, offset: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if offset >= self.len {
            return Ok(buf);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Rotate: carry the bytes past `checkpoint` into a fresh log. The
    /// caller resets the stored checkpoint to zero afterwards so replay
    /// still covers the carried tail.
    pub fn rotate(&mut self, checkpoint: u64) -> Result<()> {
        let tail = self.read_from(checkpoint)?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&tail)?;
        sync_file(&self.file)?;
        self.len = tail.len() as u64;
        tracing::debug!(carried = self.len, "rotated WAL");
        Ok(())
    }

    /// Truncate to zero after a completed replay.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        sync_file(&self.file)?;
        self.len = 0;
        Ok(())
    }
}
