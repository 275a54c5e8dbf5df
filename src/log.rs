//! Append-only log writer.
//!
//! The log is the source of truth: every other piece of state (index,
//! Merkle accumulator, epoch table) is a derived view that can be rebuilt
//! from it. Writers serialize through an exclusive advisory file lock with
//! jittered exponential backoff; readers never take the lock.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use fs2::FileExt;
use rand::Rng;

use crate::errors::{LedgerError, Result};

const MAX_LOCK_ATTEMPTS: u32 = 10;
const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 500;

/// Append-only JSONL log file.
pub struct LedgerLog {
    path: PathBuf,
}

impl LedgerLog {
    /// Opens (without creating) a handle to the log at `path`. The file is
    /// created lazily on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LedgerLog { path: path.into() }
    }

    /// The path to the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one canonical-JSON line, returning the byte offset at which
    /// it was written.
    ///
    /// Acquires an exclusive lock with jittered exponential backoff
    /// (10ms -> 500ms, capped at 10 attempts) before writing, flushes and
    /// fsyncs before releasing the lock, so a successful return means the
    /// entry is durable.
    pub fn append(&self, line: &[u8]) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        acquire_exclusive_with_backoff(&file)?;
        let result = (|| -> Result<u64> {
            let offset = file.seek(SeekFrom::End(0))?;
            file.write_all(line)?;
            file.write_all(b"\n")?;
            file.flush()?;
            file.sync_all()?;
            Ok(offset)
        })();
        let _ = FileExt::unlock(&file);
        result
    }

    /// Streams every line in the log, in order, calling `visit` with each
    /// line's 0-indexed position and raw bytes (without the trailing
    /// newline). Used by the Verifier and repair tooling; never takes the
    /// write lock.
    pub fn for_each_line(&self, mut visit: impl FnMut(u64, &[u8]) -> Result<()>) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            visit(index as u64, line.as_bytes())?;
        }
        Ok(())
    }

    /// Streams every line along with the byte offset at which it starts
    /// in the file, rather than its sequential line index. This is the
    /// offset [`LedgerLog::append`] returned when the line was written,
    /// and is what [`crate::index::IndexEntry::ledger_offset`] must match
    /// whether the row came from a live write or a rebuild from the log.
    pub fn for_each_line_with_byte_offset(
        &self,
        mut visit: impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;
        loop {
            let mut buf = Vec::new();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            let line_start = offset;
            offset += read as u64;
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }
            visit(line_start, &buf)?;
        }
        Ok(())
    }

    /// Reads every line into memory. Convenience wrapper over
    /// [`LedgerLog::for_each_line`] for tooling that needs random access
    /// (parallel replay, snapshot export).
    pub fn read_all_lines(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        self.for_each_line(|_, bytes| {
            lines.push(String::from_utf8_lossy(bytes).into_owned());
            Ok(())
        })?;
        Ok(lines)
    }

    /// The number of entries currently in the log.
    pub fn len(&self) -> Result<u64> {
        let mut count = 0u64;
        self.for_each_line(|_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Whether the log has any entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn acquire_exclusive_with_backoff(file: &File) -> Result<()> {
    let mut attempt = 0u32;
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    loop {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(_) if attempt + 1 >= MAX_LOCK_ATTEMPTS => {
                return Err(LedgerError::LockTimeout {
                    attempts: attempt + 1,
                });
            }
            Err(_) => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2 + 1);
                sleep(Duration::from_millis(backoff_ms + jitter));
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}
