//! Side I/O log: an append-only auxiliary byte stream.
//!
//! The side log coexists with the key/value path but has its own buffer
//! and its own flush/finish cycle, reusing the double-buffering core
//! with a degenerate partition count of one. Appends accumulate in a
//! staging area; only once `min_data_buffer` bytes are pending does a
//! chunk enter the pipeline (an internal `TryAgain` marks the
//! under-watermark case and is never surfaced). Epoch seals force the
//! staging area down regardless of the watermark so byte offsets stay
//! recoverable.

use std::sync::{Arc, Mutex};

use crate::buffering::{Backend, DoubleBuffering};
use crate::error::{Error, Result};
use crate::options::{DirOptions, DirStats};
use crate::pool::ThreadPool;
use crate::storage::WritableStream;

/// One rotation buffer of raw side bytes.
#[derive(Debug, Default)]
pub struct SideBuffer {
    bytes: Vec<u8>,
}

/// Backend writing side buffers straight through to the log file.
pub struct SideLogBackend {
    sink: Mutex<Box<dyn WritableStream>>,
    stats: Arc<DirStats>,
    capacity: usize,
}

impl Backend for SideLogBackend {
    type Buffer = SideBuffer;

    fn add_to_buffer(&self, buf: &mut SideBuffer, key: &[u8], _value: &[u8]) {
        buf.bytes.extend_from_slice(key);
    }

    fn has_room(&self, buf: &SideBuffer, key: &[u8], _value: &[u8]) -> bool {
        buf.bytes.len() + key.len() <= self.capacity
    }

    fn is_empty(&self, buf: &SideBuffer) -> bool {
        buf.bytes.is_empty()
    }

    fn compact(&self, buf: &mut SideBuffer) -> Result<()> {
        if buf.bytes.is_empty() {
            return Ok(());
        }
        let mut sink = self.sink.lock().unwrap();
        sink.append(&buf.bytes)?;
        self.stats.add_bytes_written(buf.bytes.len() as u64);
        Ok(())
    }

    fn clear(&self, buf: &mut SideBuffer) {
        buf.bytes.clear();
    }

    fn sync_backend(&self, closing: bool) -> Result<()> {
        let mut sink = self.sink.lock().unwrap();
        if closing {
            sink.flush()?;
        }
        sink.sync()
    }
}

/// The producer-facing side log.
pub struct SideLog {
    core: DoubleBuffering<SideLogBackend>,
    staging: Vec<u8>,
    min_flush: usize,
    chunk_limit: usize,
    total_appended: u64,
}

impl SideLog {
    /// Creates a side log over `sink` with budgets from `options`.
    pub fn new(
        options: &DirOptions,
        sink: Box<dyn WritableStream>,
        stats: Arc<DirStats>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        // The data buffer splits across the rotation pair.
        let capacity = (options.data_buffer / 2).max(options.min_data_buffer);
        let backend = SideLogBackend {
            sink: Mutex::new(sink),
            stats,
            capacity,
        };
        Self {
            core: DoubleBuffering::new(
                backend,
                vec![SideBuffer::default(), SideBuffer::default()],
                pool,
            ),
            staging: Vec::new(),
            min_flush: options.min_data_buffer,
            chunk_limit: capacity,
            total_appended: 0,
        }
    }

    /// Appends opaque bytes to the stream.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.staging.extend_from_slice(data);
        self.total_appended += data.len() as u64;
        match self.stage(false) {
            Err(Error::TryAgain) => Ok(()), // Below watermark, stays in memory.
            other => other,
        }
    }

    /// Hands the staging area to the pipeline. Without `force`, refuses
    /// (with `TryAgain`) while under the low watermark. Oversized
    /// staging is split so every chunk fits an empty rotation buffer.
    fn stage(&mut self, force: bool) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        if !force && self.staging.len() < self.min_flush {
            return Err(Error::TryAgain);
        }
        for chunk in self.staging.chunks(self.chunk_limit) {
            self.core.add(chunk, &[])?;
        }
        self.staging.clear();
        Ok(())
    }

    /// Seals buffered bytes into the pipeline and optionally waits for
    /// the write to land.
    pub fn flush(&mut self, wait: bool) -> Result<()> {
        self.stage(true)?;
        self.core.flush(wait)
    }

    /// Flushes and forces bytes to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.stage(true)?;
        self.core.sync(true)
    }

    /// Finalizes the stream. Idempotent like the core's `finish`.
    pub fn finish(&mut self) -> Result<()> {
        // A poisoned or finished pipeline reports through finish().
        let _ = self.stage(true);
        self.core.finish()
    }

    /// Total bytes accepted by `append`.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskFs, Fs};
    use tempfile::TempDir;

    fn side_log(options: &DirOptions, dir: &TempDir) -> SideLog {
        let sink = DiskFs.create(&dir.path().join("side.log")).unwrap();
        SideLog::new(
            options,
            sink,
            Arc::new(DirStats::new()),
            Arc::new(ThreadPool::fixed(1)),
        )
    }

    #[test]
    fn test_append_flush_finish() {
        let dir = TempDir::new().unwrap();
        let options = DirOptions::default();
        let mut log = side_log(&options, &dir);

        for chunk in [b"a", b"b", b"c", b"x", b"y", b"z"] {
            log.append(chunk).unwrap();
        }
        log.finish().unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("side.log")).unwrap(),
            b"abcxyz"
        );
        assert_eq!(log.total_appended(), 6);
    }

    #[test]
    fn test_small_appends_stay_in_memory() {
        let dir = TempDir::new().unwrap();
        let options = DirOptions::default(); // 64 KiB watermark
        let mut log = side_log(&options, &dir);

        log.append(b"tiny").unwrap();
        // Nothing staged to the pipeline, nothing on storage yet.
        assert!(std::fs::read(dir.path().join("side.log")).unwrap().is_empty());

        log.flush(true).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("side.log")).unwrap(),
            b"tiny"
        );
        log.finish().unwrap();
    }

    #[test]
    fn test_watermark_releases_large_appends() {
        let dir = TempDir::new().unwrap();
        let mut options = DirOptions::default();
        options.min_data_buffer = 8;
        options.data_buffer = 64;
        let mut log = side_log(&options, &dir);

        log.append(&[b'x'; 32]).unwrap();
        log.flush(true).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("side.log")).unwrap().len(),
            32
        );
        log.finish().unwrap();
    }

    #[test]
    fn test_finish_idempotent() {
        let dir = TempDir::new().unwrap();
        let options = DirOptions::default();
        let mut log = side_log(&options, &dir);
        log.append(b"data").unwrap();
        log.finish().unwrap();
        assert_eq!(log.finish(), Err(Error::already_finished()));
    }
}
