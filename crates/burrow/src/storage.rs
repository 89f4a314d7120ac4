//! Narrow storage capability used by the write path.
//!
//! The store assumes file naming, creation, and fsync are provided from
//! outside; this module defines that seam and a local-disk default.
//! Tests inject throttled or failing streams through the same trait to
//! exercise back-pressure and poisoning.

use std::fmt::Debug;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// An append-only stream of bytes backed by storage.
pub trait WritableStream: Send {
    /// Appends `data` to the stream.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes buffered bytes down to the operating system.
    fn flush(&mut self) -> Result<()>;

    /// Forces written bytes to durable storage.
    fn sync(&mut self) -> Result<()>;
}

/// Factory for writable streams.
pub trait Fs: Send + Sync + Debug {
    /// Creates (truncating) the file at `path` for appending.
    fn create(&self, path: &Path) -> Result<Box<dyn WritableStream>>;
}

/// Local-disk storage.
#[derive(Debug, Default)]
pub struct DiskFs;

impl Fs for DiskFs {
    fn create(&self, path: &Path) -> Result<Box<dyn WritableStream>> {
        let file = File::create(path)?;
        Ok(Box::new(DiskStream {
            writer: BufWriter::new(file),
        }))
    }
}

struct DiskStream {
    writer: BufWriter<File>,
}

impl WritableStream for DiskStream {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
