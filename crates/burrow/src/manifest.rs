//! Epoch manifest: the record of tables emitted per sealed epoch.
//!
//! One record is appended per epoch seal (empty epochs included):
//!
//! ```text
//! epoch varint | entry_count varint
//!   { partition varint,
//!     table_handle (offset varint, length varint),
//!     filter_handle (offset varint, length varint),
//!     first_key_len varint, first_key,
//!     last_key_len varint, last_key }*
//! ```
//!
//! Records are self-delimiting, so the stream needs no framing. At
//! `finish` a 16-byte terminal footer is appended:
//! `total_bytes_written u64 LE | manifest_magic u64 LE`. A manifest
//! without the footer belongs to a writer that never finished; its
//! records are still readable.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::format::{get_varint64, put_varint64, BlockHandle, MANIFEST_MAGIC};
use crate::options::DirStats;
use crate::storage::WritableStream;

/// Terminal footer length.
pub const MANIFEST_FOOTER_SIZE: usize = 16;

/// Where one table of one partition lives, and its key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Partition that produced the table.
    pub partition: u32,
    /// Whole-table region within the partition's file.
    pub table_handle: BlockHandle,
    /// Filter block region (zero-length when filtering is off).
    pub filter_handle: BlockHandle,
    /// Smallest key in the table.
    pub first_key: Vec<u8>,
    /// Largest key in the table.
    pub last_key: Vec<u8>,
}

/// All tables sealed under one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    /// The sealed epoch.
    pub epoch: u64,
    /// Tables in schedule order, grouped by partition.
    pub entries: Vec<IndexEntry>,
}

impl EpochRecord {
    fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.epoch);
        put_varint64(dst, self.entries.len() as u64);
        for entry in &self.entries {
            put_varint64(dst, u64::from(entry.partition));
            entry.table_handle.encode_to(dst);
            entry.filter_handle.encode_to(dst);
            put_varint64(dst, entry.first_key.len() as u64);
            dst.extend_from_slice(&entry.first_key);
            put_varint64(dst, entry.last_key.len() as u64);
            dst.extend_from_slice(&entry.last_key);
        }
    }

    fn decode_from(src: &[u8]) -> Result<(Self, usize)> {
        let mut at = 0;
        let (epoch, n) = get_varint64(&src[at..])?;
        at += n;
        let (count, n) = get_varint64(&src[at..])?;
        at += n;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (partition, n) = get_varint64(&src[at..])?;
            at += n;
            let (table_handle, n) = BlockHandle::decode_from(&src[at..])?;
            at += n;
            let (filter_handle, n) = BlockHandle::decode_from(&src[at..])?;
            at += n;
            let (first_key, n) = decode_key(&src[at..])?;
            at += n;
            let (last_key, n) = decode_key(&src[at..])?;
            at += n;
            entries.push(IndexEntry {
                partition: partition as u32,
                table_handle,
                filter_handle,
                first_key,
                last_key,
            });
        }
        Ok((Self { epoch, entries }, at))
    }
}

fn decode_key(src: &[u8]) -> Result<(Vec<u8>, usize)> {
    let (len, n) = get_varint64(src)?;
    let end = n + len as usize;
    if end > src.len() {
        return Err(Error::Corruption("manifest key overruns record".to_string()));
    }
    Ok((src[n..end].to_vec(), end))
}

/// Appends epoch records to the manifest stream, buffered until the
/// low watermark so tiny epochs do not trigger writes of their own.
pub struct ManifestWriter {
    sink: Box<dyn WritableStream>,
    stats: Arc<DirStats>,
    staging: Vec<u8>,
    min_flush: usize,
}

impl ManifestWriter {
    /// Creates a writer over `sink` flushing at the `min_flush`
    /// watermark.
    pub fn new(sink: Box<dyn WritableStream>, stats: Arc<DirStats>, min_flush: usize) -> Self {
        Self {
            sink,
            stats,
            staging: Vec::new(),
            min_flush,
        }
    }

    /// Appends the record for one sealed epoch.
    pub fn append_epoch(&mut self, record: &EpochRecord) -> Result<()> {
        record.encode_to(&mut self.staging);
        debug!(
            epoch = record.epoch,
            tables = record.entries.len(),
            "epoch sealed"
        );
        if self.staging.len() >= self.min_flush {
            self.write_through()?;
        }
        Ok(())
    }

    /// Pushes staged records down to storage.
    pub fn flush(&mut self) -> Result<()> {
        self.write_through()?;
        self.sink.flush()
    }

    /// Writes the terminal footer carrying the directory's byte counter
    /// and forces everything to durable storage.
    pub fn finish(&mut self, total_bytes_written: u64) -> Result<()> {
        self.staging
            .extend_from_slice(&total_bytes_written.to_le_bytes());
        self.staging.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
        self.write_through()?;
        self.sink.sync()
    }

    fn write_through(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.staging)?;
        self.stats.add_bytes_written(self.staging.len() as u64);
        self.staging.clear();
        Ok(())
    }
}

/// A fully parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Epoch records in seal order.
    pub epochs: Vec<EpochRecord>,
    /// Byte counter from the terminal footer; `None` when the writer
    /// never finished.
    pub total_bytes_written: Option<u64>,
}

impl Manifest {
    /// Parses a manifest stream.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (body, total_bytes_written) = if data.len() >= MANIFEST_FOOTER_SIZE
            && data[data.len() - 8..] == MANIFEST_MAGIC.to_le_bytes()
        {
            let footer_at = data.len() - MANIFEST_FOOTER_SIZE;
            let total =
                u64::from_le_bytes(data[footer_at..footer_at + 8].try_into().unwrap());
            (&data[..footer_at], Some(total))
        } else {
            (data, None)
        };

        let mut epochs = Vec::new();
        let mut at = 0;
        while at < body.len() {
            let (record, n) = EpochRecord::decode_from(&body[at..])?;
            epochs.push(record);
            at += n;
        }
        Ok(Self {
            epochs,
            total_bytes_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl WritableStream for SharedBuf {
        fn append(&mut self, data: &[u8]) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn sync(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(partition: u32, offset: u64) -> IndexEntry {
        IndexEntry {
            partition,
            table_handle: BlockHandle::new(offset, 128),
            filter_handle: BlockHandle::new(offset + 100, 16),
            first_key: b"aaa".to_vec(),
            last_key: b"zzz".to_vec(),
        }
    }

    #[test]
    fn test_roundtrip_with_footer() {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let mut writer = ManifestWriter::new(
            Box::new(SharedBuf(Arc::clone(&bytes))),
            Arc::new(DirStats::new()),
            0,
        );

        let records = vec![
            EpochRecord {
                epoch: 0,
                entries: vec![entry(0, 0), entry(1, 0)],
            },
            EpochRecord {
                epoch: 1,
                entries: Vec::new(),
            },
            EpochRecord {
                epoch: 2,
                entries: vec![entry(0, 128)],
            },
        ];
        for record in &records {
            writer.append_epoch(record).unwrap();
        }
        writer.finish(4096).unwrap();

        let manifest = Manifest::decode(&bytes.lock().unwrap()).unwrap();
        assert_eq!(manifest.epochs, records);
        assert_eq!(manifest.total_bytes_written, Some(4096));
    }

    #[test]
    fn test_unfinished_manifest_still_readable() {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let mut writer = ManifestWriter::new(
            Box::new(SharedBuf(Arc::clone(&bytes))),
            Arc::new(DirStats::new()),
            0,
        );
        let record = EpochRecord {
            epoch: 0,
            entries: vec![entry(0, 0)],
        };
        writer.append_epoch(&record).unwrap();
        writer.flush().unwrap();
        // No finish(): the footer is absent.

        let manifest = Manifest::decode(&bytes.lock().unwrap()).unwrap();
        assert_eq!(manifest.epochs, vec![record]);
        assert_eq!(manifest.total_bytes_written, None);
    }

    #[test]
    fn test_empty_epoch_record_kept() {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let mut writer = ManifestWriter::new(
            Box::new(SharedBuf(Arc::clone(&bytes))),
            Arc::new(DirStats::new()),
            0,
        );
        writer
            .append_epoch(&EpochRecord {
                epoch: 0,
                entries: Vec::new(),
            })
            .unwrap();
        writer.finish(0).unwrap();

        let manifest = Manifest::decode(&bytes.lock().unwrap()).unwrap();
        assert_eq!(manifest.epochs.len(), 1);
        assert!(manifest.epochs[0].entries.is_empty());
    }

    #[test]
    fn test_watermark_defers_writes() {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let mut writer = ManifestWriter::new(
            Box::new(SharedBuf(Arc::clone(&bytes))),
            Arc::new(DirStats::new()),
            1 << 20,
        );
        writer
            .append_epoch(&EpochRecord {
                epoch: 0,
                entries: vec![entry(0, 0)],
            })
            .unwrap();
        // Under the watermark nothing reaches the sink.
        assert!(bytes.lock().unwrap().is_empty());
        writer.flush().unwrap();
        assert!(!bytes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let mut writer = ManifestWriter::new(
            Box::new(SharedBuf(Arc::clone(&bytes))),
            Arc::new(DirStats::new()),
            0,
        );
        writer
            .append_epoch(&EpochRecord {
                epoch: 0,
                entries: vec![entry(0, 0)],
            })
            .unwrap();
        writer.flush().unwrap();

        let mut data = bytes.lock().unwrap().clone();
        data.truncate(data.len() - 2);
        assert!(matches!(
            Manifest::decode(&data),
            Err(Error::Corruption(_))
        ));
    }
}
