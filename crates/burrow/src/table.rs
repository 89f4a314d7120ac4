//! Table building: data blocks, filter block, index block, footer.
//!
//! One `TableBuilder` is bound to a partition's output file for the life
//! of the directory and emits a sequence of immutable tables, each laid
//! out as:
//!
//! ```text
//! [ data_block_0 ] .. [ data_block_n-1 ]
//! [ filter_block ]
//! [ index_block  ]
//! [ footer: filter_handle | index_handle | magic | table_len ]
//! ```
//!
//! Handles are byte offsets into the partition's file; consecutive
//! tables are concatenated with no intervening padding unless block
//! padding is enabled. Finished blocks are batched in memory and pushed
//! to storage once `block_batch_size` bytes accumulate.

use std::sync::Arc;

use crate::block::{BlockBuilder, RecordMode};
use crate::error::{Error, Result};
use crate::filter::FilterBuilder;
use crate::format::{block_crc, BlockHandle, Compression, Footer, TABLE_MAGIC, TABLE_MAGIC_LEVELDB};
use crate::options::{DirOptions, DirStats};
use crate::storage::WritableStream;

/// Where a finished table lives and what its key range is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Whole-table region, footer included.
    pub table_handle: BlockHandle,
    /// Filter block region (zero-length when filtering is off).
    pub filter_handle: BlockHandle,
    /// Smallest key in the table (first inserted in unordered mode).
    pub smallest_key: Vec<u8>,
    /// Largest key in the table (last inserted in unordered mode).
    pub largest_key: Vec<u8>,
    /// Number of records.
    pub num_entries: u64,
}

/// Streams sorted records into tables on one partition's file.
pub struct TableBuilder {
    sink: Box<dyn WritableStream>,
    stats: Arc<DirStats>,
    mode: RecordMode,
    block_size: usize,
    block_batch_size: usize,
    compression: Compression,
    force_compression: bool,
    index_compression: Compression,
    padding: Option<usize>,
    magic: u64,
    ordered: bool,
    paranoid_checks: bool,

    file_offset: u64,
    pending: Vec<u8>,

    // Per-table state, reset by `finish_table`.
    data_block: BlockBuilder,
    filter: FilterBuilder,
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    block_first_key: Option<Vec<u8>>,
    smallest_key: Option<Vec<u8>>,
    largest_key: Vec<u8>,
    num_entries: u64,
    misordered: bool,
}

impl TableBuilder {
    /// Binds a builder to a partition's output stream.
    pub fn new(options: &DirOptions, sink: Box<dyn WritableStream>, stats: Arc<DirStats>) -> Self {
        let mode = if options.fixed_kv {
            RecordMode::Fixed {
                key_size: options.key_size,
                value_size: options.value_size,
            }
        } else {
            RecordMode::Variable
        };
        Self {
            sink,
            stats,
            mode,
            block_size: options.block_size,
            block_batch_size: options.block_batch_size,
            compression: options.compression,
            force_compression: options.force_compression,
            index_compression: if options.index_compression {
                options.compression
            } else {
                Compression::None
            },
            padding: options.block_padding.then_some(options.block_size),
            magic: if options.leveldb_compatible {
                TABLE_MAGIC_LEVELDB
            } else {
                TABLE_MAGIC
            },
            ordered: !options.unordered,
            paranoid_checks: options.paranoid_checks,
            file_offset: 0,
            pending: Vec::new(),
            data_block: BlockBuilder::new(mode),
            filter: FilterBuilder::from_options(options),
            index_entries: Vec::new(),
            block_first_key: None,
            smallest_key: None,
            largest_key: Vec::new(),
            num_entries: 0,
            misordered: false,
        }
    }

    /// Appends one record to the table under construction. Records must
    /// arrive sorted unless the directory is unordered.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.ordered && !self.largest_key.is_empty() && key < self.largest_key.as_slice() {
            self.misordered = true;
        }
        if self.smallest_key.is_none() {
            self.smallest_key = Some(key.to_vec());
        }
        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
        }
        self.largest_key.clear();
        self.largest_key.extend_from_slice(key);

        self.filter.add_key(key);
        self.data_block.add(key, value);
        self.num_entries += 1;

        if self.data_block.size_estimate() >= self.block_size {
            self.cut_data_block()?;
        }
        Ok(())
    }

    /// Finishes the data block in progress and records its index entry.
    fn cut_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let finished =
            self.data_block
                .finish(self.compression, self.force_compression, self.padding)?;
        let handle = BlockHandle::new(self.file_offset, finished.unpadded_len as u64);
        self.stats.add_data_bytes(finished.unpadded_len as u64);
        self.file_offset += finished.data.len() as u64;
        self.pending.extend_from_slice(&finished.data);

        let first_key = self
            .block_first_key
            .take()
            .expect("non-empty block has a first key");
        self.index_entries.push((first_key, handle));

        if self.pending.len() >= self.block_batch_size {
            self.write_through()?;
        }
        Ok(())
    }

    /// Appends a raw (uncompressed) block with the standard trailer.
    fn append_raw_block(&mut self, payload: &[u8]) -> BlockHandle {
        let crc = block_crc(payload, Compression::None);
        let start = self.file_offset;
        self.pending.extend_from_slice(payload);
        self.pending.push(Compression::None as u8);
        self.pending.extend_from_slice(&crc.to_le_bytes());
        let length = payload.len() as u64 + crate::format::BLOCK_TRAILER_SIZE as u64;
        self.file_offset += length;
        BlockHandle::new(start, length)
    }

    /// Seals the table under construction. Returns `None` when nothing
    /// was added (an empty compaction writes nothing).
    pub fn finish_table(&mut self) -> Result<Option<TableMeta>> {
        if self.num_entries == 0 {
            return Ok(None);
        }
        if self.misordered {
            self.misordered = false;
            if self.paranoid_checks {
                return Err(Error::AssertionFailed(
                    "table records left sort order".to_string(),
                ));
            }
        }
        let table_start = self
            .index_entries
            .first()
            .map(|(_, handle)| handle.offset)
            .unwrap_or(self.file_offset);
        self.cut_data_block()?;

        // Filter block.
        let filter_payload = self.filter.finish();
        let filter_handle = if filter_payload.is_empty() {
            BlockHandle::default()
        } else {
            let handle = self.append_raw_block(&filter_payload);
            self.stats.add_filter_bytes(handle.length);
            handle
        };

        // Index block: (first key of block, encoded handle) records.
        let mut index_block = BlockBuilder::new(RecordMode::Variable);
        for (first_key, handle) in self.index_entries.drain(..) {
            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            index_block.add(&first_key, &encoded);
        }
        let finished_index = index_block.finish(self.index_compression, false, None)?;
        let index_handle = BlockHandle::new(self.file_offset, finished_index.unpadded_len as u64);
        self.stats.add_index_bytes(finished_index.unpadded_len as u64);
        self.file_offset += finished_index.data.len() as u64;
        self.pending.extend_from_slice(&finished_index.data);

        // Footer closes the table.
        let table_len =
            self.file_offset + crate::format::FOOTER_SIZE as u64 - table_start;
        let footer = Footer {
            filter_handle,
            index_handle,
            magic: self.magic,
            table_len,
        };
        let encoded = footer.encode();
        self.file_offset += encoded.len() as u64;
        self.pending.extend_from_slice(&encoded);

        // Keep table starts aligned when padding is on.
        if let Some(align) = self.padding {
            let rem = (self.file_offset % align as u64) as usize;
            if rem != 0 {
                let pad = align - rem;
                self.pending.resize(self.pending.len() + pad, 0);
                self.file_offset += pad as u64;
            }
        }
        self.write_through()?;

        let meta = TableMeta {
            table_handle: BlockHandle::new(table_start, table_len),
            filter_handle,
            smallest_key: self.smallest_key.take().unwrap_or_default(),
            largest_key: std::mem::take(&mut self.largest_key),
            num_entries: self.num_entries,
        };
        self.num_entries = 0;
        self.block_first_key = None;
        Ok(Some(meta))
    }

    /// Pushes batched bytes down to storage.
    fn write_through(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.pending)?;
        self.stats.add_bytes_written(self.pending.len() as u64);
        self.pending.clear();
        Ok(())
    }

    /// Forces written bytes to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.write_through()?;
        self.sink.sync()
    }

    /// Total cuckoo victims spilled by this partition's filters.
    pub fn num_victims(&self) -> u64 {
        self.filter.num_victims()
    }
}
