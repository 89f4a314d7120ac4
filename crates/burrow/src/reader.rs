//! Directory reader: point lookups over sealed epochs plus side reads.
//!
//! The reader replays the manifest, then answers `read_all` by probing
//! every table of the key's partition in epoch order: filter first,
//! then the table's index block, then the candidate data blocks.
//! Matching values concatenate in insertion order across tables and
//! epochs. A directory with filtering disabled falls back to block
//! iteration, so lookups still succeed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::block::{Block, RecordMode};
use crate::error::{Error, Result};
use crate::filter;
use crate::format::{block_crc, BlockHandle, Compression, Footer, BLOCK_TRAILER_SIZE, FOOTER_SIZE};
use crate::manifest::{IndexEntry, Manifest};
use crate::options::DirOptions;
use crate::writer::{key_partition, manifest_file_name, side_file_name, table_file_name};

/// The read half of a directory, opened after the writer finished (or
/// at least sealed the epochs of interest).
pub struct DirReader {
    options: DirOptions,
    manifest: Manifest,
    tables: Vec<Mutex<File>>,
    side: PathBuf,
    mode: RecordMode,
}

impl DirReader {
    /// Opens a directory for reading. Options must match the writer's.
    pub fn open(options: DirOptions, dir: impl AsRef<Path>) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref();

        let manifest_path = dir.join(manifest_file_name(options.rank));
        let manifest_bytes = std::fs::read(&manifest_path)
            .map_err(|e| Error::NotFound(format!("manifest {}: {e}", manifest_path.display())))?;
        let manifest = Manifest::decode(&manifest_bytes)?;

        let mut tables = Vec::with_capacity(options.num_parts());
        for partition in 0..options.num_parts() {
            let path = dir.join(table_file_name(options.rank, partition));
            tables.push(Mutex::new(File::open(&path)?));
        }

        let mode = if options.fixed_kv {
            RecordMode::Fixed {
                key_size: options.key_size,
                value_size: options.value_size,
            }
        } else {
            RecordMode::Variable
        };
        Ok(Self {
            side: dir.join(side_file_name(options.rank)),
            options,
            manifest,
            tables,
            mode,
        })
    }

    /// The parsed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Concatenates every value stored under `key`, in insertion order
    /// across all sealed epochs. Returns empty bytes for a missing key.
    pub fn read_all(&self, key: &[u8]) -> Result<Vec<u8>> {
        let partition = key_partition(key, self.options.lg_parts);
        let ordered = !self.options.unordered;
        let mut out = Vec::new();

        for record in &self.manifest.epochs {
            for entry in &record.entries {
                if entry.partition as usize != partition {
                    continue;
                }
                if ordered
                    && (key < entry.first_key.as_slice() || key > entry.last_key.as_slice())
                {
                    continue;
                }
                if !self.filter_admits(partition, entry, key)? {
                    continue;
                }
                self.read_from_table(partition, entry, key, ordered, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Probes the table's filter block; true means the key may be there.
    fn filter_admits(&self, partition: usize, entry: &IndexEntry, key: &[u8]) -> Result<bool> {
        if entry.filter_handle.is_empty() {
            return Ok(true);
        }
        let raw = self.read_range(partition, entry.filter_handle)?;
        if raw.len() < BLOCK_TRAILER_SIZE {
            return Err(Error::Corruption("filter block truncated".to_string()));
        }
        let payload = &raw[..raw.len() - BLOCK_TRAILER_SIZE];
        if self.options.verify_checksums {
            let stored =
                u32::from_le_bytes(raw[raw.len() - 4..].try_into().unwrap());
            let actual = block_crc(payload, Compression::None);
            if stored != actual {
                return Err(Error::Corruption("filter checksum mismatch".to_string()));
            }
        }
        Ok(filter::may_contain(self.options.filter, payload, key))
    }

    /// Collects `key`'s values from one table.
    fn read_from_table(
        &self,
        partition: usize,
        entry: &IndexEntry,
        key: &[u8],
        ordered: bool,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let table = entry.table_handle;
        if table.length < FOOTER_SIZE as u64 {
            return Err(Error::Corruption("table shorter than footer".to_string()));
        }
        let footer_at = table.offset + table.length - FOOTER_SIZE as u64;
        let footer_bytes =
            self.read_range(partition, BlockHandle::new(footer_at, FOOTER_SIZE as u64))?;
        let footer = Footer::decode(&footer_bytes)?;

        let index_bytes = self.read_range(partition, footer.index_handle)?;
        let index_block =
            Block::decode(&index_bytes, RecordMode::Variable, self.options.verify_checksums)?;
        let mut blocks = Vec::new();
        for record in index_block.iter() {
            let (first_key, encoded) = record?;
            let (handle, _) = BlockHandle::decode_from(encoded)?;
            blocks.push((first_key.to_vec(), handle));
        }

        // Candidate blocks: with sorted tables, the last block that
        // starts below the key plus every block that starts on it
        // (duplicates of one key may span block boundaries). Unordered
        // tables scan everything.
        let start = if ordered {
            blocks
                .partition_point(|(first_key, _)| first_key.as_slice() < key)
                .saturating_sub(1)
        } else {
            0
        };
        for (index, (first_key, handle)) in blocks.iter().enumerate().skip(start) {
            if ordered && index > start && first_key.as_slice() > key {
                break;
            }
            let data = self.read_range(partition, *handle)?;
            let block = Block::decode(&data, self.mode, self.options.verify_checksums)?;
            let mut values = Vec::new();
            block.get_all(key, ordered, &mut values)?;
            for value in values {
                out.extend_from_slice(&value);
            }
        }
        Ok(())
    }

    /// Reads `[offset, offset + len)` of the side I/O stream.
    pub fn read_side(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(&self.side)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|e| Error::Corruption(format!("side read past end: {e}")))?;
        Ok(data)
    }

    fn read_range(&self, partition: usize, handle: BlockHandle) -> Result<Vec<u8>> {
        let mut file = self.tables[partition].lock().unwrap();
        file.seek(SeekFrom::Start(handle.offset))?;
        let mut data = vec![0u8; handle.length as usize];
        file.read_exact(&mut data)
            .map_err(|e| Error::Corruption(format!("table read past end: {e}")))?;
        Ok(data)
    }
}
