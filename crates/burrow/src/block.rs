//! Block building and decoding.
//!
//! A block is a run of records followed by a trailer. In variable-size
//! mode records are length-prefixed and restart offsets are recorded
//! every `RESTART_INTERVAL` keys so point lookups can binary-search to
//! the right run before scanning. In fixed-size mode records are tightly
//! packed at declared widths and restart tracking is omitted.
//!
//! ```text
//! variable: [ entries .. ] [ restart_0 u32 .. restart_n u32 ] [ n u32 ]
//!           [ compression u8 ] [ crc32 u32 ]
//! fixed:    [ entries .. ] [ compression u8 ] [ crc32 u32 ]
//! ```
//!
//! Snappy is applied per block when requested: always under
//! `force_compression`, otherwise only when it saves at least an eighth
//! of the payload.

use crate::error::{Error, Result};
use crate::format::{self, block_crc, Compression, BLOCK_TRAILER_SIZE};

/// Restart point spacing for variable-size blocks.
pub const RESTART_INTERVAL: usize = 16;

/// Record layout within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// Length-prefixed records with restart offsets.
    Variable,
    /// Packed records at declared widths, no restarts.
    Fixed {
        /// Declared key width in bytes.
        key_size: usize,
        /// Declared value width in bytes.
        value_size: usize,
    },
}

/// Serializes a run of records into one block.
#[derive(Debug)]
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    num_entries: usize,
    mode: RecordMode,
}

impl BlockBuilder {
    /// Creates a builder for the given record mode.
    pub fn new(mode: RecordMode) -> Self {
        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            counter: 0,
            num_entries: 0,
            mode,
        }
    }

    /// Appends one record. Records must arrive in the table's intended
    /// order; the builder does not sort.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        match self.mode {
            RecordMode::Variable => {
                if self.counter == 0 {
                    self.restarts.push(self.buf.len() as u32);
                }
                self.counter = (self.counter + 1) % RESTART_INTERVAL;
                format::put_varint64(&mut self.buf, key.len() as u64);
                self.buf.extend_from_slice(key);
                format::put_varint64(&mut self.buf, value.len() as u64);
                self.buf.extend_from_slice(value);
            }
            RecordMode::Fixed { key_size, value_size } => {
                debug_assert_eq!(key.len(), key_size);
                debug_assert_eq!(value.len(), value_size);
                self.buf.extend_from_slice(key);
                self.buf.extend_from_slice(value);
            }
        }
        self.num_entries += 1;
    }

    /// Returns true if no records have been added.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Number of records added so far.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Estimated finished size, restart array and trailer included.
    pub fn size_estimate(&self) -> usize {
        let restarts = match self.mode {
            RecordMode::Variable => (self.restarts.len() + 1) * 4,
            RecordMode::Fixed { .. } => 0,
        };
        self.buf.len() + restarts + BLOCK_TRAILER_SIZE
    }

    /// Finishes the block: appends the restart array (variable mode),
    /// applies compression policy, and attaches the trailer. With
    /// `pad_to` set, the result is zero-padded to the next multiple.
    /// The builder is left empty and reusable; the returned
    /// `unpadded_len` is the length a reader's handle must cover.
    pub fn finish(
        &mut self,
        compression: Compression,
        force_compression: bool,
        pad_to: Option<usize>,
    ) -> Result<FinishedBlock> {
        let mut payload = std::mem::take(&mut self.buf);
        if let RecordMode::Variable = self.mode {
            for &restart in &self.restarts {
                payload.extend_from_slice(&restart.to_le_bytes());
            }
            payload.extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        }
        self.restarts.clear();
        self.counter = 0;
        self.num_entries = 0;

        let (tag, body) = match compression {
            Compression::None => (Compression::None, payload),
            Compression::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(&payload)
                    .map_err(|e| Error::Io(format!("snappy compression failed: {e}")))?;
                // Store compressed only when it pays for itself.
                if force_compression || compressed.len() < payload.len() - payload.len() / 8 {
                    (Compression::Snappy, compressed)
                } else {
                    (Compression::None, payload)
                }
            }
        };

        let crc = block_crc(&body, tag);
        let mut data = body;
        data.push(tag as u8);
        data.extend_from_slice(&crc.to_le_bytes());

        let unpadded_len = data.len();
        if let Some(align) = pad_to {
            let rem = data.len() % align;
            if rem != 0 {
                data.resize(data.len() + align - rem, 0);
            }
        }

        Ok(FinishedBlock { data, unpadded_len })
    }
}

/// Output of `BlockBuilder::finish`.
#[derive(Debug)]
pub struct FinishedBlock {
    /// Bytes to write to storage, padding included.
    pub data: Vec<u8>,
    /// Length the block handle covers (trailer included, padding not).
    pub unpadded_len: usize,
}

/// A decoded block ready for lookups and scans.
#[derive(Debug)]
pub struct Block {
    payload: Vec<u8>,
    restarts: Vec<u32>,
    mode: RecordMode,
}

impl Block {
    /// Decodes a block from the bytes a handle covers. Verifies the
    /// trailer CRC when `verify_checksums` is set and decompresses
    /// according to the trailer tag.
    pub fn decode(data: &[u8], mode: RecordMode, verify_checksums: bool) -> Result<Self> {
        if data.len() < BLOCK_TRAILER_SIZE {
            return Err(Error::Corruption("block shorter than trailer".to_string()));
        }
        let body_len = data.len() - BLOCK_TRAILER_SIZE;
        let body = &data[..body_len];
        let tag = Compression::from_u8(data[body_len])?;
        if verify_checksums {
            let stored = u32::from_le_bytes(data[body_len + 1..].try_into().unwrap());
            let actual = block_crc(body, tag);
            if stored != actual {
                return Err(Error::Corruption(format!(
                    "block checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
                )));
            }
        }

        let mut payload = match tag {
            Compression::None => body.to_vec(),
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|e| Error::Corruption(format!("snappy decompression failed: {e}")))?,
        };

        let restarts = match mode {
            RecordMode::Variable => {
                if payload.len() < 4 {
                    return Err(Error::Corruption("block missing restart count".to_string()));
                }
                let count_at = payload.len() - 4;
                let count =
                    u32::from_le_bytes(payload[count_at..].try_into().unwrap()) as usize;
                let array_len = count
                    .checked_mul(4)
                    .ok_or_else(|| Error::Corruption("restart count overflow".to_string()))?;
                if count_at < array_len {
                    return Err(Error::Corruption(
                        "block shorter than restart array".to_string(),
                    ));
                }
                let array_at = count_at - array_len;
                let restarts = payload[array_at..count_at]
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                payload.truncate(array_at);
                restarts
            }
            RecordMode::Fixed { .. } => Vec::new(),
        };

        Ok(Self {
            payload,
            restarts,
            mode,
        })
    }

    /// Iterates all records in block order.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            offset: 0,
        }
    }

    /// Collects every value stored under `key`, in block order. Works
    /// for both ordered and unordered blocks; ordered blocks start the
    /// scan at the restart run that may contain the key.
    pub fn get_all(&self, key: &[u8], ordered: bool, out: &mut Vec<Vec<u8>>) -> Result<()> {
        let start = if ordered { self.seek_restart(key)? } else { 0 };
        let mut iter = BlockIter {
            block: self,
            offset: start,
        };
        for entry in &mut iter {
            let (entry_key, value) = entry?;
            if entry_key == key {
                out.push(value.to_vec());
            } else if ordered && entry_key > key {
                break;
            }
        }
        Ok(())
    }

    /// Binary-searches the restart array for the last restart whose key
    /// is <= `key`, returning its payload offset.
    fn seek_restart(&self, key: &[u8]) -> Result<usize> {
        if self.restarts.is_empty() {
            return Ok(0);
        }
        let mut lo = 0usize;
        let mut hi = self.restarts.len();
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            let offset = self.restarts[mid] as usize;
            let (restart_key, _, _) = read_entry(&self.payload, offset, self.mode)?;
            if restart_key <= key {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(self.restarts[lo] as usize)
    }
}

fn read_entry(payload: &[u8], offset: usize, mode: RecordMode) -> Result<(&[u8], &[u8], usize)> {
    match mode {
        RecordMode::Variable => {
            let (key_len, n) = format::get_varint64(&payload[offset..])?;
            let key_start = offset + n;
            let key_end = key_start + key_len as usize;
            if key_end > payload.len() {
                return Err(Error::Corruption("record key overruns block".to_string()));
            }
            let (value_len, m) = format::get_varint64(&payload[key_end..])?;
            let value_start = key_end + m;
            let value_end = value_start + value_len as usize;
            if value_end > payload.len() {
                return Err(Error::Corruption("record value overruns block".to_string()));
            }
            Ok((
                &payload[key_start..key_end],
                &payload[value_start..value_end],
                value_end,
            ))
        }
        RecordMode::Fixed { key_size, value_size } => {
            let key_end = offset + key_size;
            let value_end = key_end + value_size;
            if value_end > payload.len() {
                return Err(Error::Corruption("record overruns block".to_string()));
            }
            Ok((&payload[offset..key_end], &payload[key_end..value_end], value_end))
        }
    }
}

/// Iterator over a decoded block's records.
pub struct BlockIter<'a> {
    block: &'a Block,
    offset: usize,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.payload.len() {
            return None;
        }
        match read_entry(&self.block.payload, self.offset, self.block.mode) {
            Ok((key, value, next)) => {
                self.offset = next;
                Some(Ok((key, value)))
            }
            Err(e) => {
                self.offset = self.block.payload.len();
                Some(Err(e))
            }
        }
    }
}
