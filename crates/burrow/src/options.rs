//! Directory configuration and shared counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::format::Compression;
use crate::storage::Fs;

/// Which filter variant tables carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    /// No filter block; point lookups scan tables.
    None,
    /// Bloom filter, sized by `bf_bits_per_key`.
    #[default]
    Bloom,
    /// Cuckoo filter with fingerprint/value bit widths from
    /// `cuckoo_fp_bits` / `cuckoo_value_bits`.
    Cuckoo,
}

/// Validated configuration bundle for a directory.
///
/// Defaults favor the bursty write-heavy workload the store is built
/// for; every knob has a `with_*` builder method.
#[derive(Debug, Clone)]
pub struct DirOptions {
    /// log2 of the partition count (P). Each key is routed to one of
    /// `2^P` partitions by its hash.
    pub lg_parts: u8,
    /// Total in-memory budget in bytes, divided across partitions and
    /// the two buffers of each partition's double-buffering pair.
    pub total_memtable_budget: usize,
    /// Approximate size of one data block.
    pub block_size: usize,
    /// Zero-pad each block to the next `block_size` multiple.
    pub block_padding: bool,
    /// Bytes of finished blocks batched in memory before a single
    /// write-through to storage.
    pub block_batch_size: usize,
    /// Per-block compression for data blocks.
    pub compression: Compression,
    /// Compress every block even when the compressed form is not smaller.
    pub force_compression: bool,
    /// Also compress index blocks.
    pub index_compression: bool,
    /// Filter variant for emitted tables.
    pub filter: FilterKind,
    /// Bloom bits per key. Zero disables filtering regardless of
    /// `filter` (lookups fall back to table iteration).
    pub bf_bits_per_key: usize,
    /// Target occupancy of the main cuckoo table, in (0, 1].
    pub cuckoo_frac: f64,
    /// Cuckoo fingerprint width in bits.
    pub cuckoo_fp_bits: u8,
    /// Cuckoo per-key value width in bits (0 when unused).
    pub cuckoo_value_bits: u8,
    /// Fixed-size record mode: keys and values are stored without
    /// length prefixes at the declared widths.
    pub fixed_kv: bool,
    /// Declared key size for fixed-size mode.
    pub key_size: usize,
    /// Declared value size for fixed-size mode.
    pub value_size: usize,
    /// Stamp tables with the LevelDB-compatible magic.
    pub leveldb_compatible: bool,
    /// Keys are unique within the directory. Duplicate detection only
    /// happens in ordered mode; see `unordered`.
    pub unique_keys: bool,
    /// Skip sorting at compaction time. Tables are indexed by position
    /// only and point lookups rely on the filter plus a block scan.
    /// Uniqueness is not verified in this mode.
    pub unordered: bool,
    /// Total side-log write buffer in bytes.
    pub data_buffer: usize,
    /// Low watermark below which side-log flushes stay in memory.
    pub min_data_buffer: usize,
    /// Manifest/index stream buffer in bytes.
    pub index_buffer: usize,
    /// Low watermark below which manifest flushes stay in memory.
    pub min_index_buffer: usize,
    /// Verify block checksums on read.
    pub verify_checksums: bool,
    /// Run extra internal validation (e.g. index ordering re-checks)
    /// during compactions.
    pub paranoid_checks: bool,
    /// Rank of the producing process, used in file names so ranks can
    /// share a directory.
    pub rank: u32,
    /// Storage capability used for all file creation. Defaults to the
    /// local disk.
    pub fs: Arc<dyn Fs>,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            lg_parts: 0,
            total_memtable_budget: 4 << 20,
            block_size: 32 << 10,
            block_padding: false,
            block_batch_size: 2 << 20,
            compression: Compression::None,
            force_compression: false,
            index_compression: false,
            filter: FilterKind::Bloom,
            bf_bits_per_key: 8,
            cuckoo_frac: 0.95,
            cuckoo_fp_bits: 16,
            cuckoo_value_bits: 0,
            fixed_kv: false,
            key_size: 8,
            value_size: 32,
            leveldb_compatible: false,
            unique_keys: true,
            unordered: false,
            data_buffer: 4 << 20,
            min_data_buffer: 64 << 10,
            index_buffer: 2 << 20,
            min_index_buffer: 64 << 10,
            verify_checksums: false,
            paranoid_checks: false,
            rank: 0,
            fs: Arc::new(crate::storage::DiskFs),
        }
    }
}

impl DirOptions {
    /// Creates options from defaults plus the diagnostic environment
    /// variables: `COMPRESSION=snappy|none`, `SNAPPY=1`,
    /// `FORCE_COMPRESSION=1`, `INDEX_COMPRESSION=1`,
    /// `BF_BITS_PER_KEY=<n>`.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(v) = std::env::var("COMPRESSION") {
            if v.eq_ignore_ascii_case("snappy") {
                options.compression = Compression::Snappy;
            }
        }
        if env_flag("SNAPPY") {
            options.compression = Compression::Snappy;
        }
        if env_flag("FORCE_COMPRESSION") {
            options.force_compression = true;
        }
        if env_flag("INDEX_COMPRESSION") {
            options.index_compression = true;
        }
        if let Ok(v) = std::env::var("BF_BITS_PER_KEY") {
            if let Ok(bits) = v.parse() {
                options.bf_bits_per_key = bits;
            }
        }
        options
    }

    /// Sets the partition count exponent.
    pub fn with_lg_parts(mut self, lg_parts: u8) -> Self {
        self.lg_parts = lg_parts;
        self
    }

    /// Sets the total memtable budget in bytes.
    pub fn with_memtable_budget(mut self, bytes: usize) -> Self {
        self.total_memtable_budget = bytes;
        self
    }

    /// Sets the data block size in bytes.
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Selects the filter variant.
    pub fn with_filter(mut self, filter: FilterKind) -> Self {
        self.filter = filter;
        self
    }

    /// Enables fixed-size record mode with the given widths.
    pub fn with_fixed_kv(mut self, key_size: usize, value_size: usize) -> Self {
        self.fixed_kv = true;
        self.key_size = key_size;
        self.value_size = value_size;
        self
    }

    /// Returns the partition count, `2^lg_parts`.
    pub fn num_parts(&self) -> usize {
        1usize << self.lg_parts
    }

    /// Returns the byte budget of one write buffer: the total budget
    /// split across partitions, halved for the double-buffer pair.
    pub fn per_buffer_budget(&self) -> usize {
        self.total_memtable_budget / self.num_parts() / 2
    }

    /// Validates the bundle, returning `InvalidArgument` on nonsense.
    pub fn validate(&self) -> Result<()> {
        if self.lg_parts > 8 {
            return Err(Error::InvalidArgument(format!(
                "lg_parts {} exceeds maximum of 8",
                self.lg_parts
            )));
        }
        if self.total_memtable_budget == 0 {
            return Err(Error::InvalidArgument(
                "total_memtable_budget must be non-zero".to_string(),
            ));
        }
        if self.per_buffer_budget() < 512 {
            return Err(Error::InvalidArgument(format!(
                "memtable budget {} too small for {} partitions",
                self.total_memtable_budget,
                self.num_parts()
            )));
        }
        if self.block_size == 0 || self.block_batch_size == 0 {
            return Err(Error::InvalidArgument(
                "block_size and block_batch_size must be non-zero".to_string(),
            ));
        }
        if self.fixed_kv && (self.key_size == 0 || self.value_size == 0) {
            return Err(Error::InvalidArgument(
                "fixed_kv requires non-zero key_size and value_size".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cuckoo_frac) || self.cuckoo_frac == 0.0 {
            return Err(Error::InvalidArgument(format!(
                "cuckoo_frac {} outside (0, 1]",
                self.cuckoo_frac
            )));
        }
        if self.cuckoo_fp_bits == 0 || self.cuckoo_fp_bits > 32 {
            return Err(Error::InvalidArgument(format!(
                "cuckoo_fp_bits {} outside [1, 32]",
                self.cuckoo_fp_bits
            )));
        }
        if self.cuckoo_value_bits > 32 {
            return Err(Error::InvalidArgument(format!(
                "cuckoo_value_bits {} exceeds 32",
                self.cuckoo_value_bits
            )));
        }
        if self.min_data_buffer > self.data_buffer {
            return Err(Error::InvalidArgument(
                "min_data_buffer exceeds data_buffer".to_string(),
            ));
        }
        if self.min_index_buffer > self.index_buffer {
            return Err(Error::InvalidArgument(
                "min_index_buffer exceeds index_buffer".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true if tables carry a filter block.
    pub fn filtering_enabled(&self) -> bool {
        match self.filter {
            FilterKind::None => false,
            FilterKind::Bloom => self.bf_bits_per_key > 0,
            FilterKind::Cuckoo => true,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true"))
}

/// Monotone counters exposed to callers. Counters stay readable after
/// the writer is poisoned; they report last-known values.
#[derive(Debug, Default)]
pub struct DirStats {
    /// Total bytes handed to storage across all files.
    pub total_bytes_written: AtomicU64,
    /// Bytes of finished data blocks.
    pub sstable_data_bytes: AtomicU64,
    /// Bytes of finished filter blocks.
    pub sstable_filter_bytes: AtomicU64,
    /// Bytes of finished index blocks.
    pub sstable_index_bytes: AtomicU64,
    /// Sum of key and value lengths accepted from the caller.
    pub total_user_data: AtomicU64,
    /// Number of keys accepted from the caller.
    pub num_keys: AtomicU64,
    /// Cuckoo fingerprints that overflowed the main table.
    pub num_victims: AtomicU64,
}

impl DirStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds to the bytes-written counter.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.total_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the data-block byte counter.
    pub fn add_data_bytes(&self, bytes: u64) {
        self.sstable_data_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the filter-block byte counter.
    pub fn add_filter_bytes(&self, bytes: u64) {
        self.sstable_filter_bytes
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the index-block byte counter.
    pub fn add_index_bytes(&self, bytes: u64) {
        self.sstable_index_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one accepted record's user bytes.
    pub fn add_user_data(&self, bytes: u64) {
        self.total_user_data.fetch_add(bytes, Ordering::Relaxed);
        self.num_keys.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the cuckoo victim counter.
    pub fn add_victims(&self, count: u64) {
        self.num_victims.fetch_add(count, Ordering::Relaxed);
    }

    /// Total bytes handed to storage.
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written.load(Ordering::Relaxed)
    }

    /// Bytes of finished data blocks.
    pub fn sstable_data_bytes(&self) -> u64 {
        self.sstable_data_bytes.load(Ordering::Relaxed)
    }

    /// Bytes of finished filter blocks.
    pub fn sstable_filter_bytes(&self) -> u64 {
        self.sstable_filter_bytes.load(Ordering::Relaxed)
    }

    /// Bytes of finished index blocks.
    pub fn sstable_index_bytes(&self) -> u64 {
        self.sstable_index_bytes.load(Ordering::Relaxed)
    }

    /// Sum of key and value lengths accepted.
    pub fn total_user_data(&self) -> u64 {
        self.total_user_data.load(Ordering::Relaxed)
    }

    /// Number of keys accepted.
    pub fn num_keys(&self) -> u64 {
        self.num_keys.load(Ordering::Relaxed)
    }

    /// Cuckoo fingerprints that overflowed the main table.
    pub fn num_victims(&self) -> u64 {
        self.num_victims.load(Ordering::Relaxed)
    }
}
