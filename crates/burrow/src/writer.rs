//! Partitioned directory writer: the top of the write path.
//!
//! At open the writer instantiates `2^P` partition slots, each with its
//! own double-buffering core over a write-buffer pair and a table
//! builder bound to that partition's file. Keys route to partitions by
//! the high-order P bits of their xxh64. Epoch seals drain every
//! partition, drive a side-log flush, and append one manifest record;
//! any background failure poisons the writer and every subsequent call
//! returns that first error.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::buffering::{Backend, DoubleBuffering};
use crate::error::{Error, Result};
use crate::manifest::{EpochRecord, IndexEntry, ManifestWriter};
use crate::memtable::WriteBuffer;
use crate::options::{DirOptions, DirStats};
use crate::pool::ThreadPool;
use crate::sidelog::SideLog;
use crate::table::{TableBuilder, TableMeta};

/// Name of one partition's table file.
pub(crate) fn table_file_name(rank: u32, partition: usize) -> String {
    format!("part-{rank}-{partition:02x}.tbl")
}

/// Name of the manifest stream.
pub(crate) fn manifest_file_name(rank: u32) -> String {
    format!("manifest-{rank}.log")
}

/// Name of the side I/O log.
pub(crate) fn side_file_name(rank: u32) -> String {
    format!("side-{rank}.dat")
}

/// Routes a key to its partition: the high-order P bits of xxh64.
pub(crate) fn key_partition(key: &[u8], lg_parts: u8) -> usize {
    if lg_parts == 0 {
        0
    } else {
        (xxh64(key, 0) >> (64 - lg_parts)) as usize
    }
}

/// Per-partition storage hooks for the double-buffering core.
struct PartitionBackend {
    table: Mutex<TableBuilder>,
    /// Tables sealed since the last epoch seal, in schedule order.
    sealed: Mutex<Vec<TableMeta>>,
    stats: Arc<DirStats>,
    unordered: bool,
    reject_duplicates: bool,
}

impl Backend for PartitionBackend {
    type Buffer = WriteBuffer;

    fn add_to_buffer(&self, buf: &mut WriteBuffer, key: &[u8], value: &[u8]) {
        buf.add(key, value);
    }

    fn has_room(&self, buf: &WriteBuffer, key: &[u8], value: &[u8]) -> bool {
        buf.has_room(key, value)
    }

    fn is_empty(&self, buf: &WriteBuffer) -> bool {
        buf.is_empty()
    }

    fn compact(&self, buf: &mut WriteBuffer) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        buf.finish_and_sort(self.unordered);

        let mut table = self.table.lock().unwrap();
        let victims_before = table.num_victims();
        let mut prev_key: Option<Vec<u8>> = None;
        for (key, value) in buf.iter() {
            if self.reject_duplicates {
                if prev_key.as_deref() == Some(key) {
                    return Err(Error::InvalidArgument(format!(
                        "duplicate key {:?} in unique-keys directory",
                        String::from_utf8_lossy(key)
                    )));
                }
                prev_key = Some(key.to_vec());
            }
            table.add(key, value)?;
        }
        let meta = table.finish_table()?;
        self.stats
            .add_victims(table.num_victims() - victims_before);
        drop(table);

        if let Some(meta) = meta {
            self.sealed.lock().unwrap().push(meta);
        }
        Ok(())
    }

    fn clear(&self, buf: &mut WriteBuffer) {
        buf.clear();
    }

    fn sync_backend(&self, _closing: bool) -> Result<()> {
        self.table.lock().unwrap().sync()
    }
}

/// The write half of a directory: open → append/flush cycles → finish.
pub struct DirWriter {
    options: DirOptions,
    stats: Arc<DirStats>,
    partitions: Vec<DoubleBuffering<PartitionBackend>>,
    side: SideLog,
    manifest: ManifestWriter,
    current_epoch: u64,
    sticky: Option<Error>,
    finished: bool,
    dir: PathBuf,
}

impl DirWriter {
    /// Opens a directory for writing, creating the on-storage files and
    /// the compaction thread pool (one worker per partition).
    pub fn open(options: DirOptions, dir: impl AsRef<Path>) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let stats = Arc::new(DirStats::new());
        let pool = Arc::new(ThreadPool::fixed(options.num_parts()));

        let make_buffer = || {
            if options.fixed_kv {
                WriteBuffer::with_fixed_records(
                    options.per_buffer_budget(),
                    options.key_size,
                    options.value_size,
                )
            } else {
                WriteBuffer::new(options.per_buffer_budget())
            }
        };

        let mut partitions = Vec::with_capacity(options.num_parts());
        for partition in 0..options.num_parts() {
            let sink = options
                .fs
                .create(&dir.join(table_file_name(options.rank, partition)))?;
            let backend = PartitionBackend {
                table: Mutex::new(TableBuilder::new(&options, sink, Arc::clone(&stats))),
                sealed: Mutex::new(Vec::new()),
                stats: Arc::clone(&stats),
                unordered: options.unordered,
                reject_duplicates: options.unique_keys
                    && options.paranoid_checks
                    && !options.unordered,
            };
            partitions.push(DoubleBuffering::new(
                backend,
                vec![make_buffer(), make_buffer()],
                Arc::clone(&pool),
            ));
        }

        let side = SideLog::new(
            &options,
            options.fs.create(&dir.join(side_file_name(options.rank)))?,
            Arc::clone(&stats),
            Arc::clone(&pool),
        );
        let manifest = ManifestWriter::new(
            options
                .fs
                .create(&dir.join(manifest_file_name(options.rank)))?,
            Arc::clone(&stats),
            options.min_index_buffer,
        );

        debug!(
            parts = options.num_parts(),
            budget = options.total_memtable_budget,
            ?dir,
            "directory opened for writing"
        );
        Ok(Self {
            options,
            stats,
            partitions,
            side,
            manifest,
            current_epoch: 0,
            sticky: None,
            finished: false,
            dir,
        })
    }

    /// Inserts one record under `epoch`. Epochs behind the current one
    /// are rejected; epochs ahead implicitly seal the intermediate ones.
    /// Blocks while the key's partition has every buffer in flight.
    pub fn append(&mut self, key: &[u8], value: &[u8], epoch: u64) -> Result<()> {
        self.check_open()?;
        if epoch < self.current_epoch {
            return Err(Error::InvalidArgument(format!(
                "epoch {epoch} behind current epoch {}",
                self.current_epoch
            )));
        }
        while epoch > self.current_epoch {
            self.epoch_flush(self.current_epoch)?;
        }
        if self.options.fixed_kv
            && (key.len() != self.options.key_size || value.len() != self.options.value_size)
        {
            return Err(Error::InvalidArgument(format!(
                "record sizes ({}, {}) do not match declared ({}, {})",
                key.len(),
                value.len(),
                self.options.key_size,
                self.options.value_size
            )));
        }
        // A record that cannot fit an empty buffer would rotate forever.
        if key.len() + value.len() + 32 > self.options.per_buffer_budget() {
            return Err(Error::InvalidArgument(format!(
                "record of {} bytes exceeds the per-buffer budget {}",
                key.len() + value.len(),
                self.options.per_buffer_budget()
            )));
        }

        let partition = key_partition(key, self.options.lg_parts);
        let outcome = self.partitions[partition].add(key, value);
        if let Err(err) = outcome {
            return Err(self.poison(err));
        }
        self.stats.add_user_data((key.len() + value.len()) as u64);
        Ok(())
    }

    /// Appends opaque bytes to the side I/O stream.
    pub fn append_side(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let outcome = self.side.append(data);
        if let Err(err) = outcome {
            return Err(self.poison(err));
        }
        Ok(())
    }

    /// Seals every partition's memtable into a table without advancing
    /// the epoch; the resulting tables join the current epoch's manifest
    /// record at seal time. Inserts for the same epoch keep flowing.
    pub fn flush(&mut self, wait: bool) -> Result<()> {
        self.check_open()?;
        let mut first_error = None;
        for core in &self.partitions {
            if let Err(err) = core.flush(wait) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(self.poison(err)),
            None => Ok(()),
        }
    }

    /// Seals epoch `epoch` (which must be the current one): drains all
    /// partitions, flushes the side log, appends the manifest record,
    /// and advances the epoch counter.
    pub fn epoch_flush(&mut self, epoch: u64) -> Result<()> {
        self.check_open()?;
        if epoch != self.current_epoch {
            return Err(Error::InvalidArgument(format!(
                "epoch flush for {epoch} but current epoch is {}",
                self.current_epoch
            )));
        }

        let mut first_error = None;
        for core in &self.partitions {
            if let Err(err) = core.flush(true) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.side.flush(false) {
            first_error.get_or_insert(err);
        }
        if let Some(err) = first_error {
            return Err(self.poison(err));
        }

        let record = EpochRecord {
            epoch,
            entries: self.drain_sealed_tables(),
        };
        if let Err(err) = self.manifest.append_epoch(&record) {
            return Err(self.poison(err));
        }
        self.current_epoch += 1;
        Ok(())
    }

    /// Waits out all in-flight compactions and forces every file to
    /// durable storage. Establishes the happens-before for all inserts
    /// issued before the call.
    pub fn sync(&mut self) -> Result<()> {
        self.check_open()?;
        let mut first_error = None;
        for core in &self.partitions {
            if let Err(err) = core.sync(true) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.side.sync() {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.manifest.flush() {
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(self.poison(err)),
            None => Ok(()),
        }
    }

    /// Finalizes the directory: drains and closes every partition and
    /// the side log, seals any tables compacted since the last epoch
    /// seal under the current epoch, and writes the manifest's terminal
    /// footer. The first call returns the final status; later calls
    /// observe the "already finished" sentinel (or the sticky error).
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(self
                .sticky
                .clone()
                .unwrap_or_else(Error::already_finished));
        }

        let mut first_error = self.sticky.clone();
        for core in &self.partitions {
            if let Err(err) = core.finish() {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.side.finish() {
            first_error.get_or_insert(err);
        }

        if first_error.is_none() {
            // Tables compacted after the last seal still belong to the
            // current epoch; give them a record so readers see them.
            let residual = self.drain_sealed_tables();
            if !residual.is_empty() {
                let record = EpochRecord {
                    epoch: self.current_epoch,
                    entries: residual,
                };
                if let Err(err) = self.manifest.append_epoch(&record) {
                    first_error.get_or_insert(err);
                }
            }
        }
        if first_error.is_none() {
            if let Err(err) = self.manifest.finish(self.stats.total_bytes_written()) {
                first_error.get_or_insert(err);
            }
        }

        self.finished = true;
        match first_error {
            Some(err) => {
                self.sticky = Some(err.clone());
                Err(err)
            }
            None => {
                debug!(epochs = self.current_epoch, dir = ?self.dir, "directory finished");
                Ok(())
            }
        }
    }

    /// Collects every partition's sealed tables, in partition order
    /// then schedule order, clearing the accumulators.
    fn drain_sealed_tables(&self) -> Vec<IndexEntry> {
        let mut entries = Vec::new();
        for (partition, core) in self.partitions.iter().enumerate() {
            let mut sealed = core.backend().sealed.lock().unwrap();
            for meta in sealed.drain(..) {
                entries.push(IndexEntry {
                    partition: partition as u32,
                    table_handle: meta.table_handle,
                    filter_handle: meta.filter_handle,
                    first_key: meta.smallest_key,
                    last_key: meta.largest_key,
                });
            }
        }
        entries
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(self
                .sticky
                .clone()
                .unwrap_or_else(Error::already_finished));
        }
        if let Some(err) = &self.sticky {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Records the first background failure; the writer is poisoned and
    /// every later operation returns this error.
    fn poison(&mut self, err: Error) -> Error {
        self.sticky.get_or_insert_with(|| err.clone());
        self.sticky.clone().unwrap()
    }

    /// The epoch currently accepting inserts.
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Shared counters. Readable after poisoning; values are last-known.
    pub fn stats(&self) -> &DirStats {
        &self.stats
    }
}
