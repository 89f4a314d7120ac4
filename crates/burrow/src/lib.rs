//! Burrow - a write-optimized, append-only indexed directory store.
//!
//! Burrow targets bursty, write-heavy workloads in which many producers
//! each emit large numbers of small key/value records plus an optional
//! opaque byte stream ("side I/O"). Writes proceed through epochs: keys
//! may arrive unordered within an epoch and become queryable once the
//! epoch is sealed. The store trades read latency for write throughput;
//! point lookups may probe several on-storage tables, pruned by Bloom
//! or cuckoo filters.
//!
//! # Components
//!
//! - [`DirWriter`]: hash-partitioned write path with double-buffered
//!   background compaction
//! - [`DirReader`]: point lookups and side reads over sealed epochs
//! - [`DirOptions`] / [`DirStats`]: configuration and counters
//!
//! # Example
//!
//! ```rust,ignore
//! use burrow::{DirOptions, DirWriter};
//!
//! let mut writer = DirWriter::open(DirOptions::default(), "/tmp/burrow")?;
//! writer.append(b"k1", b"v1", 0)?;
//! writer.append_side(b"aux bytes")?;
//! writer.epoch_flush(0)?;
//! writer.finish()?;
//! ```

#![deny(missing_docs)]

pub mod block;
pub mod buffering;
pub mod error;
pub mod filter;
pub mod format;
pub mod manifest;
pub mod memtable;
pub mod options;
pub mod pool;
pub mod reader;
pub mod sidelog;
pub mod storage;
pub mod table;
pub mod writer;

pub use error::{Error, Result};
pub use options::{DirOptions, DirStats, FilterKind};
pub use reader::DirReader;
pub use writer::DirWriter;
