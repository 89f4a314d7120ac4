//! Benchmarks for the directory write path.
//!
//! Run with: cargo bench --package burrow
//!
//! ## Benchmark Categories
//!
//! - **bf**: Bloom filter build and probe
//! - **cf**: cuckoo filter build and probe
//! - **kv**: write-buffer insert and finalize-sort
//! - **dir**: end-to-end directory writes through epoch seal
//!
//! Options honor the diagnostic environment variables (`COMPRESSION`,
//! `SNAPPY`, `FORCE_COMPRESSION`, `INDEX_COMPRESSION`,
//! `BF_BITS_PER_KEY`) via `DirOptions::from_env`.

use burrow::filter::{bloom, cuckoo};
use burrow::memtable::WriteBuffer;
use burrow::{DirOptions, DirWriter};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::TempDir;

fn generate_keys(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("p-{i:08x}").into_bytes())
        .collect()
}

fn bench_bf(c: &mut Criterion) {
    let keys = generate_keys(10_000);

    let mut group = c.benchmark_group("bf");
    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("build_10k", |b| {
        b.iter(|| {
            let mut builder = bloom::BloomBuilder::new(10);
            for key in &keys {
                builder.add_key(key);
            }
            black_box(builder.finish())
        })
    });

    let mut builder = bloom::BloomBuilder::new(10);
    for key in &keys {
        builder.add_key(key);
    }
    let block = builder.finish();
    group.bench_function("probe_10k", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(bloom::may_contain(&block, key));
            }
        })
    });
    group.finish();
}

fn bench_cf(c: &mut Criterion) {
    let keys = generate_keys(10_000);

    let mut group = c.benchmark_group("cf");
    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("build_10k", |b| {
        b.iter(|| {
            let mut builder = cuckoo::CuckooBuilder::new(16, 0, 0.95);
            for key in &keys {
                builder.add_key(key, 0);
            }
            black_box(builder.finish())
        })
    });

    let mut builder = cuckoo::CuckooBuilder::new(16, 0, 0.95);
    for key in &keys {
        builder.add_key(key, 0);
    }
    let block = builder.finish();
    group.bench_function("probe_10k", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(cuckoo::lookup(&block, key));
            }
        })
    });
    group.finish();
}

fn bench_kv(c: &mut Criterion) {
    let keys = generate_keys(10_000);
    let value = vec![b'x'; 40];

    let mut group = c.benchmark_group("kv");
    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("buffer_fill_sort_10k", |b| {
        b.iter(|| {
            let mut buffer = WriteBuffer::new(1 << 20);
            for key in &keys {
                buffer.add(key, &value);
            }
            buffer.finish_and_sort(false);
            black_box(buffer.iter().count())
        })
    });
    group.finish();
}

fn bench_dir(c: &mut Criterion) {
    let keys = generate_keys(100_000);
    let value = vec![b'x'; 40];

    let mut group = c.benchmark_group("dir");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(
        (keys.len() * (keys[0].len() + value.len())) as u64,
    ));
    group.bench_function("write_100k_one_epoch", |b| {
        b.iter(|| {
            let dir = TempDir::new().unwrap();
            let options = DirOptions {
                lg_parts: 2,
                total_memtable_budget: 32 << 20,
                block_size: 128 << 10,
                block_batch_size: 2 << 20,
                ..DirOptions::from_env()
            };
            let mut writer = DirWriter::open(options, dir.path()).unwrap();
            for key in &keys {
                writer.append(key, &value, 0).unwrap();
            }
            writer.epoch_flush(0).unwrap();
            writer.finish().unwrap();
            black_box(writer.stats().total_bytes_written())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_bf, bench_cf, bench_kv, bench_dir);
criterion_main!(benches);
