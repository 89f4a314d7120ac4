//! Double-buffering core: the producer/compactor handoff.
//!
//! One mutable buffer (`mem`) accepts appends while filled siblings are
//! compacted in the background. The core owns the rotation: when `mem`
//! runs out of room it is handed to a compaction (tagged with the next
//! schedule number), a fresh buffer is taken from the free list, and the
//! producer continues. With the free list empty the producer blocks on
//! the condition variable until a compaction completes — back-pressure
//! is bounded by buffer count, not by a task queue.
//!
//! Invariants, all under the one mutex:
//! - exactly one buffer is `mem` while the core is open;
//! - `scheduled >= completed` and `in_flight = scheduled - completed`;
//! - a non-OK `bg_status` is sticky until `finish` hands it out, after
//!   which the "already finished" sentinel takes its place;
//! - every buffer on the free list is empty.
//!
//! An empty buffer compacts inline on the calling thread (the backend
//! guarantees that path does no real I/O); everything else goes to the
//! thread pool. A completing task records the first error, returns its
//! buffer to the free list, re-runs `prepare` so a blocked producer can
//! resume, and broadcasts the condition variable.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::pool::ThreadPool;

/// Storage-side hooks the core drives. Implementations are shared with
/// the pool workers, so everything takes `&self`; exclusive access to a
/// buffer is expressed by passing it in by value or `&mut`.
pub trait Backend: Send + Sync + 'static {
    /// The buffer type rotated by the core.
    type Buffer: Send + 'static;

    /// Appends one record to the mutable buffer.
    fn add_to_buffer(&self, buf: &mut Self::Buffer, key: &[u8], value: &[u8]);

    /// Returns true if the buffer can take one more `(key, value)`.
    fn has_room(&self, buf: &Self::Buffer, key: &[u8], value: &[u8]) -> bool;

    /// Returns true if the buffer holds no records.
    fn is_empty(&self, buf: &Self::Buffer) -> bool;

    /// Compacts the buffer to storage. Runs without the core mutex
    /// unless the buffer is empty, in which case it must be a no-op.
    fn compact(&self, buf: &mut Self::Buffer) -> Result<()>;

    /// Marks the buffer empty for reuse.
    fn clear(&self, buf: &mut Self::Buffer);

    /// Forces compacted bytes to durable storage; with `closing` set,
    /// also finalizes the backend's files.
    fn sync_backend(&self, closing: bool) -> Result<()>;
}

struct State<Buf> {
    mem: Option<Box<Buf>>,
    free: VecDeque<Box<Buf>>,
    scheduled: u64,
    completed: u64,
    in_flight: u64,
    bg_status: Option<Error>,
    finished: bool,
}

struct Shared<B: Backend> {
    backend: B,
    pool: Arc<ThreadPool>,
    state: Mutex<State<B::Buffer>>,
    work_done: Condvar,
}

/// Producer-facing handle to the double-buffered pipeline.
pub struct DoubleBuffering<B: Backend> {
    shared: Arc<Shared<B>>,
}

type Guard<'a, B> = MutexGuard<'a, State<<B as Backend>::Buffer>>;

impl<B: Backend> DoubleBuffering<B> {
    /// Creates a core over `buffers` (at least two: one becomes `mem`,
    /// the rest the free list) scheduling onto `pool`.
    pub fn new(backend: B, mut buffers: Vec<B::Buffer>, pool: Arc<ThreadPool>) -> Self {
        assert!(buffers.len() >= 2, "double buffering needs two buffers");
        let mem = buffers.pop().map(Box::new);
        let free = buffers.into_iter().map(Box::new).collect();
        Self {
            shared: Arc::new(Shared {
                backend,
                pool,
                state: Mutex::new(State {
                    mem,
                    free,
                    scheduled: 0,
                    completed: 0,
                    in_flight: 0,
                    bg_status: None,
                    finished: false,
                }),
                work_done: Condvar::new(),
            }),
        }
    }

    /// The backend, for callers that own extra state there.
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Appends one record, blocking while all buffers are in flight.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let guard = self.shared.state.lock().unwrap();
        if guard.finished {
            return Err(finished_status(&guard));
        }
        let (mut guard, prepared) = Shared::prepare(&self.shared, guard, false, key, value);
        prepared?;
        let mem = guard.mem.as_mut().expect("core is open");
        self.shared.backend.add_to_buffer(mem, key, value);
        Ok(())
    }

    /// Forces the mutable buffer into a compaction even if non-empty,
    /// optionally waiting for that compaction to complete. Does not
    /// force data to durable storage; `sync` does.
    pub fn flush(&self, wait: bool) -> Result<()> {
        let guard = self.shared.state.lock().unwrap();
        if guard.finished {
            return Err(finished_status(&guard));
        }
        let (guard, prepared) = Shared::prepare(&self.shared, guard, true, &[], &[]);
        let seq = prepared?;
        if wait {
            let guard = self.shared.wait_for(guard, seq);
            status_of(&guard)
        } else {
            Ok(())
        }
    }

    /// Waits out all in-flight compactions, then runs the backend's
    /// fsync hook with the mutex released. With `do_flush` set the
    /// mutable buffer is sealed first so its records are covered too.
    pub fn sync(&self, do_flush: bool) -> Result<()> {
        let guard = self.shared.state.lock().unwrap();
        if guard.finished {
            return Err(finished_status(&guard));
        }
        let (guard, prepared) = Shared::prepare(&self.shared, guard, do_flush, &[], &[]);
        let seq = prepared?;
        let guard = self.shared.wait_for(guard, seq);
        let guard = self.shared.wait_for_compactions(guard);
        status_of(&guard)?;
        drop(guard);

        let synced = self.shared.backend.sync_backend(false);
        let mut guard = self.shared.state.lock().unwrap();
        if let Err(err) = synced {
            guard.bg_status.get_or_insert(err);
        }
        status_of(&guard)
    }

    /// Blocks until no compaction is outstanding.
    pub fn wait(&self) -> Result<()> {
        let guard = self.shared.state.lock().unwrap();
        if guard.finished {
            return Err(finished_status(&guard));
        }
        let guard = self.shared.wait_for_compactions(guard);
        status_of(&guard)
    }

    /// Finalizes the pipeline: seals the mutable buffer, drains all
    /// compactions, and closes the backend. Idempotent — the first call
    /// returns the final status; later calls observe the "already
    /// finished" sentinel (or the original sticky error).
    pub fn finish(&self) -> Result<()> {
        let guard = self.shared.state.lock().unwrap();
        if guard.finished {
            return Err(finished_status(&guard));
        }
        let (guard, _) = Shared::prepare(&self.shared, guard, true, &[], &[]);
        let mut guard = self.shared.wait_for_compactions(guard);

        let final_status = if guard.bg_status.is_none() {
            drop(guard);
            let closed = self.shared.backend.sync_backend(true);
            guard = self.shared.state.lock().unwrap();
            guard.bg_status = Some(Error::already_finished());
            closed
        } else {
            Err(guard.bg_status.clone().unwrap())
        };
        guard.finished = true;
        if let Err(err) = &final_status {
            error!(error = %err, "pipeline finished with error");
        } else {
            debug!(
                compactions = guard.completed,
                "pipeline finished"
            );
        }
        final_status
    }
}

impl<B: Backend> Shared<B> {
    /// The core loop: returns once `mem` can take `(key, value)` (or
    /// unconditionally after one buffer swap under `force`), scheduling
    /// compactions and blocking on the condvar as needed. Returns the
    /// schedule number of the compaction this call initiated, 0 if none.
    fn prepare<'a>(
        shared: &Arc<Self>,
        mut guard: Guard<'a, B>,
        mut force: bool,
        key: &[u8],
        value: &[u8],
    ) -> (Guard<'a, B>, Result<u64>) {
        let mut seq = 0;
        loop {
            if let Some(err) = &guard.bg_status {
                let err = err.clone();
                return (guard, Err(err));
            }
            let mem = guard.mem.as_ref().expect("core is open");
            if !force && shared.backend.has_room(mem, key, value) {
                break;
            }
            if guard.free.is_empty() {
                // All buffers in flight: the producer self-throttles.
                guard = shared.work_done.wait(guard).unwrap();
            } else {
                force = false;
                guard.scheduled += 1;
                seq = guard.scheduled;
                guard.in_flight += 1;
                let mut imm = guard.mem.take().expect("core is open");
                guard.mem = guard.free.pop_back();

                if shared.backend.is_empty(&imm) {
                    // Nothing to write; run to completion right here
                    // rather than waking a worker.
                    let status = shared.backend.compact(&mut imm);
                    guard = Shared::complete_compaction(shared, guard, imm, status);
                } else {
                    debug!(seq, "compaction scheduled");
                    let task = Arc::clone(shared);
                    shared
                        .pool
                        .execute(move || task.background_compaction(imm));
                }
            }
        }
        (guard, Ok(seq))
    }

    /// Pool entry point: compact without the mutex, then publish.
    fn background_compaction(self: Arc<Self>, mut imm: Box<B::Buffer>) {
        let status = self.backend.compact(&mut imm);
        let guard = self.state.lock().unwrap();
        drop(Shared::complete_compaction(&self, guard, imm, status));
    }

    /// Publishes a compaction result: first error wins, the buffer goes
    /// back empty, a blocked producer gets a chance to resume, and all
    /// waiters are woken.
    fn complete_compaction<'a>(
        shared: &Arc<Self>,
        mut guard: Guard<'a, B>,
        mut imm: Box<B::Buffer>,
        status: Result<()>,
    ) -> Guard<'a, B> {
        if let Err(err) = status {
            error!(error = %err, "compaction failed");
            guard.bg_status.get_or_insert(err);
        }
        shared.backend.clear(&mut imm);
        guard.free.push_back(imm);
        guard.completed += 1;
        debug_assert!(guard.in_flight > 0);
        guard.in_flight -= 1;
        debug_assert_eq!(guard.in_flight, guard.scheduled - guard.completed);

        let (guard, _) = Shared::prepare(shared, guard, false, &[], &[]);
        shared.work_done.notify_all();
        guard
    }

    /// Blocks until the compaction numbered `seq` has completed.
    fn wait_for<'a>(&self, mut guard: Guard<'a, B>, seq: u64) -> Guard<'a, B> {
        while guard.completed < seq {
            guard = self.work_done.wait(guard).unwrap();
        }
        guard
    }

    /// Blocks until no compaction is in flight.
    fn wait_for_compactions<'a>(&self, mut guard: Guard<'a, B>) -> Guard<'a, B> {
        while guard.in_flight > 0 {
            guard = self.work_done.wait(guard).unwrap();
        }
        guard
    }
}

fn status_of<Buf>(state: &State<Buf>) -> Result<()> {
    match &state.bg_status {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

fn finished_status<Buf>(state: &State<Buf>) -> Error {
    state
        .bg_status
        .clone()
        .unwrap_or_else(Error::already_finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Byte-counting buffer with a tiny budget.
    #[derive(Debug, Default)]
    struct TestBuf {
        records: Vec<(Vec<u8>, Vec<u8>)>,
        bytes: usize,
    }

    /// Backend that appends compacted records to a shared sink.
    struct TestBackend {
        capacity: usize,
        sink: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
        compactions: AtomicU64,
        syncs: AtomicU64,
        closes: AtomicU64,
        fail_compactions: AtomicBool,
        stall: Option<Duration>,
    }

    impl TestBackend {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                sink: Mutex::new(Vec::new()),
                compactions: AtomicU64::new(0),
                syncs: AtomicU64::new(0),
                closes: AtomicU64::new(0),
                fail_compactions: AtomicBool::new(false),
                stall: None,
            }
        }
    }

    impl Backend for TestBackend {
        type Buffer = TestBuf;

        fn add_to_buffer(&self, buf: &mut TestBuf, key: &[u8], value: &[u8]) {
            buf.bytes += key.len() + value.len();
            buf.records.push((key.to_vec(), value.to_vec()));
        }

        fn has_room(&self, buf: &TestBuf, key: &[u8], value: &[u8]) -> bool {
            buf.bytes + key.len() + value.len() <= self.capacity
        }

        fn is_empty(&self, buf: &TestBuf) -> bool {
            buf.records.is_empty()
        }

        fn compact(&self, buf: &mut TestBuf) -> Result<()> {
            if buf.records.is_empty() {
                return Ok(());
            }
            if let Some(stall) = self.stall {
                std::thread::sleep(stall);
            }
            if self.fail_compactions.load(Ordering::SeqCst) {
                return Err(Error::Io("injected compaction failure".to_string()));
            }
            self.compactions.fetch_add(1, Ordering::SeqCst);
            self.sink.lock().unwrap().extend_from_slice(&buf.records);
            Ok(())
        }

        fn clear(&self, buf: &mut TestBuf) {
            buf.records.clear();
            buf.bytes = 0;
        }

        fn sync_backend(&self, closing: bool) -> Result<()> {
            if closing {
                self.closes.fetch_add(1, Ordering::SeqCst);
            } else {
                self.syncs.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn core(capacity: usize) -> DoubleBuffering<TestBackend> {
        DoubleBuffering::new(
            TestBackend::new(capacity),
            vec![TestBuf::default(), TestBuf::default()],
            Arc::new(ThreadPool::fixed(2)),
        )
    }

    #[test]
    fn test_add_flush_finish_roundtrip() {
        let core = core(1 << 10);
        for i in 0..10u32 {
            core.add(&i.to_be_bytes(), b"value").unwrap();
        }
        core.flush(true).unwrap();
        core.finish().unwrap();
        assert_eq!(core.backend().sink.lock().unwrap().len(), 10);
        assert_eq!(core.backend().closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finish_idempotent_with_sentinel() {
        let core = core(1 << 10);
        core.add(b"k", b"v").unwrap();
        core.finish().unwrap();

        // Every later operation observes the dedicated sentinel.
        let again = core.finish();
        assert_eq!(again, Err(Error::already_finished()));
        assert_eq!(core.add(b"k2", b"v2"), Err(Error::already_finished()));
        assert_eq!(core.flush(true), Err(Error::already_finished()));
        assert_eq!(core.sync(false), Err(Error::already_finished()));
    }

    #[test]
    fn test_rotation_under_small_budget() {
        let core = core(32);
        for i in 0..100u32 {
            core.add(&i.to_be_bytes(), &[0u8; 8]).unwrap();
        }
        core.finish().unwrap();
        assert_eq!(core.backend().sink.lock().unwrap().len(), 100);
        // 12-byte records against a 32-byte budget force many rotations.
        assert!(core.backend().compactions.load(Ordering::SeqCst) > 10);
    }

    #[test]
    fn test_sticky_background_error_poisons() {
        let core = core(32);
        core.backend().fail_compactions.store(true, Ordering::SeqCst);

        // Fill until a compaction is forced and fails.
        let mut poisoned = None;
        for i in 0..100u32 {
            if let Err(err) = core.add(&i.to_be_bytes(), &[0u8; 8]) {
                poisoned = Some(err);
                break;
            }
        }
        // The flush path must surface the same sticky error even if no
        // add happened to observe it.
        let err = match poisoned {
            Some(err) => err,
            None => core.flush(true).unwrap_err(),
        };
        assert!(matches!(err, Error::Io(_)));

        assert_eq!(core.add(b"later", b"v"), Err(err.clone()));
        assert_eq!(core.sync(true), Err(err.clone()));
        // finish reports the sticky error, and keeps reporting it.
        assert_eq!(core.finish(), Err(err.clone()));
        assert_eq!(core.finish(), Err(err));
    }

    #[test]
    fn test_failed_buffer_returns_to_free_list() {
        let core = core(32);
        core.backend().fail_compactions.store(true, Ordering::SeqCst);
        for i in 0..100u32 {
            if core.add(&i.to_be_bytes(), &[0u8; 8]).is_err() {
                break;
            }
        }
        let _ = core.finish();
        let state = core.shared.state.lock().unwrap();
        // Both buffers accounted for: one mem, one free, none leaked.
        assert!(state.mem.is_some());
        assert_eq!(state.free.len(), 1);
        assert_eq!(state.in_flight, 0);
    }

    #[test]
    fn test_counters_balance() {
        let core = core(32);
        for i in 0..50u32 {
            core.add(&i.to_be_bytes(), &[0u8; 8]).unwrap();
        }
        {
            let state = core.shared.state.lock().unwrap();
            assert_eq!(state.in_flight, state.scheduled - state.completed);
        }
        core.finish().unwrap();
        let state = core.shared.state.lock().unwrap();
        assert_eq!(state.scheduled, state.completed);
        assert_eq!(state.in_flight, 0);
    }

    #[test]
    fn test_empty_flush_compacts_inline() {
        let core = core(1 << 10);
        // Nothing buffered: the forced compaction must not touch the
        // pool or the sink, and must complete synchronously.
        core.flush(true).unwrap();
        assert_eq!(core.backend().compactions.load(Ordering::SeqCst), 0);
        let state = core.shared.state.lock().unwrap();
        assert_eq!(state.scheduled, 1);
        assert_eq!(state.completed, 1);
    }

    #[test]
    fn test_sync_calls_backend_hook() {
        let core = core(1 << 10);
        core.add(b"k", b"v").unwrap();
        core.sync(true).unwrap();
        assert_eq!(core.backend().syncs.load(Ordering::SeqCst), 1);
        assert_eq!(core.backend().sink.lock().unwrap().len(), 1);
        core.finish().unwrap();
    }

    #[test]
    fn test_backpressure_blocks_then_resumes() {
        let backend = TestBackend {
            stall: Some(Duration::from_millis(50)),
            ..TestBackend::new(24)
        };
        let core = Arc::new(DoubleBuffering::new(
            backend,
            vec![TestBuf::default(), TestBuf::default()],
            Arc::new(ThreadPool::fixed(1)),
        ));

        let added = Arc::new(AtomicUsize::new(0));
        let writer = {
            let core = Arc::clone(&core);
            let added = Arc::clone(&added);
            std::thread::spawn(move || {
                // Far more than two buffers hold; the producer must block
                // in prepare and resume as compactions drain.
                for i in 0..40u32 {
                    core.add(&i.to_be_bytes(), &[0u8; 4]).unwrap();
                    added.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        // The producer cannot have raced ahead of the stalled compactor.
        assert!(added.load(Ordering::SeqCst) < 40);

        writer.join().unwrap();
        core.finish().unwrap();
        assert_eq!(core.backend().sink.lock().unwrap().len(), 40);
    }
}
