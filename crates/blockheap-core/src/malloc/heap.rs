//! Thread-safe allocator handle.
//!
//! [`Heap`] serializes every operation on one [`MallocState`] behind a single
//! `parking_lot::Mutex`. The thread holding the lock is recorded, so an
//! allocation issued from inside a `with_bytes` callback (or from anything
//! else running under the lock) is caught and aborts instead of deadlocking.
//!
//! The C-shaped entry points (`malloc`, `free`, `realloc`, `calloc`) return
//! `None` for out-of-memory and abort the process on misuse or corruption.
//! The `try_*` variants return every error instead.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::allocator::{AllocatorLogRecord, MallocState};
use super::config::MallocConfig;
use super::error::MallocError;
use super::mapper::PageMapper;
use super::profiler::ProfilerHook;
use super::stats::MallocStats;

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// Non-zero tag unique to the calling thread.
fn current_thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

/// Reports an unrecoverable allocator condition and aborts the process.
#[cold]
pub fn fatal(message: &str) -> ! {
    eprintln!("blockheap: fatal: {message}");
    std::process::abort()
}

/// Process-wide allocator: one [`MallocState`] behind one lock.
pub struct Heap {
    state: Mutex<MallocState>,
    /// Tag of the thread currently holding `state`, 0 when unlocked.
    owner: AtomicU64,
}

struct HeapGuard<'a> {
    owner: &'a AtomicU64,
    state: MutexGuard<'a, MallocState>,
}

impl Deref for HeapGuard<'_> {
    type Target = MallocState;

    fn deref(&self) -> &MallocState {
        &self.state
    }
}

impl DerefMut for HeapGuard<'_> {
    fn deref_mut(&mut self) -> &mut MallocState {
        &mut self.state
    }
}

impl Drop for HeapGuard<'_> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}

impl Heap {
    pub fn new(config: MallocConfig, mapper: impl PageMapper + 'static) -> Self {
        Self::from_state(MallocState::new(config, mapper))
    }

    pub fn from_state(state: MallocState) -> Self {
        Self {
            state: Mutex::new(state),
            owner: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> HeapGuard<'_> {
        let tag = current_thread_tag();
        if self.owner.load(Ordering::Acquire) == tag {
            fatal("allocator re-entered by the thread holding its lock");
        }
        let state = self.state.lock();
        self.owner.store(tag, Ordering::Release);
        HeapGuard {
            owner: &self.owner,
            state,
        }
    }

    /// Whether the calling thread currently holds the heap lock.
    #[must_use]
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_tag()
    }

    fn settle<T>(symbol: &str, result: Result<T, MallocError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) if err.is_fatal() => fatal(&format!("{symbol}: {err}")),
            Err(_) => None,
        }
    }

    /// Allocates `size` bytes. `None` is out-of-memory.
    pub fn malloc(&self, size: usize) -> Option<usize> {
        Self::settle("malloc", self.try_malloc(size))
    }

    /// Frees `ptr`; `free(0)` is a no-op. Aborts on invalid or double frees.
    pub fn free(&self, ptr: usize) {
        Self::settle("free", self.try_free(ptr));
    }

    /// Resizes `ptr`. `None` means freed (`new_size == 0`) or out-of-memory,
    /// in which case `ptr` is left untouched.
    pub fn realloc(&self, ptr: usize, new_size: usize) -> Option<usize> {
        Self::settle("realloc", self.try_realloc(ptr, new_size)).flatten()
    }

    /// Allocates `count * size` zeroed bytes. `None` on overflow or
    /// out-of-memory.
    pub fn calloc(&self, count: usize, size: usize) -> Option<usize> {
        Self::settle("calloc", self.try_calloc(count, size))
    }

    /// Usable bytes behind `ptr`. Aborts if `ptr` is not live.
    pub fn malloc_size(&self, ptr: usize) -> usize {
        Self::settle("malloc_size", self.lock().malloc_size(ptr)).unwrap_or(0)
    }

    #[must_use]
    pub fn malloc_good_size(&self, size: usize) -> Option<usize> {
        self.lock().malloc_good_size(size)
    }

    pub fn try_malloc(&self, size: usize) -> Result<usize, MallocError> {
        self.lock().malloc(size)
    }

    pub fn try_free(&self, ptr: usize) -> Result<(), MallocError> {
        self.lock().free(ptr)
    }

    pub fn try_realloc(&self, ptr: usize, new_size: usize) -> Result<Option<usize>, MallocError> {
        self.lock().realloc(ptr, new_size)
    }

    pub fn try_calloc(&self, count: usize, size: usize) -> Result<usize, MallocError> {
        self.lock().calloc(count, size)
    }

    /// Runs `f` over the usable bytes of a live allocation, under the lock.
    ///
    /// `f` must not call back into this heap.
    pub fn with_bytes<R>(
        &self,
        ptr: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, MallocError> {
        let guard = self.lock();
        guard.bytes(ptr).map(f)
    }

    /// Mutable variant of [`with_bytes`](Self::with_bytes).
    pub fn with_bytes_mut<R>(
        &self,
        ptr: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MallocError> {
        let mut guard = self.lock();
        guard.bytes_mut(ptr).map(f)
    }

    pub fn set_profiler(&self, hook: Box<dyn ProfilerHook>) {
        self.lock().set_profiler(hook);
    }

    /// Unmaps every cached block and recycled big mapping.
    pub fn purge_caches(&self) -> Result<usize, MallocError> {
        self.lock().purge_caches()
    }

    #[must_use]
    pub fn stats(&self) -> MallocStats {
        self.lock().stats()
    }

    #[must_use]
    pub fn config(&self) -> MallocConfig {
        *self.lock().config()
    }

    /// Human-readable counter dump.
    #[must_use]
    pub fn dump_stats(&self) -> String {
        self.stats().to_string()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.lock().drain_lifecycle_logs()
    }

    #[must_use]
    pub fn dropped_lifecycle_logs(&self) -> u64 {
        self.lock().dropped_lifecycle_logs()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().active_count()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::mapper::SimulatedMapper;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    fn heap() -> (Heap, SimulatedMapper) {
        let mapper = SimulatedMapper::new();
        (Heap::new(MallocConfig::default(), mapper.clone()), mapper)
    }

    #[test]
    fn test_basic_c_surface() {
        let (heap, _mapper) = heap();
        let ptr = heap.malloc(32).unwrap();
        assert_eq!(heap.malloc_size(ptr), 32);
        let grown = heap.realloc(ptr, 4096).unwrap();
        assert_eq!(heap.realloc(grown, 0), None);
        heap.free(0);
        assert_eq!(heap.active_count(), 0);
    }

    #[test]
    fn test_calloc_overflow_is_null_not_abort() {
        let (heap, mapper) = heap();
        assert_eq!(heap.calloc(usize::MAX / 2, 3), None);
        assert_eq!(mapper.map_calls(), 0);
        let ptr = heap.calloc(16, 16).unwrap();
        assert!(heap.with_bytes(ptr, |b| b[..256].iter().all(|&x| x == 0)).unwrap());
    }

    #[test]
    fn test_out_of_memory_is_null() {
        let (heap, mapper) = heap();
        mapper.set_map_budget(Some(0));
        assert_eq!(heap.malloc(64), None);
        assert_eq!(
            heap.try_malloc(64),
            Err(MallocError::OutOfMemory { requested: 64 })
        );
    }

    #[test]
    fn test_try_variants_surface_misuse() {
        let (heap, _mapper) = heap();
        let ptr = heap.malloc(8).unwrap();
        heap.free(ptr);
        assert_eq!(heap.try_free(ptr), Err(MallocError::DoubleFree { ptr }));
        assert_eq!(
            heap.try_realloc(0x40, 8),
            Err(MallocError::InvalidPointer { ptr: 0x40 })
        );
    }

    #[test]
    fn test_with_bytes_runs_under_lock() {
        let (heap, _mapper) = heap();
        let ptr = heap.malloc(4).unwrap();
        assert!(!heap.is_locked_by_current_thread());
        heap.with_bytes_mut(ptr, |bytes| {
            bytes[..4].copy_from_slice(b"heap");
        })
        .unwrap();
        let (seen, locked) = heap
            .with_bytes(ptr, |bytes| {
                (bytes[..4].to_vec(), heap.is_locked_by_current_thread())
            })
            .unwrap();
        assert_eq!(seen, b"heap");
        assert!(locked);
        assert!(!heap.is_locked_by_current_thread());
    }

    #[test]
    fn test_dump_stats() {
        let (heap, _mapper) = heap();
        let ptr = heap.malloc(1).unwrap();
        heap.free(ptr);
        let dump = heap.dump_stats();
        assert!(dump.starts_with("malloc stats:"));
        assert!(dump.contains("malloc:         1"));
    }

    #[test]
    fn test_concurrent_threads_never_overlap_and_stats_add_up() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            *state >> 16
        }

        #[derive(Default)]
        struct Counts {
            mallocs: u64,
            frees: u64,
            reallocs: u64,
        }

        const THREADS: u64 = 4;
        const OPS: usize = 1500;

        let (heap, _mapper) = heap();
        let heap = Arc::new(heap);
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    let mut rng = 0x9E37_79B9_7F4A_7C15 ^ t;
                    let mut live: Vec<(usize, usize, u8)> = Vec::new();
                    let mut counts = Counts::default();
                    for i in 0..OPS {
                        let r = lcg(&mut rng);
                        let tag = (t as u8) << 6 | (i % 64) as u8;
                        match r % 4 {
                            0 | 1 => {
                                let size = if (r >> 2) % 16 == 0 {
                                    33_000 + (r as usize >> 8) % 40_000
                                } else {
                                    (r as usize >> 8) % 2048 + 1
                                };
                                let ptr = heap.malloc(size).unwrap();
                                counts.mallocs += 1;
                                heap.with_bytes_mut(ptr, |b| b[..size].fill(tag)).unwrap();
                                live.push((ptr, size, tag));
                            }
                            2 if !live.is_empty() => {
                                let (ptr, size, tag) =
                                    live.swap_remove(r as usize % live.len());
                                let intact = heap
                                    .with_bytes(ptr, |b| b[..size].iter().all(|&x| x == tag))
                                    .unwrap();
                                assert!(intact, "allocation {ptr:#x} was overwritten");
                                heap.free(ptr);
                                counts.frees += 1;
                            }
                            3 if !live.is_empty() => {
                                let idx = r as usize % live.len();
                                let (ptr, size, tag) = live[idx];
                                let new_size = (r as usize >> 8) % 4096 + 1;
                                let new_ptr = heap.realloc(ptr, new_size).unwrap();
                                counts.reallocs += 1;
                                if new_ptr != ptr {
                                    counts.mallocs += 1;
                                    counts.frees += 1;
                                }
                                let kept = size.min(new_size);
                                let intact = heap
                                    .with_bytes(new_ptr, |b| b[..kept].iter().all(|&x| x == tag))
                                    .unwrap();
                                assert!(intact, "realloc lost data at {new_ptr:#x}");
                                heap.with_bytes_mut(new_ptr, |b| b[..new_size].fill(tag))
                                    .unwrap();
                                live[idx] = (new_ptr, new_size, tag);
                            }
                            _ => {}
                        }
                    }
                    (counts, live)
                })
            })
            .collect();

        let mut total = Counts::default();
        let mut all_live: BTreeMap<usize, usize> = BTreeMap::new();
        for handle in handles {
            let (counts, live) = handle.join().unwrap();
            total.mallocs += counts.mallocs;
            total.frees += counts.frees;
            total.reallocs += counts.reallocs;
            for (ptr, size, _) in live {
                assert!(all_live.insert(ptr, size).is_none(), "{ptr:#x} handed out twice");
            }
        }

        let mut end = 0;
        for (&ptr, &size) in &all_live {
            assert!(ptr >= end, "live allocations overlap at {ptr:#x}");
            end = ptr + size;
        }

        let stats = heap.stats();
        assert_eq!(stats.number_of_malloc_calls, total.mallocs);
        assert_eq!(stats.number_of_free_calls, total.frees);
        assert_eq!(stats.number_of_realloc_calls, total.reallocs);
        assert_eq!(heap.active_count(), all_live.len());
    }
}
