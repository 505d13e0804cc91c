//! Core allocator state.
//!
//! `MallocState` is one explicit allocator context: it owns the mapping
//! primitive, the chunked and big pools, the counters, the profiler hook and
//! the lifecycle log. It is single-threaded; [`Heap`](super::heap::Heap)
//! wraps it in the process-wide lock.
//!
//! Pointers are plain addresses (`usize`, 0 is null). Every operation
//! returns a `Result` so misuse is observable instead of undefined.

use std::collections::VecDeque;

use super::big::{BigGrant, BigPool};
use super::chunked::{ChunkGrant, ChunkedPool};
use super::config::{FREE_SCRUB_BYTE, MALLOC_SCRUB_BYTE, MallocConfig};
use super::error::{MallocError, MapError};
use super::mapper::PageMapper;
use super::profiler::{ProfilerEvent, ProfilerHook};
use super::size_class::{self, NUM_SIZE_CLASSES};
use super::stats::MallocStats;

/// Maximum lifecycle records retained before the oldest are dropped.
pub const LIFECYCLE_LOG_CAPACITY: usize = 4096;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `free`, `calloc`, `realloc`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `allocator_stats`, ...).
    pub event: &'static str,
    /// Pointer involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Size-class bin (`NUM_SIZE_CLASSES` for big allocations).
    pub bin: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: currently live allocation count.
    pub active_count: usize,
    /// Snapshot: currently allocated client bytes.
    pub total_allocated: usize,
}

/// Where an allocation was placed.
#[derive(Debug, Clone, Copy)]
enum Placement {
    Chunk(ChunkGrant),
    Big(BigGrant),
}

impl Placement {
    fn ptr(&self) -> usize {
        match self {
            Self::Chunk(grant) => grant.ptr,
            Self::Big(grant) => grant.ptr,
        }
    }

    fn bin(&self) -> usize {
        match self {
            Self::Chunk(grant) => grant.class,
            Self::Big(_) => NUM_SIZE_CLASSES,
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Self::Chunk(grant) => grant.source.as_str(),
            Self::Big(grant) => grant.source.as_str(),
        }
    }
}

/// Single allocator context.
pub struct MallocState {
    config: MallocConfig,
    mapper: Box<dyn PageMapper>,
    chunked: ChunkedPool,
    big: BigPool,
    stats: MallocStats,
    profiler: Option<Box<dyn ProfilerHook>>,
    /// Monotonic lifecycle decision id.
    next_decision_id: u64,
    lifecycle_logs: VecDeque<AllocatorLogRecord>,
    /// Records pushed out of a full `lifecycle_logs` before anyone drained them.
    dropped_lifecycle_logs: u64,
    /// Live allocations.
    active_count: usize,
    /// Client bytes currently requested by live allocations.
    total_allocated: usize,
}

impl MallocState {
    /// Creates an allocator context over `mapper`.
    pub fn new(config: MallocConfig, mapper: impl PageMapper + 'static) -> Self {
        Self::with_boxed_mapper(config, Box::new(mapper))
    }

    pub fn with_boxed_mapper(config: MallocConfig, mapper: Box<dyn PageMapper>) -> Self {
        Self {
            chunked: ChunkedPool::new(config.hot_blocks_per_class, config.cold_blocks_per_class),
            big: BigPool::new(config.big_blocks_per_class),
            config,
            mapper,
            stats: MallocStats::default(),
            profiler: None,
            next_decision_id: 1,
            lifecycle_logs: VecDeque::new(),
            dropped_lifecycle_logs: 0,
            active_count: 0,
            total_allocated: 0,
        }
    }

    /// Installs the hook that receives events while `notify_profiler` is on.
    pub fn set_profiler(&mut self, hook: Box<dyn ProfilerHook>) {
        self.profiler = Some(hook);
    }

    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    fn record_lifecycle(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        bin: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if level <= AllocatorLogLevel::Debug && !self.config.log {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("blockheap::malloc::{}::{:016x}", symbol, decision_id);
        if self.lifecycle_logs.len() >= LIFECYCLE_LOG_CAPACITY {
            self.lifecycle_logs.pop_front();
            self.dropped_lifecycle_logs += 1;
        }
        self.lifecycle_logs.push_back(AllocatorLogRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            ptr,
            size,
            bin,
            outcome,
            details: details.into(),
            active_count: self.active_count,
            total_allocated: self.total_allocated,
        });
    }

    fn record_allocator_stats(&mut self, symbol: &'static str) {
        if !self.config.log {
            return;
        }
        let details = format!(
            "blocks={};cached_blocks={};big_live={};big_cached={}",
            self.chunked.block_count(),
            self.chunked.cached_blocks(),
            self.big.live_count(),
            self.big.cached_total()
        );
        self.record_lifecycle(
            AllocatorLogLevel::Debug,
            symbol,
            "allocator_stats",
            None,
            None,
            None,
            "snapshot",
            details,
        );
    }

    fn record_failure(&mut self, symbol: &'static str, ptr: usize, err: &MallocError) {
        let (level, event) = match err {
            MallocError::DoubleFree { .. } => (AllocatorLogLevel::Warn, "double_free_detected"),
            MallocError::InvalidPointer { .. } => {
                (AllocatorLogLevel::Warn, "unknown_pointer")
            }
            MallocError::HeaderCorrupted { .. } => {
                (AllocatorLogLevel::Error, "header_corrupted")
            }
            _ => (AllocatorLogLevel::Error, "release_failed"),
        };
        self.record_lifecycle(
            level,
            symbol,
            event,
            Some(ptr),
            None,
            None,
            err.label(),
            err.to_string(),
        );
    }

    fn notify(&mut self, event: ProfilerEvent) {
        if !self.config.notify_profiler {
            return;
        }
        if let Some(hook) = self.profiler.as_mut() {
            hook.notify(event);
        }
    }

    fn place(&mut self, size: usize) -> Result<Placement, MallocError> {
        let mapper = self.mapper.as_mut();
        match size_class::class_for(size) {
            Some(class) => self
                .chunked
                .allocate(class, size, mapper, &mut self.stats)
                .map(Placement::Chunk),
            None => self
                .big
                .allocate(size, mapper, &mut self.stats)
                .map(Placement::Big),
        }
    }

    /// Places an allocation, purging the retention caches once on
    /// out-of-memory or a mapper failure before giving up.
    fn place_with_recovery(&mut self, size: usize) -> Result<Placement, MallocError> {
        match self.place(size) {
            Err(err @ (MallocError::OutOfMemory { .. } | MallocError::Map(_))) => {
                let (released, purge_err) = self.purge_all();
                if let Some(purge_err) = purge_err {
                    self.record_lifecycle(
                        AllocatorLogLevel::Error,
                        "malloc",
                        "purge_unmap_failed",
                        None,
                        Some(size),
                        None,
                        "map_error",
                        purge_err.to_string(),
                    );
                }
                if released == 0 {
                    return Err(err);
                }
                self.stats.number_of_oom_purges += 1;
                self.record_lifecycle(
                    AllocatorLogLevel::Info,
                    "malloc",
                    "oom_purge_retry",
                    None,
                    Some(size),
                    None,
                    "retry",
                    format!("released={released}"),
                );
                self.place(size)
            }
            other => other,
        }
    }

    /// Allocates `size` bytes and returns the client pointer.
    ///
    /// `malloc(0)` returns a unique pointer with the smallest usable size.
    pub fn malloc(&mut self, size: usize) -> Result<usize, MallocError> {
        self.stats.number_of_malloc_calls += 1;

        let placement = match self.place_with_recovery(size) {
            Ok(placement) => placement,
            Err(err) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "malloc",
                    "alloc",
                    None,
                    Some(size),
                    size_class::class_for(size).or(Some(NUM_SIZE_CLASSES)),
                    err.label(),
                    err.to_string(),
                );
                self.record_allocator_stats("malloc");
                return Err(err);
            }
        };
        let ptr = placement.ptr();

        if self.config.scrub_on_alloc {
            match placement {
                Placement::Chunk(_) => self.chunked.bytes_mut(ptr)?.fill(MALLOC_SCRUB_BYTE),
                Placement::Big(_) => self.big.bytes_mut(ptr)?[..size].fill(MALLOC_SCRUB_BYTE),
            }
        }

        if let Placement::Chunk(ChunkGrant {
            initialized_block: Some(block),
            class,
            ..
        }) = placement
        {
            self.notify(ProfilerEvent::ChunkSizeChanged {
                block,
                chunk_size: size_class::chunk_size(class),
            });
        }
        self.notify(ProfilerEvent::Malloc { ptr, size });

        self.active_count += 1;
        self.total_allocated += size;
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "malloc",
            "alloc",
            Some(ptr),
            Some(size),
            Some(placement.bin()),
            "success",
            format!("path={}", placement.path()),
        );
        self.record_allocator_stats("malloc");
        Ok(ptr)
    }

    /// Frees a previously allocated pointer. `free(0)` is a no-op.
    pub fn free(&mut self, ptr: usize) -> Result<(), MallocError> {
        self.free_as("free", ptr)
    }

    fn free_as(&mut self, symbol: &'static str, ptr: usize) -> Result<(), MallocError> {
        if ptr == 0 {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                symbol,
                "free_null",
                Some(ptr),
                None,
                None,
                "noop",
                "null_pointer",
            );
            return Ok(());
        }
        self.stats.number_of_free_calls += 1;

        let scrub = self.config.scrub_on_free.then_some(FREE_SCRUB_BYTE);
        let base = size_class::block_base(ptr);
        let frees_before = self.stats.number_of_frees;
        let cold_keeps_before = self.stats.number_of_cold_keeps;
        let mapper = self.mapper.as_mut();

        let released = if self.chunked.owns(base) {
            self.chunked
                .deallocate(ptr, scrub, mapper, &mut self.stats)
                .map(|release| (release.size, release.class, "chunk", release.deferred))
        } else if self.big.owns(base) {
            self.big
                .deallocate(ptr, scrub, mapper, &mut self.stats)
                .map(|release| {
                    let path = if release.kept { "big_kept" } else { "big_unmapped" };
                    (release.size, NUM_SIZE_CLASSES, path, release.deferred)
                })
        } else {
            Err(MallocError::InvalidPointer { ptr })
        };

        // A mapper failure after the chunk was released is reported only once
        // the accounting below is done.
        let (size, bin, path, deferred) = match released {
            Ok(released) => released,
            Err(err) => {
                self.record_failure(symbol, ptr, &err);
                self.record_allocator_stats(symbol);
                return Err(err);
            }
        };

        self.notify(ProfilerEvent::Free { ptr });

        match self.total_allocated.checked_sub(size) {
            Some(next) => self.total_allocated = next,
            None => {
                self.total_allocated = 0;
                self.record_lifecycle(
                    AllocatorLogLevel::Error,
                    symbol,
                    "invariant_total_allocated_underflow",
                    Some(ptr),
                    Some(size),
                    Some(bin),
                    "recovered",
                    "checked_sub_failed",
                );
            }
        }
        match self.active_count.checked_sub(1) {
            Some(next) => self.active_count = next,
            None => {
                self.active_count = 0;
                self.record_lifecycle(
                    AllocatorLogLevel::Error,
                    symbol,
                    "invariant_active_count_underflow",
                    Some(ptr),
                    Some(size),
                    Some(bin),
                    "recovered",
                    "checked_sub_failed",
                );
            }
        }

        if self.stats.number_of_cold_keeps > cold_keeps_before {
            self.record_lifecycle(
                AllocatorLogLevel::Info,
                symbol,
                "cache_demote_cold",
                Some(ptr),
                None,
                Some(bin),
                "demoted",
                "hot_cache_full",
            );
        }
        if self.stats.number_of_frees > frees_before {
            self.record_lifecycle(
                AllocatorLogLevel::Info,
                symbol,
                "cache_evict_unmap",
                Some(ptr),
                None,
                Some(bin),
                "unmapped",
                "cold_cache_full",
            );
        }
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            symbol,
            "free",
            Some(ptr),
            Some(size),
            Some(bin),
            "success",
            format!("path={path}"),
        );
        if let Some(map_err) = deferred {
            let err = MallocError::Map(map_err);
            self.record_failure(symbol, ptr, &err);
            self.record_allocator_stats(symbol);
            return Err(err);
        }
        self.record_allocator_stats(symbol);
        Ok(())
    }

    /// Allocates `count * size` zeroed bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<usize, MallocError> {
        self.stats.number_of_calloc_calls += 1;
        let Some(total) = count.checked_mul(size) else {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "calloc",
                "calloc_overflow",
                None,
                None,
                None,
                "denied",
                format!("count={count} size={size}"),
            );
            return Err(MallocError::CallocOverflow { count, size });
        };
        let ptr = self.malloc(total)?;
        self.bytes_mut(ptr)?[..total].fill(0);
        Ok(ptr)
    }

    /// Resizes an allocation.
    ///
    /// `realloc(0, n)` is `malloc(n)`; `realloc(p, 0)` frees `p` and returns
    /// `None`. Requests that fit the current capacity keep the pointer;
    /// otherwise the first `min(old, new)` bytes move to fresh storage and
    /// the old pointer is freed after the copy.
    pub fn realloc(&mut self, ptr: usize, new_size: usize) -> Result<Option<usize>, MallocError> {
        self.stats.number_of_realloc_calls += 1;
        if ptr == 0 {
            return self.malloc(new_size).map(Some);
        }
        if new_size == 0 {
            self.free_as("realloc", ptr)?;
            return Ok(None);
        }

        let (old_size, usable) = match self.requested_size(ptr).and_then(|old| {
            self.malloc_size(ptr).map(|usable| (old, usable))
        }) {
            Ok(sizes) => sizes,
            Err(err) => {
                self.record_failure("realloc", ptr, &err);
                return Err(err);
            }
        };

        if new_size <= usable {
            self.set_requested_size(ptr, new_size)?;
            self.total_allocated = self.total_allocated.saturating_sub(old_size) + new_size;
            self.notify(ProfilerEvent::Realloc {
                ptr,
                size: new_size,
            });
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "realloc",
                "realloc_in_place",
                Some(ptr),
                Some(new_size),
                None,
                "success",
                format!("old_size={old_size} usable={usable}"),
            );
            return Ok(Some(ptr));
        }

        let new_ptr = self.malloc(new_size)?;
        let preserved = old_size.min(new_size);
        let data = self.bytes(ptr)?[..preserved].to_vec();
        self.bytes_mut(new_ptr)?[..preserved].copy_from_slice(&data);
        match self.free_as("realloc", ptr) {
            // The old allocation is released and the failure already logged;
            // the caller must still learn the new pointer.
            Ok(()) | Err(MallocError::Map(_)) => {}
            Err(err) => return Err(err),
        }
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "realloc",
            "realloc_move",
            Some(new_ptr),
            Some(new_size),
            None,
            "success",
            format!("from={ptr:#x} copied={preserved}"),
        );
        Ok(Some(new_ptr))
    }

    /// Usable bytes behind a live pointer. `malloc_size(0)` is 0.
    pub fn malloc_size(&self, ptr: usize) -> Result<usize, MallocError> {
        if ptr == 0 {
            return Ok(0);
        }
        let base = size_class::block_base(ptr);
        if self.chunked.owns(base) {
            self.chunked.usable_size(ptr)
        } else if self.big.owns(base) {
            self.big.usable_size(ptr)
        } else {
            Err(MallocError::InvalidPointer { ptr })
        }
    }

    /// Capacity a request of `size` bytes would receive.
    #[must_use]
    pub fn malloc_good_size(&self, size: usize) -> Option<usize> {
        size_class::good_size(size)
    }

    /// Bytes the client requested for a live pointer.
    pub fn requested_size(&self, ptr: usize) -> Result<usize, MallocError> {
        let base = size_class::block_base(ptr);
        if self.chunked.owns(base) {
            self.chunked.requested_size(ptr)
        } else if self.big.owns(base) {
            self.big.requested_size(ptr)
        } else {
            Err(MallocError::InvalidPointer { ptr })
        }
    }

    fn set_requested_size(&mut self, ptr: usize, size: usize) -> Result<(), MallocError> {
        if self.chunked.owns(size_class::block_base(ptr)) {
            self.chunked.set_requested_size(ptr, size)
        } else {
            self.big.set_requested_size(ptr, size)
        }
    }

    /// Requested size of a live pointer, `None` if it is not live.
    #[must_use]
    pub fn lookup(&self, ptr: usize) -> Option<usize> {
        self.requested_size(ptr).ok()
    }

    /// The usable bytes of a live allocation.
    pub fn bytes(&self, ptr: usize) -> Result<&[u8], MallocError> {
        let base = size_class::block_base(ptr);
        if self.chunked.owns(base) {
            self.chunked.bytes(ptr)
        } else if self.big.owns(base) {
            self.big.bytes(ptr)
        } else {
            Err(MallocError::InvalidPointer { ptr })
        }
    }

    /// The usable bytes of a live allocation, mutably.
    pub fn bytes_mut(&mut self, ptr: usize) -> Result<&mut [u8], MallocError> {
        let base = size_class::block_base(ptr);
        if self.chunked.owns(base) {
            self.chunked.bytes_mut(ptr)
        } else if self.big.owns(base) {
            self.big.bytes_mut(ptr)
        } else {
            Err(MallocError::InvalidPointer { ptr })
        }
    }

    /// Unmaps everything held by the retention caches and recycle lists.
    ///
    /// Returns the number of mappings released. Every cached mapping is
    /// dropped from the caches even when an unmap fails; the first failure
    /// is returned after that.
    pub fn purge_caches(&mut self) -> Result<usize, MallocError> {
        match self.purge_all() {
            (_, Some(err)) => Err(err.into()),
            (released, None) => Ok(released),
        }
    }

    fn purge_all(&mut self) -> (usize, Option<MapError>) {
        let mapper = self.mapper.as_mut();
        let (blocks, block_err) = self.chunked.purge_caches(mapper, &mut self.stats);
        let (big, big_err) = self.big.purge_caches(mapper, &mut self.stats);
        (blocks + big, block_err.or(big_err))
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> MallocStats {
        self.stats
    }

    #[must_use]
    pub fn config(&self) -> &MallocConfig {
        &self.config
    }

    #[must_use]
    pub fn chunked(&self) -> &ChunkedPool {
        &self.chunked
    }

    #[must_use]
    pub fn big(&self) -> &BigPool {
        &self.big
    }

    /// Returns the number of live allocations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Returns the client bytes currently requested by live allocations.
    #[must_use]
    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    /// Returns the retained lifecycle records, oldest first.
    pub fn lifecycle_logs(&self) -> impl Iterator<Item = &AllocatorLogRecord> {
        self.lifecycle_logs.iter()
    }

    /// Drains and returns the lifecycle records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        self.lifecycle_logs.drain(..).collect()
    }

    /// Lifecycle records lost to the bounded buffer since creation.
    #[must_use]
    pub fn dropped_lifecycle_logs(&self) -> u64 {
        self.dropped_lifecycle_logs
    }
}

impl Drop for MallocState {
    fn drop(&mut self) {
        let mapper = self.mapper.as_mut();
        // Nothing sensible can be done with an unmap failure during teardown.
        let _ = self.chunked.release_all(mapper);
        let _ = self.big.release_all(mapper);
    }
}
