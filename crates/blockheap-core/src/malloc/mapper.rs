//! The virtual-memory mapping primitive the allocator grows and shrinks with.
//!
//! The allocator owns every region it maps as a `Box<dyn MappedRegion>` and
//! hands it back through [`PageMapper::unmap`]. Region memory is only ever
//! borrowed a range at a time, so the allocator never holds a reference over
//! bytes a client may be writing through a raw pointer. [`SimulatedMapper`] backs
//! regions with zeroed heap buffers at synthetic addresses and records every
//! call, so allocator policy can be observed without touching the OS. The real
//! `mmap` implementation lives in the `blockheap-os` crate.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use super::error::MapError;

/// Access protection applied to a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No access; touching the region faults.
    None,
    /// Normal read/write access.
    ReadWrite,
}

/// A page-granular region returned by a [`PageMapper`].
pub trait MappedRegion: Send {
    /// Address of the first byte.
    fn base(&self) -> usize;
    /// Length in bytes.
    fn len(&self) -> usize;

    /// Bytes `range` of the region, relative to its base.
    ///
    /// # Panics
    ///
    /// Panics if `range` does not lie within `0..len()`.
    fn slice(&self, range: Range<usize>) -> &[u8];

    /// Mutable bytes `range` of the region, relative to its base.
    ///
    /// # Panics
    ///
    /// Panics if `range` does not lie within `0..len()`.
    fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8];

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of page-granular memory.
pub trait PageMapper: Send {
    fn page_size(&self) -> usize;

    /// Maps `size` zero-filled bytes whose base is a multiple of `align`.
    fn map(&mut self, size: usize, align: usize) -> Result<Box<dyn MappedRegion>, MapError>;

    /// Returns a region to the operating system.
    fn unmap(&mut self, region: Box<dyn MappedRegion>) -> Result<(), MapError>;

    fn protect(
        &mut self,
        _region: &mut dyn MappedRegion,
        _protection: Protection,
    ) -> Result<(), MapError> {
        Ok(())
    }

    /// Allows the OS to discard the region's contents while it sits unused.
    fn mark_volatile(&mut self, _region: &mut dyn MappedRegion) {}

    /// Revokes [`mark_volatile`](Self::mark_volatile). Returns `true` if the
    /// contents were discarded in the meantime (the region now reads as zero).
    fn mark_nonvolatile(&mut self, _region: &mut dyn MappedRegion) -> bool {
        false
    }
}

/// Lowest synthetic address handed out by [`SimulatedMapper`].
const SIMULATED_BASE: usize = 0x1000_0000;

/// Page size reported by [`SimulatedMapper`].
pub const SIMULATED_PAGE_SIZE: usize = 4096;

#[derive(Debug)]
struct SimState {
    next_base: usize,
    map_calls: u64,
    unmap_calls: u64,
    failed_maps: u64,
    live: HashMap<usize, usize>,
    mapped_bytes: usize,
    map_budget: Option<usize>,
    capacity: Option<usize>,
    purge_volatile: bool,
    fail_protect: bool,
    fail_unmap: bool,
    volatile: HashSet<usize>,
    protected: HashSet<usize>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            next_base: SIMULATED_BASE,
            map_calls: 0,
            unmap_calls: 0,
            failed_maps: 0,
            live: HashMap::new(),
            mapped_bytes: 0,
            map_budget: None,
            capacity: None,
            purge_volatile: false,
            fail_protect: false,
            fail_unmap: false,
            volatile: HashSet::new(),
            protected: HashSet::new(),
        }
    }
}

struct SimRegion {
    base: usize,
    bytes: Box<[u8]>,
}

impl MappedRegion for SimRegion {
    fn base(&self) -> usize {
        self.base
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.bytes[range]
    }

    fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.bytes[range]
    }
}

/// Deterministic in-process mapping primitive.
///
/// Clones share state, so a test can keep a handle while the allocator owns
/// another and then inspect call counts or inject failures.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMapper {
    shared: Arc<Mutex<SimState>>,
}

impl SimulatedMapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `map` calls so far.
    pub fn map_calls(&self) -> u64 {
        self.shared.lock().map_calls
    }

    /// Number of successful `unmap` calls so far.
    pub fn unmap_calls(&self) -> u64 {
        self.shared.lock().unmap_calls
    }

    /// Number of `map` calls refused because the budget ran out.
    pub fn failed_maps(&self) -> u64 {
        self.shared.lock().failed_maps
    }

    /// Regions currently mapped.
    pub fn live_mappings(&self) -> usize {
        self.shared.lock().live.len()
    }

    /// Bytes currently mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.shared.lock().mapped_bytes
    }

    /// Limits how many further `map` calls may succeed. `None` is unlimited.
    pub fn set_map_budget(&self, budget: Option<usize>) {
        self.shared.lock().map_budget = budget;
    }

    /// Caps the bytes that may be mapped at once. Unmapping frees capacity.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.shared.lock().capacity = capacity;
    }

    /// When enabled, every volatile region is reported purged (and zeroed)
    /// when it is made non-volatile again.
    pub fn set_purge_volatile(&self, purge: bool) {
        self.shared.lock().purge_volatile = purge;
    }

    /// Makes every further `protect` call fail until cleared.
    pub fn set_fail_protect(&self, fail: bool) {
        self.shared.lock().fail_protect = fail;
    }

    /// Makes every further `unmap` call fail until cleared. The region is
    /// dropped but stays counted as live, like a mapping the kernel kept.
    pub fn set_fail_unmap(&self, fail: bool) {
        self.shared.lock().fail_unmap = fail;
    }

    pub fn is_volatile(&self, base: usize) -> bool {
        self.shared.lock().volatile.contains(&base)
    }

    pub fn is_protected(&self, base: usize) -> bool {
        self.shared.lock().protected.contains(&base)
    }
}

impl PageMapper for SimulatedMapper {
    fn page_size(&self) -> usize {
        SIMULATED_PAGE_SIZE
    }

    fn map(&mut self, size: usize, align: usize) -> Result<Box<dyn MappedRegion>, MapError> {
        if !align.is_power_of_two() {
            return Err(MapError::InvalidAlignment { align });
        }
        let align = align.max(SIMULATED_PAGE_SIZE);
        let len = size
            .checked_add(SIMULATED_PAGE_SIZE - 1)
            .map(|v| v & !(SIMULATED_PAGE_SIZE - 1))
            .filter(|&len| len > 0)
            .ok_or(MapError::OutOfMemory { size })?;

        let mut state = self.shared.lock();
        let over_capacity = state
            .capacity
            .is_some_and(|cap| state.mapped_bytes + len > cap);
        if state.map_budget == Some(0) || over_capacity {
            state.failed_maps += 1;
            return Err(MapError::OutOfMemory { size });
        }
        if let Some(budget) = state.map_budget.as_mut() {
            *budget -= 1;
        }
        let base = state
            .next_base
            .checked_add(align - 1)
            .map(|v| v & !(align - 1))
            .ok_or(MapError::OutOfMemory { size })?;
        // Leave a one-page hole after each region so neighbours never touch.
        state.next_base = base
            .checked_add(len + SIMULATED_PAGE_SIZE)
            .ok_or(MapError::OutOfMemory { size })?;

        state.map_calls += 1;
        state.live.insert(base, len);
        state.mapped_bytes += len;
        drop(state);

        Ok(Box::new(SimRegion {
            base,
            bytes: vec![0u8; len].into_boxed_slice(),
        }))
    }

    fn unmap(&mut self, region: Box<dyn MappedRegion>) -> Result<(), MapError> {
        let (base, len) = (region.base(), region.len());
        let mut state = self.shared.lock();
        if state.fail_unmap || state.live.get(&base) != Some(&len) {
            return Err(MapError::UnmapFailed { base, len });
        }
        state.live.remove(&base);
        state.volatile.remove(&base);
        state.protected.remove(&base);
        state.mapped_bytes -= len;
        state.unmap_calls += 1;
        Ok(())
    }

    fn protect(
        &mut self,
        region: &mut dyn MappedRegion,
        protection: Protection,
    ) -> Result<(), MapError> {
        let base = region.base();
        let mut state = self.shared.lock();
        if state.fail_protect || !state.live.contains_key(&base) {
            return Err(MapError::ProtectFailed {
                base,
                len: region.len(),
            });
        }
        match protection {
            Protection::None => state.protected.insert(base),
            Protection::ReadWrite => state.protected.remove(&base),
        };
        Ok(())
    }

    fn mark_volatile(&mut self, region: &mut dyn MappedRegion) {
        self.shared.lock().volatile.insert(region.base());
    }

    fn mark_nonvolatile(&mut self, region: &mut dyn MappedRegion) -> bool {
        let purged = {
            let mut state = self.shared.lock();
            state.volatile.remove(&region.base()) && state.purge_volatile
        };
        if purged {
            let len = region.len();
            region.slice_mut(0..len).fill(0);
        }
        purged
    }
}
