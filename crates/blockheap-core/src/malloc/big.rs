//! Big allocation handling (requests above the chunked threshold).
//!
//! Each big allocation is its own `BLOCK_SIZE`-aligned mapping rounded up to
//! a whole number of blocks. The mapping starts with a [`BigHeader`] and the
//! client pointer sits at `base + BIG_HEADER_SIZE`, right behind a
//! [`ChunkHeader`], so pointer to allocation recovery uses the same mask as
//! chunked blocks.
//!
//! Freed mappings of at most `MAX_RECYCLED_BIG_SIZE` bytes are kept in a
//! bounded recycle list per mapping size, protected and marked volatile until
//! they are handed out again.

use std::collections::{BTreeMap, HashMap};

use super::error::{MallocError, MapError};
use super::header::{BigHeader, ChunkHeader, MAGIC_BIG_HEADER, MAGIC_CHUNK_LIVE};
use super::mapper::{MappedRegion, PageMapper, Protection};
use super::retention::RetentionCache;
use super::size_class::{self, BIG_HEADER_SIZE, BLOCK_SIZE, CHUNK_HEADER_SIZE};
use super::stats::MallocStats;

/// Arena index of a big allocation.
pub type BigId = usize;

/// Where a big allocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BigSource {
    /// A recycled mapping with its contents intact.
    Recycled,
    /// A recycled mapping whose contents the OS had discarded.
    RecycledPurged,
    /// A fresh mapping.
    Fresh,
}

impl BigSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recycled => "big_recycled",
            Self::RecycledPurged => "big_recycled_purged",
            Self::Fresh => "big_fresh",
        }
    }
}

/// Result of a successful big allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigGrant {
    pub ptr: usize,
    pub mapping_size: usize,
    pub source: BigSource,
}

/// Result of a completed big release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigRelease {
    /// Bytes the client had requested.
    pub size: usize,
    pub mapping_size: usize,
    /// Whether the mapping went to a recycle list instead of being unmapped.
    pub kept: bool,
    /// Mapper failure hit while keeping or unmapping the mapping. The
    /// allocation is released either way.
    pub deferred: Option<MapError>,
}

struct BigAllocation {
    region: Box<dyn MappedRegion>,
    mapping_size: usize,
    kept: bool,
}

impl BigAllocation {
    fn base(&self) -> usize {
        self.region.base()
    }

    /// Mapping header bytes, chunk header included.
    fn header_area() -> std::ops::Range<usize> {
        0..BIG_HEADER_SIZE
    }

    fn header_slot() -> std::ops::Range<usize> {
        BIG_HEADER_SIZE - CHUNK_HEADER_SIZE..BIG_HEADER_SIZE
    }

    fn payload(&self) -> std::ops::Range<usize> {
        BIG_HEADER_SIZE..self.mapping_size
    }
}

/// Registry of live big allocations plus their recycle lists.
pub struct BigPool {
    allocations: Vec<Option<BigAllocation>>,
    vacant: Vec<BigId>,
    by_base: HashMap<usize, BigId>,
    /// Recycle lists keyed by mapping size.
    recycle: BTreeMap<usize, RetentionCache<BigId>>,
    keep_per_class: usize,
}

impl BigPool {
    /// Creates an empty pool keeping at most `keep_per_class` mappings per size.
    #[must_use]
    pub fn new(keep_per_class: usize) -> Self {
        Self {
            allocations: Vec::new(),
            vacant: Vec::new(),
            by_base: HashMap::new(),
            recycle: BTreeMap::new(),
            keep_per_class,
        }
    }

    /// Whether `base` is the base of a mapping owned by this pool.
    #[must_use]
    pub fn owns(&self, base: usize) -> bool {
        self.by_base.contains_key(&base)
    }

    /// Number of live (non-recycled) big allocations.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.by_base.len() - self.cached_total()
    }

    /// Recycled mappings of exactly `mapping_size` bytes.
    #[must_use]
    pub fn cached_len(&self, mapping_size: usize) -> usize {
        self.recycle
            .get(&mapping_size)
            .map_or(0, RetentionCache::len)
    }

    /// Recycled mappings across every size.
    #[must_use]
    pub fn cached_total(&self) -> usize {
        self.recycle.values().map(RetentionCache::len).sum()
    }

    fn entry(&self, id: BigId) -> &BigAllocation {
        self.allocations[id]
            .as_ref()
            .unwrap_or_else(|| panic!("big allocation {id} is registered but vacant"))
    }

    fn entry_mut(&mut self, id: BigId) -> &mut BigAllocation {
        self.allocations[id]
            .as_mut()
            .unwrap_or_else(|| panic!("big allocation {id} is registered but vacant"))
    }

    fn insert(&mut self, allocation: BigAllocation) -> BigId {
        let base = allocation.base();
        let id = match self.vacant.pop() {
            Some(id) => {
                self.allocations[id] = Some(allocation);
                id
            }
            None => {
                self.allocations.push(Some(allocation));
                self.allocations.len() - 1
            }
        };
        self.by_base.insert(base, id);
        id
    }

    /// Allocates a big mapping able to hold `size` client bytes.
    pub fn allocate(
        &mut self,
        size: usize,
        mapper: &mut dyn PageMapper,
        stats: &mut MallocStats,
    ) -> Result<BigGrant, MallocError> {
        let mapping_size =
            size_class::big_mapping_size(size).ok_or(MallocError::SizeOverflow { requested: size })?;

        let recycled = self
            .recycle
            .get_mut(&mapping_size)
            .and_then(RetentionCache::take_freshest);

        let (id, source) = match recycled {
            Some(id) => {
                let entry = self.entry_mut(id);
                if let Err(err) = mapper.protect(entry.region.as_mut(), Protection::ReadWrite) {
                    if let Some(list) = self.recycle.get_mut(&mapping_size) {
                        list.restore_freshest(id);
                    }
                    return Err(err.into());
                }
                stats.number_of_big_allocator_hits += 1;
                let purged = mapper.mark_nonvolatile(entry.region.as_mut());
                entry.kept = false;
                if purged {
                    stats.number_of_big_allocator_purge_hits += 1;
                    BigHeader::new(mapping_size).write(entry.region.slice_mut(BigAllocation::header_area()));
                    (id, BigSource::RecycledPurged)
                } else {
                    (id, BigSource::Recycled)
                }
            }
            None => {
                let mut region = mapper
                    .map(mapping_size, BLOCK_SIZE)
                    .map_err(|_| MallocError::OutOfMemory { requested: size })?;
                stats.number_of_big_allocs += 1;
                BigHeader::new(mapping_size).write(region.slice_mut(BigAllocation::header_area()));
                let id = self.insert(BigAllocation {
                    region,
                    mapping_size,
                    kept: false,
                });
                (id, BigSource::Fresh)
            }
        };

        let entry = self.entry_mut(id);
        ChunkHeader::live(id, size).write(entry.region.slice_mut(BigAllocation::header_slot()));
        Ok(BigGrant {
            ptr: entry.base() + BIG_HEADER_SIZE,
            mapping_size,
            source,
        })
    }

    fn resolve_live(&self, ptr: usize) -> Result<BigId, MallocError> {
        let base = size_class::block_base(ptr);
        let id = *self
            .by_base
            .get(&base)
            .ok_or(MallocError::InvalidPointer { ptr })?;
        if ptr != base + BIG_HEADER_SIZE {
            return Err(MallocError::InvalidPointer { ptr });
        }
        let entry = self.entry(id);
        // Recycled mappings are protected; never read them.
        if entry.kept {
            return Err(MallocError::DoubleFree { ptr });
        }

        let header = BigHeader::read(entry.region.slice(BigAllocation::header_area()));
        if header.magic != MAGIC_BIG_HEADER {
            return Err(MallocError::HeaderCorrupted {
                ptr,
                expected: MAGIC_BIG_HEADER,
                found: header.magic,
            });
        }
        let chunk = ChunkHeader::read(entry.region.slice(BigAllocation::header_slot()));
        if chunk.magic != MAGIC_CHUNK_LIVE || chunk.owner as usize != id {
            return Err(MallocError::HeaderCorrupted {
                ptr,
                expected: MAGIC_CHUNK_LIVE,
                found: chunk.magic,
            });
        }
        Ok(id)
    }

    pub fn requested_size(&self, ptr: usize) -> Result<usize, MallocError> {
        let id = self.resolve_live(ptr)?;
        let entry = self.entry(id);
        Ok(ChunkHeader::read(entry.region.slice(BigAllocation::header_slot())).size as usize)
    }

    pub fn usable_size(&self, ptr: usize) -> Result<usize, MallocError> {
        let id = self.resolve_live(ptr)?;
        Ok(self.entry(id).mapping_size - BIG_HEADER_SIZE)
    }

    pub fn set_requested_size(&mut self, ptr: usize, size: usize) -> Result<(), MallocError> {
        let id = self.resolve_live(ptr)?;
        let entry = self.entry_mut(id);
        ChunkHeader::live(id, size).write(entry.region.slice_mut(BigAllocation::header_slot()));
        Ok(())
    }

    pub fn bytes(&self, ptr: usize) -> Result<&[u8], MallocError> {
        let id = self.resolve_live(ptr)?;
        let entry = self.entry(id);
        Ok(entry.region.slice(entry.payload()))
    }

    pub fn bytes_mut(&mut self, ptr: usize) -> Result<&mut [u8], MallocError> {
        let id = self.resolve_live(ptr)?;
        let entry = self.entry_mut(id);
        let payload = entry.payload();
        Ok(entry.region.slice_mut(payload))
    }

    /// Releases the big allocation at `ptr`.
    ///
    /// Recyclable mappings are kept when their recycle list has room;
    /// everything else is unmapped. `scrub` fills the requested bytes of a
    /// kept mapping. A mapping that cannot be protected for keeping is
    /// unmapped instead.
    pub fn deallocate(
        &mut self,
        ptr: usize,
        scrub: Option<u8>,
        mapper: &mut dyn PageMapper,
        stats: &mut MallocStats,
    ) -> Result<BigRelease, MallocError> {
        let id = self.resolve_live(ptr)?;
        let keep_per_class = self.keep_per_class;
        let entry = self.entry(id);
        let mapping_size = entry.mapping_size;
        let size =
            ChunkHeader::read(entry.region.slice(BigAllocation::header_slot())).size as usize;

        let has_room = size_class::is_recyclable_big(mapping_size)
            && !self
                .recycle
                .entry(mapping_size)
                .or_insert_with(|| RetentionCache::new(keep_per_class))
                .is_full();

        let mut deferred = None;
        if has_room {
            let entry = self.entry_mut(id);
            if let Some(byte) = scrub {
                let end = (BIG_HEADER_SIZE + size).min(mapping_size);
                entry.region.slice_mut(BIG_HEADER_SIZE..end).fill(byte);
            }
            ChunkHeader::mark_free(entry.region.slice_mut(BigAllocation::header_slot()));
            deferred = mapper.protect(entry.region.as_mut(), Protection::None).err();
        }
        let kept = has_room && deferred.is_none();

        if kept {
            let entry = self.entry_mut(id);
            mapper.mark_volatile(entry.region.as_mut());
            entry.kept = true;
            if let Some(list) = self.recycle.get_mut(&mapping_size) {
                // Room was checked above, so nothing is evicted.
                let _ = list.admit(id);
            }
            stats.number_of_big_allocator_keeps += 1;
        } else {
            if let Err(err) = self.release(id, mapper) {
                deferred.get_or_insert(err);
            }
            stats.number_of_big_allocator_frees += 1;
        }

        Ok(BigRelease {
            size,
            mapping_size,
            kept,
            deferred,
        })
    }

    /// Forgets a mapping, then unmaps it.
    fn release(&mut self, id: BigId, mapper: &mut dyn PageMapper) -> Result<(), MapError> {
        let Some(entry) = self.allocations[id].take() else {
            return Ok(());
        };
        self.by_base.remove(&entry.base());
        self.vacant.push(id);
        mapper.unmap(entry.region)
    }

    /// Unmaps every recycled mapping. Returns how many were released and the
    /// first unmap failure.
    pub fn purge_caches(
        &mut self,
        mapper: &mut dyn PageMapper,
        stats: &mut MallocStats,
    ) -> (usize, Option<MapError>) {
        let cached: Vec<BigId> = self
            .recycle
            .values_mut()
            .flat_map(RetentionCache::drain)
            .collect();
        let mut first_err = None;
        for &id in &cached {
            if let Err(err) = self.release(id, mapper) {
                first_err.get_or_insert(err);
            }
            stats.number_of_big_allocator_frees += 1;
        }
        (cached.len(), first_err)
    }

    /// Unmaps every mapping, live or recycled. Used on teardown.
    pub fn release_all(&mut self, mapper: &mut dyn PageMapper) -> Result<(), MallocError> {
        self.recycle.clear();
        self.by_base.clear();
        self.vacant.clear();
        let mut first_err = None;
        for entry in std::mem::take(&mut self.allocations).into_iter().flatten() {
            if let Err(err) = mapper.unmap(entry.region) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), |err| Err(err.into()))
    }
}
