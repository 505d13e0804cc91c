//! Chunked block pool for small and medium allocations.
//!
//! Each block is one `BLOCK_SIZE` mapping carved into equal chunks of a
//! single size class. Blocks move between four states:
//!
//! - `Usable`: at least one free and one used chunk, or freshly carved.
//! - `Full`: no free chunk left.
//! - `Hot`: empty, kept mapped and ready in the per-class hot cache.
//! - `Cold`: empty, demoted from the hot cache, access-protected and marked
//!   volatile so the OS may reclaim its pages.
//!
//! Blocks live in an index arena; `by_base` maps a block base (recovered
//! from any client pointer by masking) back to its arena slot.

use std::collections::HashMap;

use super::error::{MallocError, MapError};
use super::header::{BlockHeader, ChunkHeader, MAGIC_BLOCK_HEADER, MAGIC_CHUNK_LIVE};
use super::mapper::{MappedRegion, PageMapper, Protection};
use super::retention::RetentionCache;
use super::size_class::{
    self, BLOCK_HEADER_SIZE, BLOCK_SIZE, CHUNK_HEADER_SIZE, NUM_SIZE_CLASSES,
};
use super::stats::MallocStats;

/// Arena index of a chunked block.
pub type BlockId = usize;

/// Lifecycle state of a chunked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Usable,
    Full,
    Hot,
    Cold,
}

/// Where a chunk allocation found its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// A partially full block of the class.
    Usable,
    /// The hot empty-block cache.
    Hot,
    /// The cold empty-block cache, contents intact.
    Cold,
    /// The cold empty-block cache, contents discarded by the OS.
    ColdPurged,
    /// A fresh mapping.
    Fresh,
}

impl BlockSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable_block",
            Self::Hot => "hot_block",
            Self::Cold => "cold_block",
            Self::ColdPurged => "cold_block_purged",
            Self::Fresh => "fresh_block",
        }
    }
}

/// Result of a successful chunk allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrant {
    /// Client pointer.
    pub ptr: usize,
    pub class: usize,
    pub source: BlockSource,
    /// Base of the block if it was (re)initialized for this class.
    pub initialized_block: Option<usize>,
}

/// Result of a completed chunk release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRelease {
    pub class: usize,
    /// Bytes the client had requested.
    pub size: usize,
    /// State the owning block ended in (`None` once it was unmapped).
    pub block_state: Option<BlockState>,
    /// Mapper failure hit while retiring the empty block. The chunk is
    /// released and the pool is consistent; the caller decides how to report.
    pub deferred: Option<MapError>,
}

struct ChunkedBlock {
    region: Box<dyn MappedRegion>,
    class: usize,
    chunk_size: usize,
    capacity: usize,
    /// Next never-used chunk index.
    next_lazy: usize,
    /// Recycled chunk indices.
    free_list: Vec<u32>,
    occupied: Vec<bool>,
    used: usize,
    state: BlockState,
}

impl ChunkedBlock {
    fn new(region: Box<dyn MappedRegion>, class: usize) -> Self {
        let chunk_size = size_class::chunk_size(class);
        let capacity = size_class::chunks_per_block(class);
        let mut block = Self {
            region,
            class,
            chunk_size,
            capacity,
            next_lazy: 0,
            free_list: Vec::new(),
            occupied: vec![false; capacity],
            used: 0,
            state: BlockState::Usable,
        };
        block.write_header();
        block
    }

    fn base(&self) -> usize {
        self.region.base()
    }

    fn write_header(&mut self) {
        BlockHeader::new(self.chunk_size, self.capacity)
            .write(self.region.slice_mut(0..BLOCK_HEADER_SIZE));
    }

    /// Forgets every recycled chunk; used after the OS discarded the block.
    fn reinitialize(&mut self) {
        self.next_lazy = 0;
        self.free_list.clear();
        self.occupied.fill(false);
        self.write_header();
    }

    /// Offset of chunk `index` from the block base.
    fn chunk_offset(&self, index: usize) -> usize {
        BLOCK_HEADER_SIZE + index * self.chunk_size
    }

    fn take_chunk(&mut self) -> Option<usize> {
        let index = match self.free_list.pop() {
            Some(index) => index as usize,
            None if self.next_lazy < self.capacity => {
                self.next_lazy += 1;
                self.next_lazy - 1
            }
            None => return None,
        };
        self.occupied[index] = true;
        self.used += 1;
        Some(index)
    }

    fn release_chunk(&mut self, index: usize) {
        self.occupied[index] = false;
        self.free_list.push(index as u32);
        self.used -= 1;
    }

    /// Chunk index for a client pointer, if it sits exactly on a chunk.
    fn chunk_index(&self, ptr: usize) -> Option<usize> {
        let offset = ptr
            .checked_sub(self.base())?
            .checked_sub(BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE)?;
        if offset % self.chunk_size != 0 {
            return None;
        }
        let index = offset / self.chunk_size;
        (index < self.capacity).then_some(index)
    }

    fn header_slot(&self, index: usize) -> std::ops::Range<usize> {
        let start = self.chunk_offset(index);
        start..start + CHUNK_HEADER_SIZE
    }

    fn payload(&self, index: usize) -> std::ops::Range<usize> {
        let start = self.chunk_offset(index) + CHUNK_HEADER_SIZE;
        start..start + self.chunk_size - CHUNK_HEADER_SIZE
    }
}

/// Size-class segregated pool of chunked blocks with hot/cold retention.
pub struct ChunkedPool {
    blocks: Vec<Option<ChunkedBlock>>,
    vacant: Vec<BlockId>,
    by_base: HashMap<usize, BlockId>,
    /// Per class: blocks with at least one free chunk, most recent last.
    usable: Vec<Vec<BlockId>>,
    hot: Vec<RetentionCache<BlockId>>,
    cold: Vec<RetentionCache<BlockId>>,
}

impl ChunkedPool {
    /// Creates an empty pool with the given per-class cache capacities.
    #[must_use]
    pub fn new(hot_capacity: usize, cold_capacity: usize) -> Self {
        Self {
            blocks: Vec::new(),
            vacant: Vec::new(),
            by_base: HashMap::new(),
            usable: (0..NUM_SIZE_CLASSES).map(|_| Vec::new()).collect(),
            hot: (0..NUM_SIZE_CLASSES)
                .map(|_| RetentionCache::new(hot_capacity))
                .collect(),
            cold: (0..NUM_SIZE_CLASSES)
                .map(|_| RetentionCache::new(cold_capacity))
                .collect(),
        }
    }

    /// Whether `base` is the base of a block owned by this pool.
    #[must_use]
    pub fn owns(&self, base: usize) -> bool {
        self.by_base.contains_key(&base)
    }

    /// Number of mapped blocks, cached ones included.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.by_base.len()
    }

    #[must_use]
    pub fn hot_len(&self, class: usize) -> usize {
        self.hot.get(class).map_or(0, RetentionCache::len)
    }

    #[must_use]
    pub fn cold_len(&self, class: usize) -> usize {
        self.cold.get(class).map_or(0, RetentionCache::len)
    }

    #[must_use]
    pub fn usable_len(&self, class: usize) -> usize {
        self.usable.get(class).map_or(0, Vec::len)
    }

    /// Total empty blocks held by all retention caches.
    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.hot.iter().map(RetentionCache::len).sum::<usize>()
            + self.cold.iter().map(RetentionCache::len).sum::<usize>()
    }

    /// State of the block owning `ptr`.
    #[must_use]
    pub fn block_state(&self, ptr: usize) -> Option<BlockState> {
        let id = *self.by_base.get(&size_class::block_base(ptr))?;
        self.blocks[id].as_ref().map(|block| block.state)
    }

    fn block(&self, id: BlockId) -> &ChunkedBlock {
        self.blocks[id]
            .as_ref()
            .unwrap_or_else(|| panic!("chunked block {id} is registered but vacant"))
    }

    fn block_mut(&mut self, id: BlockId) -> &mut ChunkedBlock {
        self.blocks[id]
            .as_mut()
            .unwrap_or_else(|| panic!("chunked block {id} is registered but vacant"))
    }

    fn insert(&mut self, block: ChunkedBlock) -> BlockId {
        let base = block.base();
        let id = match self.vacant.pop() {
            Some(id) => {
                self.blocks[id] = Some(block);
                id
            }
            None => {
                self.blocks.push(Some(block));
                self.blocks.len() - 1
            }
        };
        self.by_base.insert(base, id);
        id
    }

    /// Allocates one chunk of `class` for a request of `size` bytes.
    ///
    /// Search order: a partially full block, the hot cache, the cold cache,
    /// then a fresh mapping.
    pub fn allocate(
        &mut self,
        class: usize,
        size: usize,
        mapper: &mut dyn PageMapper,
        stats: &mut MallocStats,
    ) -> Result<ChunkGrant, MallocError> {
        let mut initialized_block = None;
        let (id, source) = if let Some(&id) = self.usable[class].last() {
            stats.number_of_usable_block_hits += 1;
            (id, BlockSource::Usable)
        } else if let Some(id) = self.hot[class].take_freshest() {
            stats.number_of_hot_empty_block_hits += 1;
            self.block_mut(id).state = BlockState::Usable;
            self.usable[class].push(id);
            (id, BlockSource::Hot)
        } else if let Some(id) = self.cold[class].take_freshest() {
            let block = self.block_mut(id);
            if let Err(err) = mapper.protect(block.region.as_mut(), Protection::ReadWrite) {
                // Still protected and volatile; put it back where it was.
                self.cold[class].restore_freshest(id);
                return Err(err.into());
            }
            stats.number_of_cold_empty_block_hits += 1;
            let block = self.block_mut(id);
            let purged = mapper.mark_nonvolatile(block.region.as_mut());
            block.state = BlockState::Usable;
            let source = if purged {
                block.reinitialize();
                initialized_block = Some(block.base());
                stats.number_of_cold_empty_block_purge_hits += 1;
                BlockSource::ColdPurged
            } else {
                BlockSource::Cold
            };
            self.usable[class].push(id);
            (id, source)
        } else {
            let region = mapper
                .map(BLOCK_SIZE, BLOCK_SIZE)
                .map_err(|_| MallocError::OutOfMemory { requested: size })?;
            stats.number_of_block_allocs += 1;
            let block = ChunkedBlock::new(region, class);
            initialized_block = Some(block.base());
            let id = self.insert(block);
            self.usable[class].push(id);
            (id, BlockSource::Fresh)
        };

        let block = self.block_mut(id);
        // Blocks on the usable list always have a free chunk.
        let index = block
            .take_chunk()
            .ok_or(MallocError::OutOfMemory { requested: size })?;
        let slot = block.header_slot(index);
        ChunkHeader::live(id, size).write(block.region.slice_mut(slot));
        let ptr = block.base() + block.payload(index).start;

        if block.used == block.capacity {
            block.state = BlockState::Full;
            stats.number_of_blocks_full += 1;
            self.usable[class].retain(|&b| b != id);
        }

        Ok(ChunkGrant {
            ptr,
            class,
            source,
            initialized_block,
        })
    }

    /// Resolves a client pointer to its live chunk, checking every header.
    fn resolve_live(&self, ptr: usize) -> Result<(BlockId, usize), MallocError> {
        let base = size_class::block_base(ptr);
        let id = *self
            .by_base
            .get(&base)
            .ok_or(MallocError::InvalidPointer { ptr })?;
        let block = self.block(id);
        // Cached blocks may be access-protected; never read their memory.
        if matches!(block.state, BlockState::Hot | BlockState::Cold) {
            return match block.chunk_index(ptr) {
                Some(_) => Err(MallocError::DoubleFree { ptr }),
                None => Err(MallocError::InvalidPointer { ptr }),
            };
        }

        let block_header = BlockHeader::read(block.region.slice(0..BLOCK_HEADER_SIZE));
        if block_header.magic != MAGIC_BLOCK_HEADER {
            return Err(MallocError::HeaderCorrupted {
                ptr,
                expected: MAGIC_BLOCK_HEADER,
                found: block_header.magic,
            });
        }

        let index = block
            .chunk_index(ptr)
            .ok_or(MallocError::InvalidPointer { ptr })?;
        if !block.occupied[index] {
            return Err(MallocError::DoubleFree { ptr });
        }

        let header = ChunkHeader::read(block.region.slice(block.header_slot(index)));
        if header.magic != MAGIC_CHUNK_LIVE || header.owner as usize != id {
            return Err(MallocError::HeaderCorrupted {
                ptr,
                expected: MAGIC_CHUNK_LIVE,
                found: header.magic,
            });
        }
        Ok((id, index))
    }

    /// Bytes the client requested for the live chunk at `ptr`.
    pub fn requested_size(&self, ptr: usize) -> Result<usize, MallocError> {
        let (id, index) = self.resolve_live(ptr)?;
        let block = self.block(id);
        Ok(ChunkHeader::read(block.region.slice(block.header_slot(index))).size as usize)
    }

    /// Usable capacity of the live chunk at `ptr`.
    pub fn usable_size(&self, ptr: usize) -> Result<usize, MallocError> {
        let (id, _) = self.resolve_live(ptr)?;
        Ok(self.block(id).chunk_size - CHUNK_HEADER_SIZE)
    }

    /// Records a new requested size for the live chunk at `ptr`.
    pub fn set_requested_size(&mut self, ptr: usize, size: usize) -> Result<(), MallocError> {
        let (id, index) = self.resolve_live(ptr)?;
        let block = self.block_mut(id);
        let slot = block.header_slot(index);
        ChunkHeader::live(id, size).write(block.region.slice_mut(slot));
        Ok(())
    }

    /// Client-visible bytes of the live chunk at `ptr`.
    pub fn bytes(&self, ptr: usize) -> Result<&[u8], MallocError> {
        let (id, index) = self.resolve_live(ptr)?;
        let block = self.block(id);
        Ok(block.region.slice(block.payload(index)))
    }

    /// Mutable client-visible bytes of the live chunk at `ptr`.
    pub fn bytes_mut(&mut self, ptr: usize) -> Result<&mut [u8], MallocError> {
        let (id, index) = self.resolve_live(ptr)?;
        let block = self.block_mut(id);
        let payload = block.payload(index);
        Ok(block.region.slice_mut(payload))
    }

    /// Returns the chunk at `ptr` to its block.
    ///
    /// With `scrub` set, the chunk payload is overwritten with that byte
    /// first. A block that becomes empty is retired into the retention caches.
    pub fn deallocate(
        &mut self,
        ptr: usize,
        scrub: Option<u8>,
        mapper: &mut dyn PageMapper,
        stats: &mut MallocStats,
    ) -> Result<ChunkRelease, MallocError> {
        let (id, index) = self.resolve_live(ptr)?;
        let block = self.block_mut(id);
        let class = block.class;
        let slot = block.header_slot(index);
        let size = ChunkHeader::read(block.region.slice(slot.clone())).size as usize;
        if let Some(byte) = scrub {
            let payload = block.payload(index);
            block.region.slice_mut(payload).fill(byte);
        }
        ChunkHeader::mark_free(block.region.slice_mut(slot));
        block.release_chunk(index);

        if block.state == BlockState::Full {
            block.state = BlockState::Usable;
            stats.number_of_freed_full_blocks += 1;
            self.usable[class].push(id);
        }

        let mut block_state = Some(self.block(id).state);
        let mut deferred = None;
        if self.block(id).used == 0 {
            self.usable[class].retain(|&b| b != id);
            (block_state, deferred) = self.retire_empty(id, mapper, stats);
        }
        Ok(ChunkRelease {
            class,
            size,
            block_state,
            deferred,
        })
    }

    /// Admits a newly empty block into the hot cache, demoting and purging
    /// overflow. Returns the block's final state (`None` if it was unmapped)
    /// and the first mapper failure met on the way.
    ///
    /// Never leaves a block outside both the registry and the caches: a block
    /// that cannot be protected for the cold cache is unmapped instead.
    fn retire_empty(
        &mut self,
        id: BlockId,
        mapper: &mut dyn PageMapper,
        stats: &mut MallocStats,
    ) -> (Option<BlockState>, Option<MapError>) {
        let class = self.block(id).class;
        self.block_mut(id).state = BlockState::Hot;

        let Some(demoted) = self.hot[class].admit(id) else {
            stats.number_of_hot_keeps += 1;
            return (Some(BlockState::Hot), None);
        };
        if demoted != id {
            stats.number_of_hot_keeps += 1;
        }

        let block = self.block_mut(demoted);
        if let Err(err) = mapper.protect(block.region.as_mut(), Protection::None) {
            // The protect failure is reported; a second unmap failure adds nothing.
            let _ = self.release_block(demoted, mapper);
            stats.number_of_frees += 1;
            return (self.state_of(id), Some(err));
        }
        block.state = BlockState::Cold;
        mapper.mark_volatile(block.region.as_mut());

        let Some(evicted) = self.cold[class].admit(demoted) else {
            stats.number_of_cold_keeps += 1;
            return (self.state_of(id), None);
        };
        if evicted != demoted {
            stats.number_of_cold_keeps += 1;
        }
        let deferred = self.release_block(evicted, mapper).err();
        stats.number_of_frees += 1;

        (self.state_of(id), deferred)
    }

    fn state_of(&self, id: BlockId) -> Option<BlockState> {
        self.blocks[id].as_ref().map(|block| block.state)
    }

    /// Forgets a block, then unmaps it. The block is gone from the pool even
    /// when the mapper reports a failure.
    fn release_block(&mut self, id: BlockId, mapper: &mut dyn PageMapper) -> Result<(), MapError> {
        let Some(block) = self.blocks[id].take() else {
            return Ok(());
        };
        self.by_base.remove(&block.base());
        self.vacant.push(id);
        mapper.unmap(block.region)
    }

    /// Unmaps every block held by the hot and cold caches.
    ///
    /// Returns the number of blocks released and the first unmap failure.
    /// Every cached block leaves the pool even if its unmap fails.
    pub fn purge_caches(
        &mut self,
        mapper: &mut dyn PageMapper,
        stats: &mut MallocStats,
    ) -> (usize, Option<MapError>) {
        let mut cached = Vec::new();
        for class in 0..NUM_SIZE_CLASSES {
            cached.extend(self.hot[class].drain());
            cached.extend(self.cold[class].drain());
        }
        let mut first_err = None;
        for &id in &cached {
            if let Err(err) = self.release_block(id, mapper) {
                first_err.get_or_insert(err);
            }
            stats.number_of_frees += 1;
        }
        (cached.len(), first_err)
    }

    /// Unmaps every block, live or cached. Used on teardown.
    pub fn release_all(&mut self, mapper: &mut dyn PageMapper) -> Result<(), MallocError> {
        for class in 0..NUM_SIZE_CLASSES {
            self.usable[class].clear();
            let _ = self.hot[class].drain();
            let _ = self.cold[class].drain();
        }
        self.by_base.clear();
        self.vacant.clear();
        let mut first_err = None;
        for block in std::mem::take(&mut self.blocks).into_iter().flatten() {
            if let Err(err) = mapper.unmap(block.region) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), |err| Err(err.into()))
    }
}
