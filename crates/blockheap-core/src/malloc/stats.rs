//! Process-lifetime allocator counters.

use std::fmt;

use serde::Serialize;

/// Monotonic counters updated on every allocation and free path.
///
/// Counters are never reset; snapshots are plain copies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MallocStats {
    /// Allocations performed (including those issued by `calloc`/`realloc`).
    pub number_of_malloc_calls: u64,
    pub number_of_calloc_calls: u64,
    pub number_of_realloc_calls: u64,

    /// Big allocations served from a recycle list.
    pub number_of_big_allocator_hits: u64,
    /// Recycled big allocations whose contents the OS had discarded.
    pub number_of_big_allocator_purge_hits: u64,
    /// Big allocations that needed a fresh mapping.
    pub number_of_big_allocs: u64,

    /// Chunks served from a partially full block.
    pub number_of_usable_block_hits: u64,
    pub number_of_hot_empty_block_hits: u64,
    pub number_of_cold_empty_block_hits: u64,
    /// Cold blocks whose contents the OS had discarded.
    pub number_of_cold_empty_block_purge_hits: u64,
    /// Chunked blocks that needed a fresh mapping.
    pub number_of_block_allocs: u64,
    /// Allocations that left their block full.
    pub number_of_blocks_full: u64,

    /// Non-null frees (including those issued by `realloc`).
    pub number_of_free_calls: u64,

    pub number_of_big_allocator_keeps: u64,
    pub number_of_big_allocator_frees: u64,

    /// Frees that turned a full block back into a usable one.
    pub number_of_freed_full_blocks: u64,
    pub number_of_hot_keeps: u64,
    /// Blocks demoted from the hot cache into the cold cache.
    pub number_of_cold_keeps: u64,
    /// Chunked blocks returned to the OS.
    pub number_of_frees: u64,

    /// Failed placements (out-of-memory or mapper errors) recovered by
    /// purging every retention cache and retrying.
    pub number_of_oom_purges: u64,
}

impl fmt::Display for MallocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "malloc stats:")?;
        writeln!(f, "  calls:")?;
        writeln!(f, "    malloc:         {}", self.number_of_malloc_calls)?;
        writeln!(f, "    calloc:         {}", self.number_of_calloc_calls)?;
        writeln!(f, "    realloc:        {}", self.number_of_realloc_calls)?;
        writeln!(f, "    free:           {}", self.number_of_free_calls)?;
        writeln!(f, "  big allocator:")?;
        writeln!(f, "    hits:           {}", self.number_of_big_allocator_hits)?;
        writeln!(f, "    purge hits:     {}", self.number_of_big_allocator_purge_hits)?;
        writeln!(f, "    allocs:         {}", self.number_of_big_allocs)?;
        writeln!(f, "    keeps:          {}", self.number_of_big_allocator_keeps)?;
        writeln!(f, "    frees:          {}", self.number_of_big_allocator_frees)?;
        writeln!(f, "  chunked blocks:")?;
        writeln!(f, "    usable hits:    {}", self.number_of_usable_block_hits)?;
        writeln!(f, "    hot hits:       {}", self.number_of_hot_empty_block_hits)?;
        writeln!(f, "    cold hits:      {}", self.number_of_cold_empty_block_hits)?;
        writeln!(
            f,
            "    cold purge hits: {}",
            self.number_of_cold_empty_block_purge_hits
        )?;
        writeln!(f, "    allocs:         {}", self.number_of_block_allocs)?;
        writeln!(f, "    became full:    {}", self.number_of_blocks_full)?;
        writeln!(f, "    freed full:     {}", self.number_of_freed_full_blocks)?;
        writeln!(f, "    hot keeps:      {}", self.number_of_hot_keeps)?;
        writeln!(f, "    cold keeps:     {}", self.number_of_cold_keeps)?;
        writeln!(f, "    frees:          {}", self.number_of_frees)?;
        write!(f, "  oom purges:       {}", self.number_of_oom_purges)
    }
}
