//! Integration tests for the public allocator contract over the simulated
//! mapping primitive.

use blockheap_core::malloc::size_class::{self, MAX_CHUNKED_REQUEST};
use blockheap_core::malloc::{
    MallocConfig, MallocError, MallocState, SimulatedMapper, FREE_SCRUB_BYTE, MALLOC_SCRUB_BYTE,
};

fn state_with(config: MallocConfig) -> (MallocState, SimulatedMapper) {
    let mapper = SimulatedMapper::new();
    (MallocState::new(config, mapper.clone()), mapper)
}

fn fill(state: &mut MallocState, ptr: usize, len: usize, seed: u8) {
    for (i, byte) in state.bytes_mut(ptr).unwrap()[..len].iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
}

fn check(state: &MallocState, ptr: usize, len: usize, seed: u8) -> bool {
    state.bytes(ptr).unwrap()[..len]
        .iter()
        .enumerate()
        .all(|(i, &byte)| byte == seed.wrapping_add(i as u8))
}

#[test]
fn test_pointers_are_aligned_and_disjoint() {
    let (mut state, _) = state_with(MallocConfig::default());
    let sizes = [
        0, 1, 7, 16, 17, 100, 1000, 4080, 4097, 20_000, MAX_CHUNKED_REQUEST,
        MAX_CHUNKED_REQUEST + 1, 200_000, 2_000_000,
    ];
    let mut spans = Vec::new();
    for &size in &sizes {
        let ptr = state.malloc(size).unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(ptr % 16, 0, "size {size} gave unaligned {ptr:#x}");
        let usable = state.malloc_size(ptr).unwrap();
        assert!(usable >= size, "size {size} usable {usable}");
        spans.push((ptr, usable.max(1)));
    }
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{:#x?} overlaps", pair);
    }
    for (ptr, _) in spans {
        state.free(ptr).unwrap();
    }
    assert_eq!(state.active_count(), 0);
}

#[test]
fn test_malloc_zero_is_unique_and_freeable() {
    let (mut state, _) = state_with(MallocConfig::default());
    let a = state.malloc(0).unwrap();
    let b = state.malloc(0).unwrap();
    assert_ne!(a, b);
    assert_eq!(state.requested_size(a).unwrap(), 0);
    state.free(a).unwrap();
    state.free(b).unwrap();
}

#[test]
fn test_free_null_is_noop() {
    let (mut state, mapper) = state_with(MallocConfig::default());
    state.free(0).unwrap();
    assert_eq!(state.stats().number_of_free_calls, 0);
    assert_eq!(mapper.map_calls(), 0);
}

#[test]
fn test_scrub_bytes_visible() {
    let (mut state, _) = state_with(MallocConfig::default());
    let ptr = state.malloc(64).unwrap();
    assert!(state.bytes(ptr).unwrap()[..64].iter().all(|&b| b == MALLOC_SCRUB_BYTE));
    state.free(ptr).unwrap();

    let (mut state, _) = state_with(MallocConfig::default().with_scrub_on_alloc(false));
    let ptr = state.malloc(64).unwrap();
    let keep = state.malloc(64).unwrap();
    state.free(ptr).unwrap();
    let again = state.malloc(64).unwrap();
    assert_eq!(again, ptr, "freed chunk is reused first");
    assert!(state.bytes(again).unwrap()[..64].iter().all(|&b| b == FREE_SCRUB_BYTE));
    state.free(again).unwrap();
    state.free(keep).unwrap();
}

#[test]
fn test_realloc_preserves_across_tiers() {
    let (mut state, _) = state_with(MallocConfig::default());
    let ptr = state.malloc(40).unwrap();
    fill(&mut state, ptr, 40, 3);

    let grown = state.realloc(ptr, 3000).unwrap().unwrap();
    assert!(check(&state, grown, 40, 3));
    fill(&mut state, grown, 3000, 9);

    let big = state.realloc(grown, 150_000).unwrap().unwrap();
    assert!(check(&state, big, 3000, 9));
    assert_eq!(state.requested_size(big).unwrap(), 150_000);

    let small = state.realloc(big, 100).unwrap().unwrap();
    assert!(check(&state, small, 100, 9));
    assert_eq!(small, big, "shrinking stays in place");
    assert_eq!(state.active_count(), 1);
    assert_eq!(state.realloc(small, 0).unwrap(), None);
    assert_eq!(state.active_count(), 0);
}

#[test]
fn test_realloc_null_allocates() {
    let (mut state, _) = state_with(MallocConfig::default());
    let ptr = state.realloc(0, 48).unwrap().unwrap();
    assert_eq!(state.requested_size(ptr).unwrap(), 48);
    assert_eq!(state.stats().number_of_malloc_calls, 1);
    state.free(ptr).unwrap();
}

#[test]
fn test_calloc_zeroes_reused_memory() {
    let (mut state, _) = state_with(MallocConfig::default().with_scrub_on_free(false));
    let pairs = [(1, 1), (10, 10), (3, 1000), (16, 2040), (2, 40_000)];
    for &(count, size) in &pairs {
        let dirty = state.malloc(count * size).unwrap();
        fill(&mut state, dirty, count * size, 0x5A);
        state.free(dirty).unwrap();
        let ptr = state.calloc(count, size).unwrap();
        assert!(
            state.bytes(ptr).unwrap()[..count * size].iter().all(|&b| b == 0),
            "calloc({count}, {size}) was not zeroed"
        );
        state.free(ptr).unwrap();
    }
}

#[test]
fn test_calloc_overflow_is_rejected_before_mapping() {
    let (mut state, mapper) = state_with(MallocConfig::default());
    let half = 1usize << (usize::BITS / 2);
    assert_eq!(
        state.calloc(half, half),
        Err(MallocError::CallocOverflow {
            count: half,
            size: half
        })
    );
    assert_eq!(mapper.map_calls(), 0);
    assert_eq!(state.stats().number_of_malloc_calls, 0);
}

#[test]
fn test_calloc_past_32_bits_does_not_wrap() {
    let (mut state, mapper) = state_with(MallocConfig::default());
    mapper.set_capacity(Some(1 << 20));
    // 0x10000 * 0x10001 wraps to 0x10000 in 32 bits.
    let result = state.calloc(0x1_0000, 0x1_0001);
    if cfg!(target_pointer_width = "64") {
        assert!(
            matches!(result, Err(MallocError::OutOfMemory { requested }) if requested == 0x1_0001_0000),
            "{result:?}"
        );
    } else {
        assert!(matches!(result, Err(MallocError::CallocOverflow { .. })), "{result:?}");
    }
    assert_eq!(state.active_count(), 0);
}

#[test]
fn test_retention_caches_are_bounded() {
    let (mut state, mapper) = state_with(MallocConfig::default());
    let class = size_class::class_for(MAX_CHUNKED_REQUEST).unwrap();
    let per_block = size_class::chunks_per_block(class);
    let blocks = 40;

    let ptrs: Vec<usize> = (0..blocks * per_block)
        .map(|_| state.malloc(MAX_CHUNKED_REQUEST).unwrap())
        .collect();
    assert_eq!(mapper.live_mappings(), blocks);
    for ptr in ptrs {
        state.free(ptr).unwrap();
    }

    let stats = state.stats();
    assert_eq!(state.chunked().hot_len(class), 16);
    assert_eq!(state.chunked().cold_len(class), 16);
    assert_eq!(stats.number_of_hot_keeps, blocks as u64);
    assert_eq!(stats.number_of_cold_keeps, 24);
    assert_eq!(stats.number_of_frees, 8);
    assert_eq!(mapper.unmap_calls(), 8);
    assert_eq!(mapper.live_mappings(), 32);
}

#[test]
fn test_empty_blocks_are_reused_hot_then_cold() {
    let (mut state, mapper) = state_with(MallocConfig::default());
    let class = size_class::class_for(MAX_CHUNKED_REQUEST).unwrap();
    let per_block = size_class::chunks_per_block(class);

    let ptrs: Vec<usize> = (0..17 * per_block)
        .map(|_| state.malloc(MAX_CHUNKED_REQUEST).unwrap())
        .collect();
    for ptr in ptrs {
        state.free(ptr).unwrap();
    }
    assert_eq!(state.chunked().cold_len(class), 1);
    let maps_before = mapper.map_calls();
    mapper.set_purge_volatile(true);

    let again: Vec<usize> = (0..17 * per_block)
        .map(|_| state.malloc(MAX_CHUNKED_REQUEST).unwrap())
        .collect();
    let stats = state.stats();
    assert_eq!(mapper.map_calls(), maps_before, "no fresh mappings needed");
    assert_eq!(stats.number_of_hot_empty_block_hits, 16);
    assert_eq!(stats.number_of_cold_empty_block_hits, 1);
    assert_eq!(stats.number_of_cold_empty_block_purge_hits, 1);
    for ptr in again {
        state.free(ptr).unwrap();
    }
}

#[test]
fn test_big_allocations_recycle_by_mapping_size() {
    let (mut state, mapper) = state_with(MallocConfig::default());
    let a = state.malloc(100_000).unwrap();
    state.free(a).unwrap();
    assert_eq!(state.stats().number_of_big_allocator_keeps, 1);

    let b = state.malloc(100_000).unwrap();
    assert_eq!(b, a, "same mapping comes back");
    assert_eq!(state.stats().number_of_big_allocator_hits, 1);
    state.free(b).unwrap();

    let huge = state.malloc(4 << 20).unwrap();
    state.free(huge).unwrap();
    assert_eq!(
        state.stats().number_of_big_allocator_frees,
        1,
        "mappings above the recycle limit go straight back"
    );
    assert_eq!(mapper.live_mappings(), 1);
}

#[test]
fn test_double_free_and_foreign_pointer_are_detected() {
    let (mut state, _) = state_with(MallocConfig::default());
    let ptr = state.malloc(32).unwrap();
    let keep = state.malloc(32).unwrap();
    state.free(ptr).unwrap();
    assert_eq!(state.free(ptr), Err(MallocError::DoubleFree { ptr }));
    assert!(matches!(
        state.free(0xdead_0000),
        Err(MallocError::InvalidPointer { .. })
    ));
    state.free(keep).unwrap();
}

#[test]
fn test_oom_purges_caches_and_retries() {
    let (mut state, mapper) = state_with(MallocConfig::default());
    let ptr = state.malloc(100_000).unwrap();
    state.free(ptr).unwrap();
    let cached = mapper.mapped_bytes();
    mapper.set_capacity(Some(cached + 64 * 1024));

    // Needs more than the free capacity, but fits once the recycled mapping
    // is released.
    let bigger = state.malloc(150_000).unwrap();
    assert_eq!(state.stats().number_of_oom_purges, 1);
    state.free(bigger).unwrap();

    mapper.set_capacity(Some(0));
    assert!(matches!(
        state.malloc(10),
        Err(MallocError::OutOfMemory { .. })
    ));
}
