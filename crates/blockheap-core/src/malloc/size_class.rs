//! Size class bins for chunked and big allocations.
//!
//! Every mapping the allocator requests is `BLOCK_SIZE` bytes (chunked
//! blocks) or a multiple of it (big allocations), aligned to `BLOCK_SIZE`.
//! Chunked blocks are carved into equal chunks; each chunk starts with a
//! `CHUNK_HEADER_SIZE` header, so a request of `n` bytes needs a chunk of at
//! least `n + CHUNK_HEADER_SIZE`.

/// Size and alignment of every mapping handed out by the mapper (64 KiB).
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Mask that recovers a block base from any address inside the block.
pub const BLOCK_MASK: usize = !(BLOCK_SIZE - 1);

/// Bytes reserved at the start of each chunked block for its header.
pub const BLOCK_HEADER_SIZE: usize = 64;

/// Bytes hidden in front of every client pointer. Also the minimum alignment.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Bytes reserved at the start of a big mapping (block header plus chunk header).
pub const BIG_HEADER_SIZE: usize = BLOCK_HEADER_SIZE;

/// Number of chunked size classes.
pub const NUM_SIZE_CLASSES: usize = 30;

/// Largest big mapping that is kept around for recycling (1 MiB).
pub const MAX_RECYCLED_BIG_SIZE: usize = 16 * BLOCK_SIZE;

/// Chunk sizes, header included. All are multiples of `CHUNK_HEADER_SIZE`.
///
/// The last classes are picked so that whole chunks tile the
/// `BLOCK_SIZE - BLOCK_HEADER_SIZE` payload with little slack.
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    32, 48, 64, 80, 96, 112, 128, // 16-byte steps
    160, 192, 224, 256, // 32-byte steps
    320, 384, 448, 512, // 64-byte steps
    640, 768, 896, 1024, // 128-byte steps
    1280, 1536, 2048, 2560, 3072, 4096, // wider steps
    5440, 8176, 10912, 16368, 32704, // 12, 8, 6, 4 and 2 chunks per block
];

/// Largest chunk size; requests needing more go to the big pool.
pub const CHUNKED_THRESHOLD: usize = SIZE_TABLE[NUM_SIZE_CLASSES - 1];

/// Largest client request served by the chunked pool.
pub const MAX_CHUNKED_REQUEST: usize = CHUNKED_THRESHOLD - CHUNK_HEADER_SIZE;

/// Returns the bin index serving a request of `size` bytes.
///
/// `None` means the request is too large for chunking (or overflows once
/// the header is added) and must use the big path.
#[must_use]
pub fn class_for(size: usize) -> Option<usize> {
    let needed = size.checked_add(CHUNK_HEADER_SIZE)?;
    if needed > CHUNKED_THRESHOLD {
        return None;
    }
    Some(SIZE_TABLE.partition_point(|&chunk| chunk < needed))
}

/// Returns the chunk size for a bin index, or 0 when out of range.
#[must_use]
pub fn chunk_size(index: usize) -> usize {
    SIZE_TABLE.get(index).copied().unwrap_or(0)
}

/// Number of chunks a block of the given class holds.
#[must_use]
pub fn chunks_per_block(index: usize) -> usize {
    match chunk_size(index) {
        0 => 0,
        size => (BLOCK_SIZE - BLOCK_HEADER_SIZE) / size,
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Mapping size for a big allocation of `size` client bytes.
///
/// Big size classes are multiples of `BLOCK_SIZE`. `None` on overflow.
#[must_use]
pub fn big_mapping_size(size: usize) -> Option<usize> {
    align_up(size.checked_add(BIG_HEADER_SIZE)?, BLOCK_SIZE)
}

/// Whether a big mapping of this size may be kept in a recycle list.
#[must_use]
pub fn is_recyclable_big(mapping_size: usize) -> bool {
    mapping_size <= MAX_RECYCLED_BIG_SIZE
}

/// Capacity a request of `size` bytes would actually receive.
///
/// Returns `None` if the request cannot be represented at all.
#[must_use]
pub fn good_size(size: usize) -> Option<usize> {
    match class_for(size) {
        Some(index) => Some(chunk_size(index) - CHUNK_HEADER_SIZE),
        None => big_mapping_size(size).map(|mapped| mapped - BIG_HEADER_SIZE),
    }
}

/// Recovers the block base that owns `ptr`.
#[must_use]
pub const fn block_base(ptr: usize) -> usize {
    ptr & BLOCK_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for_min() {
        assert_eq!(class_for(0), Some(0));
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(16), Some(0));
    }

    #[test]
    fn test_class_for_accounts_for_header() {
        // 17 + 16 = 33 bytes needs the 48-byte chunk.
        assert_eq!(class_for(17), Some(1));
        assert_eq!(chunk_size(class_for(48).unwrap()), 64);
        assert_eq!(chunk_size(class_for(49).unwrap()), 80);
    }

    #[test]
    fn test_class_for_big_boundary() {
        assert_eq!(class_for(MAX_CHUNKED_REQUEST), Some(NUM_SIZE_CLASSES - 1));
        assert_eq!(class_for(MAX_CHUNKED_REQUEST + 1), None);
        assert_eq!(class_for(usize::MAX), None);
    }

    #[test]
    fn test_every_class_is_smallest_fit() {
        for size in 0..=MAX_CHUNKED_REQUEST {
            let index = class_for(size).unwrap();
            assert!(chunk_size(index) >= size + CHUNK_HEADER_SIZE);
            if index > 0 {
                assert!(chunk_size(index - 1) < size + CHUNK_HEADER_SIZE);
            }
        }
    }

    #[test]
    fn test_size_table_monotonic_and_aligned() {
        for i in 0..NUM_SIZE_CLASSES {
            assert_eq!(SIZE_TABLE[i] % CHUNK_HEADER_SIZE, 0, "class {i} misaligned");
            if i > 0 {
                assert!(
                    SIZE_TABLE[i] > SIZE_TABLE[i - 1],
                    "size class {} ({}) must be > class {} ({})",
                    i,
                    SIZE_TABLE[i],
                    i - 1,
                    SIZE_TABLE[i - 1]
                );
            }
        }
    }

    #[test]
    fn test_every_class_fits_at_least_two_chunks() {
        for class in 0..NUM_SIZE_CLASSES {
            let per_block = chunks_per_block(class);
            assert!(per_block >= 2, "class {class}");
            assert!(BLOCK_HEADER_SIZE + per_block * chunk_size(class) <= BLOCK_SIZE);
        }
    }

    #[test]
    fn test_chunk_size_out_of_range() {
        assert_eq!(chunk_size(NUM_SIZE_CLASSES), 0);
        assert_eq!(chunks_per_block(NUM_SIZE_CLASSES), 0);
    }

    #[test]
    fn test_big_mapping_size() {
        assert_eq!(big_mapping_size(MAX_CHUNKED_REQUEST + 1), Some(BLOCK_SIZE));
        assert_eq!(
            big_mapping_size(BLOCK_SIZE - BIG_HEADER_SIZE),
            Some(BLOCK_SIZE)
        );
        assert_eq!(
            big_mapping_size(BLOCK_SIZE - BIG_HEADER_SIZE + 1),
            Some(2 * BLOCK_SIZE)
        );
        assert_eq!(big_mapping_size(usize::MAX), None);
        assert_eq!(big_mapping_size(usize::MAX - BIG_HEADER_SIZE), None);
    }

    #[test]
    fn test_good_size() {
        assert_eq!(good_size(1), Some(16));
        assert_eq!(good_size(100), Some(112));
        assert_eq!(good_size(40_000), Some(BLOCK_SIZE - BIG_HEADER_SIZE));
        assert_eq!(good_size(usize::MAX), None);
    }

    #[test]
    fn test_block_base() {
        let base = 7 * BLOCK_SIZE;
        assert_eq!(block_base(base + BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE), base);
        assert_eq!(block_base(base + BLOCK_SIZE - 1), base);
    }

    #[test]
    fn test_recyclable_big() {
        assert!(is_recyclable_big(BLOCK_SIZE));
        assert!(is_recyclable_big(MAX_RECYCLED_BIG_SIZE));
        assert!(!is_recyclable_big(MAX_RECYCLED_BIG_SIZE + BLOCK_SIZE));
    }
}
