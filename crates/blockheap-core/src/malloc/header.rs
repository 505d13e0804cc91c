//! In-band headers written into mapped memory.
//!
//! Each chunked block starts with a [`BlockHeader`], each big mapping with a
//! [`BigHeader`], and every client pointer is preceded by a [`ChunkHeader`].
//! The allocator never trusts these bytes for ownership (that comes from the
//! pool registries); it reads them back to detect corruption and to recover
//! the requested size of a live allocation.

use super::size_class::{BLOCK_HEADER_SIZE, CHUNK_HEADER_SIZE};

/// Magic tag at the base of a chunked block.
pub const MAGIC_BLOCK_HEADER: u32 = 0x4265_7274;
/// Magic tag at the base of a big mapping.
pub const MAGIC_BIG_HEADER: u32 = 0x4269_7267;
/// Magic tag in front of a live chunk.
pub const MAGIC_CHUNK_LIVE: u32 = 0x4c69_7665;
/// Magic tag in front of a chunk that has been freed.
pub const MAGIC_CHUNK_FREE: u32 = 0x4672_6565;

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Header at offset 0 of every chunked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    /// Chunk size (header included) this block is carved into.
    pub chunk_size: u32,
    /// Number of chunks in the block.
    pub capacity: u32,
}

impl BlockHeader {
    #[must_use]
    pub fn new(chunk_size: usize, capacity: usize) -> Self {
        Self {
            magic: MAGIC_BLOCK_HEADER,
            chunk_size: chunk_size as u32,
            capacity: capacity as u32,
        }
    }

    pub fn write(&self, block: &mut [u8]) {
        let out = &mut block[..BLOCK_HEADER_SIZE];
        out.fill(0);
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.chunk_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.capacity.to_le_bytes());
    }

    #[must_use]
    pub fn read(block: &[u8]) -> Self {
        Self {
            magic: read_u32(block, 0),
            chunk_size: read_u32(block, 4),
            capacity: read_u32(block, 8),
        }
    }
}

/// Header at offset 0 of every big mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigHeader {
    pub magic: u32,
    /// Total bytes of the mapping.
    pub mapping_size: u64,
}

impl BigHeader {
    #[must_use]
    pub fn new(mapping_size: usize) -> Self {
        Self {
            magic: MAGIC_BIG_HEADER,
            mapping_size: mapping_size as u64,
        }
    }

    pub fn write(&self, mapping: &mut [u8]) {
        // The chunk header lives in the tail of this area; leave it alone.
        let out = &mut mapping[..BLOCK_HEADER_SIZE - CHUNK_HEADER_SIZE];
        out.fill(0);
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[8..16].copy_from_slice(&self.mapping_size.to_le_bytes());
    }

    #[must_use]
    pub fn read(mapping: &[u8]) -> Self {
        Self {
            magic: read_u32(mapping, 0),
            mapping_size: read_u64(mapping, 8),
        }
    }
}

/// Header in the `CHUNK_HEADER_SIZE` bytes in front of a client pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub magic: u32,
    /// Index of the owning block in its pool arena.
    pub owner: u32,
    /// Bytes the client asked for.
    pub size: u64,
}

impl ChunkHeader {
    #[must_use]
    pub fn live(owner: usize, size: usize) -> Self {
        Self {
            magic: MAGIC_CHUNK_LIVE,
            owner: owner as u32,
            size: size as u64,
        }
    }

    /// Writes the header into `slot`, which must be exactly the header bytes.
    pub fn write(&self, slot: &mut [u8]) {
        slot[0..4].copy_from_slice(&self.magic.to_le_bytes());
        slot[4..8].copy_from_slice(&self.owner.to_le_bytes());
        slot[8..16].copy_from_slice(&self.size.to_le_bytes());
    }

    #[must_use]
    pub fn read(slot: &[u8]) -> Self {
        Self {
            magic: read_u32(slot, 0),
            owner: read_u32(slot, 4),
            size: read_u64(slot, 8),
        }
    }

    /// Marks the header in `slot` as freed, keeping the rest intact.
    pub fn mark_free(slot: &mut [u8]) {
        slot[0..4].copy_from_slice(&MAGIC_CHUNK_FREE.to_le_bytes());
    }
}
