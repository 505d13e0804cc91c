//! Process-wide heap and raw-pointer entry points.
//!
//! The heap is built on first use from [`MallocConfig::from_env`], so the
//! `BLOCKHEAP_*` variables must be set before the first allocation.

use std::ptr;
use std::sync::OnceLock;

use blockheap_core::malloc::{Heap, MallocConfig};

use crate::os_mapper::OsMapper;

static GLOBAL_HEAP: OnceLock<Heap> = OnceLock::new();

/// The process-wide heap, created on first call.
pub fn global_heap() -> &'static Heap {
    GLOBAL_HEAP.get_or_init(|| Heap::new(MallocConfig::from_env(), OsMapper::new()))
}

fn to_ptr(addr: Option<usize>) -> *mut u8 {
    addr.map_or(ptr::null_mut(), ptr::with_exposed_provenance_mut)
}

/// Allocates `size` bytes, null on out-of-memory.
pub fn malloc(size: usize) -> *mut u8 {
    to_ptr(global_heap().malloc(size))
}

/// Releases `ptr`. Null is ignored; anything else not returned by this
/// module aborts the process.
pub fn free(ptr: *mut u8) {
    global_heap().free(ptr.expose_provenance());
}

/// Resizes `ptr`. Returns null when `new_size == 0` (the block is freed) or
/// on out-of-memory (the block is left untouched).
pub fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    to_ptr(global_heap().realloc(ptr.expose_provenance(), new_size))
}

/// Allocates `count * size` zeroed bytes, null on overflow.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    to_ptr(global_heap().calloc(count, size))
}

/// Usable bytes behind `ptr`, 0 for null.
pub fn malloc_size(ptr: *const u8) -> usize {
    global_heap().malloc_size(ptr.expose_provenance())
}
