//! # blockheap-os
//!
//! Operating-system backend for `blockheap-core`:
//! - [`OsMapper`]: a [`PageMapper`](blockheap_core::malloc::PageMapper) over
//!   anonymous private `mmap`
//! - [`global_heap`]: the lazily initialized process-wide [`Heap`] plus raw
//!   pointer entry points on top of it
//!
//! This is the only crate in the workspace that contains `unsafe` code.

pub mod global;
pub mod os_mapper;

pub use blockheap_core::malloc::Heap;
pub use global::{calloc, free, global_heap, malloc, malloc_size, realloc};
pub use os_mapper::OsMapper;
