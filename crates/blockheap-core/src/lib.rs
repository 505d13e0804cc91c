//! # blockheap-core
//!
//! Safe core of a user-space `malloc`/`free`/`realloc`/`calloc` allocator.
//!
//! Small and medium requests are carved from 64 KiB blocks segregated by
//! size class; larger requests get their own mapping. Empty blocks and
//! freed big mappings are retained in bounded caches before being returned
//! to the OS. Memory comes from a pluggable [`malloc::PageMapper`]; this
//! crate ships a simulated one, and `blockheap-os` provides the real `mmap`
//! backend. No `unsafe` code is permitted in this crate.

#![deny(unsafe_code)]

pub mod malloc;

pub use malloc::{Heap, MallocConfig, MallocError, MallocState, MallocStats};
