//! Memory allocation.
//!
//! Implements the malloc family with a two-pool design:
//! - Chunked allocations (up to `MAX_CHUNKED_REQUEST` bytes): 64 KiB blocks
//!   carved into equal chunks per size class, with hot/cold retention of
//!   empty blocks
//! - Big allocations: one mapping each, recycled per mapping size
//!
//! [`MallocState`] is a single allocator context; [`Heap`] puts it behind the
//! process-wide lock.

pub mod allocator;
pub mod big;
pub mod chunked;
pub mod config;
pub mod error;
pub mod header;
pub mod heap;
pub mod mapper;
pub mod profiler;
pub mod retention;
pub mod size_class;
pub mod stats;

pub use allocator::{AllocatorLogLevel, AllocatorLogRecord, LIFECYCLE_LOG_CAPACITY, MallocState};
pub use big::BigPool;
pub use chunked::{BlockSource, BlockState, ChunkedPool};
pub use config::{FREE_SCRUB_BYTE, MALLOC_SCRUB_BYTE, MallocConfig};
pub use error::{MallocError, MapError};
pub use heap::{Heap, fatal};
pub use mapper::{MappedRegion, PageMapper, Protection, SimulatedMapper};
pub use profiler::{ChannelProfiler, ProfilerEvent, ProfilerHook};
pub use retention::RetentionCache;
pub use stats::MallocStats;
