//! Workload harness for blockheap.
//!
//! This crate provides:
//! - Stress runs: seeded multi-threaded malloc/free/realloc/calloc traffic
//!   against one shared heap, with overlap and accounting checks
//! - Trace replay: deterministic single-threaded replay of JSON op traces
//! - Structured logs: allocator lifecycle records rendered as JSONL

#![forbid(unsafe_code)]

pub mod error;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use structured_log::{LogEmitter, LogEntry, LogLevel};
pub use workload::{ReplayReport, StressConfig, StressReport, TraceOp, replay, run_stress};
