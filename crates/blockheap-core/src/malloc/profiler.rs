//! Best-effort allocation event notifications for an external profiler.
//!
//! Hooks run while the heap lock is held, so implementations must return
//! promptly and must not allocate from the notifying heap.

use std::sync::mpsc::{self, Receiver, Sender};

/// Allocation event forwarded to a profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerEvent {
    Malloc { ptr: usize, size: usize },
    Free { ptr: usize },
    Realloc { ptr: usize, size: usize },
    /// A block was (re)initialized with a new chunk size.
    ChunkSizeChanged { block: usize, chunk_size: usize },
}

/// Receives allocator events. Failures are swallowed.
pub trait ProfilerHook: Send {
    fn notify(&mut self, event: ProfilerEvent);
}

/// Hook that forwards events over an unbounded channel.
///
/// Sending never blocks; once the receiver is dropped events are discarded.
#[derive(Debug, Clone)]
pub struct ChannelProfiler {
    tx: Sender<ProfilerEvent>,
}

impl ChannelProfiler {
    /// Creates a hook and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, Receiver<ProfilerEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl ProfilerHook for ChannelProfiler {
    fn notify(&mut self, event: ProfilerEvent) {
        let _ = self.tx.send(event);
    }
}
