//! Stress and replay workloads.
//!
//! Both run over a [`SimulatedMapper`] so results are reproducible and the
//! mapping counters can be reported next to the allocator stats.

use std::collections::HashMap;
use std::path::Path;

use blockheap_core::malloc::size_class::MAX_CHUNKED_REQUEST;
use blockheap_core::malloc::{
    AllocatorLogRecord, Heap, MallocConfig, MallocState, MallocStats, SimulatedMapper,
};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel};

const MAX_LIVE_PER_THREAD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    pub seed: u64,
    /// Upper bound for ordinary request sizes.
    pub max_size: usize,
    /// Record trace/debug lifecycle events.
    pub log: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 10_000,
            seed: 0x5EED,
            max_size: 4096,
            log: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub threads: usize,
    pub ops_per_thread: usize,
    pub seed: u64,
    pub map_calls: u64,
    pub unmap_calls: u64,
    /// Mappings still held by retention caches after every block was freed.
    pub cached_mappings: usize,
    pub log_records: usize,
    /// Records the heap's bounded buffer discarded before they were drained.
    pub dropped_log_records: u64,
    pub stats: MallocStats,
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 16
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound.max(1) as u64) as usize
    }
}

struct Live {
    ptr: usize,
    size: usize,
    tag: u64,
}

fn write_tag(heap: &Heap, live: &Live) -> Result<(), HarnessError> {
    let tag = live.tag.to_le_bytes();
    heap.with_bytes_mut(live.ptr, |bytes| {
        let n = live.size.min(tag.len()).min(bytes.len());
        bytes[..n].copy_from_slice(&tag[..n]);
    })?;
    Ok(())
}

fn check_tag(heap: &Heap, live: &Live, len: usize, thread: usize) -> Result<(), HarnessError> {
    let tag = live.tag.to_le_bytes();
    let n = len.min(tag.len());
    let intact = heap.with_bytes(live.ptr, |bytes| bytes.len() >= n && bytes[..n] == tag[..n])?;
    if intact {
        Ok(())
    } else {
        Err(HarnessError::StressMismatch {
            thread,
            detail: format!("allocation {:#x} lost its tag {:#x}", live.ptr, live.tag),
        })
    }
}

fn stress_worker(
    heap: &Heap,
    config: &StressConfig,
    thread: usize,
) -> Result<Vec<AllocatorLogRecord>, HarnessError> {
    let mut rng = Lcg(config.seed ^ ((thread as u64 + 1) << 40));
    let mut live: Vec<Live> = Vec::new();
    let mut records = Vec::new();
    let mut next_tag = ((thread as u64) << 32) | 1;

    for _ in 0..config.ops_per_thread {
        let size = if rng.below(32) == 0 {
            MAX_CHUNKED_REQUEST + 1 + rng.below(4 * MAX_CHUNKED_REQUEST)
        } else {
            1 + rng.below(config.max_size)
        };
        let tag = next_tag;
        next_tag += 1;

        match rng.below(8) {
            _ if live.len() >= MAX_LIVE_PER_THREAD => {
                let victim = live.swap_remove(rng.below(live.len()));
                check_tag(heap, &victim, victim.size, thread)?;
                heap.try_free(victim.ptr)?;
            }
            0..=2 => {
                let entry = Live { ptr: heap.try_malloc(size)?, size, tag };
                write_tag(heap, &entry)?;
                live.push(entry);
            }
            3 => {
                let count = 1 + rng.below(16);
                let elem = 1 + size / count;
                let ptr = heap.try_calloc(count, elem)?;
                let zeroed = heap.with_bytes(ptr, |bytes| {
                    bytes[..count * elem].iter().all(|&b| b == 0)
                })?;
                if !zeroed {
                    return Err(HarnessError::StressMismatch {
                        thread,
                        detail: format!("calloc {ptr:#x} returned non-zero bytes"),
                    });
                }
                let entry = Live { ptr, size: count * elem, tag };
                write_tag(heap, &entry)?;
                live.push(entry);
            }
            4 | 5 if !live.is_empty() => {
                let victim = live.swap_remove(rng.below(live.len()));
                check_tag(heap, &victim, victim.size, thread)?;
                heap.try_free(victim.ptr)?;
            }
            6 if !live.is_empty() => {
                let index = rng.below(live.len());
                let (old_ptr, old_size, old_tag) = (live[index].ptr, live[index].size, live[index].tag);
                check_tag(heap, &live[index], old_size, thread)?;
                let new_size = if rng.below(16) == 0 { 0 } else { size };
                match heap.try_realloc(old_ptr, new_size)? {
                    None => {
                        live.swap_remove(index);
                    }
                    Some(ptr) => {
                        let moved = Live { ptr, size: old_size, tag: old_tag };
                        check_tag(heap, &moved, old_size.min(new_size), thread)?;
                        let entry = Live { ptr, size: new_size, tag };
                        write_tag(heap, &entry)?;
                        live[index] = entry;
                    }
                }
            }
            _ => {
                let entry = Live { ptr: heap.try_malloc(size)?, size, tag };
                write_tag(heap, &entry)?;
                live.push(entry);
            }
        }

        // One op writes a handful of records; draining each time keeps the
        // shared buffer far below its capacity.
        if config.log {
            records.extend(heap.drain_lifecycle_logs());
        }
    }

    for entry in live.drain(..) {
        check_tag(heap, &entry, entry.size, thread)?;
        heap.try_free(entry.ptr)?;
    }
    Ok(records)
}

/// Harness-level closing entry for a stress run.
fn stress_summary(report: &StressReport) -> LogEntry {
    let (level, outcome) = if report.dropped_log_records == 0 {
        (LogLevel::Info, "complete")
    } else {
        (LogLevel::Warn, "records_dropped")
    };
    LogEntry::new(format!("blockheap::stress::{:016x}", report.seed), level, "stress_summary")
        .with_symbol("stress")
        .with_outcome(outcome)
        .with_details(serde_json::json!({
            "threads": report.threads,
            "ops_per_thread": report.ops_per_thread,
            "log_records": report.log_records,
            "dropped_log_records": report.dropped_log_records,
            "map_calls": report.map_calls,
            "unmap_calls": report.unmap_calls,
        }))
}

/// Runs `config.threads` workers against one shared heap, then checks that
/// every counter balances. Lifecycle records go to `emitter` in decision
/// order.
pub fn run_stress(
    config: &StressConfig,
    emitter: Option<&mut LogEmitter>,
) -> Result<StressReport, HarnessError> {
    let mapper = SimulatedMapper::new();
    let heap = Heap::new(MallocConfig::default().with_log(config.log), mapper.clone());

    let results: Vec<Result<Vec<AllocatorLogRecord>, HarnessError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads.max(1))
            .map(|thread| {
                let heap = &heap;
                scope.spawn(move || stress_worker(heap, config, thread))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(HarnessError::StressMismatch {
                        thread: usize::MAX,
                        detail: "worker panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    let mut records = Vec::new();
    for result in results {
        records.extend(result?);
    }
    records.extend(heap.drain_lifecycle_logs());
    records.sort_by_key(|record| record.decision_id);

    let stats = heap.stats();
    if stats.number_of_malloc_calls != stats.number_of_free_calls || heap.active_count() != 0 {
        return Err(HarnessError::StressMismatch {
            thread: usize::MAX,
            detail: format!(
                "{} mallocs against {} frees, {} live allocations",
                stats.number_of_malloc_calls,
                stats.number_of_free_calls,
                heap.active_count()
            ),
        });
    }

    let report = StressReport {
        threads: config.threads.max(1),
        ops_per_thread: config.ops_per_thread,
        seed: config.seed,
        map_calls: mapper.map_calls(),
        unmap_calls: mapper.unmap_calls(),
        cached_mappings: mapper.live_mappings(),
        log_records: records.len(),
        dropped_log_records: heap.dropped_lifecycle_logs(),
        stats,
    };

    if let Some(emitter) = emitter {
        emitter.emit_records(&records)?;
        emitter.emit(&stress_summary(&report))?;
        emitter.flush()?;
    }

    Ok(report)
}

/// One step of a replay trace. `id` names an allocation across steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TraceOp {
    Malloc { id: u64, size: usize },
    Calloc { id: u64, count: usize, size: usize },
    /// Unknown ids behave like `realloc(NULL, size)`; size 0 frees.
    Realloc { id: u64, size: usize },
    Free { id: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub ops: usize,
    pub live: usize,
    pub live_bytes: usize,
    pub map_calls: u64,
    pub unmap_calls: u64,
    pub stats: MallocStats,
}

/// Reads a JSON array of [`TraceOp`].
pub fn load_trace(path: &Path) -> Result<Vec<TraceOp>, HarnessError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn invalid(index: usize, reason: impl Into<String>) -> HarnessError {
    HarnessError::InvalidTrace {
        index,
        reason: reason.into(),
    }
}

/// Replays `ops` on a fresh single-threaded allocator.
pub fn replay(
    ops: &[TraceOp],
    config: MallocConfig,
    emitter: Option<&mut LogEmitter>,
) -> Result<ReplayReport, HarnessError> {
    let mapper = SimulatedMapper::new();
    let mut state = MallocState::new(config, mapper.clone());
    let mut ids: HashMap<u64, usize> = HashMap::new();

    for (index, op) in ops.iter().enumerate() {
        match *op {
            TraceOp::Malloc { id, size } => {
                if ids.contains_key(&id) {
                    return Err(invalid(index, format!("id {id} is already live")));
                }
                ids.insert(id, state.malloc(size)?);
            }
            TraceOp::Calloc { id, count, size } => {
                if ids.contains_key(&id) {
                    return Err(invalid(index, format!("id {id} is already live")));
                }
                ids.insert(id, state.calloc(count, size)?);
            }
            TraceOp::Realloc { id, size } => {
                let old = ids.remove(&id).unwrap_or(0);
                if let Some(ptr) = state.realloc(old, size)? {
                    ids.insert(id, ptr);
                }
            }
            TraceOp::Free { id } => {
                let ptr = ids
                    .remove(&id)
                    .ok_or_else(|| invalid(index, format!("id {id} is not live")))?;
                state.free(ptr)?;
            }
        }
    }

    if let Some(emitter) = emitter {
        emitter.emit_records(state.lifecycle_logs())?;
        emitter.flush()?;
    }

    Ok(ReplayReport {
        ops: ops.len(),
        live: state.active_count(),
        live_bytes: state.total_allocated(),
        map_calls: mapper.map_calls(),
        unmap_calls: mapper.unmap_calls(),
        stats: state.stats(),
    })
}
