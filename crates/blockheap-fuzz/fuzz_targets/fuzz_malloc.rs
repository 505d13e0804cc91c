#![no_main]
use blockheap_core::malloc::{MallocConfig, MallocState, SimulatedMapper};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one op: [kind, size_lo, size_hi, pick].
    if data.len() < 4 {
        return;
    }

    let mapper = SimulatedMapper::new();
    let mut state = MallocState::new(
        MallocConfig::default().with_retention(2, 2, 1),
        mapper.clone(),
    );
    let mut live: Vec<(usize, usize)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let raw = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        // Occasionally reach into the big pool.
        let size = if chunk[3] & 0x80 != 0 { raw * 4 } else { raw };
        let pick = chunk[3] as usize;

        match chunk[0] % 5 {
            0 => {
                if let Ok(ptr) = state.malloc(size) {
                    live.push((ptr, size));
                }
            }
            1 => {
                if !live.is_empty() {
                    let (ptr, _) = live.swap_remove(pick % live.len());
                    state.free(ptr).expect("free of a live pointer");
                }
            }
            2 => {
                if !live.is_empty() {
                    let index = pick % live.len();
                    let (ptr, _) = live[index];
                    match state.realloc(ptr, size).expect("realloc of a live pointer") {
                        Some(new_ptr) => live[index] = (new_ptr, size),
                        None => {
                            live.swap_remove(index);
                        }
                    }
                }
            }
            3 => {
                let count = 1 + (chunk[3] as usize & 0x0f);
                if let Ok(ptr) = state.calloc(count, raw / count) {
                    let bytes = state.bytes(ptr).expect("fresh calloc is live");
                    assert!(bytes[..count * (raw / count)].iter().all(|&b| b == 0));
                    live.push((ptr, count * (raw / count)));
                }
            }
            _ => {
                if !live.is_empty() {
                    let (ptr, size) = live[pick % live.len()];
                    assert_eq!(state.requested_size(ptr).expect("live"), size);
                    assert!(state.malloc_size(ptr).expect("live") >= size);
                }
            }
        }
    }

    assert_eq!(state.active_count(), live.len());
    for (ptr, _) in live {
        state.free(ptr).expect("final free");
    }
    let stats = state.stats();
    assert_eq!(stats.number_of_malloc_calls, stats.number_of_free_calls);
    drop(state);
    assert_eq!(mapper.live_mappings(), 0, "dropping the state unmaps everything");
});
