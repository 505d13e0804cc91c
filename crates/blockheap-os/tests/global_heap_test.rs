//! Integration tests for the process-wide heap over real mappings.

use blockheap_os::{calloc, free, global_heap, malloc, malloc_size, realloc};

#[test]
fn test_malloc_write_read_free() {
    let ptr = malloc(100);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 16, 0);
    assert!(malloc_size(ptr) >= 100);
    // SAFETY: `ptr` points at >= 100 writable bytes until freed.
    unsafe {
        for i in 0..100 {
            ptr.add(i).write(i as u8);
        }
        assert_eq!(ptr.add(99).read(), 99);
    }
    free(ptr);
}

#[test]
fn test_big_allocation_round_trip() {
    let size = 200_000;
    let ptr = malloc(size);
    assert!(!ptr.is_null());
    // SAFETY: `ptr` points at `size` writable bytes until freed.
    unsafe {
        ptr.write(0x11);
        ptr.add(size - 1).write(0x22);
        assert_eq!(ptr.read(), 0x11);
        assert_eq!(ptr.add(size - 1).read(), 0x22);
    }
    free(ptr);
}

#[test]
fn test_calloc_is_zeroed() {
    let ptr = calloc(64, 32);
    assert!(!ptr.is_null());
    // SAFETY: calloc returned 2048 readable bytes.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 64 * 32) };
    assert!(bytes.iter().all(|&b| b == 0));
    free(ptr);
    assert!(calloc(usize::MAX, 2).is_null());
}

#[test]
fn test_realloc_preserves_prefix() {
    let ptr = malloc(24);
    // SAFETY: 24 writable bytes.
    unsafe { ptr.copy_from_nonoverlapping(b"blockheap realloc bytes!".as_ptr(), 24) };
    let grown = realloc(ptr, 70_000);
    assert!(!grown.is_null());
    // SAFETY: `grown` holds at least the 24 copied bytes.
    let prefix = unsafe { std::slice::from_raw_parts(grown, 24) };
    assert_eq!(prefix, b"blockheap realloc bytes!");
    assert!(realloc(grown, 0).is_null());
}

#[test]
fn test_null_is_ignored() {
    free(std::ptr::null_mut());
    assert_eq!(malloc_size(std::ptr::null()), 0);
}

#[test]
fn test_threads_share_one_heap() {
    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                for i in 0..500usize {
                    let size = 1 + (i * 37 + t * 11) % 3000;
                    let ptr = malloc(size);
                    assert!(!ptr.is_null());
                    // SAFETY: `size` writable bytes until freed.
                    unsafe {
                        ptr.write(t as u8);
                        ptr.add(size - 1).write(t as u8);
                        assert_eq!(ptr.read(), t as u8);
                    }
                    free(ptr);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!global_heap().is_locked_by_current_thread());
}

#[test]
fn test_client_writes_race_neighbour_chunk_traffic() {
    // Same class, so both threads work inside the same blocks.
    const SIZE: usize = 200;
    let owned: Vec<usize> = (0..32).map(|_| malloc(SIZE) as usize).collect();
    assert!(owned.iter().all(|&addr| addr != 0));

    let writer = {
        let owned = owned.clone();
        std::thread::spawn(move || {
            for round in 0..2000usize {
                for &addr in &owned {
                    let ptr = std::ptr::with_exposed_provenance_mut::<u8>(addr);
                    // SAFETY: every pointer stays allocated until the join below.
                    unsafe { ptr.write_bytes(round as u8, SIZE) };
                }
            }
        })
    };
    for _ in 0..2000 {
        let ptr = malloc(SIZE);
        assert!(!ptr.is_null());
        assert!(malloc_size(ptr) >= SIZE);
        free(ptr);
    }
    writer.join().unwrap();

    for addr in owned {
        let ptr = std::ptr::with_exposed_provenance_mut::<u8>(addr);
        // SAFETY: still allocated; the writer thread has finished.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, SIZE) };
        assert!(bytes.iter().all(|&b| b == bytes[0]));
        free(ptr);
    }
}
