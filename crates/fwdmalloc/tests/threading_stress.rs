//! Multi-thread stress: concurrent malloc/free must not corrupt, abort,
//! or deadlock, and the non-reuse guarantee must hold across threads.

use fwdmalloc::api;
use std::collections::HashSet;
use std::ptr;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

// ---------------------------------------------------------------------------
// N threads doing rapid malloc/free cycles
// ---------------------------------------------------------------------------

fn stress_malloc_free_n_threads(num_threads: usize) {
    const ITERATIONS: usize = 10_000;
    const ALLOC_SIZE: usize = 128;

    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unsafe {
                    for _ in 0..ITERATIONS {
                        let p = api::malloc(ALLOC_SIZE);
                        assert!(!p.is_null(), "malloc returned NULL under contention");
                        ptr::write_bytes(p, 0xCC, ALLOC_SIZE);
                        api::free(p);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked during malloc/free stress");
    }
}

#[test]
fn stress_malloc_free_4_threads() {
    stress_malloc_free_n_threads(4);
}

#[test]
fn stress_malloc_free_8_threads() {
    stress_malloc_free_n_threads(8);
}

// ---------------------------------------------------------------------------
// Cross-thread free: thread A allocates, thread B frees
// ---------------------------------------------------------------------------

/// Wrapper to allow sending `*mut u8` across thread boundaries.
/// Safety: the allocator is thread-safe; ownership moves with the send.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

#[test]
fn cross_thread_free() {
    const BATCH: usize = 2_000;

    let producer = thread::spawn(|| {
        let mut ptrs = Vec::with_capacity(BATCH);
        unsafe {
            for i in 0..BATCH {
                let size = 16 + (i % 48) * 8;
                let p = api::malloc(size);
                assert!(!p.is_null());
                ptr::write_bytes(p, (i & 0xFF) as u8, size);
                ptrs.push(SendPtr(p));
            }
        }
        ptrs
    });

    let ptrs = producer.join().expect("producer panicked");
    let consumer = thread::spawn(move || unsafe {
        for p in ptrs {
            api::free(p.0);
        }
    });
    consumer.join().expect("consumer panicked");
}

// ---------------------------------------------------------------------------
// Non-reuse holds across threads
// ---------------------------------------------------------------------------

#[test]
fn addresses_stay_unique_across_threads() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1_500;

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let seen = Arc::clone(&seen);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut local = Vec::with_capacity(PER_THREAD);
                unsafe {
                    for _ in 0..PER_THREAD {
                        let p = api::malloc(96);
                        assert!(!p.is_null());
                        local.push(p as usize);
                        api::free(p);
                    }
                }
                let mut seen = seen.lock().unwrap();
                for addr in local {
                    assert!(seen.insert(addr), "address {:#x} issued twice", addr);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }
}

// ---------------------------------------------------------------------------
// Mixed sizes under contention, interleaved with reallocs
// ---------------------------------------------------------------------------

#[test]
fn mixed_size_churn() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 800;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            thread::spawn(move || unsafe {
                for i in 0..ITERATIONS {
                    let size = match (t + i) % 4 {
                        0 => 24,
                        1 => 700,
                        2 => 9 * 1024,
                        _ => 70 * 1024,
                    };
                    let p = api::malloc(size);
                    assert!(!p.is_null());
                    p.write(0xEE);

                    let grown = api::realloc(p, size * 2);
                    assert!(!grown.is_null());
                    assert_eq!(grown.read(), 0xEE);

                    api::free(grown);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }
}
