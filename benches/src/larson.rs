//! Larson benchmark: multi-threaded slot-replacement allocation pattern.
//! Simulates a server workload with long-lived batches of mixed-size
//! objects being replaced at random. For a forward-only allocator this
//! is close to the worst case: every replacement consumes fresh address
//! space and leaves a hole behind, which is exactly the pressure the
//! sweeper exists to relieve.

use fwdmalloc::api;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_DURATION_SECS: u64 = 5;
const BATCH_SIZE: usize = 1000;
const MIN_SIZE: usize = 8;
const MAX_SIZE: usize = 512;

fn main() {
    let num_threads: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let duration_secs: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_DURATION_SECS);

    println!(
        "Larson benchmark: {} threads, {} seconds",
        num_threads, duration_secs
    );

    let running = Arc::new(AtomicBool::new(true));
    let total_ops = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..num_threads)
        .map(|tid| {
            let running = Arc::clone(&running);
            let total_ops = Arc::clone(&total_ops);
            std::thread::spawn(move || {
                larson_worker(tid, &running, &total_ops);
            })
        })
        .collect();

    let start = Instant::now();
    std::thread::sleep(Duration::from_secs(duration_secs));
    running.store(false, Ordering::Release);

    for h in handles {
        h.join().unwrap();
    }

    let elapsed = start.elapsed().as_secs_f64();
    let ops = total_ops.load(Ordering::Relaxed);
    let mops = ops as f64 / elapsed / 1_000_000.0;

    println!("Total operations: {}", ops);
    println!("Throughput: {:.2} Mops/sec", mops);
    println!("Per-thread: {:.2} Mops/sec", mops / num_threads as f64);
    println!("Pools registered: {}", api::pool_count());
}

fn larson_worker(tid: usize, running: &AtomicBool, total_ops: &AtomicUsize) {
    // Simple LCG PRNG seeded by thread ID
    let mut rng = (tid as u64).wrapping_mul(6364136223846793005).wrapping_add(1);

    let mut batch: Vec<*mut u8> = Vec::with_capacity(BATCH_SIZE);

    // Initial fill
    for _ in 0..BATCH_SIZE {
        let size = random_size(&mut rng);
        unsafe {
            let ptr = api::malloc(size);
            if !ptr.is_null() {
                std::ptr::write_bytes(ptr, 0xAB, std::cmp::min(size, 16));
                batch.push(ptr);
            }
        }
    }

    let mut ops = 0usize;

    while running.load(Ordering::Relaxed) {
        // Free a random element and replace it
        if !batch.is_empty() {
            let idx = (next_random(&mut rng) as usize) % batch.len();
            unsafe {
                api::free(batch[idx]);
            }

            let size = random_size(&mut rng);
            unsafe {
                let ptr = api::malloc(size);
                if !ptr.is_null() {
                    std::ptr::write_bytes(ptr, 0xCD, std::cmp::min(size, 16));
                    batch[idx] = ptr;
                } else {
                    batch.swap_remove(idx);
                }
            }
            ops += 2; // one free + one malloc
        }

        if ops % 10000 == 0 {
            total_ops.fetch_add(10000, Ordering::Relaxed);
        }
    }

    total_ops.fetch_add(ops % 10000, Ordering::Relaxed);

    // Cleanup
    for ptr in batch {
        unsafe {
            api::free(ptr);
        }
    }
}

fn random_size(rng: &mut u64) -> usize {
    let r = next_random(rng);
    MIN_SIZE + (r as usize) % (MAX_SIZE - MIN_SIZE)
}

fn next_random(rng: &mut u64) -> u64 {
    *rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    *rng >> 33
}
