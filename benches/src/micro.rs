//! Microbenchmarks for fwdmalloc's allocation paths.
//!
//! A forward-only allocator never recycles on the fast path, so these
//! numbers mostly measure the per-thread bump path, page refills, and
//! the page-release cost on free.

use fwdmalloc::api;
use std::hint::black_box;
use std::time::Instant;

/// Measure malloc/free latency for a given size, N iterations.
fn bench_malloc_free(size: usize, iterations: usize) -> f64 {
    // Warmup
    for _ in 0..1000 {
        unsafe {
            let ptr = api::malloc(black_box(size));
            std::ptr::write_bytes(ptr, 0xAB, std::cmp::min(size, 64));
            api::free(black_box(ptr));
        }
    }
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = api::malloc(black_box(size));
            std::ptr::write_bytes(ptr, 0xAB, std::cmp::min(size, 64));
            api::free(black_box(ptr));
        }
    }
    let elapsed = start.elapsed();
    elapsed.as_nanos() as f64 / iterations as f64
}

/// Measure calloc/free latency.
fn bench_calloc_free(size: usize, iterations: usize) -> f64 {
    for _ in 0..1000 {
        unsafe {
            let ptr = api::calloc(black_box(1), black_box(size));
            api::free(black_box(ptr));
        }
    }
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = api::calloc(black_box(1), black_box(size));
            api::free(black_box(ptr));
        }
    }
    let elapsed = start.elapsed();
    elapsed.as_nanos() as f64 / iterations as f64
}

/// Measure a growing realloc ladder.
fn bench_realloc_grow(iterations: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let mut ptr = api::malloc(black_box(16));
            for &size in black_box(&[32usize, 64, 128, 256, 512, 1024]) {
                ptr = api::realloc(black_box(ptr), size);
            }
            api::free(black_box(ptr));
        }
    }
    let elapsed = start.elapsed();
    elapsed.as_nanos() as f64 / iterations as f64
}

/// Measure multi-threaded throughput in ops/sec.
fn bench_threaded_throughput(num_threads: usize, ops_per_thread: usize, size: usize) -> f64 {
    let start = Instant::now();
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..ops_per_thread {
                    unsafe {
                        let ptr = api::malloc(black_box(size));
                        std::ptr::write_bytes(ptr, 0xCD, std::cmp::min(size, 16));
                        api::free(black_box(ptr));
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    let elapsed = start.elapsed();
    let total_ops = num_threads * ops_per_thread;
    total_ops as f64 / elapsed.as_secs_f64()
}

fn main() {
    const ITERATIONS: usize = 200_000;

    println!("fwdmalloc microbenchmarks");
    println!();

    for &size in &[16usize, 64, 256, 1024, 4096, 16384, 65536] {
        let ns = bench_malloc_free(size, ITERATIONS);
        println!("malloc/free {:>6} B: {:>8.1} ns/op", size, ns);
    }
    println!();

    for &size in &[64usize, 1024, 16384] {
        let ns = bench_calloc_free(size, ITERATIONS);
        println!("calloc/free {:>6} B: {:>8.1} ns/op", size, ns);
    }
    println!();

    let ns = bench_realloc_grow(ITERATIONS / 10);
    println!("realloc ladder 16..1024: {:>8.1} ns/ladder", ns);
    println!();

    for &threads in &[1usize, 2, 4, 8] {
        let ops = bench_threaded_throughput(threads, 100_000, 128);
        println!("threads {:>2}: {:>12.0} ops/sec", threads, ops);
    }
}
