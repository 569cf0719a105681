//! Allocation-contract tests for fwdmalloc.
//!
//! These exercise the standard malloc-family semantics through the
//! crate's public Rust API.

use fwdmalloc::api;
use std::ptr;

// ---------------------------------------------------------------------------
// malloc(0) returns a real, freeable minimum-size allocation
// ---------------------------------------------------------------------------

#[test]
fn malloc_zero_returns_non_null() {
    unsafe {
        let p = api::malloc(0);
        assert!(!p.is_null(), "malloc(0) must return non-NULL");
        assert!(api::malloc_usable_size(p) >= 8);
        api::free(p);
    }
}

// ---------------------------------------------------------------------------
// free(NULL) is a no-op
// ---------------------------------------------------------------------------

#[test]
fn free_null_is_noop() {
    unsafe {
        api::free(ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// Alignment guarantees
// ---------------------------------------------------------------------------

#[test]
fn malloc_returns_aligned_pointers() {
    let min_align = fwdmalloc::util::MIN_ALIGN;
    unsafe {
        for &size in &[1usize, 2, 7, 8, 9, 15, 16, 17, 31, 32, 33, 64, 100, 256, 1024, 2048] {
            let p = api::malloc(size);
            assert!(!p.is_null(), "malloc({}) returned NULL", size);
            // The 8-byte request is the one size allowed to be only
            // 8-aligned; everything else gets at least MIN_ALIGN.
            let expect = if size <= 8 { 8 } else { min_align };
            assert_eq!(
                (p as usize) % expect,
                0,
                "malloc({}) returned {:?} not aligned to {}",
                size,
                p,
                expect
            );
            api::free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// Memory is writable and readable across the size spectrum
// ---------------------------------------------------------------------------

#[test]
fn various_allocation_sizes() {
    unsafe {
        let sizes: Vec<usize> = vec![
            1, 2, 3, 7, 8, 15, 16, 17, 31, 32, 48, 63, 64, 65, 100, 128, 255, 256, 512, 1000,
            1024, 2000, 2048, 2049, 4096, 8192, 10000, 65536, 131072, 1048576,
        ];

        for &size in &sizes {
            let p = api::malloc(size);
            assert!(!p.is_null(), "malloc({}) returned NULL", size);

            ptr::write_bytes(p, 0xAA, size);
            let slice = std::slice::from_raw_parts(p, size);
            assert!(
                slice.iter().all(|&b| b == 0xAA),
                "malloc({}) memory is not writable/readable",
                size
            );

            api::free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// calloc: overflow detection and zero fill
// ---------------------------------------------------------------------------

#[test]
fn calloc_overflow_returns_null() {
    unsafe {
        let p = api::calloc(usize::MAX / 2 + 1, 2);
        assert!(p.is_null(), "overflowing calloc must return NULL");
        let q = api::calloc(usize::MAX, usize::MAX);
        assert!(q.is_null());
    }
}

#[test]
fn calloc_returns_zeroed_memory() {
    unsafe {
        for &size in &[1usize, 16, 64, 256, 1024, 4096, 65536] {
            let p = api::calloc(size, 1);
            assert!(!p.is_null(), "calloc({}, 1) returned NULL", size);
            let slice = std::slice::from_raw_parts(p, size);
            assert!(
                slice.iter().all(|&b| b == 0),
                "calloc({}, 1) memory is not zero-filled",
                size
            );
            api::free(p);
        }
    }
}

// ---------------------------------------------------------------------------
// realloc semantics
// ---------------------------------------------------------------------------

#[test]
fn realloc_null_acts_as_malloc() {
    unsafe {
        let p = api::realloc(ptr::null_mut(), 128);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xAB, 128);
        api::free(p);
    }
}

#[test]
fn realloc_to_zero_frees() {
    unsafe {
        let p = api::malloc(64);
        assert!(!p.is_null());
        let q = api::realloc(p, 0);
        assert!(q.is_null(), "realloc(p, 0) frees and returns NULL");
    }
}

#[test]
fn realloc_grow_preserves_data() {
    unsafe {
        let initial = 64usize;
        let p = api::malloc(initial);
        assert!(!p.is_null());
        for i in 0..initial {
            p.add(i).write((i & 0xFF) as u8);
        }

        let q = api::realloc(p, 4096);
        assert!(!q.is_null());
        for i in 0..initial {
            assert_eq!(
                q.add(i).read(),
                (i & 0xFF) as u8,
                "data corruption at offset {} after realloc",
                i
            );
        }
        api::free(q);
    }
}

#[test]
fn realloc_shrink_returns_same_pointer() {
    unsafe {
        // Within a small slot, and within a large allocation, shrinking
        // never moves: the slack is simply kept.
        let p = api::malloc(256);
        let q = api::realloc(p, 32);
        assert_eq!(p, q);

        let big = api::malloc(32 * 1024);
        let shrunk = api::realloc(big, 8 * 1024);
        assert_eq!(big, shrunk);

        api::free(q);
        api::free(shrunk);
    }
}

#[test]
fn reallocarray_overflow_leaves_allocation_alone() {
    unsafe {
        let p = api::malloc(64);
        p.write(0x5A);
        let q = api::reallocarray(p, usize::MAX / 4, 8);
        assert!(q.is_null());
        // p is still live and intact.
        assert_eq!(p.read(), 0x5A);
        api::free(p);
    }
}

// ---------------------------------------------------------------------------
// usable size
// ---------------------------------------------------------------------------

#[test]
fn usable_size_at_least_requested() {
    unsafe {
        for &size in &[1usize, 7, 16, 17, 100, 1024, 2048, 4096, 65536, 3 << 20] {
            let p = api::malloc(size);
            assert!(!p.is_null());
            let usable = api::malloc_usable_size(p);
            assert!(usable >= size, "usable {} < requested {}", usable, size);
            api::free(p);
        }
        assert_eq!(api::malloc_usable_size(ptr::null_mut()), 0);
    }
}

// ---------------------------------------------------------------------------
// Aligned allocation family
// ---------------------------------------------------------------------------

#[test]
fn memalign_various_alignments() {
    unsafe {
        for &alignment in &[8usize, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096] {
            let size = 100;
            let p = api::memalign(alignment, size);
            assert!(!p.is_null(), "memalign({}, {}) returned NULL", alignment, size);
            assert_eq!(
                (p as usize) % alignment,
                0,
                "memalign({}, {}) returned {:?} unaligned",
                alignment,
                size,
                p
            );
            ptr::write_bytes(p, 0xBB, size);
            api::free(p);
        }
    }
}

#[test]
fn memalign_non_power_of_two_fails() {
    unsafe {
        let p = api::memalign(3, 100);
        assert!(p.is_null());
    }
}

#[test]
fn posix_memalign_contract() {
    unsafe {
        let mut p: *mut u8 = ptr::null_mut();

        assert_eq!(api::posix_memalign(&mut p, 64, 100), 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        api::free(p);

        // Alignment below pointer size, or not a power of two: EINVAL.
        assert_eq!(api::posix_memalign(&mut p, 4, 100), libc::EINVAL);
        assert!(p.is_null());
        assert_eq!(api::posix_memalign(&mut p, 24, 100), libc::EINVAL);

        // Zero size: EINVAL.
        assert_eq!(api::posix_memalign(&mut p, 64, 0), libc::EINVAL);
    }
}

#[test]
fn aligned_alloc_requires_size_multiple() {
    unsafe {
        let p = api::aligned_alloc(64, 100);
        assert!(p.is_null(), "size not a multiple of alignment must fail");

        let q = api::aligned_alloc(64, 128);
        assert!(!q.is_null());
        assert_eq!(q as usize % 64, 0);
        api::free(q);
    }
}

// ---------------------------------------------------------------------------
// Arena API
// ---------------------------------------------------------------------------

#[test]
fn arena_round_trip() {
    unsafe {
        let id = match api::create_arena() {
            Ok(id) => id,
            Err(_) => panic!("create_arena failed"),
        };
        assert!(id > 0);

        let p = api::malloc_arena(id, 128).expect("arena allocation");
        ptr::write_bytes(p, 0xCD, 128);

        let q = api::malloc_arena(id, 100 * 1024).expect("large arena allocation");
        ptr::write_bytes(q, 0xCE, 100 * 1024);

        // One call releases everything the arena handed out.
        assert!(api::destroy_arena(id).is_ok());

        // The id is dead afterwards.
        assert!(api::malloc_arena(id, 16).is_err());
        assert!(api::destroy_arena(id).is_err());
    }
}

#[test]
fn arena_rejects_bad_ids() {
    unsafe {
        assert!(api::malloc_arena(0, 16).is_err(), "default arena is not addressable");
        assert!(api::malloc_arena(9999, 16).is_err());
        assert!(api::destroy_arena(0).is_err());
    }
}
