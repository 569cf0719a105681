//! GlobalAlloc surface tests, driving the trait impl directly.

use core::alloc::{GlobalAlloc, Layout};
use fwdmalloc::FwdMalloc;

#[test]
fn alloc_and_dealloc_round_trip() {
    unsafe {
        let layout = Layout::from_size_align(256, 16).unwrap();
        let p = FwdMalloc.alloc(layout);
        assert!(!p.is_null());
        core::ptr::write_bytes(p, 0x3C, 256);
        assert!(p.add(255).read() == 0x3C);
        FwdMalloc.dealloc(p, layout);
    }
}

#[test]
fn zero_sized_layouts_do_not_allocate() {
    unsafe {
        let layout = Layout::from_size_align(0, 64).unwrap();
        let p = FwdMalloc.alloc(layout);
        // Dangling, well-aligned, and dealloc is a no-op.
        assert_eq!(p as usize, 64);
        FwdMalloc.dealloc(p, layout);
    }
}

#[test]
fn alloc_zeroed_is_zeroed() {
    unsafe {
        for &(size, align) in &[(64usize, 16usize), (100, 64), (5000, 16), (4096, 4096)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let p = FwdMalloc.alloc_zeroed(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0);
            let slice = std::slice::from_raw_parts(p, size);
            assert!(slice.iter().all(|&b| b == 0), "({}, {}) not zeroed", size, align);
            FwdMalloc.dealloc(p, layout);
        }
    }
}

#[test]
fn over_aligned_realloc_preserves_data_and_alignment() {
    unsafe {
        let layout = Layout::from_size_align(128, 256).unwrap();
        let p = FwdMalloc.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 256, 0);

        for i in 0..128 {
            p.add(i).write(i as u8);
        }

        let q = FwdMalloc.realloc(p, layout, 512);
        assert!(!q.is_null());
        assert_eq!(q as usize % 256, 0, "realloc must preserve over-alignment");
        for i in 0..128 {
            assert_eq!(q.add(i).read(), i as u8);
        }

        FwdMalloc.dealloc(q, Layout::from_size_align(512, 256).unwrap());
    }
}

#[test]
fn vec_workload_through_the_trait() {
    // Simulate a growing vector: repeated realloc with the previous
    // layout, like RawVec does.
    unsafe {
        let align = 8;
        let mut capacity = 4usize;
        let mut p = FwdMalloc.alloc(Layout::from_size_align(capacity, align).unwrap());
        assert!(!p.is_null());
        for i in 0..capacity {
            p.add(i).write(i as u8);
        }

        while capacity < 4096 {
            let old_layout = Layout::from_size_align(capacity, align).unwrap();
            let new_capacity = capacity * 2;
            p = FwdMalloc.realloc(p, old_layout, new_capacity);
            assert!(!p.is_null());
            for i in 0..4 {
                assert_eq!(p.add(i).read(), i as u8, "lost prefix at capacity {}", new_capacity);
            }
            capacity = new_capacity;
        }

        FwdMalloc.dealloc(p, Layout::from_size_align(capacity, align).unwrap());
    }
}
