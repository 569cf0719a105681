//! The property that gives the allocator its name: a freed address does
//! not come back.

use fwdmalloc::api;
use fwdmalloc::util::PAGE_SIZE;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Free then allocate the same size: different address
// ---------------------------------------------------------------------------

#[test]
fn freed_address_is_not_reissued() {
    unsafe {
        let p1 = api::malloc(24);
        assert!(!p1.is_null());
        api::free(p1);

        let p2 = api::malloc(24);
        assert!(!p2.is_null());
        assert_ne!(p1, p2, "freed address must not be handed out again");
        api::free(p2);
    }
}

// ---------------------------------------------------------------------------
// Sustained churn never repeats an address
// ---------------------------------------------------------------------------

#[test]
fn churn_produces_distinct_addresses() {
    // Stay well under a pool's worth of pages so no pool can be
    // destroyed mid-test: before the sweeper certifies anything, every
    // address must be unique.
    const ROUNDS: usize = 4000;

    unsafe {
        let mut seen = HashSet::with_capacity(ROUNDS);
        for _ in 0..ROUNDS {
            let p = api::malloc(64);
            assert!(!p.is_null());
            assert!(
                seen.insert(p as usize),
                "address {:p} was issued twice",
                p
            );
            api::free(p);
        }
    }
}

#[test]
fn churn_across_sizes_produces_distinct_addresses() {
    unsafe {
        let mut seen = HashSet::new();
        for round in 0..500 {
            for &size in &[16usize, 48, 112, 336, 1024, 2048] {
                let p = api::malloc(size + (round & 7));
                assert!(!p.is_null());
                assert!(seen.insert(p as usize));
                api::free(p);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Page release: a fully freed page leaves the address space, the pool
// stays findable
// ---------------------------------------------------------------------------

#[test]
fn fully_freed_page_is_decommitted() {
    unsafe {
        // 16-byte slots: one page holds exactly PAGE_SIZE / 16 = 256.
        let per_page = PAGE_SIZE / 16;
        let mut ptrs = Vec::with_capacity(2 * per_page);

        // Two pages' worth, so the first page is full (and flagged so)
        // before its last slot is freed.
        for _ in 0..2 * per_page {
            let p = api::malloc(16);
            assert!(!p.is_null());
            ptrs.push(p);
        }

        let page_base = ptrs[0] as usize & !(PAGE_SIZE - 1);
        assert!(
            ptrs[..per_page]
                .iter()
                .all(|&p| (p as usize) & !(PAGE_SIZE - 1) == page_base),
            "first {} slots did not come from one page",
            per_page
        );

        for &p in &ptrs {
            api::free(p);
        }

        // The page's physical backing is gone.
        let fd = fwdmalloc::platform::pagemap::open_pagemap();
        assert!(fd >= 0);
        let status = fwdmalloc::platform::pagemap::page_status(fd, page_base);
        assert!(
            !status.present,
            "fully freed page {:#x} still has a physical page",
            page_base
        );
        fwdmalloc::platform::pagemap::close_pagemap(fd);

        // But the pool stays registered: a stale free into that page
        // must still find the pool (and abort), not miss entirely.
        assert!(!fwdmalloc::pool::radix::lookup(page_base).is_null());
    }
}
