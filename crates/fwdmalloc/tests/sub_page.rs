//! Sub-page slot recycling, driven synchronously.
//!
//! One test function on purpose: the initializing thread is the
//! registered mutator, so `collect` runs the whole cycle inline.

#![cfg(feature = "sub-page-reuse")]

use fwdmalloc::api;
use fwdmalloc::util::PAGE_SIZE;

#[test]
fn certified_slots_are_recycled_within_their_page() {
    const SIZE: usize = 64;
    const SLOTS: usize = PAGE_SIZE / SIZE;

    unsafe {
        fwdmalloc::init::ensure_initialized();

        // Fill one page exactly (plus a spill allocation so the page is
        // flagged fully allocated before anything on it is freed).
        let mut slots = vec![core::ptr::null_mut(); SLOTS];
        for slot in slots.iter_mut() {
            *slot = api::malloc(SIZE);
            assert!(!slot.is_null());
        }
        let spill = api::malloc(SIZE);
        assert!(!spill.is_null());

        let page_base = slots[0] as usize & !(PAGE_SIZE - 1);
        assert!(
            slots.iter().all(|&p| (p as usize) & !(PAGE_SIZE - 1) == page_base),
            "expected all {} slots on one page",
            SLOTS
        );

        // Free a block in the middle and scrub every trace of those
        // addresses from our own memory; the frames and vector are
        // roots, and a surviving copy would veto recycling.
        let mut freed = [0usize; 8];
        for (i, entry) in freed.iter_mut().enumerate() {
            let victim = slots[20 + i];
            *entry = victim as usize;
            api::free(victim);
            slots[20 + i] = core::ptr::null_mut();
        }
        let freed_base = freed[0];
        let freed_end = freed[7] + SIZE;
        // Volatile: a dead-store-eliminated wipe would leave the
        // addresses visible to the scan.
        for entry in freed.iter_mut() {
            core::ptr::write_volatile(entry, 0);
        }

        // One cycle scans, certifies the freed slots, and publishes the
        // page on the reuse list.
        api::collect();

        // The next allocation of this size must come from the certified
        // slots rather than fresh address space.
        let recycled = api::malloc(SIZE);
        assert!(!recycled.is_null());
        let addr = recycled as usize;
        assert!(
            addr >= freed_base && addr < freed_end,
            "expected a recycled slot in [{:#x}, {:#x}), got {:#x}",
            freed_base,
            freed_end,
            addr
        );

        // And it must be zeroed: the reuse path hands out clean slots.
        let view = std::slice::from_raw_parts(recycled, SIZE);
        assert!(view.iter().all(|&b| b == 0));

        api::free(recycled);
        api::free(spill);
        for &p in &slots {
            if !p.is_null() {
                api::free(p);
            }
        }
    }
}
