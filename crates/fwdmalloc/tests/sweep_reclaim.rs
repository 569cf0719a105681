//! End-to-end sweep mechanics, driven synchronously.
//!
//! One test function on purpose: the thread that initializes the
//! allocator is the registered mutator, and a synchronous `collect`
//! from that thread runs the whole cycle without signals.

#![cfg(feature = "sweeper")]

use fwdmalloc::api;
use fwdmalloc::arena;
use fwdmalloc::platform::{self, linux, pagemap};
use fwdmalloc::pool::radix;
use fwdmalloc::pool::PoolKind;
use fwdmalloc::sweep::reclaim;
use fwdmalloc::util::POOL_SIZE;

#[test]
fn certified_ranges_are_recycled() {
    unsafe {
        // Register this thread as the mutator before anything else.
        fwdmalloc::init::ensure_initialized();

        // Stand-in destroyed pools: parked (decommitted) ranges outside
        // the pool address band, so nothing the scanners read can alias
        // them and certification is deterministic.
        let a = linux::map_anonymous(POOL_SIZE);
        let b = linux::map_anonymous(POOL_SIZE);
        let c = linux::map_anonymous(POOL_SIZE);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert!(platform::decommit(a, POOL_SIZE));
        assert!(platform::decommit(b, POOL_SIZE));
        assert!(platform::decommit(c, POOL_SIZE));

        let arena0 = arena::default_arena();
        reclaim::queue_destroyed(arena0, a as usize, a as usize + POOL_SIZE, PoolKind::Small);
        reclaim::queue_destroyed(arena0, b as usize, b as usize + POOL_SIZE, PoolKind::Small);
        reclaim::queue_destroyed(arena0, c as usize, c as usize + POOL_SIZE, PoolKind::Large);

        let reclaimed_before = reclaim::ranges_reclaimed();
        let stored_before = reclaim::addrs_stored();

        api::collect();

        assert_eq!(
            reclaim::ranges_reclaimed() - reclaimed_before,
            3,
            "all three parked ranges should certify"
        );
        assert_eq!(
            reclaim::addrs_stored() - stored_before,
            2,
            "only the small ranges enter the store"
        );

        // The store hands the small ranges back in push order, revived
        // and writable.
        let first = reclaim::pop_addr_store();
        let second = reclaim::pop_addr_store();
        assert_eq!(first, a as usize);
        assert_eq!(second, b as usize);
        (first as *mut u8).write(0x99);
        (second as *mut u8).write(0x99);

        // The large range was unmapped outright.
        let fd = pagemap::open_pagemap();
        assert!(fd >= 0);
        assert!(!pagemap::page_status(fd, c as usize).present);
        pagemap::close_pagemap(fd);

        // A range that is still referenced stays parked. A jumbo
        // allocation's pool is the cleanest way to make one: the local
        // pointer below keeps it marked through the STW scan.
        let held = api::malloc(POOL_SIZE + 1);
        assert!(!held.is_null());
        // Keep the dangling address in heap memory, where the root scan
        // is guaranteed to see it (a register-only local might not be).
        let keeper: Box<usize> = Box::new(held as usize);
        api::free(held);
        // Freed and destroyed: gone from the tree, range parked.
        assert!(radix::lookup(*keeper).is_null());

        let reclaimed_mid = reclaim::ranges_reclaimed();
        api::collect();
        // The scan marked the address held in `keeper`, so the parked
        // range survived the cycle.
        assert_eq!(
            reclaim::ranges_reclaimed(),
            reclaimed_mid,
            "a referenced range must not be reclaimed (held {:#x})",
            *keeper
        );

        // Clean up what we un-parked.
        linux::unmap(first as *mut u8, POOL_SIZE);
        linux::unmap(second as *mut u8, POOL_SIZE);
    }
}
