//! Per-thread caches: bins plus a private run of blank pages.
//!
//! The hot small-allocation path touches only thread-local state. A
//! cache refills its page run with PAGES_PER_REFILL pages at a time via
//! one atomic bump on the arena's active small pool, so the only lock in
//! the steady state is the rare small-list lock when a pool retires.

use crate::arena::Arena;
use crate::meta;
use crate::platform;
use crate::pool::{pool, PageMap, PagePool};
use crate::pool::radix;
use crate::util::{
    BIN_COUNT, BIN_INFLECTION, MAX_ARENAS, MIN_ALIGN, PAGES_PER_REFILL, PAGE_SIZE,
};
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::Ordering;

/// One small-allocation bin: the page currently being filled for one
/// size class.
#[repr(C)]
pub struct Bin {
    /// Next free slot on the page.
    pub next_alloc: *mut u8,
    /// Slot size, a multiple of 8.
    pub alloc_size: usize,
    /// Allocations made from the current page so far.
    pub alloc_count: usize,
    /// Slots per page for this size.
    pub max_alloc: usize,
    /// Page map carrying the liveness bitmap.
    pub page: *mut PageMap,
}

#[repr(C)]
pub struct ThreadCache {
    pub bins: [Bin; BIN_COUNT],
    /// Next blank page map available to any bin of this cache.
    pub next_unused: *mut PageMap,
    /// End (exclusive) of the blank page run.
    pub end_unused: *mut PageMap,
    /// Arena this cache draws pages from.
    pub arena: *mut Arena,
}

/// Build the bin table. Bins start "full" so a bin that never sees an
/// allocation never claims a page.
unsafe fn init_tcache(tcache: *mut ThreadCache, arena: *mut Arena) {
    let tcache = &mut *tcache;

    // Fixed-step bins: consecutive multiples of the alignment unit,
    // highest bin index = smallest size.
    for b in 1..=(BIN_COUNT - BIN_INFLECTION) {
        let bin = &mut tcache.bins[BIN_COUNT - b];
        bin.alloc_size = b * MIN_ALIGN;
        bin.max_alloc = PAGE_SIZE / bin.alloc_size;
        bin.alloc_count = bin.max_alloc;
        bin.page = ptr::null_mut();
        bin.next_alloc = ptr::null_mut();
    }

    // Count-per-page bins: bin b packs exactly b slots. Intermediate
    // sizes would pack no better -- three 1360-byte slots fit a page but
    // so do only two 1536-byte ones, so 1536 rides in the 2048 bin.
    for b in 1..BIN_INFLECTION {
        let bin = &mut tcache.bins[b];
        bin.alloc_size = (PAGE_SIZE / b) & !(MIN_ALIGN - 1);
        bin.max_alloc = b;
        bin.alloc_count = b;
        bin.page = ptr::null_mut();
        bin.next_alloc = ptr::null_mut();
    }

    // The 8-byte bin does not fit the 16-byte-aligned pattern.
    #[cfg(not(feature = "eight-byte-align"))]
    {
        let bin = &mut tcache.bins[0];
        bin.alloc_size = 8;
        bin.max_alloc = PAGE_SIZE / 8;
        bin.alloc_count = bin.max_alloc;
        bin.page = ptr::null_mut();
        bin.next_alloc = ptr::null_mut();
    }

    tcache.arena = arena;
    tcache.next_unused = ptr::null_mut();
    tcache.end_unused = ptr::null_mut();
}

/// Refill the cache's blank-page run from the arena's active small pool,
/// retiring the pool and creating a new one if it is out of pages.
/// Returns false only when the OS is out of address space.
///
/// # Safety
/// `tcache` must be the calling thread's cache.
pub unsafe fn assign_pages(tcache: *mut ThreadCache) -> bool {
    let tcache = &mut *tcache;
    let arena = &*tcache.arena;
    let refill_bytes = PAGES_PER_REFILL * PAGE_SIZE;

    let mut pool_ptr = (*arena.small_list.load(Ordering::Acquire)).pool;
    // Concurrent threads get distinct ranges out of the same pool from
    // this one atomic bump.
    let mut next_page = (*pool_ptr).next_free.fetch_add(refill_bytes, Ordering::AcqRel);

    // PAGES_PER_REFILL divides the pool evenly, so a range either fits
    // entirely or the pool is exhausted.
    while next_page + refill_bytes > (*pool_ptr).end as usize {
        arena.small_lock.lock();
        // The pool may already have been replaced while we waited.
        if pool_ptr == (*arena.small_list.load(Ordering::Acquire)).pool {
            let node =
                meta::alloc_zeroed(core::mem::size_of::<crate::arena::PoolListNode>())
                    as *mut crate::arena::PoolListNode;
            let new_pool = meta::alloc_zeroed(core::mem::size_of::<PagePool>()) as *mut PagePool;
            (*new_pool).arena = tcache.arena;
            if !pool::create_small(new_pool) {
                meta::free(new_pool as *mut u8, core::mem::size_of::<PagePool>());
                meta::free(node as *mut u8, core::mem::size_of::<crate::arena::PoolListNode>());
                arena.small_lock.unlock();
                return false;
            }
            radix::insert(new_pool);
            (*node).pool = new_pool;
            (*node)
                .next
                .store(arena.small_list.load(Ordering::Acquire), Ordering::Release);
            arena.small_list.store(node, Ordering::Release);
        }
        pool_ptr = (*arena.small_list.load(Ordering::Acquire)).pool;
        arena.small_lock.unlock();

        next_page = (*pool_ptr).next_free.fetch_add(refill_bytes, Ordering::AcqRel);
    }

    let map_index = (next_page - (*pool_ptr).start as usize) / PAGE_SIZE;
    let maps = (*pool_ptr).page_maps();

    // Stamp the page bases; everything else on the map is claimed lazily.
    for i in 0..PAGES_PER_REFILL {
        (*maps.add(map_index + i))
            .start
            .store(next_page + i * PAGE_SIZE, Ordering::Release);
    }

    tcache.next_unused = maps.add(map_index);
    tcache.end_unused = tcache.next_unused.add(PAGES_PER_REFILL);
    true
}

/// Give back whatever the cache still holds when its thread exits.
unsafe fn destroy_tcache(tcache: *mut ThreadCache) {
    let tcache = &mut *tcache;
    if tcache.next_unused.is_null() || tcache.next_unused >= tcache.end_unused {
        return;
    }

    // The run is only returnable while its pool still exists: an arena
    // torn down before this thread exited took the pool, and the page
    // maps this cache points into, with it.
    let base = (*tcache.next_unused).start.load(Ordering::Acquire);
    let pool = radix::lookup(base);
    if pool.is_null() {
        return;
    }
    let maps = (*pool).page_maps();
    let maps_end = maps.add(crate::util::POOL_SIZE / PAGE_SIZE);
    if tcache.next_unused < maps || tcache.next_unused >= maps_end {
        return;
    }

    // Returning the pages to their pool of origin would need donation
    // bookkeeping; give them straight back to the OS.
    let pages = tcache.end_unused.offset_from(tcache.next_unused) as usize;
    platform::decommit(base as *mut u8, pages * PAGE_SIZE);
    mark_released(tcache.next_unused, pages);
}

/// Flag a run of page maps as returned to the OS.
unsafe fn mark_released(first: *mut PageMap, pages: usize) {
    use crate::pool::page_map::{FLAG_FULL, FLAG_READY, FLAG_RELEASED};
    for i in 0..pages {
        // The pages were never claimed by a bin, so claim-equivalent
        // state has to be synthesized for the release accounting.
        (*first.add(i)).or_flags(FLAG_FULL | FLAG_READY | FLAG_RELEASED);
    }
}

/// Per-thread cache table, one slot per arena. The Drop impl is the
/// thread-exit hook.
struct CacheSlots {
    caches: [Cell<*mut ThreadCache>; MAX_ARENAS],
}

impl Drop for CacheSlots {
    fn drop(&mut self) {
        for slot in self.caches.iter() {
            let tcache = slot.get();
            if !tcache.is_null() {
                unsafe {
                    destroy_tcache(tcache);
                    meta::free(tcache as *mut u8, core::mem::size_of::<ThreadCache>());
                }
                slot.set(ptr::null_mut());
            }
        }
    }
}

thread_local! {
    static CACHES: CacheSlots = CacheSlots {
        caches: [const { Cell::new(ptr::null_mut()) }; MAX_ARENAS],
    };
}

/// Get (creating on first use) the calling thread's cache for `arena`.
///
/// # Safety
/// `arena` must be a live arena.
pub unsafe fn get_threadcache(arena: *mut Arena) -> *mut ThreadCache {
    let index = (*arena).index;

    let cached = CACHES.try_with(|slots| unsafe {
        let tcache = slots.caches[index].get();
        // A pointer mismatch means the arena slot was destroyed and
        // reused; the stale cache's pages are gone with the old arena.
        if !tcache.is_null() && (*tcache).arena == arena {
            return tcache;
        }
        if !tcache.is_null() {
            meta::free(tcache as *mut u8, core::mem::size_of::<ThreadCache>());
        }
        let tcache = meta::alloc_zeroed(core::mem::size_of::<ThreadCache>()) as *mut ThreadCache;
        init_tcache(tcache, arena);
        slots.caches[index].set(tcache);
        tcache
    });

    match cached {
        Ok(tcache) => tcache,
        Err(_) => {
            // TLS is gone (thread teardown). Serve the allocation from a
            // one-shot cache; the metadata is abandoned.
            let tcache =
                meta::alloc_zeroed(core::mem::size_of::<ThreadCache>()) as *mut ThreadCache;
            init_tcache(tcache, arena);
            tcache
        }
    }
}
