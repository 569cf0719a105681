//! Small allocations: bump allocation out of per-thread bins.

use crate::alloc::tcache::{self, ThreadCache};
use crate::arena::Arena;
use crate::pool::page_map::FLAG_FULL;
use crate::util::get_bin;
use core::ptr;
use core::sync::atomic::Ordering;

#[cfg(feature = "sub-page-reuse")]
use crate::pool::PageMap;
#[cfg(feature = "sub-page-reuse")]
use crate::sync::RawMutex;

/// Serializes every safemap consumer against the sweeper's publisher.
#[cfg(feature = "sub-page-reuse")]
pub static REUSE_LOCK: RawMutex = RawMutex::new();

/// Allocate `size` bytes (already align_size-rounded, at most HALF_PAGE)
/// from `arena`. Returns null only on address-space exhaustion.
///
/// # Safety
/// The allocator must be initialized and `arena` live.
pub unsafe fn malloc_small(size: usize, arena: *mut Arena) -> *mut u8 {
    let tcache = tcache::get_threadcache(arena);

    // Recycled slots the sweeper certified dead take priority over
    // fresh address space.
    #[cfg(feature = "sub-page-reuse")]
    {
        let reused = try_reuse(size, arena);
        if !reused.is_null() {
            return reused;
        }
    }

    malloc_small_fresh(size, tcache)
}

/// The forward-only bump path.
unsafe fn malloc_small_fresh(size: usize, tcache: *mut ThreadCache) -> *mut u8 {
    let tcache = &mut *tcache;
    let bin: *mut super::tcache::Bin = &mut tcache.bins[get_bin(size)];

    // Bin page exhausted (or never assigned): connect a blank page.
    if (*bin).alloc_count == (*bin).max_alloc {
        if tcache.next_unused >= tcache.end_unused {
            if !tcache::assign_pages(tcache as *mut ThreadCache) {
                return ptr::null_mut();
            }
        }

        (*bin).page = tcache.next_unused;
        tcache.next_unused = tcache.next_unused.add(1);

        (*(*bin).page).claim((*bin).alloc_size);
        (*bin).alloc_count = 0;
        (*bin).next_alloc = (*(*bin).page).start.load(Ordering::Acquire) as *mut u8;
    }

    // Only this cache allocates from the page, but any thread may be
    // freeing previous allocations, so the bitmap write is atomic.
    (*(*bin).page).set_live((*bin).alloc_count);

    let allocation = (*bin).next_alloc;
    (*bin).next_alloc = (*bin).next_alloc.add((*bin).alloc_size);
    (*bin).alloc_count += 1;

    if (*bin).alloc_count == (*bin).max_alloc {
        (*(*bin).page).or_flags(FLAG_FULL);
    }

    allocation
}

/// Try to satisfy the request from the arena's reuse list for this size
/// bucket: pages whose safemap carries slots the sweeper proved
/// unreferenced.
#[cfg(feature = "sub-page-reuse")]
unsafe fn try_reuse(size: usize, arena: *mut Arena) -> *mut u8 {
    let arena = &*arena;
    let bucket = crate::arena::reuse_bucket(size);

    // Unlocked emptiness probe keeps the common (nothing published)
    // case off the reuse lock entirely.
    if arena.reuse_head[bucket].load(Ordering::Acquire).is_null()
        && arena.reuse_tail[bucket].load(Ordering::Acquire).is_null()
    {
        return ptr::null_mut();
    }

    REUSE_LOCK.lock();

    // The sweeper publishes onto the tail; promote it to the consumer
    // head once the head drains. Under the lock, so publication cannot
    // interleave and cross-link the two lists.
    if arena.reuse_head[bucket].load(Ordering::Acquire).is_null() {
        let tail = arena.reuse_tail[bucket].swap(ptr::null_mut(), Ordering::AcqRel);
        if !tail.is_null() {
            arena.reuse_head[bucket].store(tail, Ordering::Release);
        }
    }

    let allocation = reuse_from_list(size, arena, bucket);
    REUSE_LOCK.unlock();
    allocation
}

/// Scan the bucket's pages for a slot that is free in the bitmap and set
/// in the safemap; claim it. A page that yields a slot stays at the head
/// for the next request; a page with nothing left is dropped. Caller
/// holds REUSE_LOCK.
#[cfg(feature = "sub-page-reuse")]
unsafe fn reuse_from_list(size: usize, arena: &Arena, bucket: usize) -> *mut u8 {
    let mut curr = arena.reuse_head[bucket].load(Ordering::Acquire);

    while !curr.is_null() {
        let page: &PageMap = &*curr;
        // Only fully-allocated, still-mapped pages participate; anything
        // else changed state since the sweeper queued it.
        if page.flags() == FLAG_FULL && page.alloc_size() == size {
            let max_alloc = page.max_alloc();
            for slot in 0..max_alloc {
                if !page.is_live(slot) && page.is_safe(slot) {
                    page.set_live(slot);
                    page.clear_safe(slot);
                    let allocation =
                        (page.start.load(Ordering::Acquire) + size * slot) as *mut u8;
                    ptr::write_bytes(allocation, 0, size);
                    return allocation;
                }
            }
        }

        // Nothing to give: drop the page off the head and look at the next.
        let next = page.next.load(Ordering::Acquire);
        arena.reuse_head[bucket].store(next, Ordering::Release);
        curr = next;
    }

    ptr::null_mut()
}
