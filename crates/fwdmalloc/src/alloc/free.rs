//! The free path: locate the owning pool, validate the pointer, update
//! liveness, and hand whole released page runs back to the OS.
//!
//! A pointer that the radix tree does not know, or that does not sit on
//! a live allocation boundary, aborts the process. Returning quietly
//! would let a double free go unnoticed, and the non-reuse guarantee is
//! only as strong as that check.

use crate::platform::{self, linux};
use crate::pool::page_map::{PageMap, FLAG_FULL, FLAG_READY, FLAG_RELEASED};
use crate::pool::pool::{self, PagePool, PoolKind, TRACK_END, TRACK_FREE, TRACK_MASK, TRACK_UNMAPPED};
use crate::pool::radix;
use crate::util::{
    abort_with_message, align_down, align_up, MIN_PAGES_TO_FREE, PAGE_SIZE, POOL_SIZE,
};
use core::sync::atomic::Ordering;

#[cfg(feature = "sub-page-reuse")]
use crate::alloc::small::REUSE_LOCK;

/// Locate a small allocation. Returns the page map and slot index, or
/// None if `ptr` is not a live slot boundary.
///
/// # Safety
/// `pool` must be a live small pool owning `ptr`.
pub unsafe fn find_small_ptr(ptr: *mut u8, pool: &PagePool) -> Option<(&PageMap, usize)> {
    let map_index = (ptr as usize - pool.start as usize) / PAGE_SIZE;
    let page = pool.page_map(map_index);

    let alloc_size = page.alloc_size();
    if alloc_size == 0 {
        // Page was never claimed by a bin; nothing was ever allocated here.
        return None;
    }

    // Reject addresses inside an allocation.
    let offset = ptr as usize - page.start.load(Ordering::Acquire);
    if offset % alloc_size != 0 {
        return None;
    }

    // Reject slots that are not live (never allocated, or already freed).
    let index = offset / alloc_size;
    if !page.is_live(index) {
        return None;
    }

    Some((page, index))
}

/// Locate a large allocation by binary search over the tracking array.
/// Returns its entry index and size, or None. Freed entries carry tag
/// bits, so a stale pointer no longer compares equal -- that miss is the
/// double-free detector.
///
/// # Safety
/// `pool` must be a live large pool owning `ptr`.
pub unsafe fn find_large_ptr(ptr: *mut u8, pool: &PagePool) -> Option<(usize, usize)> {
    let mut left = 0usize;
    let mut right = pool.next_free_index.load(Ordering::Acquire);
    let mut current = (right - left) / 2;

    while left != right {
        let entry = pool.track_load(current);
        if entry == ptr as usize {
            if current == pool.next_free_index.load(Ordering::Acquire) {
                // The final entry is the running end-pointer, not an
                // allocation.
                return None;
            }
            let size = (pool.track_load(current + 1) & !TRACK_MASK) - entry;
            return Some((current, size));
        } else if (ptr as usize) < entry {
            right = current;
        } else {
            left = current + 1;
        }
        current = left + (right - left) / 2;
    }

    None
}

/// Release the page run around a fully freed page back to the OS, if the
/// run is big enough (or bridges two released regions), and advance the
/// pool's in-use window.
unsafe fn free_page(pool_ptr: *mut PagePool, page: &PageMap) {
    let pool = &*pool_ptr;
    let pool_start = pool.start as usize;
    let maps = pool.page_maps();
    let total_pages = POOL_SIZE / PAGE_SIZE;

    pool.lock.lock();

    let my_index = (page.start.load(Ordering::Acquire) - pool_start) / PAGE_SIZE;
    let mut first = my_index;
    let mut last = my_index;
    let mut left_released = false;
    let mut right_released = false;

    // Pull earlier pages that are freed but not yet returned into the
    // run; stop at the pool edge, a released page, or a page in use.
    while first > 0 {
        let flags = (*maps.add(first - 1)).flags();
        if flags == FLAG_READY | FLAG_FULL {
            first -= 1;
        } else {
            if flags & FLAG_RELEASED != 0 {
                left_released = true;
            }
            break;
        }
    }
    if first == 0 {
        left_released = true;
    }

    while last + 1 < total_pages {
        let flags = (*maps.add(last + 1)).flags();
        if flags == FLAG_READY | FLAG_FULL {
            last += 1;
        } else {
            if flags & FLAG_RELEASED != 0 {
                right_released = true;
            }
            break;
        }
    }
    if last + 1 == total_pages {
        right_released = true;
    }

    let start_addr = pool_start + first * PAGE_SIZE;
    let end_addr = pool_start + (last + 1) * PAGE_SIZE;

    // Below the minimum, returning pages one at a time shreds the range
    // into VMAs; islands between released regions go back regardless
    // because they merge VMAs instead.
    if end_addr - start_addr >= PAGE_SIZE * MIN_PAGES_TO_FREE || (left_released && right_released) {
        if !platform::decommit(start_addr as *mut u8, end_addr - start_addr) {
            if linux::errno() == libc::ENOMEM {
                // Likely out of VMAs. Leave everything marked freed; a
                // later free retries and may merge enough to succeed.
                pool.lock.unlock();
                return;
            }
            abort_with_message("fwdmalloc: page decommit failed\n");
        }

        for i in first..=last {
            (*maps.add(i)).or_flags(FLAG_RELEASED);
        }

        // The in-use window only moves when a release touches it.
        if start_addr <= pool.start_in_use.load(Ordering::Acquire) {
            let mut idx = last + 1;
            while idx < total_pages && (*maps.add(idx)).flags() & FLAG_RELEASED != 0 {
                idx += 1;
            }
            pool.start_in_use.store(pool_start + idx * PAGE_SIZE, Ordering::Release);
        }
        if end_addr >= pool.end_in_use.load(Ordering::Acquire) {
            let mut idx = first;
            while idx > 0 && (*maps.add(idx - 1)).flags() & FLAG_RELEASED != 0 {
                idx -= 1;
            }
            pool.end_in_use.store(pool_start + idx * PAGE_SIZE, Ordering::Release);
        }

        if pool.is_destroyed() {
            pool.lock.unlock();
            pool::destroy(pool_ptr);
            return;
        }
    }

    pool.lock.unlock();
}

/// Mark a small slot freed; release its page if that emptied it.
///
/// # Safety
/// `page`/`index` must come from `find_small_ptr` on `pool`.
pub unsafe fn free_small_ptr(pool_ptr: *mut PagePool, page: &PageMap, index: usize) {
    #[cfg(feature = "sub-page-reuse")]
    page.epoch.fetch_sub(1, Ordering::Relaxed);

    page.clear_live(index);

    // The release check races against the reuse path handing out
    // certified slots on this page; both sides hold the reuse lock.
    #[cfg(feature = "sub-page-reuse")]
    REUSE_LOCK.lock();

    if page.flags() & FLAG_FULL != 0 && page.live_fold() == 0 {
        // Every allocation on the page is freed and no bin will touch it
        // again: it can leave the address space.
        page.or_flags(FLAG_READY);
        free_page(pool_ptr, page);
    }

    #[cfg(feature = "sub-page-reuse")]
    REUSE_LOCK.unlock();
}

/// Mark a large allocation freed, then decommit the page-aligned body of
/// the surrounding freed run if it qualifies.
///
/// # Safety
/// `index` must come from `find_large_ptr` on `pool` (or be the trim
/// path's tail allocation).
pub unsafe fn free_large_pointer(pool_ptr: *mut PagePool, index: usize, _size: usize) {
    let pool = &*pool_ptr;

    pool.lock.lock();
    pool.track_or(index, TRACK_FREE);

    // Walk to the start of the contiguous freed-but-mapped run.
    let mut first = index;
    while first > 0 && (pool.track_load(first - 1) & TRACK_MASK) == TRACK_FREE {
        first -= 1;
    }

    let mut left_released = false;
    let mut right_released = false;

    // Shrink (or extend, when the neighbour is already partially
    // unmapped) the run start to a page boundary.
    let mut start_free = pool.track_load(first) & !TRACK_MASK;
    if start_free & (PAGE_SIZE - 1) != 0 {
        if first > 0 && (pool.track_load(first - 1) & TRACK_UNMAPPED) != 0 {
            // The tail of this page belongs to an allocation that is
            // already gone; the whole page can go.
            start_free = align_down(start_free, PAGE_SIZE);
            left_released = true;
        } else {
            start_free = align_up(start_free, PAGE_SIZE);
        }
    } else if first == 0 || (pool.track_load(first - 1) & TRACK_UNMAPPED) != 0 {
        left_released = true;
    }

    let next_free_index = pool.next_free_index.load(Ordering::Acquire);
    let mut last = index;
    while last < next_free_index && (pool.track_load(last + 1) & TRACK_MASK) == TRACK_FREE {
        last += 1;
    }

    let mut end_free = pool.track_load(last + 1) & !TRACK_MASK;
    if end_free == 0 {
        abort_with_message("fwdmalloc: large tracking array corrupt\n");
    }
    if end_free & (PAGE_SIZE - 1) != 0 {
        if (pool.track_load(last + 1) & TRACK_UNMAPPED) != 0 {
            end_free = align_up(end_free, PAGE_SIZE);
            right_released = true;
        } else {
            end_free = align_down(end_free, PAGE_SIZE);
        }
    } else if end_free >= pool.end as usize || (pool.track_load(last + 1) & TRACK_UNMAPPED) != 0 {
        right_released = true;
    }

    if start_free <= pool.start_in_use.load(Ordering::Acquire) {
        if end_free < pool.end as usize {
            let mut cont = last;
            while cont < next_free_index && (pool.track_load(cont + 1) & TRACK_UNMAPPED) != 0 {
                cont += 1;
            }
            pool.start_in_use
                .store(pool.track_load(cont + 1) & !TRACK_MASK, Ordering::Release);
        } else {
            pool.start_in_use.store(pool.end as usize, Ordering::Release);
        }
    }

    // Retired and every allocation freed: the whole pool goes at once.
    if pool.is_destroyed() && (pool.track_load(next_free_index) & TRACK_END) != 0 {
        pool.lock.unlock();
        pool::destroy(pool_ptr);
        return;
    }

    if end_free > start_free
        && (end_free - start_free >= PAGE_SIZE * MIN_PAGES_TO_FREE
            || (left_released && right_released))
    {
        if !platform::decommit(start_free as *mut u8, end_free - start_free) {
            if linux::errno() == libc::ENOMEM {
                // Out of VMAs; leave the run marked freed so a later
                // free can retry with a bigger range.
                pool.lock.unlock();
                return;
            }
            abort_with_message("fwdmalloc: large decommit failed\n");
        }

        for i in first..=last {
            pool.track_or(i, TRACK_FREE | TRACK_UNMAPPED);
        }
    }

    pool.lock.unlock();
}

/// Free a jumbo allocation by destroying its pool.
///
/// # Safety
/// `pool` must be a live jumbo pool.
pub unsafe fn free_jumbo(pool_ptr: *mut PagePool) {
    pool::destroy(pool_ptr);
}

/// The full free path behind the public API.
///
/// # Safety
/// `ptr` must be non-null and previously returned by this allocator.
pub unsafe fn free_ptr(ptr: *mut u8) {
    let pool_ptr = radix::lookup(ptr as usize);
    if pool_ptr.is_null() {
        abort_with_message("fwdmalloc: free of pointer not owned by any pool\n");
    }
    let pool = &*pool_ptr;

    match pool.kind() {
        PoolKind::Large => match find_large_ptr(ptr, pool) {
            Some((index, size)) => free_large_pointer(pool_ptr, index, size),
            None => abort_with_message("fwdmalloc: free of invalid large pointer\n"),
        },
        PoolKind::Jumbo => free_jumbo(pool_ptr),
        PoolKind::Small => match find_small_ptr(ptr, pool) {
            Some((page, index)) => {
                // Freed objects are zeroed so a stale copy of the data
                // cannot keep the sweeper from certifying the page.
                #[cfg(feature = "sweeper")]
                core::ptr::write_bytes(ptr, 0, page.alloc_size());
                #[cfg(feature = "sub-page-reuse")]
                page.epochs_since_free.store(0, Ordering::Relaxed);

                free_small_ptr(pool_ptr, page, index);
            }
            None => abort_with_message("fwdmalloc: free of invalid small pointer\n"),
        },
    }
}

/// Actual backing size of an allocation; 0 for null or unknown pointers.
///
/// # Safety
/// The allocator must be initialized.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let pool_ptr = radix::lookup(ptr as usize);
    if pool_ptr.is_null() {
        return 0;
    }
    let pool = &*pool_ptr;

    match pool.kind() {
        PoolKind::Large => find_large_ptr(ptr, pool).map_or(0, |(_, size)| size),
        PoolKind::Jumbo => pool.end as usize - pool.start as usize,
        PoolKind::Small => find_small_ptr(ptr, pool).map_or(0, |(page, _)| page.alloc_size()),
    }
}
