//! Large (half page to just under a pool) and jumbo allocations.
//!
//! Large pools append end-pointers to a sorted tracking array; the size
//! of allocation *i* is `entry[i+1] - entry[i]`, so N allocations always
//! keep N+1 entries. Jumbo requests get a pool of their own.

use crate::alloc::free;
use crate::arena::{self, Arena, PoolListNode};
use crate::meta;
use crate::pool::pool::{self, PagePool, TRACK_END, TRACK_MASK};
use crate::pool::radix;
use crate::util::{align_up, HALF_PAGE, MAX_POOLS_PER_LIST, MIN_ALIGN};
use core::ptr;
use core::sync::atomic::Ordering;

/// Record one allocation in `pool`. Caller holds the pool lock (or owns
/// the pool exclusively, pre-publication).
///
/// # Safety
/// The caller has verified the aligned request fits before `pool.end`.
pub unsafe fn large_from_pool(size: usize, alignment: usize, pool: *mut PagePool) -> *mut u8 {
    let pool = &*pool;
    let aligned = align_up(pool.next_free.load(Ordering::Relaxed), alignment);

    // The returned pointer was already recorded as the previous entry's
    // end. Alignment past MIN_ALIGN can push it forward, in which case
    // the previous entry grows to cover the gap; a spacer "allocation"
    // would buy nothing over that.
    let mut index = pool.next_free_index.load(Ordering::Relaxed);
    if alignment > MIN_ALIGN {
        pool.track_store(index, aligned);
    }

    let new_next = aligned + size;
    pool.next_free.store(new_next, Ordering::Relaxed);
    index += 1;
    pool.next_free_index.store(index, Ordering::Relaxed);
    pool.track_store(index, new_next);

    // Less than a minimum large allocation left: fold the remainder into
    // this allocation so the pool finishes exactly.
    if (pool.end as usize).saturating_sub(new_next) < HALF_PAGE + MIN_ALIGN {
        pool.track_store(index, pool.end as usize);
        pool.next_free.store(pool.end as usize, Ordering::Relaxed);
    }

    aligned as *mut u8
}

/// Release the unallocated tail of a pool being demoted and stamp the
/// end-of-pool sentinel. The pool may be destroyed here if everything in
/// it was already freed.
///
/// # Safety
/// The pool must be off the active list (no further allocations).
pub unsafe fn trim(pool_ptr: *mut PagePool) {
    let pool = &*pool_ptr;

    pool.lock.lock();
    let mut index = pool.next_free_index.load(Ordering::Relaxed);
    let tail = pool.track_load(index) & !TRACK_MASK;
    if tail < pool.end as usize {
        let remaining = pool.end as usize - tail;

        // Convert the slack into one recorded allocation and free it.
        index += 1;
        pool.next_free_index.store(index, Ordering::Relaxed);
        pool.track_store(index, pool.end as usize);
        pool.next_free.store(pool.end as usize, Ordering::Relaxed);
        pool.lock.unlock();

        free::free_large_pointer(pool_ptr, index - 1, remaining);
        pool.lock.lock();
    }

    let index = pool.next_free_index.load(Ordering::Relaxed);
    pool.track_or(index, TRACK_END);

    let destroyed = pool.is_destroyed();
    pool.lock.unlock();

    if destroyed {
        pool::destroy(pool_ptr);
    }
}

/// Allocate from one of the arena's large-pool lists, creating a pool if
/// none has room.
///
/// # Safety
/// The allocator must be initialized and `arena` live.
pub unsafe fn malloc_large(size: usize, alignment: usize, arena_ptr: *mut Arena) -> *mut u8 {
    let arena = &*arena_ptr;
    let list_id = arena::large_list_index();

    let mut node = arena.large_lists[list_id].load(Ordering::Acquire);
    let mut tail_node = node;
    let mut loop_count = 0usize;

    // Walk this CPU's pools for one with space. Pools on other lists
    // might fit better, but checking them would just move contention.
    while !node.is_null() {
        let pool = (*node).pool;
        let aligned = align_up((*pool).next_free.load(Ordering::Relaxed), alignment);
        if aligned + size > (*pool).end as usize {
            tail_node = node;
            node = (*node).next.load(Ordering::Acquire);
            loop_count += 1;
        } else {
            // Promising. The size test ran without the lock to avoid a
            // pileup, so it must be repeated inside.
            (*pool).lock.lock();
            let aligned = align_up((*pool).next_free.load(Ordering::Relaxed), alignment);
            if aligned + size <= (*pool).end as usize {
                let allocation = large_from_pool(size, alignment, pool);
                (*pool).lock.unlock();
                return allocation;
            }
            // Lost the race; try the next pool.
            (*pool).lock.unlock();
            node = (*node).next.load(Ordering::Acquire);
        }
    }

    // No pool on this list has space.
    arena.large_locks[list_id].lock();

    // A new pool may have appeared while we waited for the list lock.
    let newer = (*tail_node).next.load(Ordering::Acquire);
    if !newer.is_null() {
        let pool = (*newer).pool;
        (*pool).lock.lock();
        let aligned = align_up((*pool).next_free.load(Ordering::Relaxed), alignment);
        if aligned + size <= (*pool).end as usize {
            let allocation = large_from_pool(size, alignment, pool);
            (*pool).lock.unlock();
            arena.large_locks[list_id].unlock();
            return allocation;
        }
        (*pool).lock.unlock();

        while !(*tail_node).next.load(Ordering::Acquire).is_null() {
            tail_node = (*tail_node).next.load(Ordering::Acquire);
        }
    }

    // Create a fresh pool and allocate from it before publication.
    let pool = meta::alloc_zeroed(core::mem::size_of::<PagePool>()) as *mut PagePool;
    (*pool).arena = arena_ptr;
    if !pool::create_large(pool) {
        meta::free(pool as *mut u8, core::mem::size_of::<PagePool>());
        arena.large_locks[list_id].unlock();
        return ptr::null_mut();
    }
    radix::insert(pool);

    // An aggressive alignment can defeat even an empty pool; publish it
    // anyway (smaller requests will fill it) and fail this one cleanly.
    let aligned = align_up((*pool).next_free.load(Ordering::Relaxed), alignment);
    let allocation = if aligned + size <= (*pool).end as usize {
        large_from_pool(size, alignment, pool)
    } else {
        ptr::null_mut()
    };

    let node = meta::alloc_zeroed(core::mem::size_of::<PoolListNode>()) as *mut PoolListNode;
    (*node).pool = pool;
    (*tail_node).next.store(node, Ordering::Release);

    // The list has grown long: demote the head pool. It keeps serving
    // frees (and the sweeper keeps scanning it) from the inactive list.
    if loop_count >= MAX_POOLS_PER_LIST {
        let head = arena.large_lists[list_id].load(Ordering::Acquire);
        arena.large_lists[list_id].store((*head).next.load(Ordering::Acquire), Ordering::Release);
        trim((*head).pool);

        (*head)
            .next
            .store(arena.inactive_large[list_id].load(Ordering::Acquire), Ordering::Release);
        arena.inactive_large[list_id].store(head, Ordering::Release);
    }
    arena.large_locks[list_id].unlock();

    allocation
}

/// Allocate a pool-sized-or-bigger request as its own jumbo pool.
///
/// # Safety
/// The allocator must be initialized and `arena` live.
pub unsafe fn malloc_jumbo(size: usize, arena_ptr: *mut Arena) -> *mut u8 {
    let arena = &*arena_ptr;

    let pool = meta::alloc_zeroed(core::mem::size_of::<PagePool>()) as *mut PagePool;
    let node = meta::alloc_zeroed(core::mem::size_of::<PoolListNode>()) as *mut PoolListNode;

    (*pool).arena = arena_ptr;
    if !pool::create_jumbo(pool, size) {
        meta::free(pool as *mut u8, core::mem::size_of::<PagePool>());
        meta::free(node as *mut u8, core::mem::size_of::<PoolListNode>());
        return ptr::null_mut();
    }

    radix::insert(pool);

    (*node).pool = pool;
    loop {
        let head = arena.jumbo_list.load(Ordering::Acquire);
        (*node).next.store(head, Ordering::Release);
        if arena
            .jumbo_list
            .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }

    (*pool).start
}
