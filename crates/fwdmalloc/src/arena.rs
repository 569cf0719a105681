//! Arenas: independent collections of pools.
//!
//! The default arena at slot 0 backs the standard allocation API. Callers
//! can create additional arenas, allocate from them, and tear down the
//! whole arena in one call, which releases everything without individual
//! frees. Each arena owns one small-pool list (head = the pool currently
//! being carved into thread-cache page runs), one large-pool list per CPU
//! (capped), and a jumbo list.

use crate::meta;
use crate::platform::{self, linux};
use crate::pool::{pool, PagePool};
use crate::pool::radix;
use crate::sync::RawMutex;
use crate::util::{MAX_ARENAS, MAX_LARGE_LISTS};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(feature = "sub-page-reuse")]
use crate::pool::PageMap;

/// Reuse-list buckets for sub-page recycling: one per 8-byte size step up
/// to half a page.
#[cfg(feature = "sub-page-reuse")]
pub const REUSE_BUCKETS: usize = 256;

/// Bucket for a small allocation size.
#[cfg(feature = "sub-page-reuse")]
#[inline]
pub fn reuse_bucket(size: usize) -> usize {
    (size >> 3) - 1
}

/// Node in a singly linked list of pools. Nodes are metadata-allocated
/// and never freed while their arena lives, so unlocked list walks stay
/// safe against concurrent appends.
#[repr(C)]
pub struct PoolListNode {
    pub next: AtomicPtr<PoolListNode>,
    pub pool: *mut PagePool,
}

#[repr(C, align(128))]
pub struct Arena {
    /// Small pools; the head is the active one.
    pub small_list: AtomicPtr<PoolListNode>,
    /// Active large pools, one list per CPU slot.
    pub large_lists: [AtomicPtr<PoolListNode>; MAX_LARGE_LISTS],
    /// Large pools demoted off the active lists. They still hold live
    /// allocations and stay visible to frees (radix) and the sweeper.
    pub inactive_large: [AtomicPtr<PoolListNode>; MAX_LARGE_LISTS],
    /// Jumbo pools.
    pub jumbo_list: AtomicPtr<PoolListNode>,
    /// Protects replacement of the small-list head.
    pub small_lock: RawMutex,
    /// One lock per large list, protecting appends and demotions.
    pub large_locks: [RawMutex; MAX_LARGE_LISTS],
    /// Slot in the arena table.
    pub index: usize,
    /// Destroyed-pool ranges awaiting sweep certification.
    #[cfg(feature = "sweeper")]
    pub pending_head: AtomicPtr<crate::sweep::reclaim::PendingNode>,
    #[cfg(feature = "sweeper")]
    pub pending_tail: AtomicPtr<crate::sweep::reclaim::PendingNode>,
    /// Pages with sweep-certified recyclable slots, bucketed by size.
    /// The sweeper publishes onto the tails; the allocator consumes from
    /// the heads.
    #[cfg(feature = "sub-page-reuse")]
    pub reuse_head: [AtomicPtr<PageMap>; REUSE_BUCKETS],
    #[cfg(feature = "sub-page-reuse")]
    pub reuse_tail: [AtomicPtr<PageMap>; REUSE_BUCKETS],
}

/// The arena table. Slot 0 is the default arena.
static ARENAS: [AtomicPtr<Arena>; MAX_ARENAS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_ARENAS];

/// Number of large lists actually in use: min(MAX_LARGE_LISTS, CPUs).
static LARGE_LIST_COUNT: AtomicUsize = AtomicUsize::new(1);

#[inline]
pub fn large_list_count() -> usize {
    LARGE_LIST_COUNT.load(Ordering::Relaxed)
}

/// Which large list the calling thread should try first.
#[inline]
pub fn large_list_index() -> usize {
    linux::current_cpu() % large_list_count()
}

/// Fetch an arena by slot; null when the slot is empty.
#[inline]
pub fn arena(id: usize) -> *mut Arena {
    if id >= MAX_ARENAS {
        return ptr::null_mut();
    }
    ARENAS[id].load(Ordering::Acquire)
}

/// The default arena. Valid after init.
#[inline]
pub fn default_arena() -> *mut Arena {
    ARENAS[0].load(Ordering::Acquire)
}

/// Allocate and wire up the pool lists for a fresh arena struct.
///
/// # Safety
/// `arena` must be zeroed metadata whose `index` is already set.
unsafe fn build_arena(arena: *mut Arena) -> bool {
    // First small pool, created eagerly so the first allocation does not
    // pay for pool setup under the thread-cache refill path.
    let node = meta::alloc_zeroed(core::mem::size_of::<PoolListNode>()) as *mut PoolListNode;
    let small = meta::alloc_zeroed(core::mem::size_of::<PagePool>()) as *mut PagePool;
    (*small).arena = arena;
    if !pool::create_small(small) {
        meta::free(small as *mut u8, core::mem::size_of::<PagePool>());
        meta::free(node as *mut u8, core::mem::size_of::<PoolListNode>());
        return false;
    }
    radix::insert(small);
    (*node).pool = small;
    (*arena).small_list.store(node, Ordering::Release);

    // One eager large pool per active list.
    for i in 0..large_list_count() {
        let large = meta::alloc_zeroed(core::mem::size_of::<PagePool>()) as *mut PagePool;
        (*large).arena = arena;
        if !pool::create_large(large) {
            meta::free(large as *mut u8, core::mem::size_of::<PagePool>());
            return false;
        }
        radix::insert(large);
        let node = meta::alloc_zeroed(core::mem::size_of::<PoolListNode>()) as *mut PoolListNode;
        (*node).pool = large;
        (*arena).large_lists[i].store(node, Ordering::Release);
    }

    true
}

/// Create the default arena. Called once from init.
///
/// # Safety
/// Must run during single-threaded init, after the metadata allocator
/// and high-water mark are up.
pub unsafe fn create_default() -> bool {
    LARGE_LIST_COUNT.store(
        MAX_LARGE_LISTS.min(platform::num_cpus()).max(1),
        Ordering::Relaxed,
    );

    let arena = meta::alloc_zeroed(core::mem::size_of::<Arena>()) as *mut Arena;
    (*arena).index = 0;
    if !build_arena(arena) {
        return false;
    }
    ARENAS[0].store(arena, Ordering::Release);
    true
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArenaError {
    /// Every arena slot is occupied.
    Limit,
    /// The id does not name a live non-default arena.
    BadArena,
    /// The arena could not reserve its initial pools.
    NoMemory,
    /// Invalid argument (zero size, overflow).
    BadParam,
}

/// Create a new arena and return its id.
///
/// # Safety
/// The allocator must be initialized.
pub unsafe fn arena_create() -> Result<usize, ArenaError> {
    let arena = meta::alloc_zeroed(core::mem::size_of::<Arena>()) as *mut Arena;

    for id in 1..MAX_ARENAS {
        if ARENAS[id].load(Ordering::Acquire).is_null()
            && ARENAS[id]
                .compare_exchange(ptr::null_mut(), arena, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            (*arena).index = id;
            if !build_arena(arena) {
                ARENAS[id].store(ptr::null_mut(), Ordering::Release);
                meta::free(arena as *mut u8, core::mem::size_of::<Arena>());
                return Err(ArenaError::NoMemory);
            }
            return Ok(id);
        }
    }

    meta::free(arena as *mut u8, core::mem::size_of::<Arena>());
    Err(ArenaError::Limit)
}

/// Destroy every pool on a list and free the list nodes.
unsafe fn destroy_pool_list(head: *mut PoolListNode) {
    let mut node = head;
    while !node.is_null() {
        let pool = (*node).pool;
        if !pool.is_null() && !(*pool).is_destroyed() {
            pool::destroy(pool);
        }
        if !pool.is_null() {
            meta::free(pool as *mut u8, core::mem::size_of::<PagePool>());
        }
        let next = (*node).next.load(Ordering::Acquire);
        meta::free(node as *mut u8, core::mem::size_of::<PoolListNode>());
        node = next;
    }
}

/// Free all memory allocated from an arena, then the arena itself.
/// The default arena cannot be destroyed.
///
/// # Safety
/// The caller must guarantee no thread still allocates from or frees
/// into this arena, and calls this at most once per arena.
pub unsafe fn arena_destroy(id: usize) -> Result<(), ArenaError> {
    if id == 0 || id >= MAX_ARENAS {
        return Err(ArenaError::BadArena);
    }
    let arena = ARENAS[id].load(Ordering::Acquire);
    if arena.is_null() {
        return Err(ArenaError::BadArena);
    }

    destroy_pool_list((*arena).small_list.load(Ordering::Acquire));
    destroy_pool_list((*arena).jumbo_list.load(Ordering::Acquire));
    for i in 0..MAX_LARGE_LISTS {
        destroy_pool_list((*arena).large_lists[i].load(Ordering::Acquire));
        destroy_pool_list((*arena).inactive_large[i].load(Ordering::Acquire));
    }

    // The destroyed pools just parked their ranges on this arena's
    // pending queue; hand them to the default arena so the sweeper can
    // still certify and recycle them.
    #[cfg(feature = "sweeper")]
    crate::sweep::reclaim::migrate_pending(arena, default_arena());

    ARENAS[id].store(ptr::null_mut(), Ordering::Release);
    meta::free(arena as *mut u8, core::mem::size_of::<Arena>());
    Ok(())
}

/// Iterate over the live arenas.
pub fn for_each_arena(mut f: impl FnMut(*mut Arena)) {
    for slot in ARENAS.iter() {
        let arena = slot.load(Ordering::Acquire);
        if !arena.is_null() {
            f(arena);
        }
    }
}
