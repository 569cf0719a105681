//! Three-level radix tree mapping any heap pointer to its owning pool.
//!
//! Indexed by pointer bits [47..40] (stem), [39..32] (leaf), [31..21]
//! (slot). Pool reservations are not POOL_SIZE aligned (the high-water
//! allocator deliberately staggers them), so a pointer's 2 MiB prefix may
//! belong to a pool that *starts* in that prefix or to one that *ends*
//! there; each leaf therefore carries two slot arrays and lookup checks
//! both.
//!
//! Inserts and removals are rare and serialize on one lock. Lookups are
//! the free-path hot path and are lock-free: nodes are installed with
//! release stores and never deallocated while the tree lives.

use crate::meta;
use crate::pool::PagePool;
use crate::sync::RawMutex;
use crate::util::POOL_SIZE_BITS;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const STEM_BITS: usize = 8;
const STEM_COUNT: usize = 1 << STEM_BITS;
const LEAF_BITS: usize = 8;
const LEAVES_PER_STEM: usize = 1 << LEAF_BITS;
const SLOT_BITS: usize = 48 - STEM_BITS - LEAF_BITS - POOL_SIZE_BITS;
const SLOTS_PER_LEAF: usize = 1 << SLOT_BITS;

#[repr(C)]
struct RadixLeaf {
    /// Pools whose start address falls in the matching prefix.
    pool_start: [AtomicPtr<PagePool>; SLOTS_PER_LEAF],
    /// Pools whose end address falls in the matching prefix.
    pool_end: [AtomicPtr<PagePool>; SLOTS_PER_LEAF],
}

#[repr(C)]
struct RadixStem {
    leaves: [AtomicPtr<RadixLeaf>; LEAVES_PER_STEM],
}

struct RadixRoot {
    stems: [AtomicPtr<RadixStem>; STEM_COUNT],
}

static TREE: RadixRoot = RadixRoot {
    stems: [const { AtomicPtr::new(ptr::null_mut()) }; STEM_COUNT],
};

static TREE_LOCK: RawMutex = RawMutex::new();

/// Pools currently present in the tree.
static POOL_COUNT: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn stem_index(addr: usize) -> usize {
    (addr >> (POOL_SIZE_BITS + SLOT_BITS + LEAF_BITS)) & (STEM_COUNT - 1)
}

#[inline]
fn leaf_index(addr: usize) -> usize {
    (addr >> (POOL_SIZE_BITS + SLOT_BITS)) & (LEAVES_PER_STEM - 1)
}

#[inline]
fn slot_index(addr: usize) -> usize {
    (addr >> POOL_SIZE_BITS) & (SLOTS_PER_LEAF - 1)
}

/// Walk to the leaf for `addr`, creating intermediate nodes.
/// Caller must hold TREE_LOCK.
unsafe fn leaf_for(addr: usize) -> *mut RadixLeaf {
    let stem_slot = &TREE.stems[stem_index(addr)];
    let mut stem = stem_slot.load(Ordering::Acquire);
    if stem.is_null() {
        stem = meta::alloc_zeroed(core::mem::size_of::<RadixStem>()) as *mut RadixStem;
        stem_slot.store(stem, Ordering::Release);
    }

    let leaf_slot = &(*stem).leaves[leaf_index(addr)];
    let mut leaf = leaf_slot.load(Ordering::Acquire);
    if leaf.is_null() {
        leaf = meta::alloc_zeroed(core::mem::size_of::<RadixLeaf>()) as *mut RadixLeaf;
        leaf_slot.store(leaf, Ordering::Release);
    }
    leaf
}

/// Record a newly created pool under both its start and end address.
///
/// # Safety
/// `pool` must point at an initialized pool with valid start/end.
pub unsafe fn insert(pool: *mut PagePool) {
    let start = (*pool).start as usize;
    let end = (*pool).end as usize;

    // Pool creation is infrequent; a single lock is plenty.
    TREE_LOCK.lock();
    let start_leaf = leaf_for(start);
    let end_leaf = leaf_for(end);
    (*start_leaf).pool_start[slot_index(start)].store(pool, Ordering::Release);
    (*end_leaf).pool_end[slot_index(end)].store(pool, Ordering::Release);
    POOL_COUNT.fetch_add(1, Ordering::Relaxed);
    TREE_LOCK.unlock();
}

/// Remove a pool from the tree. Only called with a pool that was
/// definitely inserted, so the path must exist.
///
/// # Safety
/// `pool` must be a previously inserted pool.
pub unsafe fn remove(pool: *mut PagePool) {
    let start = (*pool).start as usize;
    let end = (*pool).end as usize;

    TREE_LOCK.lock();
    let start_leaf = leaf_for(start);
    let end_leaf = leaf_for(end);
    (*start_leaf).pool_start[slot_index(start)].store(ptr::null_mut(), Ordering::Release);
    (*end_leaf).pool_end[slot_index(end)].store(ptr::null_mut(), Ordering::Release);
    POOL_COUNT.fetch_sub(1, Ordering::Relaxed);
    TREE_LOCK.unlock();
}

/// Find the pool owning `addr`, or null.
pub fn lookup(addr: usize) -> *mut PagePool {
    let stem = TREE.stems[stem_index(addr)].load(Ordering::Acquire);
    if stem.is_null() {
        return ptr::null_mut();
    }
    let leaf = unsafe { (*stem).leaves[leaf_index(addr)].load(Ordering::Acquire) };
    if leaf.is_null() {
        return ptr::null_mut();
    }

    unsafe {
        let slot = slot_index(addr);
        let pool = (*leaf).pool_start[slot].load(Ordering::Acquire);
        if !pool.is_null() && addr >= (*pool).start as usize {
            return pool;
        }
        let pool = (*leaf).pool_end[slot].load(Ordering::Acquire);
        if !pool.is_null() && addr < (*pool).end as usize {
            return pool;
        }
    }
    ptr::null_mut()
}

/// Number of pools currently registered.
pub fn pool_count() -> usize {
    POOL_COUNT.load(Ordering::Relaxed)
}
