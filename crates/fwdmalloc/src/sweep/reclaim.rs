//! Certified reclamation: the only path by which a freed address can
//! ever be handed out again.
//!
//! Destroyed pools park their (inaccessible) ranges on their arena's
//! pending queue. After a cycle freezes the mark bitmap, a pending range
//! whose fold is zero is provably unreferenced: small-pool ranges are
//! revived and pushed onto the free-address store for
//! `alloc_highwater` to reuse, large and jumbo ranges are unmapped.
//!
//! Sub-page mode additionally publishes safemap bits for free slots on
//! still-live pages whose addresses went unreferenced, making them
//! available to the reuse allocation path.

use crate::arena::{self, Arena};
use crate::meta;
use crate::platform;
use crate::pool::PoolKind;
use crate::sweep::markmap;
use crate::sync::{Mutex, RawMutex};
use crate::util::POOL_SIZE;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Free-address store: a bounded ring of reusable POOL_SIZE ranges.
/// First pushed, first served; overflow simply unmaps instead.
const STORE_ENTRIES: usize = 131072;

struct AddrStore {
    entries: [usize; STORE_ENTRIES],
    head: usize,
    len: usize,
}

impl AddrStore {
    const fn new() -> Self {
        AddrStore {
            entries: [0; STORE_ENTRIES],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, base: usize) -> bool {
        if self.len == STORE_ENTRIES {
            return false;
        }
        let tail = (self.head + self.len) % STORE_ENTRIES;
        self.entries[tail] = base;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let base = self.entries[self.head];
        self.entries[self.head] = 0;
        self.head = (self.head + 1) % STORE_ENTRIES;
        self.len -= 1;
        base
    }
}

static STORE: Mutex<AddrStore> = Mutex::new(AddrStore::new());

/// Guards every arena's pending queue.
static PENDING_LOCK: RawMutex = RawMutex::new();

/// Cycle statistics, readable by tests and diagnostics.
static RANGES_RECLAIMED: AtomicUsize = AtomicUsize::new(0);
static ADDRS_STORED: AtomicUsize = AtomicUsize::new(0);

pub fn ranges_reclaimed() -> usize {
    RANGES_RECLAIMED.load(Ordering::Relaxed)
}

pub fn addrs_stored() -> usize {
    ADDRS_STORED.load(Ordering::Relaxed)
}

/// Push a certified pool base for reuse. Returns false when the ring is
/// full (the caller unmaps instead).
pub fn push_addr_store(base: usize) -> bool {
    STORE.lock().push(base)
}

/// Pop the oldest stored base, or 0 when empty.
pub fn pop_addr_store() -> usize {
    STORE.lock().pop()
}

/// One parked range awaiting certification.
#[repr(C)]
pub struct PendingNode {
    pub start: usize,
    pub end: usize,
    pub kind: PoolKind,
    pub next: *mut PendingNode,
}

/// Park a destroyed pool's range on its arena's pending queue.
///
/// # Safety
/// The range must already be decommitted and out of the radix tree.
pub unsafe fn queue_destroyed(arena: *mut Arena, start: usize, end: usize, kind: PoolKind) {
    let node = meta::alloc(core::mem::size_of::<PendingNode>()) as *mut PendingNode;
    (*node).start = start;
    (*node).end = end;
    (*node).kind = kind;
    (*node).next = ptr::null_mut();

    PENDING_LOCK.lock();
    let arena = &*arena;
    let tail = arena.pending_tail.load(Ordering::Acquire);
    if tail.is_null() {
        arena.pending_head.store(node, Ordering::Release);
    } else {
        (*tail).next = node;
    }
    arena.pending_tail.store(node, Ordering::Release);
    PENDING_LOCK.unlock();
}

/// Move every pending range from `src` onto `dst`'s queue (arena
/// teardown keeps its parked ranges reclaimable this way).
///
/// # Safety
/// Both arenas must be valid; `src` must no longer receive queue pushes.
pub unsafe fn migrate_pending(src: *mut Arena, dst: *mut Arena) {
    PENDING_LOCK.lock();
    let src = &*src;
    let head = src.pending_head.swap(ptr::null_mut(), Ordering::AcqRel);
    let tail = src.pending_tail.swap(ptr::null_mut(), Ordering::AcqRel);
    if !head.is_null() {
        let dst = &*dst;
        let dst_tail = dst.pending_tail.load(Ordering::Acquire);
        if dst_tail.is_null() {
            dst.pending_head.store(head, Ordering::Release);
        } else {
            (*dst_tail).next = head;
        }
        dst.pending_tail.store(tail, Ordering::Release);
    }
    PENDING_LOCK.unlock();
}

/// Certify and recycle pending ranges against the frozen mark bitmap.
/// Unlinked nodes are chained onto `deferred` for the coordinator to
/// free after the mutator resumes (the metadata bins are off limits
/// while it may be suspended holding one).
///
/// # Safety
/// Must run with the bitmap frozen (no scanner active, marks complete).
pub unsafe fn reclaim_pools(deferred: &mut *mut PendingNode) {
    // The mutator might be parked mid-push; skip rather than deadlock.
    if !PENDING_LOCK.try_lock() {
        return;
    }

    arena::for_each_arena(|arena| unsafe {
        let arena = &*arena;
        let mut prev: *mut PendingNode = ptr::null_mut();
        let mut node = arena.pending_head.load(Ordering::Acquire);

        while !node.is_null() {
            let next = (*node).next;
            let fold = markmap::read_range((*node).start, (*node).end);

            if fold == 0 {
                let len = (*node).end - (*node).start;
                match (*node).kind {
                    PoolKind::Small => {
                        // Revive the range and let the high-water
                        // allocator hand the exact address out again.
                        debug_assert!(len == POOL_SIZE);
                        if platform::commit((*node).start as *mut u8, len)
                            && push_addr_store((*node).start)
                        {
                            ADDRS_STORED.fetch_add(1, Ordering::Relaxed);
                        } else {
                            platform::unmap((*node).start as *mut u8, len);
                        }
                    }
                    PoolKind::Large | PoolKind::Jumbo => {
                        platform::unmap((*node).start as *mut u8, len);
                    }
                }
                RANGES_RECLAIMED.fetch_add(1, Ordering::Relaxed);

                // Unlink and defer the node.
                if prev.is_null() {
                    arena.pending_head.store(next, Ordering::Release);
                } else {
                    (*prev).next = next;
                }
                if arena.pending_tail.load(Ordering::Acquire) == node {
                    arena.pending_tail.store(prev, Ordering::Release);
                }
                (*node).next = *deferred;
                *deferred = node;
            } else {
                prev = node;
            }
            node = next;
        }
    });

    PENDING_LOCK.unlock();
}

/// Free the nodes unlinked by `reclaim_pools`. Runs after the mutator
/// resumes.
///
/// # Safety
/// `deferred` must be the chain produced by `reclaim_pools`.
pub unsafe fn free_deferred(mut deferred: *mut PendingNode) {
    while !deferred.is_null() {
        let next = (*deferred).next;
        meta::free(deferred as *mut u8, core::mem::size_of::<PendingNode>());
        deferred = next;
    }
}

/// Sub-page publication: on fully-allocated pages that have seen frees,
/// mark the free-and-unreferenced slots recyclable and queue the page
/// onto its arena's reuse list.
#[cfg(feature = "sub-page-reuse")]
pub unsafe fn reclaim_subpage() {
    use crate::alloc::small::REUSE_LOCK;
    use crate::pool::page_map::FLAG_FULL;
    use crate::util::{PAGE_SIZE as PAGE, POOL_SIZE as POOL};

    /// Sweep epoch stamp; frees knock a page's stamp off this value,
    /// re-arming it for the next pass.
    const GLOBAL_EPOCH: i32 = 256;

    /// A page is only worth publishing while
    /// `(max_alloc / live) * epochs_since_free` stays under this.
    const REUSE_PROFIT_LIMIT: usize = 100;

    if !REUSE_LOCK.try_lock() {
        return;
    }

    arena::for_each_arena(|arena_ptr| unsafe {
        let arena = &*arena_ptr;

        // Unconsumed heads are dropped; every eligible page is
        // re-examined and re-queued below.
        for bucket in 0..crate::arena::REUSE_BUCKETS {
            arena.reuse_head[bucket].store(ptr::null_mut(), Ordering::Release);
        }

        let mut list_node = arena.small_list.load(Ordering::Acquire);
        while !list_node.is_null() {
            let pool = (*list_node).pool;
            list_node = (*list_node).next.load(Ordering::Acquire);
            if pool.is_null() || (*pool).is_destroyed() {
                continue;
            }

            for map_id in 0..(POOL / PAGE) {
                let page = (*pool).page_map(map_id);
                if page.flags() != FLAG_FULL {
                    continue;
                }

                let alloc_size = page.alloc_size();
                let max_alloc = page.max_alloc();
                let live = page.live_count();

                if page.epoch.load(Ordering::Acquire) == GLOBAL_EPOCH || live >= max_alloc {
                    page.epochs_since_free.fetch_add(1, Ordering::Relaxed);
                    page.epoch.store(GLOBAL_EPOCH, Ordering::Release);
                    continue;
                }

                page.clear_safemap();

                let idle = page.epochs_since_free.load(Ordering::Relaxed) as usize;
                let factor = idle * max_alloc / live.max(1);
                if factor < REUSE_PROFIT_LIMIT {
                    let base = page.start.load(Ordering::Acquire);
                    let mut safe_count = 0;
                    for slot in 0..max_alloc {
                        let slot_start = base + slot * alloc_size;
                        if !page.is_live(slot)
                            && !markmap::range_marked(slot_start, slot_start + alloc_size)
                        {
                            page.set_safe(slot);
                            safe_count += 1;
                        }
                    }

                    if safe_count > 0 {
                        queue_reuse_page(arena, page, alloc_size);
                    }
                }

                page.epochs_since_free.fetch_add(1, Ordering::Relaxed);
                page.epoch.store(GLOBAL_EPOCH, Ordering::Release);
            }
        }
    });

    REUSE_LOCK.unlock();
}

/// Append a page to its bucket's publish tail unless it is already
/// queued. Caller holds REUSE_LOCK.
#[cfg(feature = "sub-page-reuse")]
unsafe fn queue_reuse_page(
    arena: &Arena,
    page: &crate::pool::page_map::PageMap,
    alloc_size: usize,
) {
    let bucket = crate::arena::reuse_bucket(alloc_size);
    let page_ptr = page as *const _ as *mut crate::pool::page_map::PageMap;

    let mut node = arena.reuse_tail[bucket].load(Ordering::Acquire);
    if node.is_null() {
        page.next.store(ptr::null_mut(), Ordering::Release);
        arena.reuse_tail[bucket].store(page_ptr, Ordering::Release);
        return;
    }

    loop {
        if node == page_ptr {
            return;
        }
        let next = (*node).next.load(Ordering::Acquire);
        if next.is_null() {
            page.next.store(ptr::null_mut(), Ordering::Release);
            (*node).next.store(page_ptr, Ordering::Release);
            return;
        }
        node = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Private instances: the live ring feeds pool creation, so tests
    // must not put fabricated addresses into it.
    static FIFO_STORE: Mutex<AddrStore> = Mutex::new(AddrStore::new());
    static WRAP_STORE: Mutex<AddrStore> = Mutex::new(AddrStore::new());

    #[test]
    fn addr_store_is_fifo() {
        let mut store = FIFO_STORE.lock();

        assert_eq!(store.pop(), 0);
        assert!(store.push(0x1000));
        assert!(store.push(0x2000));
        assert!(store.push(0x3000));
        assert_eq!(store.pop(), 0x1000);
        assert_eq!(store.pop(), 0x2000);
        assert_eq!(store.pop(), 0x3000);
        assert_eq!(store.pop(), 0);
    }

    #[test]
    fn addr_store_wraps_and_bounds() {
        let mut store = WRAP_STORE.lock();

        for i in 0..STORE_ENTRIES {
            assert!(store.push(0x10000 + i));
        }
        // Full ring rejects the push; the caller unmaps such ranges.
        assert!(!store.push(0xdead0000));

        assert_eq!(store.pop(), 0x10000);
        assert!(store.push(0xbeef0000));
        for i in 1..STORE_ENTRIES {
            assert_eq!(store.pop(), 0x10000 + i);
        }
        assert_eq!(store.pop(), 0xbeef0000);
        assert_eq!(store.pop(), 0);
    }
}
