//! Root enumeration and the two scanner work queues.
//!
//! A cycle scans two kinds of work: raw memory ranges taken from the
//! process map (stacks, globals, foreign heaps) and the heap pools
//! themselves, so heap objects transitively root other heap objects.
//! Ranges live in a sweeper-private bump region so enumeration never
//! touches the metadata allocator -- during the stop-the-world phase the
//! mutator may be suspended while holding metadata locks.

use crate::arena::{self, PoolListNode};
use crate::meta;
use crate::platform::{self, linux, procmaps::MapsFile};
use crate::pool::{PagePool, PoolKind};
use crate::sweep::markmap;
use crate::sync::RawMutex;
use crate::util::MAX_LARGE_LISTS;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Clone, Copy)]
#[repr(C)]
struct Range {
    start: usize,
    end: usize,
}

/// Backing store for the range queue: enough for the kernel's default
/// VMA limit with room to spare.
const RANGE_CAPACITY: usize = 128 * 1024;

static RANGE_BASE: AtomicUsize = AtomicUsize::new(0);
static RANGE_COUNT: AtomicUsize = AtomicUsize::new(0);
static RANGE_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Set when enumeration could not record every root; reclamation must
/// not trust a cycle with missing roots.
static INCOMPLETE: AtomicBool = AtomicBool::new(false);

/// Pool-walk cursor, advanced under POOL_CURSOR_LOCK.
static POOL_CURSOR_LOCK: RawMutex = RawMutex::new();

struct PoolCursor {
    arena_id: usize,
    stage: usize,
    node: *mut PoolListNode,
}

static mut POOL_CURSOR: PoolCursor = PoolCursor {
    arena_id: 0,
    stage: 0,
    node: ptr::null_mut(),
};

/// Stages per arena: small list, jumbo list, the active large lists,
/// then the inactive large lists.
const STAGES: usize = 2 + 2 * MAX_LARGE_LISTS;

/// Map the range store.
///
/// # Safety
/// Must be called once from sweeper init.
pub unsafe fn init() -> bool {
    let base = linux::map_anonymous(RANGE_CAPACITY * core::mem::size_of::<Range>());
    if base.is_null() {
        return false;
    }
    RANGE_BASE.store(base as usize, Ordering::Release);
    true
}

#[inline]
fn range_slot(index: usize) -> *mut Range {
    (RANGE_BASE.load(Ordering::Acquire) as *mut Range).wrapping_add(index)
}

fn push_range(start: usize, end: usize) {
    let index = RANGE_COUNT.load(Ordering::Relaxed);
    if index >= RANGE_CAPACITY {
        INCOMPLETE.store(true, Ordering::Release);
        return;
    }
    unsafe {
        *range_slot(index) = Range { start, end };
    }
    RANGE_COUNT.store(index + 1, Ordering::Release);
}

/// Take one memory range to scan.
pub fn pop_range() -> Option<(usize, usize)> {
    let index = RANGE_CURSOR.fetch_add(1, Ordering::AcqRel);
    if index >= RANGE_COUNT.load(Ordering::Acquire) {
        return None;
    }
    let range = unsafe { *range_slot(index) };
    Some((range.start, range.end))
}

/// Take one pool to scan.
pub fn pop_pool() -> Option<(*mut PagePool, PoolKind)> {
    POOL_CURSOR_LOCK.lock();
    let result = unsafe { advance_pool_cursor() };
    POOL_CURSOR_LOCK.unlock();
    result
}

/// Walk the arena pool lists stage by stage. List nodes are
/// metadata-allocated and never freed while their arena lives, so
/// holding raw node pointers across the walk is safe.
unsafe fn advance_pool_cursor() -> Option<(*mut PagePool, PoolKind)> {
    let cursor = &mut *ptr::addr_of_mut!(POOL_CURSOR);

    loop {
        if !cursor.node.is_null() {
            let node = cursor.node;
            cursor.node = (*node).next.load(Ordering::Acquire);
            let pool = (*node).pool;
            if pool.is_null() {
                continue;
            }
            let kind = match cursor.stage {
                0 => PoolKind::Small,
                1 => PoolKind::Jumbo,
                _ => PoolKind::Large,
            };
            return Some((pool, kind));
        }

        // Current list exhausted: move to the next stage or arena.
        cursor.stage += 1;
        loop {
            if cursor.stage >= STAGES {
                cursor.arena_id += 1;
                cursor.stage = 0;
            }
            if cursor.arena_id >= crate::util::MAX_ARENAS {
                return None;
            }
            let arena = arena::arena(cursor.arena_id);
            if arena.is_null() {
                cursor.arena_id += 1;
                cursor.stage = 0;
                continue;
            }
            cursor.node = match cursor.stage {
                0 => (*arena).small_list.load(Ordering::Acquire),
                1 => (*arena).jumbo_list.load(Ordering::Acquire),
                s if s < 2 + MAX_LARGE_LISTS => {
                    (*arena).large_lists[s - 2].load(Ordering::Acquire)
                }
                s => (*arena).inactive_large[s - 2 - MAX_LARGE_LISTS].load(Ordering::Acquire),
            };
            break;
        }
    }
}

/// Rebuild both queues for a scan phase: reset the cursors and walk the
/// process map for rootable ranges.
///
/// # Safety
/// No scanner may be running.
pub unsafe fn enumerate() -> bool {
    RANGE_COUNT.store(0, Ordering::Release);
    RANGE_CURSOR.store(0, Ordering::Release);
    INCOMPLETE.store(false, Ordering::Release);

    POOL_CURSOR_LOCK.lock();
    let cursor = &mut *ptr::addr_of_mut!(POOL_CURSOR);
    cursor.arena_id = 0;
    cursor.stage = 0;
    cursor.node = {
        let arena = arena::arena(0);
        if arena.is_null() {
            ptr::null_mut()
        } else {
            (*arena).small_list.load(Ordering::Acquire)
        }
    };
    POOL_CURSOR_LOCK.unlock();

    let mut maps = match MapsFile::open() {
        Some(maps) => maps,
        None => {
            INCOMPLETE.store(true, Ordering::Release);
            return false;
        }
    };

    let (meta_start, meta_end) = meta::region();
    let range_base = RANGE_BASE.load(Ordering::Acquire);

    while let Some(region) = maps.next_region() {
        // Only private, writable, non-executable memory can hold live
        // pointers worth treating as roots. Shared file mappings are
        // data, not pointer graphs.
        if !region.readable || !region.writable || region.executable || !region.private {
            continue;
        }

        // Never scan our own machinery: the metadata arena (pool
        // descriptors hold every pool address by definition), the heap
        // pools (scanned page-map-guided as pool work instead), the mark
        // bitmap, and the range queue itself.
        if region.start >= meta_start && region.start < meta_end {
            continue;
        }
        if platform::in_pool_range(region.start) {
            continue;
        }
        if markmap::is_leaf_base(region.start) || markmap::is_top_table(region.start) {
            continue;
        }
        if region.start == range_base {
            continue;
        }

        push_range(region.start, region.end);
    }

    !INCOMPLETE.load(Ordering::Acquire)
}

/// Did the last enumeration capture every root?
pub fn complete() -> bool {
    !INCOMPLETE.load(Ordering::Acquire)
}
