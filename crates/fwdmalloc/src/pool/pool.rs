//! Page pools: the unit of address-space accounting.
//!
//! A pool owns one contiguous reservation obtained from the high-water
//! allocator. Small and large pools are POOL_SIZE long; a jumbo pool is
//! sized to its single allocation. The pool kind is encoded as a sentinel
//! in `next_free_index`, which for large pools doubles as the count of
//! recorded allocations.
//!
//! `start_in_use`/`end_in_use` track the lowest and highest addresses not
//! yet freed-and-released. Once they meet or cross, every byte of the
//! pool has been returned and the pool is destroyed.

use crate::arena::Arena;
use crate::meta;
use crate::platform;
use crate::pool::page_map::PageMap;
use crate::pool::radix;
use crate::sync::RawMutex;
use crate::util::{align_up, PAGE_SIZE, POOL_SIZE};
use core::sync::atomic::{AtomicUsize, Ordering};

/// `next_free_index` value marking a small pool.
pub const SMALL_SENTINEL: usize = usize::MAX;

/// `next_free_index` value marking a jumbo pool.
pub const JUMBO_SENTINEL: usize = usize::MAX - 1;

/// Large-pool tracking entry tags (low three bits of each end-pointer).
pub const TRACK_FREE: usize = 1;
pub const TRACK_UNMAPPED: usize = 2;
pub const TRACK_END: usize = 4;
pub const TRACK_MASK: usize = 7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolKind {
    Small,
    Large,
    Jumbo,
}

#[repr(C)]
pub struct PagePool {
    /// First address of the reservation. Constant for the pool's life.
    pub start: *mut u8,
    /// One past the last address of the reservation.
    pub end: *mut u8,
    /// Next unallocated byte. Small pools bump it a page range at a time,
    /// large pools an allocation at a time.
    pub next_free: AtomicUsize,
    /// Page-map array (small) or tracking-entry array (large); null for
    /// jumbo pools, which need no per-allocation metadata.
    tracking: AtomicUsize,
    /// Pool-kind sentinel, or for large pools the index of the tracking
    /// entry holding the running end-pointer.
    pub next_free_index: AtomicUsize,
    /// Lowest address not yet freed and released.
    pub start_in_use: AtomicUsize,
    /// One past the highest address not yet freed and released.
    pub end_in_use: AtomicUsize,
    /// Owning arena (non-owning backpointer).
    pub arena: *mut Arena,
    /// Protects structural updates to the tracking metadata and the
    /// in-use bounds.
    pub lock: RawMutex,
}

unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    #[inline]
    pub fn kind(&self) -> PoolKind {
        match self.next_free_index.load(Ordering::Relaxed) {
            SMALL_SENTINEL => PoolKind::Small,
            JUMBO_SENTINEL => PoolKind::Jumbo,
            _ => PoolKind::Large,
        }
    }

    /// Page-map array of a small pool.
    ///
    /// # Safety
    /// The pool must be a live small pool.
    #[inline]
    pub unsafe fn page_maps(&self) -> *mut PageMap {
        self.tracking.load(Ordering::Relaxed) as *mut PageMap
    }

    /// Page map of page `index`.
    ///
    /// # Safety
    /// The pool must be a live small pool and `index` within it.
    #[inline]
    pub unsafe fn page_map(&self, index: usize) -> &PageMap {
        debug_assert!(index < POOL_SIZE / PAGE_SIZE);
        &*self.page_maps().add(index)
    }

    /// Tracking-entry array of a large pool.
    ///
    /// # Safety
    /// The pool must be a live large pool.
    #[inline]
    pub unsafe fn allocations(&self) -> *mut AtomicUsize {
        self.tracking.load(Ordering::Relaxed) as *mut AtomicUsize
    }

    /// Tracking entry `index`, tags included.
    ///
    /// # Safety
    /// As `allocations`, with `index` below `track_capacity`.
    #[inline]
    pub unsafe fn track_load(&self, index: usize) -> usize {
        (*self.allocations().add(index)).load(Ordering::Acquire)
    }

    /// # Safety
    /// As `track_load`. Caller holds the pool lock for read-modify-write
    /// sequences.
    #[inline]
    pub unsafe fn track_store(&self, index: usize, value: usize) {
        (*self.allocations().add(index)).store(value, Ordering::Release);
    }

    /// # Safety
    /// As `track_load`.
    #[inline]
    pub unsafe fn track_or(&self, index: usize, bits: usize) {
        (*self.allocations().add(index)).fetch_or(bits, Ordering::AcqRel);
    }

    /// Number of tracking entries a large pool can hold.
    #[inline]
    pub fn track_capacity() -> usize {
        meta::pool_meta_size(false) / core::mem::size_of::<usize>()
    }

    /// Has every byte of this pool been freed and released?
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.start_in_use.load(Ordering::Acquire) >= self.end_in_use.load(Ordering::Acquire)
    }
}

/// Initialize `pool` as a small pool backed by a fresh reservation.
///
/// # Safety
/// `pool` must be zeroed metadata with `arena` already set.
pub unsafe fn create_small(pool: *mut PagePool) -> bool {
    let metadata = meta::pool_meta_alloc(true);

    let reserve = platform::alloc_highwater(POOL_SIZE);
    if reserve.is_null() {
        meta::pool_meta_free(metadata, true);
        return false;
    }

    let pool = &mut *pool;
    pool.tracking = AtomicUsize::new(metadata as usize);
    pool.start = reserve;
    pool.end = reserve.add(POOL_SIZE);
    pool.next_free = AtomicUsize::new(reserve as usize);
    pool.start_in_use = AtomicUsize::new(reserve as usize);
    pool.end_in_use = AtomicUsize::new(pool.end as usize);
    pool.next_free_index = AtomicUsize::new(SMALL_SENTINEL);
    pool.lock = RawMutex::new();
    true
}

/// Initialize `pool` as a large pool.
///
/// # Safety
/// As `create_small`.
pub unsafe fn create_large(pool: *mut PagePool) -> bool {
    // Tracking should max out around a page per MiB of data:
    // (1 MiB / 2048-byte minimum allocation) * 8 bytes per entry.
    let metadata = meta::pool_meta_alloc(false);

    let reserve = platform::alloc_highwater(POOL_SIZE);
    if reserve.is_null() {
        meta::pool_meta_free(metadata, false);
        return false;
    }

    let pool = &mut *pool;
    pool.tracking = AtomicUsize::new(metadata as usize);
    pool.start = reserve;
    pool.end = reserve.add(POOL_SIZE);
    pool.next_free = AtomicUsize::new(reserve as usize);
    pool.start_in_use = AtomicUsize::new(reserve as usize);
    pool.end_in_use = AtomicUsize::new(pool.end as usize);
    pool.next_free_index = AtomicUsize::new(0);
    pool.lock = RawMutex::new();

    // One more entry than allocations always exists so the last size can
    // be computed by subtraction; record the initial dummy entry now.
    pool.track_store(0, reserve as usize);
    true
}

/// Initialize `pool` as a jumbo pool holding exactly one allocation of
/// `size` bytes (rounded up to a page).
///
/// # Safety
/// As `create_small`.
pub unsafe fn create_jumbo(pool: *mut PagePool, size: usize) -> bool {
    let size = align_up(size, PAGE_SIZE);

    let reserve = platform::alloc_highwater(size);
    if reserve.is_null() {
        return false;
    }

    let pool = &mut *pool;
    pool.tracking = AtomicUsize::new(0);
    pool.start = reserve;
    pool.end = reserve.add(size);
    pool.next_free = AtomicUsize::new(pool.end as usize);
    pool.start_in_use = AtomicUsize::new(reserve as usize);
    pool.end_in_use = AtomicUsize::new(pool.end as usize);
    pool.next_free_index = AtomicUsize::new(JUMBO_SENTINEL);
    pool.lock = RawMutex::new();
    true
}

/// Tear down a fully freed pool: park or release its address range, give
/// its metadata back, and drop it from the radix tree. The pool
/// descriptor itself stays on its arena list (marked destroyed) so
/// in-flight list walks stay valid.
///
/// # Safety
/// Every allocation in the pool must already be freed.
pub unsafe fn destroy(pool: *mut PagePool) {
    let kind = (*pool).kind();
    let start = (*pool).start;
    let len = (*pool).end as usize - start as usize;

    // Park the range: physical pages go back now, the reservation stays
    // claimed (and faulting) until a sweep cycle proves nothing points
    // at it. Without a live sweeper there is nobody to certify, so the
    // range is released outright.
    #[cfg(feature = "sweeper")]
    let parked = crate::sweep::active();
    #[cfg(not(feature = "sweeper"))]
    let parked = false;

    if parked {
        if !platform::decommit(start, len) {
            crate::util::abort_with_message("fwdmalloc: pool decommit failed\n");
        }
    } else {
        platform::unmap(start, len);
    }

    // Close the in-use window and detach the metadata before freeing
    // it, so a scanner that raced past its destroyed-pool check reads
    // a null tracking pointer instead of a recycled block.
    (*pool).start_in_use.store((*pool).end as usize, Ordering::Release);
    let tracking = (*pool).tracking.swap(0, Ordering::AcqRel);

    match kind {
        PoolKind::Small => {
            // External bitmaps hang off every claimed page map; walk the
            // claimed prefix and give them back first.
            let maps = tracking as *mut PageMap;
            let next_free = (*pool).next_free.load(Ordering::Acquire);
            let last = next_free.min((*pool).end as usize);
            let claimed_pages = (last - start as usize) / PAGE_SIZE;
            for i in 0..claimed_pages {
                (*maps.add(i)).release_storage();
            }
            meta::pool_meta_free(maps as *mut u8, true);
        }
        PoolKind::Large => {
            meta::pool_meta_free(tracking as *mut u8, false);
        }
        PoolKind::Jumbo => {
            // No per-allocation metadata to clean up.
        }
    }

    radix::remove(pool);

    #[cfg(feature = "sweeper")]
    if parked {
        crate::sweep::reclaim::queue_destroyed(
            (*pool).arena,
            start as usize,
            start as usize + len,
            kind,
        );
    }
}
