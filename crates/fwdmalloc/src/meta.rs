//! Internal metadata allocator.
//!
//! Pool descriptors, page maps, tracking arrays, radix nodes, and sweeper
//! bookkeeping all need dynamic storage, and none of it may come from the
//! allocator being built here (or from a foreign malloc, since the library
//! must work interposed). A single contiguous address range is reserved up
//! front and committed POOL_SIZE at a time; freed blocks are recycled
//! through bin-per-size freelists. This allocator does *not* follow the
//! forward-only rule -- it is internal and its blocks never escape.
//!
//! Blocks are 16-byte granular. A freed block's first word is reused as
//! the freelist link.

use crate::platform::linux;
use crate::sync::RawMutex;
use crate::util::{abort_with_message, align_up, METADATA_RESERVE, PAGE_SIZE, POOL_SIZE};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// General bins: 16-byte steps up to 4 KiB, everything larger shares the
/// last bin. The radix leaf is the only structure above a page in size,
/// and it is freed back with its exact size, so the shared bin is safe.
const NUM_BINS: usize = 256;

/// Bin index for a 16-byte-aligned size.
#[inline]
fn bin_id(size: usize) -> usize {
    if size >= 4096 {
        NUM_BINS - 1
    } else {
        (size >> 4) - 1
    }
}

/// Byte size of the two pool-metadata classes.
#[inline]
pub fn pool_meta_size(small: bool) -> usize {
    let size = if small {
        (POOL_SIZE / PAGE_SIZE) * core::mem::size_of::<crate::pool::page_map::PageMap>()
    } else {
        (POOL_SIZE >> 20) * PAGE_SIZE
    };
    align_up(size, 16)
}

struct MetaInner {
    /// Start of the reservation.
    base: *mut u8,
    /// Next unallocated byte.
    free: *mut u8,
    /// End of the committed prefix.
    committed: *mut u8,
    /// Freelist heads for the general bins.
    bins: [*mut u8; NUM_BINS],
    /// Freelist heads for the two pool-metadata classes.
    pool_bins: [*mut u8; 2],
}

struct MetaHolder(UnsafeCell<MetaInner>);
unsafe impl Sync for MetaHolder {}

static META: MetaHolder = MetaHolder(UnsafeCell::new(MetaInner {
    base: ptr::null_mut(),
    free: ptr::null_mut(),
    committed: ptr::null_mut(),
    bins: [ptr::null_mut(); NUM_BINS],
    pool_bins: [ptr::null_mut(); 2],
}));

static POOL_LOCK: RawMutex = RawMutex::new();
static BIN_LOCKS: [RawMutex; NUM_BINS] = [const { RawMutex::new() }; NUM_BINS];
static POOL_BIN_LOCKS: [RawMutex; 2] = [const { RawMutex::new() }; 2];

/// Published copy of the reservation bounds for lock-free range checks
/// (the sweeper excludes this region from its roots).
static META_START: AtomicUsize = AtomicUsize::new(0);
static META_END: AtomicUsize = AtomicUsize::new(0);

/// Reserve the metadata address range and commit its first slice.
///
/// # Safety
/// Must be called exactly once during allocator init.
pub unsafe fn init() -> bool {
    let base = linux::reserve_noaccess(METADATA_RESERVE);
    if base.is_null() {
        return false;
    }
    if !linux::protect_read_write(base, POOL_SIZE) {
        linux::unmap(base, METADATA_RESERVE);
        return false;
    }

    let inner = &mut *META.0.get();
    inner.base = base;
    inner.free = base;
    inner.committed = base.add(POOL_SIZE);

    META_START.store(base as usize, Ordering::Release);
    META_END.store(base as usize + METADATA_RESERVE, Ordering::Release);
    true
}

/// Is `addr` inside the metadata reservation?
#[inline]
pub fn contains(addr: usize) -> bool {
    addr >= META_START.load(Ordering::Relaxed) && addr < META_END.load(Ordering::Relaxed)
}

/// Reservation bounds, for the sweeper's root filter.
#[inline]
pub fn region() -> (usize, usize) {
    (META_START.load(Ordering::Relaxed), META_END.load(Ordering::Relaxed))
}

/// Carve `size` bytes off the top of the committed region.
/// Caller must hold POOL_LOCK.
unsafe fn bump(inner: &mut MetaInner, size: usize) -> *mut u8 {
    let allocation = inner.free;
    if allocation.add(size) > inner.committed {
        let reserve_end = inner.base.add(METADATA_RESERVE);
        if inner.committed.add(POOL_SIZE) > reserve_end {
            abort_with_message("fwdmalloc: metadata address space exhausted\n");
        }
        if !linux::protect_read_write(inner.committed, POOL_SIZE) {
            abort_with_message("fwdmalloc: metadata commit failed\n");
        }
        linux::advise_willneed(inner.committed, PAGE_SIZE * 16);
        inner.committed = inner.committed.add(POOL_SIZE);
    }
    inner.free = inner.free.add(size);
    allocation
}

/// Allocate a general metadata block. Contents are *not* zeroed when the
/// block is recycled from a bin.
pub unsafe fn alloc(size: usize) -> *mut u8 {
    let size = align_up(size, 16);
    let bin = bin_id(size);

    BIN_LOCKS[bin].lock();
    let inner = &mut *META.0.get();
    let allocation = if inner.bins[bin].is_null() {
        // No freed chunk of this size. Take fresh space off the top; no
        // attempt is made to split larger freed chunks.
        POOL_LOCK.lock();
        let allocation = bump(inner, size);
        POOL_LOCK.unlock();
        allocation
    } else {
        let allocation = inner.bins[bin];
        inner.bins[bin] = *(allocation as *mut *mut u8);
        allocation
    };
    BIN_LOCKS[bin].unlock();

    allocation
}

/// Allocate and zero a general metadata block.
pub unsafe fn alloc_zeroed(size: usize) -> *mut u8 {
    let allocation = alloc(size);
    ptr::write_bytes(allocation, 0, align_up(size, 16));
    allocation
}

/// Return a general metadata block. The size must match the allocation.
pub unsafe fn free(block: *mut u8, size: usize) {
    let size = align_up(size, 16);
    let bin = bin_id(size);

    let inner = &mut *META.0.get();
    if (block as usize) < inner.base as usize || block > inner.free {
        abort_with_message("fwdmalloc: metadata free outside the arena\n");
    }

    BIN_LOCKS[bin].lock();
    *(block as *mut *mut u8) = inner.bins[bin];
    inner.bins[bin] = block;
    BIN_LOCKS[bin].unlock();
}

/// Allocate a pool-metadata array (page maps for a small pool, tracking
/// entries for a large pool). Always zeroed: pool code relies on fresh
/// page maps and tracking slots reading as empty.
pub unsafe fn pool_meta_alloc(small: bool) -> *mut u8 {
    let class = small as usize;
    let size = pool_meta_size(small);

    POOL_BIN_LOCKS[class].lock();
    let inner = &mut *META.0.get();
    let allocation = if inner.pool_bins[class].is_null() {
        POOL_LOCK.lock();
        let allocation = bump(inner, size);
        POOL_LOCK.unlock();
        allocation
    } else {
        let allocation = inner.pool_bins[class];
        inner.pool_bins[class] = *(allocation as *mut *mut u8);
        allocation
    };
    POOL_BIN_LOCKS[class].unlock();

    ptr::write_bytes(allocation, 0, size);
    allocation
}

/// Return a pool-metadata array.
pub unsafe fn pool_meta_free(block: *mut u8, small: bool) {
    let class = small as usize;

    let inner = &mut *META.0.get();
    if (block as usize) < inner.base as usize || block > inner.free {
        abort_with_message("fwdmalloc: pool metadata free outside the arena\n");
    }

    POOL_BIN_LOCKS[class].lock();
    *(block as *mut *mut u8) = inner.pool_bins[class];
    inner.pool_bins[class] = block;
    POOL_BIN_LOCKS[class].unlock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init;

    #[test]
    fn blocks_recycle_within_a_bin() {
        unsafe {
            init::ensure_initialized();
            let a = alloc(48);
            assert!(!a.is_null());
            assert!(contains(a as usize));
            free(a, 48);
            let b = alloc(48);
            // Same-size free then alloc must pop the recycled block.
            assert_eq!(a, b);
            free(b, 48);
        }
    }

    #[test]
    fn distinct_bins_do_not_share_blocks() {
        unsafe {
            init::ensure_initialized();
            let a = alloc(32);
            free(a, 32);
            let b = alloc(64);
            assert_ne!(a, b);
            free(b, 64);
        }
    }

    #[test]
    fn pool_meta_classes_recycle() {
        unsafe {
            init::ensure_initialized();
            let a = pool_meta_alloc(true);
            pool_meta_free(a, true);
            let b = pool_meta_alloc(true);
            assert_eq!(a, b);
            // And the block comes back zeroed.
            assert_eq!(*(b as *mut u64), 0);
            pool_meta_free(b, true);
        }
    }
}
