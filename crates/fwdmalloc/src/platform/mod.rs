pub mod linux;
pub mod pagemap;
pub mod procmaps;

use crate::util::{GUARD_GAP, POOL_SIZE};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// The next address a pool reservation will be attempted at. Only ever
/// moves up; the gap behind it is what makes freed addresses unreachable.
static POOL_HIGH_WATER: AtomicUsize = AtomicUsize::new(0);

/// The lowest address any pool has ever occupied.
static POOL_LOW_ADDR: AtomicUsize = AtomicUsize::new(0);

/// Seed the high-water mark above the program break so the pools never
/// contend with brk-based allocations from a foreign libc heap.
///
/// # Safety
/// Must be called exactly once during allocator init.
pub unsafe fn init_highwater() {
    let base = libc::sbrk(0) as usize + 0x4000_0000;
    POOL_HIGH_WATER.store(base, Ordering::Release);
    POOL_LOW_ADDR.store(base, Ordering::Release);
}

#[inline]
pub fn pool_high_water() -> usize {
    POOL_HIGH_WATER.load(Ordering::Relaxed)
}

#[inline]
pub fn pool_low_addr() -> usize {
    POOL_LOW_ADDR.load(Ordering::Relaxed)
}

/// Does `addr` fall inside the range ever used for pools?
#[inline]
pub fn in_pool_range(addr: usize) -> bool {
    addr >= pool_low_addr() && addr < pool_high_water()
}

/// Reserve `size` bytes of read/write anonymous memory at an address no
/// lower than any previous reservation, and bump the high-water mark past
/// it plus a guard gap. Returns null when the OS is out of address space.
///
/// POOL_SIZE-sized requests first consult the sweeper's free-address
/// store: that is the only path by which an address can come back.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn alloc_highwater(size: usize) -> *mut u8 {
    #[cfg(feature = "sweeper")]
    if size == POOL_SIZE {
        let base = crate::sweep::reclaim::pop_addr_store();
        if base != 0 {
            return base as *mut u8;
        }
    }

    // New address space is likely to be touched immediately, so pre-fault
    // pool-sized requests. Jumbo reservations skip this: faulting a very
    // large allocation up front could force swapping under pressure.
    let populate = size == POOL_SIZE;

    let mut local_high = POOL_HIGH_WATER.fetch_add(size + GUARD_GAP, Ordering::AcqRel);
    loop {
        let result = linux::map_at_noreplace(local_high as *mut u8, size, populate);
        if !result.is_null() {
            return result;
        }
        if linux::errno() == libc::EEXIST {
            // Someone else owns that range (most likely a racing pool
            // creation). Jump up and try again.
            local_high = POOL_HIGH_WATER.fetch_add(size + GUARD_GAP, Ordering::AcqRel);
        } else {
            return ptr::null_mut();
        }
    }
}

/// Return physical pages to the OS while keeping the address range
/// reserved and inaccessible. Any later touch of the range faults.
///
/// # Safety
/// The range must be a page-aligned span of a previous reservation.
pub unsafe fn decommit(addr: *mut u8, size: usize) -> bool {
    linux::remap_none(addr, size)
}

/// Make a decommitted range accessible again. Only the sweeper's reuse
/// path may call this, and only for ranges it has certified unreferenced.
///
/// # Safety
/// The range must be a page-aligned decommitted span.
pub unsafe fn commit(addr: *mut u8, size: usize) -> bool {
    linux::protect_read_write(addr, size)
}

/// Fully release a reservation back to the OS.
///
/// # Safety
/// `addr`/`size` must describe an entire previous reservation.
pub unsafe fn unmap(addr: *mut u8, size: usize) {
    linux::unmap(addr, size);
}

/// Get the number of online CPUs.
pub fn num_cpus() -> usize {
    linux::num_cpus()
}
