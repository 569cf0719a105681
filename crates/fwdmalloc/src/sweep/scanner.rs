//! Parallel scan workers.
//!
//! MAX_SCANNER long-lived threads alternate between parked and working.
//! Each worker's park is a lock the coordinator holds except during a
//! scan phase; dispatch is "drop the locks", collection is "take them
//! back". Workers drain the range queue first, then the pool queue, and
//! raise their done flag when both are empty.

use crate::platform::pagemap::{self, PageStatus};
use crate::pool::page_map::{FLAG_READY, FLAG_RELEASED};
use crate::pool::{PagePool, PoolKind};
use crate::sweep::{markmap, roots};
use crate::platform;
use crate::sync::RawMutex;
use crate::util::{align_down, PAGE_SIZE};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Scan worker count.
pub const MAX_SCANNER: usize = 10;

static OPER_LOCKS: [RawMutex; MAX_SCANNER] = [const { RawMutex::new() }; MAX_SCANNER];
static DONE: [AtomicBool; MAX_SCANNER] = [const { AtomicBool::new(false) }; MAX_SCANNER];
static READY: [AtomicBool; MAX_SCANNER] = [const { AtomicBool::new(true) }; MAX_SCANNER];

/// True while a scan phase is dispatched.
static OPER: AtomicBool = AtomicBool::new(false);

/// True during the concurrent phase (scan soft-dirty pages only); the
/// stop-the-world phase reads every present page.
static CONCURRENT: AtomicBool = AtomicBool::new(false);

/// The open /proc/self/pagemap descriptor for the current phase.
static PAGEMAP_FD: AtomicI32 = AtomicI32::new(-1);

pub fn set_pagemap_fd(fd: libc::c_int) {
    PAGEMAP_FD.store(fd, Ordering::Release);
}

/// Page eligibility under the two-phase rule.
#[inline]
fn should_scan(status: PageStatus, concurrent: bool) -> bool {
    status.present && (!concurrent || status.soft_dirty)
}

fn scanner_main(id: usize) {
    loop {
        // Parked until the coordinator drops our lock.
        OPER_LOCKS[id].lock();
        READY[id].store(false, Ordering::Release);
        let concurrent = CONCURRENT.load(Ordering::Acquire);

        while !DONE[id].load(Ordering::Acquire) {
            if let Some((start, end)) = roots::pop_range() {
                unsafe {
                    scan_range(start, end, concurrent);
                }
                continue;
            }
            match roots::pop_pool() {
                Some((pool, kind)) => unsafe {
                    scan_pool(pool, kind, concurrent);
                },
                None => break,
            }
        }

        DONE[id].store(true, Ordering::Release);
        OPER_LOCKS[id].unlock();

        // Wait for the coordinator to reclaim our park lock.
        while OPER.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        READY[id].store(true, Ordering::Release);
    }
}

/// Spawn the workers, parked.
///
/// # Safety
/// Must be called once from sweeper init.
pub unsafe fn spawn() {
    for lock in OPER_LOCKS.iter() {
        lock.lock();
    }
    for id in 0..MAX_SCANNER {
        std::thread::Builder::new()
            .name(format!("fwdmalloc-scan{}", id))
            .spawn(move || scanner_main(id))
            .expect("scanner spawn");
    }
}

/// Dispatch a scan phase and wait for every worker to pick it up.
pub fn start(concurrent: bool) {
    CONCURRENT.store(concurrent, Ordering::Release);
    OPER.store(true, Ordering::Release);

    // Workers must all have finished parking from the previous phase.
    loop {
        let parked = READY.iter().filter(|r| r.load(Ordering::Acquire)).count();
        if parked == MAX_SCANNER {
            break;
        }
        core::hint::spin_loop();
    }

    for done in DONE.iter() {
        done.store(false, Ordering::Release);
    }
    for lock in OPER_LOCKS.iter() {
        lock.unlock();
    }
}

/// Wait for the phase to finish and park the workers again.
pub fn stop() {
    loop {
        let finished = DONE.iter().filter(|d| d.load(Ordering::Acquire)).count();
        if finished == MAX_SCANNER {
            break;
        }
        core::hint::spin_loop();
    }

    let mut reclaimed = 0;
    while reclaimed < MAX_SCANNER {
        if OPER_LOCKS[reclaimed].try_lock() {
            reclaimed += 1;
        } else {
            core::hint::spin_loop();
        }
    }

    OPER.store(false, Ordering::Release);
}

/// Scan every eligible page of [start, end), marking any word that
/// lands inside the pool address range.
unsafe fn scan_range(start: usize, end: usize, concurrent: bool) {
    let fd = PAGEMAP_FD.load(Ordering::Acquire);
    let low = platform::pool_low_addr();
    let high = platform::pool_high_water();

    let mut page = align_down(start, PAGE_SIZE);
    while page < end {
        let status = pagemap::page_status(fd, page);
        if should_scan(status, concurrent) {
            let word_start = page.max(start);
            let word_end = (page + PAGE_SIZE).min(end);
            scan_words(word_start, word_end, low, high);
        }
        page += PAGE_SIZE;
    }
}

/// Read a span through process_vm_readv and mark its pool-range words.
/// Copying through the kernel instead of dereferencing means a page
/// decommitted between the status check and the read costs us the copy
/// (EFAULT, skip), not a fault in the scanner.
unsafe fn scan_words(start: usize, end: usize, low: usize, high: usize) {
    let mut buf = [0usize; PAGE_SIZE / 8];
    let aligned_start = (start + 7) & !7;
    if aligned_start + 8 > end {
        return;
    }
    let bytes = (end - aligned_start) & !7;

    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: bytes,
    };
    let remote = libc::iovec {
        iov_base: aligned_start as *mut libc::c_void,
        iov_len: bytes,
    };
    let copied = libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0);
    if copied <= 0 {
        return;
    }

    let words = copied as usize / 8;
    for &value in &buf[..words] {
        if value >= low && value < high {
            markmap::mark(value);
        }
    }
}

/// Kind-directed pool scan: only pages that can still hold live
/// allocations are read.
unsafe fn scan_pool(pool: *mut PagePool, kind: PoolKind, concurrent: bool) {
    let pool = &*pool;
    if pool.is_destroyed() {
        return;
    }

    match kind {
        PoolKind::Small => scan_small_pool(pool, concurrent),
        PoolKind::Large => scan_large_pool(pool, concurrent),
        PoolKind::Jumbo => {
            scan_range(pool.start as usize, pool.end as usize, concurrent);
        }
    }
}

/// Small pools: page-map-guided. Unclaimed, freed, and released pages
/// are skipped. Live slots hold the only data; freed slots were zeroed
/// on free, so the page scan cannot resurrect stale pointers.
unsafe fn scan_small_pool(pool: &PagePool, concurrent: bool) {
    let fd = PAGEMAP_FD.load(Ordering::Acquire);
    let low = platform::pool_low_addr();
    let high = platform::pool_high_water();
    let pool_start = pool.start as usize;

    // Snapshot the map array; destruction nulls the pool's pointer but
    // the array itself stays mapped, so a racing destroy costs at most
    // a scan of stale metadata.
    let maps = pool.page_maps();
    if maps.is_null() {
        return;
    }

    let mut page = pool.start_in_use.load(Ordering::Acquire);
    let end = pool.end_in_use.load(Ordering::Acquire);
    while page < end {
        let map = &*maps.add((page - pool_start) / PAGE_SIZE);

        if map.alloc_size() == 0 || map.flags() & (FLAG_READY | FLAG_RELEASED) != 0 {
            page += PAGE_SIZE;
            continue;
        }

        let status = pagemap::page_status(fd, page);
        if should_scan(status, concurrent) {
            scan_words(page, page + PAGE_SIZE, low, high);
        }
        page += PAGE_SIZE;
    }
}

/// Large pools: tracking-array-guided, reading only the page spans of
/// still-live allocations.
unsafe fn scan_large_pool(pool: &PagePool, concurrent: bool) {
    use crate::pool::pool::{TRACK_FREE, TRACK_MASK, TRACK_UNMAPPED};
    use core::sync::atomic::AtomicUsize;

    // Snapshot for the same reason as the small-pool scan.
    let allocations = pool.allocations() as *const AtomicUsize;
    if allocations.is_null() {
        return;
    }

    let capacity = PagePool::track_capacity();
    let mut index = 0;
    while index < capacity {
        let entry = (*allocations.add(index)).load(Ordering::Acquire);
        if entry == 0 {
            // Past the recorded entries.
            return;
        }
        if entry & (TRACK_FREE | TRACK_UNMAPPED) == 0 {
            let start = entry & !TRACK_MASK;
            let end = if index + 1 < capacity {
                (*allocations.add(index + 1)).load(Ordering::Acquire) & !TRACK_MASK
            } else {
                pool.end as usize
            };
            if end > start {
                scan_range(start, end, concurrent);
            }
        }
        index += 1;
    }
}
