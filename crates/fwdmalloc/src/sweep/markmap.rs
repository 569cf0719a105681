//! The address-mark bitmap.
//!
//! One bit per 8-byte word of virtual address space, recording "a word
//! with this value was seen in scanned memory". Two levels: a 16 MiB
//! top table indexed by address bits [47..27], pointing at lazily
//! mapped 2 MiB leaves indexed by bits [26..6], with bits [5..3]
//! selecting the bit within the leaf byte.
//!
//! Reclamation reads the map with a byte-granular OR fold: one leaf byte
//! covers 64 bytes of address space, so a zero fold over a pool's range
//! proves no scanned word pointed anywhere inside it.

use crate::platform::linux;
use crate::sync::RawMutex;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const BIT_SHIFT: usize = 3; // 8-byte granularity
const BYTE_BITS: usize = 21; // bytes per leaf
const MAP_BITS: usize = 21; // leaves

const LEAF_SIZE: usize = 1 << BYTE_BITS;
const NUM_LEAVES: usize = 1 << MAP_BITS;

#[inline]
fn bit_of(addr: usize) -> u8 {
    1u8 << ((addr >> BIT_SHIFT) & 7)
}

#[inline]
fn byte_of(addr: usize) -> usize {
    (addr >> (BIT_SHIFT + 3)) & (LEAF_SIZE - 1)
}

#[inline]
fn leaf_of(addr: usize) -> usize {
    (addr >> (BIT_SHIFT + 3 + BYTE_BITS)) & (NUM_LEAVES - 1)
}

/// Top table: NUM_LEAVES pointers, mmap'd at init (zero = absent leaf).
static TOP: AtomicUsize = AtomicUsize::new(0);

static GROW_LOCK: RawMutex = RawMutex::new();

/// Bases of materialized leaves, for the root filter (leaves are
/// ordinary writable anonymous mappings and must not be scanned).
/// Open-addressed, sized far beyond any realistic leaf count; when it
/// overflows we stop recording, which only costs extra retention.
const LEAF_SET_SIZE: usize = 4096;
static LEAF_SET: [AtomicUsize; LEAF_SET_SIZE] =
    [const { AtomicUsize::new(0) }; LEAF_SET_SIZE];

fn leaf_set_insert(base: usize) {
    let mut idx = (base >> BYTE_BITS) & (LEAF_SET_SIZE - 1);
    for _ in 0..LEAF_SET_SIZE {
        match LEAF_SET[idx].compare_exchange(0, base, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(existing) if existing == base => return,
            Err(_) => idx = (idx + 1) & (LEAF_SET_SIZE - 1),
        }
    }
}

/// Is `addr` the base of a markmap leaf mapping?
pub fn is_leaf_base(addr: usize) -> bool {
    let mut idx = (addr >> BYTE_BITS) & (LEAF_SET_SIZE - 1);
    for _ in 0..LEAF_SET_SIZE {
        let entry = LEAF_SET[idx].load(Ordering::Acquire);
        if entry == addr {
            return true;
        }
        if entry == 0 {
            return false;
        }
        idx = (idx + 1) & (LEAF_SET_SIZE - 1);
    }
    false
}

/// Is `addr` inside the top table mapping?
pub fn is_top_table(addr: usize) -> bool {
    let top = TOP.load(Ordering::Acquire);
    top != 0 && addr >= top && addr < top + NUM_LEAVES * 8
}

/// Map the top table.
///
/// # Safety
/// Must be called once from sweeper init.
pub unsafe fn init() -> bool {
    let top = linux::map_anonymous(NUM_LEAVES * 8);
    if top.is_null() {
        return false;
    }
    TOP.store(top as usize, Ordering::Release);
    true
}

#[inline]
unsafe fn top_slot(index: usize) -> &'static AtomicUsize {
    let top = TOP.load(Ordering::Acquire) as *mut AtomicUsize;
    &*top.add(index)
}

#[cold]
unsafe fn grow_leaf(slot: &AtomicUsize) -> *mut u8 {
    GROW_LOCK.lock();
    let mut leaf = slot.load(Ordering::Acquire);
    if leaf == 0 {
        let mapped = linux::map_anonymous(LEAF_SIZE);
        if mapped.is_null() {
            GROW_LOCK.unlock();
            // Failing to mark is not an option: an unmarked live pointer
            // could get its object reclaimed.
            crate::util::abort_with_message("fwdmalloc: mark bitmap leaf allocation failed\n");
        }
        leaf_set_insert(mapped as usize);
        slot.store(mapped as usize, Ordering::Release);
        leaf = mapped as usize;
    }
    GROW_LOCK.unlock();
    leaf as *mut u8
}

/// Record that a scanned word held `addr`.
///
/// # Safety
/// The markmap must be initialized.
pub unsafe fn mark(addr: usize) {
    let slot = top_slot(leaf_of(addr));
    let mut leaf = slot.load(Ordering::Acquire) as *mut u8;
    if leaf.is_null() {
        leaf = grow_leaf(slot);
    }
    let byte = &*(leaf.add(byte_of(addr)) as *const AtomicU8);
    byte.fetch_or(bit_of(addr), Ordering::AcqRel);
}

/// Was `addr`'s exact word marked?
///
/// # Safety
/// The markmap must be initialized.
pub unsafe fn check(addr: usize) -> bool {
    let slot = top_slot(leaf_of(addr));
    let leaf = slot.load(Ordering::Acquire) as *mut u8;
    if leaf.is_null() {
        return false;
    }
    let byte = &*(leaf.add(byte_of(addr)) as *const AtomicU8);
    byte.load(Ordering::Acquire) & bit_of(addr) != 0
}

/// OR-fold of every mark byte covering [start, end). Zero proves the
/// range unreferenced at the time the bitmap was frozen.
///
/// # Safety
/// The markmap must be initialized.
pub unsafe fn read_range(start: usize, end: usize) -> u64 {
    let mut fold = 0u64;
    let mut addr = start;
    while addr < end {
        let slot = top_slot(leaf_of(addr));
        let leaf = slot.load(Ordering::Acquire) as *mut u8;
        if leaf.is_null() {
            // Whole leaf absent: skip the rest of its coverage.
            let covered = 1 << (BIT_SHIFT + 3 + BYTE_BITS);
            addr = (addr & !(covered - 1)) + covered;
            continue;
        }
        let byte = &*(leaf.add(byte_of(addr)) as *const AtomicU8);
        fold |= byte.load(Ordering::Acquire) as u64;
        addr += 1 << (BIT_SHIFT + 3);
    }
    fold
}

/// Does any mark fall within a slot-sized range? Byte folds are too
/// coarse for sub-page slots, so this walks word granularity.
///
/// # Safety
/// The markmap must be initialized.
#[cfg(feature = "sub-page-reuse")]
pub unsafe fn range_marked(start: usize, end: usize) -> bool {
    let mut addr = start;
    while addr < end {
        if check(addr) {
            return true;
        }
        addr += 1 << BIT_SHIFT;
    }
    false
}

/// Drop every mark by replacing materialized leaves with fresh zero
/// pages. The leaves stay mapped for the next cycle.
///
/// # Safety
/// No scanner may be running.
pub unsafe fn clear() {
    let top = TOP.load(Ordering::Acquire);
    if top == 0 {
        return;
    }
    for entry in LEAF_SET.iter() {
        let leaf = entry.load(Ordering::Acquire);
        if leaf != 0 {
            linux::remap_zero(leaf as *mut u8, LEAF_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: mark, fold, and clear all act on the same global
    // bitmap, so the assertions must not interleave.
    #[test]
    fn mark_fold_clear_lifecycle() {
        unsafe {
            if TOP.load(Ordering::Acquire) == 0 {
                assert!(init());
            }

            let addr = 0x7000_1234_5678usize & !7;
            assert!(!check(addr));
            mark(addr);
            assert!(check(addr));
            // Neighbouring words unaffected.
            assert!(!check(addr + 8));
            assert!(!check(addr - 8));

            let base = 0x7100_0000_0000usize;
            assert_eq!(read_range(base, base + 4096), 0);
            mark(base + 1024);
            assert_ne!(read_range(base, base + 4096), 0);
            // A fold over a disjoint range stays clean.
            assert_eq!(read_range(base + 8192, base + 12288), 0);

            // Marks in separate leaves all vanish on clear.
            mark(base + (1 << 28));
            clear();
            assert_eq!(read_range(base, base + 4096), 0);
            assert!(!check(addr));
            assert!(!check(base + (1 << 28)));
        }
    }
}
