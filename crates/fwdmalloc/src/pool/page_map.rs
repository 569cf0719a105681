//! Per-page metadata for small pools.
//!
//! Every 4 KiB page handed to a small bin gets one `PageMap` entry in its
//! pool's metadata array. The entry records the page base, the slot size
//! (with three status flags packed into the low bits), and a liveness
//! bitmap. Pages holding more than 64 slots (slot size below 64 bytes)
//! store a pointer to an external word array in the bitmap field instead
//! of the bitmap itself, exactly one bit per slot either way.

use crate::meta;
use crate::util::PAGE_SIZE;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "sub-page-reuse")]
use core::sync::atomic::{AtomicI32, AtomicPtr};

/// Status flags in the low three bits of `alloc_size`.
pub const FLAG_READY: usize = 1; // every allocation freed, release scheduled
pub const FLAG_RELEASED: usize = 2; // page returned to the OS
pub const FLAG_FULL: usize = 4; // page fully allocated, no longer in a bin
pub const FLAG_MASK: usize = 7;

#[repr(C)]
pub struct PageMap {
    /// Page base address. Zero until the page is assigned to a cache.
    pub start: AtomicUsize,
    /// Slot size in bytes, multiple of 8, with status flags in bits 0-2.
    alloc_size: AtomicUsize,
    /// Slot-liveness bits: the bitmap word itself when the page holds at
    /// most 64 slots, otherwise a pointer to an external word array.
    bitmap: AtomicUsize,
    /// Same shape as `bitmap`; bits the sweeper proved recyclable.
    #[cfg(feature = "sub-page-reuse")]
    safemap: AtomicUsize,
    /// Link in the arena's reuse list.
    #[cfg(feature = "sub-page-reuse")]
    pub next: AtomicPtr<PageMap>,
    /// Sweep epoch this page was last examined in.
    #[cfg(feature = "sub-page-reuse")]
    pub epoch: AtomicI32,
    /// Sweep epochs since the last free on this page.
    #[cfg(feature = "sub-page-reuse")]
    pub epochs_since_free: AtomicI32,
}

/// Bitmap words needed for `max_alloc` slots.
#[inline]
pub const fn bitmap_words(max_alloc: usize) -> usize {
    max_alloc.div_ceil(64)
}

impl PageMap {
    /// Slot size with the status flags masked off.
    #[inline]
    pub fn alloc_size(&self) -> usize {
        self.alloc_size.load(Ordering::Relaxed) & !FLAG_MASK
    }

    #[inline]
    pub fn flags(&self) -> usize {
        self.alloc_size.load(Ordering::Relaxed) & FLAG_MASK
    }

    #[inline]
    pub fn or_flags(&self, flags: usize) {
        self.alloc_size.fetch_or(flags, Ordering::AcqRel);
    }

    /// Slots on this page.
    #[inline]
    pub fn max_alloc(&self) -> usize {
        let size = self.alloc_size();
        if size == 0 {
            0
        } else {
            PAGE_SIZE / size
        }
    }

    /// Does the bitmap live in an external word array?
    #[inline]
    fn external(&self) -> bool {
        let size = self.alloc_size();
        size != 0 && size < 64
    }

    #[inline]
    fn words(&self) -> *mut AtomicU64 {
        self.bitmap.load(Ordering::Relaxed) as *mut AtomicU64
    }

    /// Claim this page for a bin: record the slot size and set up the
    /// bitmap. Runs on the owning thread before the page is exposed to
    /// any free, so the pointer stores need no ordering stronger than
    /// the bin's publication.
    ///
    /// # Safety
    /// The page must be unclaimed (alloc_size still zero).
    pub unsafe fn claim(&self, alloc_size: usize) {
        debug_assert!(self.alloc_size.load(Ordering::Relaxed) == 0);
        let max_alloc = PAGE_SIZE / alloc_size;
        if max_alloc > 64 {
            let words = bitmap_words(max_alloc);
            self.bitmap
                .store(meta::alloc_zeroed(words * 8) as usize, Ordering::Relaxed);
            #[cfg(feature = "sub-page-reuse")]
            self.safemap
                .store(meta::alloc_zeroed(words * 8) as usize, Ordering::Relaxed);
        } else {
            self.bitmap.store(0, Ordering::Relaxed);
            #[cfg(feature = "sub-page-reuse")]
            self.safemap.store(0, Ordering::Relaxed);
        }
        self.alloc_size.store(alloc_size, Ordering::Release);
    }

    /// Free any external bitmap storage. Called from pool destruction.
    ///
    /// # Safety
    /// No other thread may touch this page map afterwards.
    pub unsafe fn release_storage(&self) {
        if self.external() {
            let words = bitmap_words(self.max_alloc());
            let array = self.words();
            if !array.is_null() {
                meta::free(array as *mut u8, words * 8);
                self.bitmap.store(0, Ordering::Relaxed);
            }
            #[cfg(feature = "sub-page-reuse")]
            {
                let safe = self.safemap.load(Ordering::Relaxed) as *mut u8;
                if !safe.is_null() {
                    meta::free(safe, words * 8);
                    self.safemap.store(0, Ordering::Relaxed);
                }
            }
        }
    }

    /// Atomically set the liveness bit for `slot`.
    ///
    /// # Safety
    /// `slot` must be below `max_alloc` on a claimed page.
    #[inline]
    pub unsafe fn set_live(&self, slot: usize) {
        if self.external() {
            let word = &*self.words().add(slot >> 6);
            word.fetch_or(1u64 << (slot & 63), Ordering::AcqRel);
        } else {
            self.bitmap.fetch_or(1usize << slot, Ordering::AcqRel);
        }
    }

    /// Atomically clear the liveness bit for `slot`.
    ///
    /// # Safety
    /// As `set_live`.
    #[inline]
    pub unsafe fn clear_live(&self, slot: usize) {
        if self.external() {
            let word = &*self.words().add(slot >> 6);
            word.fetch_and(!(1u64 << (slot & 63)), Ordering::AcqRel);
        } else {
            self.bitmap.fetch_and(!(1usize << slot), Ordering::AcqRel);
        }
    }

    /// Is `slot` currently live?
    ///
    /// # Safety
    /// As `set_live`.
    #[inline]
    pub unsafe fn is_live(&self, slot: usize) -> bool {
        if self.external() {
            let word = &*self.words().add(slot >> 6);
            word.load(Ordering::Acquire) & (1u64 << (slot & 63)) != 0
        } else {
            self.bitmap.load(Ordering::Acquire) & (1usize << slot) != 0
        }
    }

    /// OR of every bitmap word; zero means no live slot remains.
    ///
    /// # Safety
    /// The page must be claimed.
    pub unsafe fn live_fold(&self) -> u64 {
        if self.external() {
            let words = bitmap_words(self.max_alloc());
            let array = self.words();
            let mut fold = 0u64;
            for i in 0..words {
                fold |= (*array.add(i)).load(Ordering::Acquire);
            }
            fold
        } else {
            self.bitmap.load(Ordering::Acquire) as u64
        }
    }

    /// Number of live slots.
    ///
    /// # Safety
    /// The page must be claimed.
    #[cfg(feature = "sub-page-reuse")]
    pub unsafe fn live_count(&self) -> usize {
        if self.external() {
            let words = bitmap_words(self.max_alloc());
            let array = self.words();
            let mut count = 0;
            for i in 0..words {
                count += (*array.add(i)).load(Ordering::Acquire).count_ones() as usize;
            }
            count
        } else {
            (self.bitmap.load(Ordering::Acquire) as u64).count_ones() as usize
        }
    }
}

#[cfg(feature = "sub-page-reuse")]
impl PageMap {
    #[inline]
    fn safe_words(&self) -> *mut AtomicU64 {
        self.safemap.load(Ordering::Relaxed) as *mut AtomicU64
    }

    /// Atomically set the safemap bit for `slot`.
    ///
    /// # Safety
    /// `slot` must be below `max_alloc` on a claimed page.
    #[inline]
    pub unsafe fn set_safe(&self, slot: usize) {
        if self.external() {
            let word = &*self.safe_words().add(slot >> 6);
            word.fetch_or(1u64 << (slot & 63), Ordering::AcqRel);
        } else {
            self.safemap.fetch_or(1usize << slot, Ordering::AcqRel);
        }
    }

    /// Atomically clear the safemap bit for `slot`.
    ///
    /// # Safety
    /// As `set_safe`.
    #[inline]
    pub unsafe fn clear_safe(&self, slot: usize) {
        if self.external() {
            let word = &*self.safe_words().add(slot >> 6);
            word.fetch_and(!(1u64 << (slot & 63)), Ordering::AcqRel);
        } else {
            self.safemap.fetch_and(!(1usize << slot), Ordering::AcqRel);
        }
    }

    /// Is `slot` marked recyclable?
    ///
    /// # Safety
    /// As `set_safe`.
    #[inline]
    pub unsafe fn is_safe(&self, slot: usize) -> bool {
        if self.external() {
            let word = &*self.safe_words().add(slot >> 6);
            word.load(Ordering::Acquire) & (1u64 << (slot & 63)) != 0
        } else {
            self.safemap.load(Ordering::Acquire) & (1usize << slot) != 0
        }
    }

    /// Clear the entire safemap before republishing it.
    ///
    /// # Safety
    /// The page must be claimed.
    pub unsafe fn clear_safemap(&self) {
        if self.external() {
            let words = bitmap_words(self.max_alloc());
            let array = self.safe_words();
            for i in 0..words {
                (*array.add(i)).store(0, Ordering::Release);
            }
        } else {
            self.safemap.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init;

    unsafe fn fresh_map() -> &'static PageMap {
        init::ensure_initialized();
        let map = meta::alloc_zeroed(core::mem::size_of::<PageMap>()) as *mut PageMap;
        &*map
    }

    #[test]
    fn inline_bitmap_tracks_slots() {
        unsafe {
            let map = fresh_map();
            map.claim(64);
            assert_eq!(map.max_alloc(), 64);

            map.set_live(0);
            map.set_live(63);
            assert!(map.is_live(0));
            assert!(map.is_live(63));
            assert!(!map.is_live(1));
            assert_ne!(map.live_fold(), 0);

            map.clear_live(0);
            map.clear_live(63);
            assert_eq!(map.live_fold(), 0);
        }
    }

    #[test]
    fn external_bitmap_tracks_slots() {
        unsafe {
            let map = fresh_map();
            map.claim(16);
            assert_eq!(map.max_alloc(), 256);

            map.set_live(200);
            assert!(map.is_live(200));
            assert!(!map.is_live(199));
            assert_ne!(map.live_fold(), 0);
            map.clear_live(200);
            assert_eq!(map.live_fold(), 0);

            map.release_storage();
        }
    }

    #[test]
    fn flags_pack_into_alloc_size() {
        unsafe {
            let map = fresh_map();
            map.claim(128);
            assert_eq!(map.flags(), 0);
            map.or_flags(FLAG_FULL);
            map.or_flags(FLAG_READY);
            assert_eq!(map.flags(), FLAG_FULL | FLAG_READY);
            assert_eq!(map.alloc_size(), 128);
        }
    }
}
