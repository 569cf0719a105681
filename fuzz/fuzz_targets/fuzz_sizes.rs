#![no_main]

use fwdmalloc::api;
use libfuzzer_sys::fuzz_target;

/// Hammer the size/alignment argument space: every accepted allocation
/// must be correctly aligned, sized, and writable end to end.
fuzz_target!(|data: &[u8]| {
    let mut i = 0;
    while i + 3 <= data.len() {
        let size = u16::from_le_bytes([data[i], data[i + 1]]) as usize;
        let align_shift = (data[i + 2] & 0x0F) as u32;
        i += 3;

        let alignment = 1usize << align_shift;

        unsafe {
            let ptr = api::memalign(alignment, size);
            if !ptr.is_null() {
                assert_eq!(
                    ptr as usize % alignment,
                    0,
                    "memalign({}, {}) misaligned",
                    alignment,
                    size
                );
                let usable = api::malloc_usable_size(ptr);
                assert!(usable >= size, "usable {} below request {}", usable, size);
                if size > 0 {
                    std::ptr::write_bytes(ptr, 0x5A, size);
                    assert_eq!(*ptr.add(size - 1), 0x5A);
                }
                api::free(ptr);
            }
        }
    }
});
