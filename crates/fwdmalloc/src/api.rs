//! The public allocation contract.
//!
//! These are plain Rust entry points; the C-symbol interposition shims
//! that put this allocator underneath an unmodified process live in a
//! separate crate and call straight through to here.

use crate::alloc::{free, large, small};
use crate::arena::{self, Arena, ArenaError};
use crate::init;
use crate::pool::pool::PoolKind;
use crate::pool::radix;
use crate::util::{
    abort_with_message, align_size, HALF_PAGE, MIN_ALIGN, PAGE_SIZE, POOL_SIZE,
};
use core::ptr;
use core::sync::atomic::Ordering;

#[inline]
unsafe fn set_errno(err: libc::c_int) {
    *libc::__errno_location() = err;
}

/// Route a size to the small, large, or jumbo path.
///
/// # Safety
/// `size` is already align_size-rounded; `arena` is live.
unsafe fn malloc_route(size: usize, arena: *mut Arena) -> *mut u8 {
    if size <= HALF_PAGE {
        small::malloc_small(size, arena)
    } else if size < POOL_SIZE - HALF_PAGE {
        large::malloc_large(size, MIN_ALIGN, arena)
    } else {
        large::malloc_jumbo(size, arena)
    }
}

/// Allocate at least `size` bytes, aligned to MIN_ALIGN.
/// `malloc(0)` returns a real minimum-size allocation: a surprising
/// number of programs realloc or write through the result.
///
/// # Safety
/// Standard malloc contract; the pointer must eventually go to `free`.
pub unsafe fn malloc(size: usize) -> *mut u8 {
    init::ensure_initialized();

    let size = if size == 0 { 8 } else { size };
    if size > usize::MAX - MIN_ALIGN {
        set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }
    let size = align_size(size);

    #[cfg(feature = "sweeper")]
    crate::sweep::trigger::note_allocation();

    let allocation = malloc_route(size, arena::default_arena());
    if allocation.is_null() {
        set_errno(libc::ENOMEM);
    }
    allocation
}

/// Allocate zeroed memory for `nmemb` elements of `size` bytes.
/// Forward allocation hands out fresh (or certified-and-rezeroed)
/// memory only, so no explicit clear is needed.
///
/// # Safety
/// Standard calloc contract.
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
    };
    malloc(total)
}

/// Resize an allocation, preserving the leading `min(old, new)` bytes.
///
/// # Safety
/// `ptr` must be null or a live allocation from this allocator.
pub unsafe fn realloc(ptr_in: *mut u8, size: usize) -> *mut u8 {
    if ptr_in.is_null() {
        return malloc(size);
    }
    if size == 0 {
        free(ptr_in);
        return ptr::null_mut();
    }

    let size = align_size(size);

    let pool_ptr = radix::lookup(ptr_in as usize);
    if pool_ptr.is_null() {
        abort_with_message("fwdmalloc: realloc of pointer not owned by any pool\n");
    }
    let pool = &*pool_ptr;

    match pool.kind() {
        PoolKind::Large => {
            let (index, old_size) = match free::find_large_ptr(ptr_in, pool) {
                Some(found) => found,
                None => abort_with_message("fwdmalloc: realloc of invalid large pointer\n"),
            };

            if size <= old_size {
                return ptr_in;
            }

            // The tail allocation of a pool with room can simply grow in
            // place. Profiling of allocation-heavy workloads shows this
            // is common enough to matter.
            if size < POOL_SIZE {
                pool.lock.lock();
                let additional = size - old_size;
                let index_now = pool.next_free_index.load(Ordering::Relaxed);
                let next_free = pool.next_free.load(Ordering::Relaxed);
                if index + 1 == index_now && next_free + additional <= pool.end as usize {
                    pool.next_free.store(next_free + additional, Ordering::Relaxed);
                    let sentinel = pool.track_load(index_now);
                    pool.track_store(index_now, sentinel + additional);
                    pool.lock.unlock();
                    return ptr_in;
                }
                pool.lock.unlock();
            }

            let new_ptr = malloc(size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(ptr_in, new_ptr, old_size);
            free::free_large_pointer(pool_ptr, index, old_size);
            new_ptr
        }
        PoolKind::Jumbo => {
            let jumbo_size = pool.end as usize - pool.start as usize;
            if size <= jumbo_size {
                return pool.start;
            }

            let new_ptr = malloc(size);
            if new_ptr.is_null() {
                set_errno(libc::ENOMEM);
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(ptr_in, new_ptr, jumbo_size);
            free::free_jumbo(pool_ptr);
            new_ptr
        }
        PoolKind::Small => {
            let (page, index) = match free::find_small_ptr(ptr_in, pool) {
                Some(found) => found,
                None => abort_with_message("fwdmalloc: realloc of invalid small pointer\n"),
            };

            let old_size = page.alloc_size();
            if size <= old_size {
                return ptr_in;
            }

            let new_ptr = malloc(size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(ptr_in, new_ptr, old_size);

            #[cfg(feature = "sweeper")]
            ptr::write_bytes(ptr_in, 0, old_size);
            #[cfg(feature = "sub-page-reuse")]
            page.epochs_since_free.store(0, Ordering::Relaxed);

            free::free_small_ptr(pool_ptr, page, index);
            new_ptr
        }
    }
}

/// `realloc(ptr, nmemb * size)` with overflow detection; the original
/// allocation is untouched on overflow.
///
/// # Safety
/// As `realloc`.
pub unsafe fn reallocarray(ptr_in: *mut u8, nmemb: usize, size: usize) -> *mut u8 {
    match nmemb.checked_mul(size) {
        Some(total) => realloc(ptr_in, total),
        None => {
            set_errno(libc::ENOMEM);
            ptr::null_mut()
        }
    }
}

/// Release an allocation. Freeing null is a no-op; freeing anything
/// this allocator did not hand out, or handing the same pointer in
/// twice, aborts the process.
///
/// # Safety
/// Standard free contract.
pub unsafe fn free(ptr_in: *mut u8) {
    if ptr_in.is_null() {
        return;
    }
    free::free_ptr(ptr_in);
}

/// Common argument-checked aligned-allocation path.
/// Alignments at or past the pool size cannot be carved out of a pool
/// and are rejected upstream.
unsafe fn memalign_internal(alignment: usize, size: usize) -> *mut u8 {
    let arena = arena::default_arena();

    // Small sizes with small alignments come out of the bins: an
    // allocation of the alignment itself (or the size rounded to a
    // power of two) lands on a slot boundary with that alignment.
    if size <= HALF_PAGE && alignment <= HALF_PAGE {
        if size <= alignment {
            return small::malloc_small(alignment, arena);
        }
        return small::malloc_small(size.next_power_of_two(), arena);
    }

    let size = align_size(size);
    if size >= POOL_SIZE {
        large::malloc_jumbo(size, arena)
    } else {
        large::malloc_large(size, alignment, arena)
    }
}

/// POSIX-contract aligned allocation.
///
/// # Safety
/// `memptr` must be valid for writes.
pub unsafe fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> libc::c_int {
    init::ensure_initialized();

    if size == 0 || size >= usize::MAX - PAGE_SIZE {
        *memptr = ptr::null_mut();
        return libc::EINVAL;
    }
    if alignment < core::mem::size_of::<*mut u8>()
        || !alignment.is_power_of_two()
        || alignment >= POOL_SIZE
    {
        *memptr = ptr::null_mut();
        return libc::EINVAL;
    }
    // Jumbo reservations are page-aligned and no stronger.
    if size + PAGE_SIZE >= POOL_SIZE && alignment > PAGE_SIZE {
        *memptr = ptr::null_mut();
        return libc::EINVAL;
    }

    *memptr = memalign_internal(alignment, size);
    if (*memptr).is_null() {
        return libc::ENOMEM;
    }
    0
}

/// Obsolete but still-encountered aligned allocation.
///
/// # Safety
/// `alignment` constraints as documented; returned pointer goes to `free`.
pub unsafe fn memalign(alignment: usize, size: usize) -> *mut u8 {
    init::ensure_initialized();

    if size == 0 || size >= usize::MAX - PAGE_SIZE {
        return ptr::null_mut();
    }
    if !alignment.is_power_of_two() || alignment >= POOL_SIZE {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    if alignment <= core::mem::size_of::<*mut u8>() {
        return malloc(size);
    }
    if size + PAGE_SIZE >= POOL_SIZE && alignment > PAGE_SIZE {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }

    memalign_internal(alignment, size)
}

/// C11 aligned allocation: `size` must be a multiple of `alignment`.
///
/// # Safety
/// As `memalign`.
pub unsafe fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    init::ensure_initialized();

    if size == 0 || size >= usize::MAX - PAGE_SIZE {
        return ptr::null_mut();
    }
    if alignment < core::mem::size_of::<*mut u8>()
        || !alignment.is_power_of_two()
        || alignment >= POOL_SIZE
    {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    if size < alignment || size % alignment != 0 {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    if size + PAGE_SIZE >= POOL_SIZE && alignment > PAGE_SIZE {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }

    let arena = arena::default_arena();
    if size >= POOL_SIZE {
        large::malloc_jumbo(size, arena)
    } else if size <= HALF_PAGE && alignment <= HALF_PAGE {
        small::malloc_small(size.next_power_of_two(), arena)
    } else {
        large::malloc_large(size, alignment, arena)
    }
}

/// Actual backing size of an allocation; 0 for null or unknown.
///
/// # Safety
/// The allocator must be initialized if `ptr_in` is non-null.
pub unsafe fn malloc_usable_size(ptr_in: *mut u8) -> usize {
    free::usable_size(ptr_in)
}

/// Create a new arena; allocations made through `malloc_arena` against
/// the returned id can all be released at once with `destroy_arena`.
///
/// # Safety
/// The allocator must be initialized (ensured here).
pub unsafe fn create_arena() -> Result<usize, ArenaError> {
    init::ensure_initialized();
    arena::arena_create()
}

/// Free every allocation in an arena and the arena itself.
///
/// # Safety
/// No concurrent use of the arena; see `arena::arena_destroy`.
pub unsafe fn destroy_arena(id: usize) -> Result<(), ArenaError> {
    arena::arena_destroy(id)
}

/// Allocate from a specific (non-default) arena.
///
/// # Safety
/// `id` must come from `create_arena`; the pointer must be freed before
/// (or by) `destroy_arena`.
pub unsafe fn malloc_arena(id: usize, size: usize) -> Result<*mut u8, ArenaError> {
    init::ensure_initialized();

    // The default arena is reachable only through `malloc`: its id is an
    // implementation detail and it can never be destroyed, so letting it
    // alias here would just invite confusion.
    if id == 0 {
        return Err(ArenaError::BadArena);
    }
    let arena = arena::arena(id);
    if arena.is_null() {
        return Err(ArenaError::BadArena);
    }

    if size == 0 || size > usize::MAX - MIN_ALIGN {
        return Err(ArenaError::BadParam);
    }
    let size = align_size(size);

    let allocation = malloc_route(size, arena);
    if allocation.is_null() {
        Err(ArenaError::NoMemory)
    } else {
        Ok(allocation)
    }
}

/// Number of pools currently registered in the lookup tree.
pub fn pool_count() -> usize {
    radix::pool_count()
}

/// Run one synchronous sweep cycle now.
///
/// # Safety
/// The allocator must be initialized (ensured here).
#[cfg(feature = "sweeper")]
pub unsafe fn collect() {
    init::ensure_initialized();
    crate::sweep::collect();
}
