use core::ptr;

// Not in every libc version's constants; value is stable kernel ABI.
const MAP_FIXED_NOREPLACE: libc::c_int = 0x100000;

#[inline]
pub fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

/// Map anonymous read-write memory at exactly `addr`, failing with EEXIST
/// if anything already occupies the range.
///
/// # Safety
/// `addr` must be page-aligned, `size` page-aligned and non-zero.
pub unsafe fn map_at_noreplace(addr: *mut u8, size: usize, populate: bool) -> *mut u8 {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_FIXED_NOREPLACE;
    if populate {
        flags |= libc::MAP_POPULATE;
    }
    let result = libc::mmap(
        addr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        flags,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Map anonymous memory at any address.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Reserve address space without backing it (metadata arena reservation).
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve_noaccess(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Replace a mapped range with an inaccessible reservation. The kernel
/// drops the physical pages; the virtual range stays claimed.
///
/// # Safety
/// Range must be page-aligned and previously mapped.
pub unsafe fn remap_none(addr: *mut u8, size: usize) -> bool {
    let result = libc::mmap(
        addr as *mut libc::c_void,
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    result != libc::MAP_FAILED
}

/// Replace a mapped range with fresh zeroed read-write pages.
///
/// # Safety
/// Range must be page-aligned and previously mapped.
pub unsafe fn remap_zero(addr: *mut u8, size: usize) -> bool {
    let result = libc::mmap(
        addr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    result != libc::MAP_FAILED
}

/// Unmap memory.
///
/// # Safety
/// `addr`/`size` must describe a mapped range.
pub unsafe fn unmap(addr: *mut u8, size: usize) {
    libc::munmap(addr as *mut libc::c_void, size);
}

/// Mark memory as read-write.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_read_write(addr: *mut u8, size: usize) -> bool {
    libc::mprotect(
        addr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// Hint that the range is about to be touched.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn advise_willneed(addr: *mut u8, size: usize) {
    libc::madvise(addr as *mut libc::c_void, size, libc::MADV_WILLNEED);
}

/// Get the number of online CPUs.
pub fn num_cpus() -> usize {
    unsafe {
        let n = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
        if n < 1 {
            1
        } else {
            n as usize
        }
    }
}

/// CPU the calling thread is currently running on (0 if unknown).
#[inline]
pub fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

/// Kernel thread id of the calling thread.
#[inline]
pub fn raw_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}
