use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default sweeper tick period in microseconds.
const DEFAULT_TICK_US: usize = 1000;

/// Cached config values (read once at init, never allocate).
static TICK_US: AtomicUsize = AtomicUsize::new(DEFAULT_TICK_US);
static SWEEP_DISABLED: AtomicBool = AtomicBool::new(false);

/// Read configuration from environment variables.
///
/// # Safety
/// Calls libc::getenv, so must run from the single-threaded init path
/// before any allocations.
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"FWDMALLOC_TICK_US\0") {
        if val > 0 {
            TICK_US.store(val, Ordering::Relaxed);
        }
    }
    if !libc::getenv(b"FWDMALLOC_NO_SWEEP\0".as_ptr() as *const libc::c_char).is_null() {
        SWEEP_DISABLED.store(true, Ordering::Relaxed);
    }
}

/// Sweeper tick period in microseconds.
pub fn tick_us() -> usize {
    TICK_US.load(Ordering::Relaxed)
}

/// Kill-switch for the background sweeper.
pub fn sweep_disabled() -> bool {
    SWEEP_DISABLED.load(Ordering::Relaxed)
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
