use crate::{arena, config, meta, platform};
use crate::util::abort_with_message;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// One-time process-wide setup: the high-water mark, the metadata
/// arena, the default arena, and the sweeper. The standard-interface
/// interposition shims own process attach; in-process users reach this
/// through `ensure_initialized` on first call.
unsafe fn initialize() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    config::read_config();
    platform::init_highwater();

    if !meta::init() {
        abort_with_message("fwdmalloc: metadata arena reservation failed\n");
    }

    if !arena::create_default() {
        abort_with_message("fwdmalloc: default arena creation failed\n");
    }

    #[cfg(feature = "sweeper")]
    if !config::sweep_disabled() {
        crate::sweep::init();
        libc::atexit(sweep_teardown);
    }

    INIT_STATE.store(READY, Ordering::Release);
}

#[cfg(feature = "sweeper")]
extern "C" fn sweep_teardown() {
    crate::sweep::shutdown();
}

/// Initialize on first use; cheap once ready.
#[inline]
pub fn ensure_initialized() {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        unsafe {
            initialize();
        }
    }
}
