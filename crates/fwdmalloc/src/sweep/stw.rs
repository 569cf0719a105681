//! The stop-the-world protocol.
//!
//! The coordinator stops the registered mutator thread with SIGUSR1. The
//! handler publishes quiescence by taking the STW lock, then sleeps in
//! sigsuspend until SIGUSR2. The coordinator detects the parked mutator
//! by failing to take the lock, runs the precise scan phase, and sends
//! SIGUSR2 to resume.
//!
//! SIGUSR2 is blocked inside the stop handler's mask, so a resume that
//! races the park stays pending and is consumed by sigsuspend -- the
//! wakeup cannot be lost. The quiesce wait is bounded: a mutator that
//! never parks (wrong thread got the signal, or it is blocked in the
//! kernel) costs us the cycle, not a livelock.

use crate::platform::linux;
use crate::sync::RawMutex;
use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicI32, Ordering};

/// Held by the mutator for as long as it is parked in the stop handler.
static STW_LOCK: RawMutex = RawMutex::new();

/// Thread id of the registered mutator (the thread that initialized the
/// allocator; in a single-threaded host, the only application thread).
static MUTATOR_TID: AtomicI32 = AtomicI32::new(0);

/// Signal mask used inside sigsuspend: everything but SIGUSR2.
struct WaitMask(UnsafeCell<libc::sigset_t>);
unsafe impl Sync for WaitMask {}
static WAIT_MASK: WaitMask = WaitMask(UnsafeCell::new(unsafe { mem::zeroed() }));

/// Attempts to observe the parked mutator before giving up on a cycle.
const QUIESCE_ATTEMPTS: usize = 2000;

extern "C" fn stop_handler(sig: libc::c_int) {
    if sig != libc::SIGUSR1 {
        return;
    }
    // The process-directed signal can land on any thread; only the
    // registered mutator parks.
    if linux::raw_tid() != MUTATOR_TID.load(Ordering::Acquire) {
        return;
    }

    STW_LOCK.lock();
    unsafe {
        libc::sigsuspend(WAIT_MASK.0.get());
    }
    STW_LOCK.unlock();
}

extern "C" fn resume_handler(_sig: libc::c_int) {}

/// Install the stop/resume handlers and register the calling thread as
/// the mutator.
///
/// # Safety
/// Must be called once, from the thread that owns the application.
pub unsafe fn init_stw() {
    MUTATOR_TID.store(linux::raw_tid(), Ordering::Release);

    let mut action: libc::sigaction = mem::zeroed();
    libc::sigfillset(&mut action.sa_mask);
    // Leave fatal/interactive signals deliverable while parked.
    libc::sigdelset(&mut action.sa_mask, libc::SIGINT);
    libc::sigdelset(&mut action.sa_mask, libc::SIGQUIT);
    libc::sigdelset(&mut action.sa_mask, libc::SIGABRT);
    libc::sigdelset(&mut action.sa_mask, libc::SIGTERM);
    libc::sigdelset(&mut action.sa_mask, libc::SIGALRM);
    action.sa_flags = libc::SA_RESTART;

    action.sa_sigaction = stop_handler as usize;
    libc::sigaction(libc::SIGUSR1, &action, core::ptr::null_mut());

    action.sa_sigaction = resume_handler as usize;
    libc::sigaction(libc::SIGUSR2, &action, core::ptr::null_mut());

    let mask = WAIT_MASK.0.get();
    libc::sigfillset(mask);
    libc::sigdelset(mask, libc::SIGUSR2);
}

/// Is the calling thread the registered mutator?
#[inline]
pub fn caller_is_mutator() -> bool {
    linux::raw_tid() == MUTATOR_TID.load(Ordering::Acquire)
}

/// Suspend the mutator. Returns true once it is quiescent. A caller
/// that *is* the mutator is quiescent by definition and no signal is
/// sent (that is what makes synchronous collection work).
pub fn stop_the_world() -> bool {
    if caller_is_mutator() {
        return true;
    }

    unsafe {
        libc::kill(libc::getpid(), libc::SIGUSR1);
    }

    for _ in 0..QUIESCE_ATTEMPTS {
        if STW_LOCK.try_lock() {
            STW_LOCK.unlock();
            unsafe {
                libc::usleep(50);
            }
        } else {
            // The mutator holds the lock: it is parked in the handler.
            return true;
        }
    }

    // Never quiesced. Unwedge it in case the signal arrives late.
    resume_the_world();
    false
}

/// Wake the parked mutator.
pub fn resume_the_world() {
    if caller_is_mutator() {
        return;
    }
    unsafe {
        libc::kill(libc::getpid(), libc::SIGUSR2);
    }
}
