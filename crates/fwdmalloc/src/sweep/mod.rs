//! The conservative sweeper.
//!
//! A cycle moves through four states:
//!
//! * Idle -> Scanning(concurrent): soft-dirty cleared, roots enumerated,
//!   workers dispatched over pages that are present *and* soft-dirty.
//! * Scanning(concurrent) -> Scanning(STW): the mutator is stopped and
//!   the workers redispatched over every present page. Marks accumulate
//!   across both phases.
//! * Scanning(STW) -> Reclaim: the bitmap is frozen, soft-dirty cleared,
//!   and pending pool ranges whose fold is zero are recycled.
//! * Reclaim -> Idle: the bitmap is wiped and the mutator resumed.
//!
//! Conservatism only ever errs toward retention: a stale-looking word
//! keeps memory parked for another cycle. The reverse error cannot
//! happen because the STW phase reads every present root page while the
//! mutator is provably not running.

pub mod markmap;
pub mod reclaim;
pub mod roots;
pub mod scanner;
pub mod stw;
pub mod trigger;

use crate::platform::pagemap;
use crate::sync::RawMutex;
use core::sync::atomic::{AtomicBool, Ordering};

static SWEEP_READY: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Serializes cycles (the trigger thread vs. synchronous `collect`).
static CYCLE_LOCK: RawMutex = RawMutex::new();

/// Bring the sweeper up: mark bitmap, root store, STW handlers, scanner
/// pool, and (outside tests) the trigger thread.
///
/// # Safety
/// Must be called once, during allocator init, from the mutator thread.
pub unsafe fn init() {
    if !markmap::init() || !roots::init() {
        // Without the bitmap there is nothing to certify against; the
        // allocator still works, it just never recycles.
        return;
    }
    stw::init_stw();
    scanner::spawn();

    #[cfg(not(test))]
    spawn_reclaimer();

    SWEEP_READY.store(true, Ordering::Release);
}

/// Is the sweeper up? Destroyed pools only park their ranges when a
/// sweeper exists to certify them; otherwise they are unmapped outright.
pub fn active() -> bool {
    SWEEP_READY.load(Ordering::Acquire)
}

/// Stop scheduling cycles. Registered with atexit.
pub fn shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}

#[cfg(not(test))]
fn spawn_reclaimer() {
    std::thread::Builder::new()
        .name("fwdmalloc-sweep".into())
        .spawn(reclaimer_main)
        .expect("reclaimer spawn");
}

/// The trigger loop: one tick per period, one cycle per firing.
#[cfg(not(test))]
fn reclaimer_main() {
    let mut window = trigger::TriggerWindow::new();

    loop {
        if SHUTDOWN.load(Ordering::Acquire) {
            return;
        }
        unsafe {
            libc::usleep(crate::config::tick_us() as libc::c_uint);
        }

        let current = trigger::take_tick_count();
        if window.observe(current) {
            unsafe {
                run_cycle();
            }
        }
    }
}

/// Run one full sweep cycle. Any failure along the way (pagemap not
/// readable, mutator never quiesced, incomplete roots) degrades to
/// "reclaim nothing this time".
///
/// # Safety
/// The allocator must be initialized.
pub unsafe fn run_cycle() {
    if !SWEEP_READY.load(Ordering::Acquire) || SHUTDOWN.load(Ordering::Acquire) {
        return;
    }

    CYCLE_LOCK.lock();

    // --- Scanning (concurrent) ---
    if !pagemap::clear_soft_dirty() {
        CYCLE_LOCK.unlock();
        return;
    }
    let fd = pagemap::open_pagemap();
    if fd < 0 {
        CYCLE_LOCK.unlock();
        return;
    }
    scanner::set_pagemap_fd(fd);

    roots::enumerate();
    scanner::start(true);
    scanner::stop();

    // --- Scanning (STW) ---
    let quiesced = stw::stop_the_world();
    let mut certified = false;
    if quiesced {
        let roots_complete = roots::enumerate();
        scanner::start(false);
        scanner::stop();
        certified = roots_complete && roots::complete();

        pagemap::clear_soft_dirty();
    }

    // --- Reclaim ---
    let mut deferred: *mut reclaim::PendingNode = core::ptr::null_mut();
    if certified {
        reclaim::reclaim_pools(&mut deferred);
        #[cfg(feature = "sub-page-reuse")]
        reclaim::reclaim_subpage();
    }

    // --- Back to idle ---
    markmap::clear();
    if quiesced {
        stw::resume_the_world();
    }
    reclaim::free_deferred(deferred);

    scanner::set_pagemap_fd(-1);
    pagemap::close_pagemap(fd);

    CYCLE_LOCK.unlock();
}

/// Synchronous collection for callers that want a cycle now. When the
/// caller is the registered mutator the whole cycle runs without
/// signals.
///
/// # Safety
/// The allocator must be initialized.
pub unsafe fn collect() {
    run_cycle();
}
