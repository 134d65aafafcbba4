//! Thread lifecycle: sleep wake-up at the right tick, suspend/resume
//! cancelling the thread timer, and defunct reclamation of exited dynamic
//! threads by the idle thread.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tern_kernel::{Thread, ThreadState};

mod common;
use common::{park_forever, wait_until};

static SLEEP_WOKE_AT: AtomicU32 = AtomicU32::new(u32::MAX);
static NAPPER_DONE: AtomicBool = AtomicBool::new(false);
static SHORT_LIVED_RAN: AtomicBool = AtomicBool::new(false);

unsafe fn napper_entry(_: usize) {
    // First nap expires by timer.
    tern_kernel::sleep(10).unwrap();
    SLEEP_WOKE_AT.store(tern_kernel::tick_count(), Ordering::SeqCst);

    // Second nap is cut short by an external resume; the thread timer must
    // be cancelled so the stale expiry cannot fire later.
    tern_kernel::sleep(1000).unwrap();
    NAPPER_DONE.store(true, Ordering::SeqCst);

    park_forever();
}

unsafe fn short_lived_entry(_: usize) {
    SHORT_LIVED_RAN.store(true, Ordering::SeqCst);
    // Returning runs the seeded exit trampoline.
}

#[test]
fn sleep_resume_and_defunct_reaping() {
    tern_port_std::init();

    let napper = Thread::create("napper", napper_entry, 0, 16 * 1024, 5, 10).unwrap();
    napper.startup().unwrap();

    // Resuming a thread that is not suspended is an error, and starting a
    // thread twice is too.
    assert!(napper.resume().is_err());
    assert!(napper.startup().is_err());

    tern_port_std::start_scheduler();

    // The first nap wakes exactly at its deadline.
    wait_until("napper's first nap", || napper.state() == ThreadState::Suspend);
    tern_port_std::tick(10);
    wait_until("napper to wake", || {
        SLEEP_WOKE_AT.load(Ordering::SeqCst) != u32::MAX
    });
    assert_eq!(SLEEP_WOKE_AT.load(Ordering::SeqCst), 10);

    // The second nap is interrupted by a resume, which also cancels the
    // timer: hundreds of ticks later nothing fires.
    wait_until("napper's second nap", || {
        napper.state() == ThreadState::Suspend && !NAPPER_DONE.load(Ordering::SeqCst)
    });
    tern_port_std::isr(|| {
        napper.resume().unwrap();
        tern_kernel::schedule();
    });
    wait_until("napper to be resumed early", || {
        NAPPER_DONE.load(Ordering::SeqCst)
    });

    tern_port_std::tick(1500);

    // The cancelled timer never fired: the napper is still parked.
    assert_eq!(napper.state(), ThreadState::Suspend);

    // A dynamic thread whose entry returns is reaped by the idle thread once
    // nothing else wants the processor.
    let short_lived = Thread::create("shortl", short_lived_entry, 0, 16 * 1024, 4, 10).unwrap();
    short_lived.startup().unwrap();
    wait_until("the short-lived thread to run", || {
        SHORT_LIVED_RAN.load(Ordering::SeqCst)
    });
    wait_until("the reaper to unregister it", || {
        Thread::find("shortl").is_none()
    });
}
