//! The classic three-thread priority inversion: a low-priority holder is
//! boosted to the blocked high-priority waiter's urgency, so the
//! medium-priority thread cannot run until the mutex changes hands.
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{Mutex, QueueOrder, Thread, ThreadState};

mod common;
use common::{park_forever, spin_while_clear, wait_until, EventLog};

static EVENTS: EventLog = EventLog::new();
static LOW_HOLDS: AtomicBool = AtomicBool::new(false);
static RELEASE: AtomicBool = AtomicBool::new(false);

unsafe fn low_entry(_: usize) {
    let mutex = Mutex::find("shared").unwrap();

    mutex.take().unwrap();
    EVENTS.push("low:took");
    LOW_HOLDS.store(true, Ordering::SeqCst);

    // Hold the mutex (and the CPU, as far as the kernel knows) until the
    // harness asks for the release.
    spin_while_clear(&RELEASE);

    EVENTS.push("low:releasing");
    mutex.release().unwrap();
    EVENTS.push("low:released");

    park_forever();
}

unsafe fn mid_entry(_: usize) {
    EVENTS.push("mid:ran");
    park_forever();
}

unsafe fn high_entry(_: usize) {
    let mutex = Mutex::find("shared").unwrap();

    EVENTS.push("high:taking");
    mutex.take().unwrap();
    EVENTS.push("high:took");
    mutex.release().unwrap();

    park_forever();
}

#[test]
fn priority_inheritance_blocks_out_the_middle_thread() {
    tern_port_std::init();

    let mutex = Mutex::create("shared", QueueOrder::Priority).unwrap();
    let low = Thread::create("low", low_entry, 0, 16 * 1024, 10, 10).unwrap();
    let mid = Thread::create("mid", mid_entry, 0, 16 * 1024, 5, 10).unwrap();
    let high = Thread::create("high", high_entry, 0, 16 * 1024, 1, 10).unwrap();

    low.startup().unwrap();
    tern_port_std::start_scheduler();

    wait_until("low to take the mutex", || LOW_HOLDS.load(Ordering::SeqCst));
    assert_eq!(low.priority(), 10);

    // The high-priority thread contends and blocks; the holder inherits its
    // urgency.
    tern_port_std::isr(|| high.startup().unwrap());
    wait_until("high to block on the mutex", || {
        high.state() == ThreadState::Suspend
    });
    assert_eq!(low.priority(), 1);
    assert_eq!(mutex.owner(), Some(low));

    // The medium thread becomes ready but cannot outrank the boosted holder.
    tern_port_std::isr(|| mid.startup().unwrap());
    assert_eq!(mid.state(), ThreadState::Ready);
    assert!(!EVENTS.contains("mid:ran"));

    // Release: the holder's priority is restored and the ownership is handed
    // straight to the high-priority waiter.
    RELEASE.store(true, Ordering::SeqCst);
    wait_until("high to acquire the mutex", || EVENTS.contains("high:took"));
    wait_until("mid to finally run", || EVENTS.contains("mid:ran"));

    assert_eq!(low.priority(), 10);

    // The mutex is back at rest.
    assert_eq!(mutex.owner(), None);
    assert_eq!(mutex.hold(), 0);
    assert_eq!(mutex.waiter_count(), 0);

    let events = EVENTS.snapshot();
    let index_of = |event| {
        events
            .iter()
            .position(|e| *e == event)
            .unwrap_or_else(|| panic!("missing event {event}"))
    };

    // The medium thread never ran while the high-priority thread was blocked.
    assert!(index_of("high:taking") < index_of("low:releasing"));
    assert!(index_of("high:took") < index_of("mid:ran"));
    assert!(index_of("low:releasing") < index_of("high:took"));
}
