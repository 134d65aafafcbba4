//! Software timers: one-shot timers fire once at their deadline, periodic
//! timers re-arm themselves, and cancellation is idempotent.
use std::sync::atomic::{AtomicU32, Ordering};

use tern_kernel::Timer;

static PERIODIC_FIRED: AtomicU32 = AtomicU32::new(0);
static ONESHOT_FIRED_AT: AtomicU32 = AtomicU32::new(u32::MAX);

fn periodic_callback(step: usize) {
    PERIODIC_FIRED.fetch_add(step as u32, Ordering::SeqCst);
}

fn oneshot_callback(_: usize) {
    ONESHOT_FIRED_AT.store(tern_kernel::tick_count(), Ordering::SeqCst);
}

#[test]
fn timers_fire_on_schedule() {
    tern_port_std::init();

    let periodic = Timer::create("blink", periodic_callback, 1, 10, true).unwrap();
    let oneshot = Timer::create("once", oneshot_callback, 0, 25, false).unwrap();

    periodic.start().unwrap();
    oneshot.start().unwrap();

    // Starting an armed timer is refused.
    assert!(periodic.start().is_err());

    tern_port_std::tick(9);
    assert_eq!(PERIODIC_FIRED.load(Ordering::SeqCst), 0);

    tern_port_std::tick(1);
    assert_eq!(PERIODIC_FIRED.load(Ordering::SeqCst), 1);

    tern_port_std::tick(25);
    assert_eq!(PERIODIC_FIRED.load(Ordering::SeqCst), 3);
    assert_eq!(ONESHOT_FIRED_AT.load(Ordering::SeqCst), 25);

    // A one-shot timer does not re-arm; it can be started again by hand.
    tern_port_std::tick(30);
    assert_eq!(ONESHOT_FIRED_AT.load(Ordering::SeqCst), 25);
    oneshot.start().unwrap();
    tern_port_std::tick(25);
    assert_eq!(ONESHOT_FIRED_AT.load(Ordering::SeqCst), 90);

    // Stopping is idempotent, even on an idle timer.
    periodic.stop().unwrap();
    periodic.stop().unwrap();
    let fired = PERIODIC_FIRED.load(Ordering::SeqCst);
    tern_port_std::tick(50);
    assert_eq!(PERIODIC_FIRED.load(Ordering::SeqCst), fired);

    // A re-armed timer uses the interval set by `set_ticks`.
    periodic.set_ticks(5).unwrap();
    periodic.start().unwrap();
    tern_port_std::tick(5);
    assert_eq!(PERIODIC_FIRED.load(Ordering::SeqCst), fired + 1);
}
