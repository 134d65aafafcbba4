//! The tick clock
//!
//! Kernel time is counted in ticks. The port's periodic timer interrupt calls
//! [`tick_advance`] once per tick; everything time-related (the round-robin
//! budget and the timer wheel) is driven from there.
use crate::{klock, sched, timer};

/// The atomic unit of kernel time.
pub type Tick = u32;

static TICK: klock::CpuLockCell<Tick> = klock::CpuLockCell::new(0);

/// Get the current tick count.
pub fn tick_count() -> Tick {
    let lock = klock::lock_cpu();
    TICK.get(&*lock)
}

pub(crate) fn now(lock: klock::CpuLockTokenRefMut<'_>) -> Tick {
    TICK.get(&*lock)
}

/// `true` if the absolute tick `at` has been reached at time `now`,
/// wrap-safe.
pub(crate) fn elapsed(now: Tick, at: Tick) -> bool {
    now.wrapping_sub(at) < Tick::MAX / 2
}

/// The body of the periodic timer interrupt: advance the tick, charge the
/// running thread's round-robin budget, and expire timers.
///
/// Must be called from an interrupt context (between [`crate::interrupt_enter`]
/// and [`crate::interrupt_leave`]); any context switch this causes is deferred
/// to the outermost interrupt exit.
pub fn tick_advance() {
    let mut lock = klock::lock_cpu();
    TICK.replace_with(&mut *lock, |t| t.wrapping_add(1));

    let need_resched = sched::round_robin_tick(lock.borrow_mut());
    drop(lock);

    if need_resched {
        sched::schedule();
    }

    timer::check_expirations();
}
