//! The scheduler
//!
//! Fixed-priority preemptive scheduling with round-robin among equal
//! priorities. The running thread keeps the `Ready` state and stays linked at
//! the front of its ready list; [`schedule`] switches contexts whenever the
//! highest-urgency ready thread differs from the running one.
//!
//! [`schedule`] may be called from an interrupt handler, in which case the
//! switch is deferred until the outermost [`interrupt_leave`].
use crate::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    port,
    thread::{readyqueue, ThreadRef, ThreadState},
};

static RUNNING: CpuLockCell<Option<ThreadRef>> = CpuLockCell::new(None);
static STARTED: CpuLockCell<bool> = CpuLockCell::new(false);
static ISR_NEST: CpuLockCell<u32> = CpuLockCell::new(0);
static SWITCH_PENDING: CpuLockCell<bool> = CpuLockCell::new(false);

pub(crate) fn running(lock: CpuLockTokenRefMut<'_>) -> Option<ThreadRef> {
    RUNNING.get(&*lock)
}

pub(crate) fn in_isr(lock: CpuLockTokenRefMut<'_>) -> bool {
    ISR_NEST.get(&*lock) > 0
}

/// Mark the entry into an interrupt handler. Nestable.
pub fn interrupt_enter() {
    let mut lock = klock::lock_cpu();
    ISR_NEST.replace_with(&mut *lock, |n| *n + 1);
}

/// Mark the exit from an interrupt handler. When the outermost handler exits
/// with a context switch pending, the switch is performed here.
pub fn interrupt_leave() {
    let mut lock = klock::lock_cpu();
    let nest = ISR_NEST.get(&*lock);
    assert!(nest > 0, "interrupt_leave without interrupt_enter");
    ISR_NEST.replace(&mut *lock, nest - 1);

    if nest == 1 && SWITCH_PENDING.replace(&mut *lock, false) && STARTED.get(&*lock) {
        switch_to_highest(lock);
    }
}

/// Pick the highest-urgency ready thread and dispatch it.
///
/// A no-op before the scheduler is started. Inside an interrupt handler the
/// switch is deferred to the outermost [`interrupt_leave`].
pub fn schedule() {
    let mut lock = klock::lock_cpu();

    if !STARTED.get(&*lock) {
        return;
    }

    if ISR_NEST.get(&*lock) > 0 {
        SWITCH_PENDING.replace(&mut *lock, true);
        return;
    }

    switch_to_highest(lock);
}

/// The core of [`schedule`]: compare the ready-queue head against the running
/// thread and switch if they differ. The critical section is held across the
/// switch; the incoming context resumes with the interrupt state it saved.
fn switch_to_highest(mut lock: CpuLockGuard) {
    let Some(next) = readyqueue::highest(lock.borrow_mut()) else {
        return;
    };

    let cur = RUNNING.get(&*lock);
    if cur == Some(next) {
        return;
    }

    let prev = RUNNING.replace(&mut *lock, Some(next)).unwrap();

    let from_sp = prev.cb().sp.get();
    let to_sp = next.cb().sp.get();

    // Safety: both slots belong to live thread control blocks; CPU Lock is
    // active
    unsafe { (port::port().context_switch)(from_sp, to_sp) };

    // Execution resumes here when `prev` is dispatched again; `lock` is
    // still held and is released on return.
}

/// Charge one tick to the running thread's round-robin budget. Returns `true`
/// if the budget ran out and the thread was rotated to the tail of its ready
/// list, requiring a reschedule.
pub(crate) fn round_robin_tick(mut lock: CpuLockTokenRefMut<'_>) -> bool {
    if !STARTED.get(&*lock) {
        return false;
    }
    let Some(cur) = RUNNING.get(&*lock) else {
        return false;
    };

    let cb = cur.cb();

    // The running thread may already be mid-suspension with the switch still
    // pending; its budget is not charged.
    if cb.state.get(&*lock) != ThreadState::Ready {
        return false;
    }

    let remaining = cb.remaining_tick.get(&*lock).saturating_sub(1);
    cb.remaining_tick.replace(&mut *lock, remaining);

    if remaining == 0 {
        let init_tick = cb.init_tick.get(&*lock);
        cb.remaining_tick
            .replace(&mut *lock, init_tick);

        if readyqueue::has_peer(lock.borrow_mut(), cur) {
            readyqueue::rotate(lock.borrow_mut(), cur);
            return true;
        }
    }

    false
}

/// Start the scheduler: dispatch the highest-urgency ready thread. Never
/// returns.
pub fn start() -> ! {
    let mut lock = klock::lock_cpu();

    let next = readyqueue::highest(lock.borrow_mut()).expect("no ready thread to dispatch");
    RUNNING.replace(&mut *lock, Some(next));
    STARTED.replace(&mut *lock, true);

    let to_sp = next.cb().sp.get();

    // The dispatched context starts with its own interrupt state; this
    // critical section is discarded along with the boot context.
    core::mem::forget(lock);

    // Safety: `to_sp` belongs to a live thread control block
    unsafe { (port::port().context_switch_to)(to_sp) }
}

/// Dispatch the next thread without saving the current context. Used by the
/// thread exit path.
pub(crate) fn dispatch_exit(mut lock: CpuLockGuard) -> ! {
    let next = readyqueue::highest(lock.borrow_mut()).expect("no ready thread to dispatch");
    RUNNING.replace(&mut *lock, Some(next));

    let to_sp = next.cb().sp.get();

    // The exiting context is discarded; see `start`.
    core::mem::forget(lock);

    // Safety: `to_sp` belongs to a live thread control block
    unsafe { (port::port().context_switch_to)(to_sp) }
}
