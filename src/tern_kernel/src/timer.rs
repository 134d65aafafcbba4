//! Timers
//!
//! A timer is a kernel object holding a callback function pointer and an
//! opaque argument. Active timers sit on a single list ordered by absolute
//! expiration tick; the tick interrupt pops expired entries and invokes their
//! callbacks with the critical section released between callbacks.
//!
//! Every thread owns an embedded one-shot timer used for bounded waits; those
//! reuse this machinery through the `pub(crate)` entry points.
use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, ObjectClass, ObjectFlags},
    timeout::{self, Tick},
    utils::{
        intrusive_list::{ElemRef, ListHead, ListNode},
        Init,
    },
};

/// Timer callback function. Invoked in an interrupt context with the critical
/// section released.
pub type TimerFn = fn(usize);

bitflags::bitflags! {
    pub(crate) struct TimerFlags: u8 {
        /// The timer is on the active list.
        const ACTIVATED = 1 << 0;

        /// The timer re-arms itself on expiration.
        const PERIODIC = 1 << 1;
    }
}

impl Init for TimerFlags {
    const INIT: Self = TimerFlags::empty();
}

/// *Timer control block* - the state data of a timer.
pub struct TimerCb {
    pub(crate) object: KernelObject,

    /// Membership in the active-timer list, ordered by `timeout_tick`.
    node: ListNode<TimerCb>,

    timeout_fn: CpuLockCell<Option<TimerFn>>,
    param: CpuLockCell<usize>,

    /// The relative interval this timer is armed with.
    init_tick: CpuLockCell<Tick>,

    /// The absolute expiration tick. Meaningful while `ACTIVATED`.
    timeout_tick: CpuLockCell<Tick>,

    flags: CpuLockCell<TimerFlags>,
}

// Safety: all mutable state is token-gated
unsafe impl Send for TimerCb {}
unsafe impl Sync for TimerCb {}

impl Init for TimerCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl TimerCb {
    pub const fn new() -> Self {
        Self {
            object: KernelObject::new(),
            node: ListNode::new(),
            timeout_fn: CpuLockCell::new(None),
            param: CpuLockCell::new(0),
            init_tick: CpuLockCell::new(0),
            timeout_tick: CpuLockCell::new(0),
            flags: CpuLockCell::new(TimerFlags::empty()),
        }
    }

    pub fn as_object(&self) -> &KernelObject {
        &self.object
    }

    /// Initialize a caller-owned timer and register it.
    pub fn init(
        &'static self,
        name: &str,
        timeout_fn: TimerFn,
        param: usize,
        ticks: Tick,
        periodic: bool,
    ) -> Timer {
        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            self,
            name,
            timeout_fn,
            param,
            ticks,
            periodic,
            ObjectFlags::STATIC,
        );
        Timer(NonNull::from(self))
    }
}

/// The global list of active timers, ordered by expiration.
static TIMER_LIST: ListHead<TimerCb> = ListHead::new();

#[allow(clippy::too_many_arguments)]
fn init_common(
    mut lock: CpuLockTokenRefMut<'_>,
    cb: &TimerCb,
    name: &str,
    timeout_fn: TimerFn,
    param: usize,
    ticks: Tick,
    periodic: bool,
    lifecycle: ObjectFlags,
) {
    cb.timeout_fn.replace(&mut *lock, Some(timeout_fn));
    cb.param.replace(&mut *lock, param);
    cb.init_tick.replace(&mut *lock, ticks);
    cb.timeout_tick.replace(&mut *lock, 0);
    cb.flags.replace(
        &mut *lock,
        if periodic {
            TimerFlags::PERIODIC
        } else {
            TimerFlags::empty()
        },
    );
    cb.node.set_owner(lock.borrow_mut(), ElemRef::new(cb));

    object::register(
        lock,
        &cb.object,
        ObjectClass::Timer,
        name,
        lifecycle,
        NonNull::from(cb),
    );
}

/// Insert an inactive timer into the active list at its sorted position and
/// mark it `ACTIVATED`.
pub(crate) fn start_locked(mut lock: CpuLockTokenRefMut<'_>, cb: &TimerCb) {
    debug_assert!(!cb.flags.read(&*lock).contains(TimerFlags::ACTIVATED));

    let now = timeout::now(lock.borrow_mut());
    let at = now.wrapping_add(cb.init_tick.get(&*lock));
    cb.timeout_tick.replace(&mut *lock, at);

    insert_sorted(lock.borrow_mut(), cb, now);

    let flags = cb.flags.get(&*lock) | TimerFlags::ACTIVATED;
    cb.flags.replace(&mut *lock, flags);
}

/// Cancel a timer. Idempotent: stopping an inactive timer is a no-op.
pub(crate) fn stop_locked(mut lock: CpuLockTokenRefMut<'_>, cb: &TimerCb) {
    if cb.flags.read(&*lock).contains(TimerFlags::ACTIVATED) {
        cb.node.unlink(lock.borrow_mut());
        let flags = cb.flags.get(&*lock) - TimerFlags::ACTIVATED;
        cb.flags.replace(&mut *lock, flags);
    }
}

pub(crate) fn set_ticks_locked(mut lock: CpuLockTokenRefMut<'_>, cb: &TimerCb, ticks: Tick) {
    cb.init_tick.replace(&mut *lock, ticks);
}

/// Initialize a thread's embedded one-shot timer.
pub(crate) fn init_embedded(
    lock: CpuLockTokenRefMut<'_>,
    cb: &TimerCb,
    name: &str,
    timeout_fn: TimerFn,
    param: usize,
) {
    init_common(
        lock,
        cb,
        name,
        timeout_fn,
        param,
        0,
        false,
        ObjectFlags::STATIC,
    );
}

/// Stop a timer and remove it from the registry.
pub(crate) fn detach_locked(mut lock: CpuLockTokenRefMut<'_>, cb: &TimerCb) {
    stop_locked(lock.borrow_mut(), cb);
    object::unregister(lock, &cb.object);
}

fn insert_sorted(mut lock: CpuLockTokenRefMut<'_>, cb: &TimerCb, now: Tick) {
    let key = cb.timeout_tick.get(&*lock).wrapping_sub(now);

    let mut cur = TIMER_LIST.first(lock.borrow_mut());
    while let Some(node) = cur {
        let other = node.elem(lock.borrow_mut());
        let other_key = other.get().timeout_tick.get(&*lock).wrapping_sub(now);
        if other_key > key {
            TIMER_LIST.insert_before(lock.borrow_mut(), node, &cb.node);
            return;
        }
        cur = TIMER_LIST.next(lock.borrow_mut(), node);
    }

    TIMER_LIST.push_back(lock, &cb.node);
}

/// Pop and fire every expired timer. Called by the tick interrupt after the
/// tick count has been advanced.
pub(crate) fn check_expirations() {
    loop {
        let mut lock = lock_cpu();
        let now = timeout::now(lock.borrow_mut());

        let Some(first) = TIMER_LIST.front(lock.borrow_mut()) else {
            return;
        };
        let cb = first.get();

        if !timeout::elapsed(now, cb.timeout_tick.get(&*lock)) {
            return;
        }

        cb.node.unlink(lock.borrow_mut());

        let timeout_fn = cb.timeout_fn.get(&*lock);
        let param = cb.param.get(&*lock);

        if cb.flags.read(&*lock).contains(TimerFlags::PERIODIC) {
            let at = now.wrapping_add(cb.init_tick.get(&*lock));
            cb.timeout_tick.replace(&mut *lock, at);
            insert_sorted(lock.borrow_mut(), cb, now);
        } else {
            let flags = cb.flags.get(&*lock) - TimerFlags::ACTIVATED;
            cb.flags.replace(&mut *lock, flags);
        }

        // Release the critical section before entering the callback; the
        // expired entry is already off the list, so the next iteration
        // re-reads a consistent head.
        drop(lock);

        if let Some(timeout_fn) = timeout_fn {
            timeout_fn(param);
        }
    }
}

/// An owned or borrowed timer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer(NonNull<TimerCb>);

// Safety: `TimerCb` is `Send + Sync`
unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    fn cb(&self) -> &TimerCb {
        // Safety: handles refer to live control blocks; a deleted timer's
        // handle must not be used (`delete` is unsafe)
        unsafe { self.0.as_ref() }
    }

    /// Allocate and register a timer.
    pub fn create(
        name: &str,
        timeout_fn: TimerFn,
        param: usize,
        ticks: Tick,
        periodic: bool,
    ) -> Result<Timer> {
        let cb = Box::leak(Box::new(TimerCb::new()));
        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            cb,
            name,
            timeout_fn,
            param,
            ticks,
            periodic,
            ObjectFlags::empty(),
        );
        Ok(Timer(NonNull::from(cb)))
    }

    /// Find a registered timer by name.
    pub fn find(name: &str) -> Option<Timer> {
        let mut lock = lock_cpu();
        object::find(lock.borrow_mut(), ObjectClass::Timer, name)
            // Safety: objects registered under `ObjectClass::Timer` are
            // always `TimerCb`s
            .map(|owner| Timer(unsafe { owner.cast() }))
    }

    /// Arm the timer. Fails if it is already active.
    pub fn start(&self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if cb.flags.read(&*lock).contains(TimerFlags::ACTIVATED) {
            return Err(Error::Failed);
        }
        start_locked(lock.borrow_mut(), cb);
        Ok(())
    }

    /// Cancel the timer. Idempotent.
    pub fn stop(&self) -> Result {
        let mut lock = lock_cpu();
        stop_locked(lock.borrow_mut(), self.cb());
        Ok(())
    }

    /// Change the armed interval. Takes effect the next time the timer is
    /// started.
    pub fn set_ticks(&self, ticks: Tick) -> Result {
        let mut lock = lock_cpu();
        set_ticks_locked(lock.borrow_mut(), self.cb(), ticks);
        Ok(())
    }

    /// Tear down a caller-owned timer.
    pub fn detach(self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if !cb.object.is_static(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        detach_locked(lock.borrow_mut(), cb);
        Ok(())
    }

    /// Tear down and free a kernel-allocated timer.
    ///
    /// # Safety
    ///
    /// No other handle to this timer may be used afterwards.
    pub unsafe fn delete(self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if cb.object.is_static(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        detach_locked(lock.borrow_mut(), cb);
        drop(lock);

        // Safety: the control block was leaked from a `Box` in `create` and
        // is no longer reachable from any kernel list
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout;

    #[test]
    fn elapsed_is_wrap_safe() {
        assert!(timeout::elapsed(0, 0));
        assert!(timeout::elapsed(50, 50));
        assert!(timeout::elapsed(51, 50));
        assert!(!timeout::elapsed(49, 50));
        // Around the wrap point
        assert!(timeout::elapsed(5, Tick::MAX - 5));
        assert!(!timeout::elapsed(Tick::MAX - 5, 5));
    }
}
