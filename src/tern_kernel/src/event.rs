//! Event flag groups
//!
//! A 32-bit flag set with a single shared wait queue. Each waiter records
//! the bits it wants and how they combine (`AND`/`OR`, optionally `CLEAR`)
//! in its own control block; senders walk the queue head-to-tail and wake
//! every waiter whose condition the updated set satisfies.
use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, ObjectClass, ObjectFlags},
    sched,
    timeout::Tick,
    utils::Init,
    wait::{QueueOrder, WaitFor, WaitQueue},
};

bitflags::bitflags! {
    /// Wait options of an event receive.
    pub struct EventFlags: u8 {
        /// All requested bits must be present.
        const AND = 1 << 0;

        /// Any requested bit suffices.
        const OR = 1 << 1;

        /// Consume the requested bits from the set on a successful receive.
        const CLEAR = 1 << 2;
    }
}

impl Init for EventFlags {
    const INIT: Self = EventFlags::empty();
}

/// Given a wait condition `(want, options)`, check whether `set` satisfies
/// it. Returns the set snapshot to report and applies `CLEAR` to `set` on a
/// match.
///
/// A condition carrying neither `AND` nor `OR` never matches.
fn poll_core(set: &mut u32, want: u32, options: EventFlags) -> Option<u32> {
    let matched = if options.contains(EventFlags::AND) {
        (*set & want) == want
    } else if options.contains(EventFlags::OR) {
        (*set & want) != 0
    } else {
        false
    };

    if matched {
        let snapshot = *set;
        if options.contains(EventFlags::CLEAR) {
            *set &= !want;
        }
        Some(snapshot)
    } else {
        None
    }
}

/// *Event control block* - the state data of an event flag group.
pub struct EventCb {
    object: KernelObject,
    wait_queue: WaitQueue,
    set: CpuLockCell<u32>,
}

// Safety: all mutable state is token-gated
unsafe impl Send for EventCb {}
unsafe impl Sync for EventCb {}

impl Init for EventCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl EventCb {
    pub const fn new() -> Self {
        Self {
            object: KernelObject::new(),
            wait_queue: WaitQueue::new(),
            set: CpuLockCell::new(0),
        }
    }

    pub fn as_object(&self) -> &KernelObject {
        &self.object
    }

    /// Initialize a caller-owned event group and register it.
    pub fn init(&'static self, name: &str, order: QueueOrder) -> Event {
        let mut lock = lock_cpu();
        init_common(lock.borrow_mut(), self, name, order, ObjectFlags::STATIC);
        Event(NonNull::from(self))
    }
}

fn init_common(
    mut lock: CpuLockTokenRefMut<'_>,
    cb: &EventCb,
    name: &str,
    order: QueueOrder,
    lifecycle: ObjectFlags,
) {
    cb.set.replace(&mut *lock, 0);
    cb.wait_queue.set_order(lock.borrow_mut(), order);

    let mut flags = lifecycle;
    if order == QueueOrder::Priority {
        flags |= ObjectFlags::PRIORITY;
    }

    object::register(
        lock,
        &cb.object,
        ObjectClass::Event,
        name,
        flags,
        NonNull::from(cb),
    );
}

/// An opaque event group handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(NonNull<EventCb>);

// Safety: `EventCb` is `Send + Sync`
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    fn cb(&self) -> &EventCb {
        // Safety: handles refer to live control blocks; see `delete`
        unsafe { self.0.as_ref() }
    }

    /// Allocate and register an event group.
    pub fn create(name: &str, order: QueueOrder) -> Result<Event> {
        let cb = Box::leak(Box::new(EventCb::new()));
        let mut lock = lock_cpu();
        init_common(lock.borrow_mut(), cb, name, order, ObjectFlags::empty());
        Ok(Event(NonNull::from(cb)))
    }

    /// Find a registered event group by name.
    pub fn find(name: &str) -> Option<Event> {
        let mut lock = lock_cpu();
        object::find(lock.borrow_mut(), ObjectClass::Event, name)
            // Safety: objects registered under `ObjectClass::Event` are
            // always `EventCb`s
            .map(|owner| Event(unsafe { owner.cast() }))
    }

    /// Set `bits` in the group and wake every waiter whose condition is now
    /// satisfied. Safe to call from an interrupt handler.
    ///
    /// The walk is in queue order, and a waiter with `CLEAR` consumes its
    /// bits immediately, which can keep later waiters blocked even though
    /// their condition held transiently during the walk.
    pub fn send(&self, bits: u32) -> Result {
        if bits == 0 {
            return Err(Error::Failed);
        }

        let mut lock = lock_cpu();
        let cb = self.cb();

        let mut set = cb.set.get(&*lock) | bits;
        let mut woke_any = false;

        let mut cur = cb.wait_queue.first_node(lock.borrow_mut());
        while let Some(node) = cur {
            cur = cb.wait_queue.next_node(lock.borrow_mut(), node);

            let waiter = node.elem(lock.borrow_mut());
            let waiter = waiter.get();
            let want = waiter.event_set.get(&*lock);
            let options = waiter.event_info.get(&*lock);

            if let Some(snapshot) = poll_core(&mut set, want, options) {
                // Store the pre-CLEAR snapshot for the waiter to report.
                waiter.event_set.replace(&mut *lock, snapshot);
                waiter.error.replace(&mut *lock, Ok(()));
                cb.wait_queue.wake_node(lock.borrow_mut(), node);
                woke_any = true;
            }
        }

        cb.set.replace(&mut *lock, set);
        drop(lock);

        if woke_any {
            sched::schedule();
        }
        Ok(())
    }

    /// Receive events, blocking until the condition is satisfied.
    pub fn recv(&self, want: u32, options: EventFlags) -> Result<u32> {
        self.recv_inner(want, options, WaitFor::Forever)
    }

    /// Receive events, blocking for at most `ticks`.
    pub fn recv_timeout(&self, want: u32, options: EventFlags, ticks: Tick) -> Result<u32> {
        self.recv_inner(want, options, WaitFor::Ticks(ticks))
    }

    /// Receive events without blocking.
    pub fn try_recv(&self, want: u32, options: EventFlags) -> Result<u32> {
        self.recv_inner(want, options, WaitFor::Poll)
    }

    fn recv_inner(&self, want: u32, options: EventFlags, wait: WaitFor) -> Result<u32> {
        if want == 0 {
            return Err(Error::Failed);
        }

        let mut lock = lock_cpu();
        let cb = self.cb();

        let mut set = cb.set.get(&*lock);
        if let Some(snapshot) = poll_core(&mut set, want, options) {
            cb.set.replace(&mut *lock, set);
            return Ok(snapshot);
        }

        let timeout = match wait {
            WaitFor::Poll => return Err(Error::Timeout),
            WaitFor::Forever => None,
            WaitFor::Ticks(ticks) => {
                if ticks == 0 {
                    return Err(Error::Timeout);
                }
                Some(ticks)
            }
        };

        let cur = sched::running(lock.borrow_mut()).ok_or(Error::Failed)?;
        cur.cb().event_set.replace(&mut *lock, want);
        cur.cb().event_info.replace(&mut *lock, options);
        cb.wait_queue.suspend_current(lock.borrow_mut(), timeout)?;
        drop(lock);

        sched::schedule();

        let mut lock = lock_cpu();
        if let Err(error) = cur.cb().error.get(&*lock) {
            if error == Error::Timeout {
                cb.wait_queue.forget_waiter(lock.borrow_mut());
            }
            return Err(error);
        }

        // The snapshot was stored over our request mask by the sender.
        Ok(cur.cb().event_set.get(&*lock))
    }

    /// The current flag set.
    pub fn set(&self) -> u32 {
        let lock = lock_cpu();
        self.cb().set.get(&*lock)
    }

    /// The number of threads blocked on the group.
    pub fn waiter_count(&self) -> u32 {
        let mut lock = lock_cpu();
        self.cb().wait_queue.waiter_count(lock.borrow_mut())
    }

    /// Tear down a caller-owned event group, releasing every waiter with
    /// [`Error::Failed`].
    pub fn detach(self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if !cb.object.is_static(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        cb.wait_queue
            .wake_all_with_error(lock.borrow_mut(), Error::Failed);
        object::unregister(lock.borrow_mut(), &cb.object);
        drop(lock);

        sched::schedule();
        Ok(())
    }

    /// Tear down and free a kernel-allocated event group, releasing every
    /// waiter with [`Error::Failed`].
    ///
    /// # Safety
    ///
    /// No other handle to this event group may be used afterwards.
    pub unsafe fn delete(self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if cb.object.is_static(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        cb.wait_queue
            .wake_all_with_error(lock.borrow_mut(), Error::Failed);
        object::unregister(lock.borrow_mut(), &cb.object);
        drop(lock);

        // Safety: see `Semaphore::delete`
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });

        sched::schedule();
        Ok(())
    }
}
