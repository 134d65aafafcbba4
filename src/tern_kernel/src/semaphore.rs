//! Semaphores
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

/// *Semaphore control block* - the state data of a semaphore.
///
/// `value > 0` is the number of available permits; `-value` is the number of
/// blocked takers otherwise (`waiter_count == max(0, -value)` at all times).
pub struct SemaphoreCb {
    object: KernelObject,
    wait_queue: WaitQueue,
    value: CpuLockCell<i32>,
}

// Safety: all mutable state is token-gated
unsafe impl Send for SemaphoreCb {}
unsafe impl Sync for SemaphoreCb {}

impl Init for SemaphoreCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl SemaphoreCb {
    pub const fn new() -> Self {
        Self {
            object: KernelObject::new(),
            wait_queue: WaitQueue::new(),
            value: CpuLockCell::new(0),
        }
    }

    pub fn as_object(&self) -> &KernelObject {
        &self.object
    }

    /// Initialize a caller-owned semaphore and register it.
    pub fn init(&'static self, name: &str, value: i32, order: QueueOrder) -> Semaphore {
        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            self,
            name,
            value,
            order,
            ObjectFlags::STATIC,
        );
        Semaphore(NonNull::from(self))
    }
}

fn init_common(
    mut lock: CpuLockTokenRefMut<'_>,
    cb: &SemaphoreCb,
    name: &str,
    value: i32,
    order: QueueOrder,
    lifecycle: ObjectFlags,
) {
    cb.value.replace(&mut *lock, value);
    cb.wait_queue.set_order(lock.borrow_mut(), order);

    let mut flags = lifecycle;
    if order == QueueOrder::Priority {
        flags |= ObjectFlags::PRIORITY;
    }

    object::register(
        lock,
        &cb.object,
        ObjectClass::Semaphore,
        name,
        flags,
        NonNull::from(cb),
    );
}

/// An opaque semaphore handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore(NonNull<SemaphoreCb>);

// Safety: `SemaphoreCb` is `Send + Sync`
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn cb(&self) -> &SemaphoreCb {
        // Safety: handles refer to live control blocks; see `delete`
        unsafe { self.0.as_ref() }
    }

    /// Allocate and register a semaphore.
    pub fn create(name: &str, value: i32, order: QueueOrder) -> Result<Semaphore> {
        let cb = Box::leak(Box::new(SemaphoreCb::new()));
        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            cb,
            name,
            value,
            order,
            ObjectFlags::empty(),
        );
        Ok(Semaphore(NonNull::from(cb)))
    }

    /// Find a registered semaphore by name.
    pub fn find(name: &str) -> Option<Semaphore> {
        let mut lock = lock_cpu();
        object::find(lock.borrow_mut(), ObjectClass::Semaphore, name)
            // Safety: objects registered under `ObjectClass::Semaphore` are
            // always `SemaphoreCb`s
            .map(|owner| Semaphore(unsafe { owner.cast() }))
    }

    /// Take the semaphore, blocking until a permit is available.
    pub fn take(&self) -> Result {
        self.take_inner(WaitFor::Forever)
    }

    /// Take the semaphore, blocking for at most `ticks`.
    pub fn take_timeout(&self, ticks: Tick) -> Result {
        self.take_inner(WaitFor::Ticks(ticks))
    }

    /// Take the semaphore without blocking.
    pub fn try_take(&self) -> Result {
        self.take_inner(WaitFor::Poll)
    }

    fn take_inner(&self, wait: WaitFor) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();

        let value = cb.value.get(&*lock);
        if value > 0 {
            cb.value.replace(&mut *lock, value - 1);
            return Ok(());
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

        // Drive the value negative and park on the wait queue.
        cb.value.replace(&mut *lock, value - 1);
        let cur = match cb.wait_queue.suspend_current(lock.borrow_mut(), timeout) {
            Ok(cur) => cur,
            Err(error) => {
                cb.value.replace(&mut *lock, value);
                return Err(error);
            }
        };
        drop(lock);

        sched::schedule();

        let mut lock = lock_cpu();
        if let Err(error) = cur.cb().error.get(&*lock) {
            // Only the timeout path leaves the accounting inflated. A waiter
            // released by a teardown must not touch the object at all.
            if error == Error::Timeout {
                cb.wait_queue.forget_waiter(lock.borrow_mut());
                cb.value.replace_with(&mut *lock, |v| *v + 1);
            }
            return Err(error);
        }
        Ok(())
    }

    /// Release one permit, waking the head waiter if there is one.
    /// Safe to call from an interrupt handler.
    pub fn release(&self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();

        let value = cb.value.get(&*lock) + 1;
        cb.value.replace(&mut *lock, value);

        let woke = value <= 0 && cb.wait_queue.wake_one(lock.borrow_mut());
        drop(lock);

        if woke {
            sched::schedule();
        }
        Ok(())
    }

    /// The current value. Negative values count blocked takers.
    pub fn value(&self) -> i32 {
        let lock = lock_cpu();
        self.cb().value.get(&*lock)
    }

    /// The number of threads blocked on the semaphore.
    pub fn waiter_count(&self) -> u32 {
        let mut lock = lock_cpu();
        self.cb().wait_queue.waiter_count(lock.borrow_mut())
    }

    /// Tear down a caller-owned semaphore, releasing every waiter with
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

    /// Tear down and free a kernel-allocated semaphore, releasing every
    /// waiter with [`Error::Failed`].
    ///
    /// # Safety
    ///
    /// No other handle to this semaphore may be used afterwards.
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

        // Safety: the control block was leaked from a `Box` in `create` and
        // is no longer reachable from the registry; the waiters are gone
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });

        sched::schedule();
        Ok(())
    }
}
