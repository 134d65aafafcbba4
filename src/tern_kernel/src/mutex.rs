//! Mutexes
//!
//! A mutex is recursively lockable by its owner and applies single-level
//! priority inheritance: a waiter of higher urgency raises the owner's
//! current priority to its own for the duration of the hold. A thread may
//! hold several mutexes at once; they chain through the owner's
//! `last_mutex_held` list, and each release restores the holder to the most
//! urgent demand that remains: the highest-urgency waiter across the
//! mutexes it still holds, or its initial priority once none is contended.
use alloc::boxed::Box;
use core::{fmt, ptr::NonNull};

use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, ObjectClass, ObjectFlags},
    sched,
    thread::{self, Thread, ThreadRef},
    timeout::Tick,
    utils::Init,
    wait::{QueueOrder, WaitFor, WaitQueue},
};

/// A reference to a [`MutexCb`].
pub(crate) struct MutexRef(NonNull<MutexCb>);

// Safety: `MutexCb` is `Send + Sync`
unsafe impl Send for MutexRef {}
unsafe impl Sync for MutexRef {}

impl Clone for MutexRef {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl Copy for MutexRef {}

impl PartialEq for MutexRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for MutexRef {}

impl fmt::Debug for MutexRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MutexRef").field(&self.0).finish()
    }
}

impl MutexRef {
    fn new(cb: &MutexCb) -> Self {
        Self(NonNull::from(cb))
    }

    /// Dereference the control block. Chained mutexes are live: a mutex is
    /// taken off its owner's chain before it can be torn down.
    fn cb(&self) -> &MutexCb {
        // Safety: see above
        unsafe { self.0.as_ref() }
    }
}

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb {
    object: KernelObject,
    wait_queue: WaitQueue,

    /// `1` iff the mutex is free. `owner.is_none() ⇔ value == 1`.
    value: CpuLockCell<u8>,

    owner: CpuLockCell<Option<ThreadRef>>,

    /// The owner's current priority at the time of acquisition, kept for
    /// diagnostics.
    original_priority: CpuLockCell<u8>,

    /// Recursion depth of the owner's hold.
    hold: CpuLockCell<u32>,

    /// The next entry in the chain of mutexes held by the owner, headed by
    /// `ThreadCb::last_mutex_held`.
    prev_mutex_held: CpuLockCell<Option<MutexRef>>,
}

// Safety: all mutable state is token-gated
unsafe impl Send for MutexCb {}
unsafe impl Sync for MutexCb {}

impl Init for MutexCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl MutexCb {
    pub const fn new() -> Self {
        Self {
            object: KernelObject::new(),
            wait_queue: WaitQueue::new(),
            value: CpuLockCell::new(1),
            owner: CpuLockCell::new(None),
            original_priority: CpuLockCell::new(0),
            hold: CpuLockCell::new(0),
            prev_mutex_held: CpuLockCell::new(None),
        }
    }

    pub fn as_object(&self) -> &KernelObject {
        &self.object
    }

    /// Initialize a caller-owned mutex and register it.
    pub fn init(&'static self, name: &str, order: QueueOrder) -> Mutex {
        let mut lock = lock_cpu();
        init_common(lock.borrow_mut(), self, name, order, ObjectFlags::STATIC);
        Mutex(NonNull::from(self))
    }
}

fn init_common(
    mut lock: CpuLockTokenRefMut<'_>,
    cb: &MutexCb,
    name: &str,
    order: QueueOrder,
    lifecycle: ObjectFlags,
) {
    cb.value.replace(&mut *lock, 1);
    cb.owner.replace(&mut *lock, None);
    cb.original_priority.replace(&mut *lock, 0);
    cb.hold.replace(&mut *lock, 0);
    cb.prev_mutex_held.replace(&mut *lock, None);
    cb.wait_queue.set_order(lock.borrow_mut(), order);

    let mut flags = lifecycle;
    if order == QueueOrder::Priority {
        flags |= ObjectFlags::PRIORITY;
    }

    object::register(
        lock,
        &cb.object,
        ObjectClass::Mutex,
        name,
        flags,
        NonNull::from(cb),
    );
}

/// Give the ownership of the mutex to `thread` and push it onto the chain of
/// mutexes the thread holds.
fn grant_locked(mut lock: CpuLockTokenRefMut<'_>, cb: &MutexCb, thread: ThreadRef) {
    cb.value.replace(&mut *lock, 0);
    cb.owner.replace(&mut *lock, Some(thread));
    let current_priority = thread.cb().priority.get(&*lock).current();
    cb.original_priority
        .replace(&mut *lock, current_priority);
    cb.hold.replace(&mut *lock, 1);

    let prev = thread
        .cb()
        .last_mutex_held
        .replace(&mut *lock, Some(MutexRef::new(cb)));
    cb.prev_mutex_held.replace(&mut *lock, prev);
}

/// Unlink `cb` from the chain of mutexes held by `thread`. Mutexes may be
/// released in any order, so the chain is searched.
fn forget_held_locked(mut lock: CpuLockTokenRefMut<'_>, thread: ThreadRef, cb: &MutexCb) {
    let target = MutexRef::new(cb);

    let mut cur = thread.cb().last_mutex_held.get(&*lock);
    if cur == Some(target) {
        let prev = cb.prev_mutex_held.replace(&mut *lock, None);
        thread.cb().last_mutex_held.replace(&mut *lock, prev);
        return;
    }

    while let Some(held) = cur {
        let prev = held.cb().prev_mutex_held.get(&*lock);
        if prev == Some(target) {
            let rest = cb.prev_mutex_held.replace(&mut *lock, None);
            held.cb().prev_mutex_held.replace(&mut *lock, rest);
            return;
        }
        cur = prev;
    }

    debug_assert!(false, "mutex is not on the owner's held chain");
}

/// The priority `thread` should run at: its initial priority, raised to the
/// most urgent waiter across every mutex it still holds.
fn evaluate_held_priority(mut lock: CpuLockTokenRefMut<'_>, thread: ThreadRef) -> u8 {
    let mut priority = thread.cb().init_priority.get(&*lock);

    let mut cur = thread.cb().last_mutex_held.get(&*lock);
    while let Some(held) = cur {
        if let Some(waiter) = held
            .cb()
            .wait_queue
            .highest_waiter_priority(lock.borrow_mut())
        {
            priority = priority.min(waiter);
        }
        cur = held.cb().prev_mutex_held.get(&*lock);
    }
    priority
}

/// An opaque mutex handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex(NonNull<MutexCb>);

// Safety: `MutexCb` is `Send + Sync`
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    fn cb(&self) -> &MutexCb {
        // Safety: handles refer to live control blocks; see `delete`
        unsafe { self.0.as_ref() }
    }

    /// Allocate and register a mutex.
    pub fn create(name: &str, order: QueueOrder) -> Result<Mutex> {
        let cb = Box::leak(Box::new(MutexCb::new()));
        let mut lock = lock_cpu();
        init_common(lock.borrow_mut(), cb, name, order, ObjectFlags::empty());
        Ok(Mutex(NonNull::from(cb)))
    }

    /// Find a registered mutex by name.
    pub fn find(name: &str) -> Option<Mutex> {
        let mut lock = lock_cpu();
        object::find(lock.borrow_mut(), ObjectClass::Mutex, name)
            // Safety: objects registered under `ObjectClass::Mutex` are
            // always `MutexCb`s
            .map(|owner| Mutex(unsafe { owner.cast() }))
    }

    /// Take the mutex, blocking until it is available.
    pub fn take(&self) -> Result {
        self.take_inner(WaitFor::Forever)
    }

    /// Take the mutex, blocking for at most `ticks`.
    pub fn take_timeout(&self, ticks: Tick) -> Result {
        self.take_inner(WaitFor::Ticks(ticks))
    }

    /// Take the mutex without blocking.
    pub fn try_take(&self) -> Result {
        self.take_inner(WaitFor::Poll)
    }

    fn take_inner(&self, wait: WaitFor) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();

        let cur = sched::running(lock.borrow_mut()).ok_or(Error::Failed)?;

        if cb.owner.get(&*lock) == Some(cur) {
            cb.hold.replace_with(&mut *lock, |h| *h + 1);
            return Ok(());
        }

        if cb.value.get(&*lock) > 0 {
            grant_locked(lock.borrow_mut(), cb, cur);
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

        // Priority inheritance: raise the owner to the waiter's urgency.
        let owner = cb.owner.get(&*lock).unwrap();
        let own_priority = cur.cb().priority.get(&*lock).current();
        if own_priority < owner.cb().priority.get(&*lock).current() {
            thread::change_priority_locked(lock.borrow_mut(), owner, own_priority);
        }

        cb.wait_queue.suspend_current(lock.borrow_mut(), timeout)?;
        drop(lock);

        sched::schedule();

        let mut lock = lock_cpu();
        if let Err(error) = cur.cb().error.get(&*lock) {
            if error == Error::Timeout {
                cb.wait_queue.forget_waiter(lock.borrow_mut());
            }
            // The owner's inherited priority is deliberately left in place
            // on a waiter timeout; it is restored when the owner releases.
            return Err(error);
        }

        // The releaser handed the ownership over before waking us;
        // re-assert it under this fresh critical section.
        debug_assert_eq!(cb.owner.get(&*lock), Some(cur));
        cb.owner.replace(&mut *lock, Some(cur));
        cb.hold.replace(&mut *lock, 1);
        Ok(())
    }

    /// Release the mutex. Fails unless the calling thread is the owner.
    pub fn release(&self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();

        let cur = sched::running(lock.borrow_mut()).ok_or(Error::Failed)?;

        if cb.owner.get(&*lock) != Some(cur) {
            return Err(Error::Failed);
        }

        let hold = cb.hold.get(&*lock) - 1;
        cb.hold.replace(&mut *lock, hold);
        if hold > 0 {
            return Ok(());
        }

        // This mutex's waiters no longer count towards the holder's
        // priority; shed exactly the inheritance the remaining held mutexes
        // do not demand.
        forget_held_locked(lock.borrow_mut(), cur, cb);
        let restored = evaluate_held_priority(lock.borrow_mut(), cur);
        if cur.cb().priority.get(&*lock).current() != restored {
            thread::change_priority_locked(lock.borrow_mut(), cur, restored);
        }

        if let Some(next) = cb.wait_queue.front(lock.borrow_mut()) {
            // Hand the ownership to the head waiter; `value` stays 0.
            grant_locked(lock.borrow_mut(), cb, next);
            let woke = cb.wait_queue.wake_one(lock.borrow_mut());
            debug_assert!(woke);
        } else {
            cb.value.replace(&mut *lock, 1);
            cb.owner.replace(&mut *lock, None);
        }
        drop(lock);

        sched::schedule();
        Ok(())
    }

    /// The current owner, if any.
    pub fn owner(&self) -> Option<Thread> {
        let lock = lock_cpu();
        self.cb().owner.get(&*lock).map(Thread)
    }

    /// The owner's recursion depth; `0` when the mutex is free.
    pub fn hold(&self) -> u32 {
        let lock = lock_cpu();
        self.cb().hold.get(&*lock)
    }

    /// The number of threads blocked on the mutex.
    pub fn waiter_count(&self) -> u32 {
        let mut lock = lock_cpu();
        self.cb().wait_queue.waiter_count(lock.borrow_mut())
    }

    /// Tear down a caller-owned mutex, releasing every waiter with
    /// [`Error::Failed`].
    pub fn detach(self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if !cb.object.is_static(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        if let Some(owner) = cb.owner.get(&*lock) {
            forget_held_locked(lock.borrow_mut(), owner, cb);
        }
        cb.wait_queue
            .wake_all_with_error(lock.borrow_mut(), Error::Failed);
        object::unregister(lock.borrow_mut(), &cb.object);
        drop(lock);

        sched::schedule();
        Ok(())
    }

    /// Tear down and free a kernel-allocated mutex, releasing every waiter
    /// with [`Error::Failed`].
    ///
    /// # Safety
    ///
    /// No other handle to this mutex may be used afterwards.
    pub unsafe fn delete(self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if cb.object.is_static(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        if let Some(owner) = cb.owner.get(&*lock) {
            forget_held_locked(lock.borrow_mut(), owner, cb);
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
