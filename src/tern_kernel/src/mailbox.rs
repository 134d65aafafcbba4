//! Mailboxes
//!
//! A mailbox is a fixed-capacity ring of machine words. Receivers block when
//! the ring is empty; senders never block; a full mailbox fails the send
//! with [`Error::Full`].
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

/// *Mailbox control block* - the state data of a mailbox.
///
/// Invariant: `entry == (in_offset - out_offset) mod size`.
pub struct MailboxCb {
    object: KernelObject,
    wait_queue: WaitQueue,

    /// The ring storage, `size` machine words.
    pool: CpuLockCell<usize>,
    size: CpuLockCell<usize>,

    in_offset: CpuLockCell<usize>,
    out_offset: CpuLockCell<usize>,
    entry: CpuLockCell<usize>,
}

// Safety: all mutable state is token-gated; the pool is only accessed inside
// the critical section
unsafe impl Send for MailboxCb {}
unsafe impl Sync for MailboxCb {}

impl Init for MailboxCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl MailboxCb {
    pub const fn new() -> Self {
        Self {
            object: KernelObject::new(),
            wait_queue: WaitQueue::new(),
            pool: CpuLockCell::new(0),
            size: CpuLockCell::new(0),
            in_offset: CpuLockCell::new(0),
            out_offset: CpuLockCell::new(0),
            entry: CpuLockCell::new(0),
        }
    }

    pub fn as_object(&self) -> &KernelObject {
        &self.object
    }

    /// Initialize a caller-owned mailbox over a caller-owned pool of `size`
    /// machine words.
    ///
    /// # Safety
    ///
    /// `pool` must point to a region of `size` words owned exclusively by
    /// this mailbox for its entire lifetime.
    pub unsafe fn init(
        &'static self,
        name: &str,
        pool: *mut usize,
        size: usize,
        order: QueueOrder,
    ) -> Mailbox {
        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            self,
            name,
            pool,
            size,
            order,
            ObjectFlags::STATIC,
        );
        Mailbox(NonNull::from(self))
    }

    fn slot(&self, lock: CpuLockTokenRefMut<'_>, index: usize) -> *mut usize {
        let pool = self.pool.get(&*lock) as *mut usize;
        debug_assert!(index < self.size.get(&*lock));
        pool.wrapping_add(index)
    }
}

fn init_common(
    mut lock: CpuLockTokenRefMut<'_>,
    cb: &MailboxCb,
    name: &str,
    pool: *mut usize,
    size: usize,
    order: QueueOrder,
    lifecycle: ObjectFlags,
) {
    assert!(size > 0, "mailbox capacity must be non-zero");

    cb.pool.replace(&mut *lock, pool as usize);
    cb.size.replace(&mut *lock, size);
    cb.in_offset.replace(&mut *lock, 0);
    cb.out_offset.replace(&mut *lock, 0);
    cb.entry.replace(&mut *lock, 0);
    cb.wait_queue.set_order(lock.borrow_mut(), order);

    let mut flags = lifecycle;
    if order == QueueOrder::Priority {
        flags |= ObjectFlags::PRIORITY;
    }

    object::register(
        lock,
        &cb.object,
        ObjectClass::Mailbox,
        name,
        flags,
        NonNull::from(cb),
    );
}

/// An opaque mailbox handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox(NonNull<MailboxCb>);

// Safety: `MailboxCb` is `Send + Sync`
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    fn cb(&self) -> &MailboxCb {
        // Safety: handles refer to live control blocks; see `delete`
        unsafe { self.0.as_ref() }
    }

    /// Allocate and register a mailbox holding up to `size` words.
    pub fn create(name: &str, size: usize, order: QueueOrder) -> Result<Mailbox> {
        let cb = Box::leak(Box::new(MailboxCb::new()));
        let pool = Box::leak(alloc::vec![0usize; size].into_boxed_slice());

        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            cb,
            name,
            pool.as_mut_ptr(),
            size,
            order,
            ObjectFlags::empty(),
        );
        Ok(Mailbox(NonNull::from(cb)))
    }

    /// Find a registered mailbox by name.
    pub fn find(name: &str) -> Option<Mailbox> {
        let mut lock = lock_cpu();
        object::find(lock.borrow_mut(), ObjectClass::Mailbox, name)
            // Safety: objects registered under `ObjectClass::Mailbox` are
            // always `MailboxCb`s
            .map(|owner| Mailbox(unsafe { owner.cast() }))
    }

    /// Post one word, waking the head receiver if there is one. Never
    /// blocks; a full mailbox fails with [`Error::Full`]. Safe to call from
    /// an interrupt handler.
    pub fn send(&self, value: usize) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();

        let size = cb.size.get(&*lock);
        let entry = cb.entry.get(&*lock);
        if entry == size {
            return Err(Error::Full);
        }

        let in_offset = cb.in_offset.get(&*lock);
        // Safety: `in_offset < size`, and the pool is owned by the mailbox
        unsafe { *cb.slot(lock.borrow_mut(), in_offset) = value };
        cb.in_offset.replace(&mut *lock, (in_offset + 1) % size);
        cb.entry.replace(&mut *lock, entry + 1);

        let woke = cb.wait_queue.wake_one(lock.borrow_mut());
        drop(lock);

        if woke {
            sched::schedule();
        }
        Ok(())
    }

    /// Receive one word, blocking while the mailbox is empty.
    pub fn recv(&self) -> Result<usize> {
        self.recv_inner(WaitFor::Forever)
    }

    /// Receive one word, blocking for at most `ticks`.
    pub fn recv_timeout(&self, ticks: Tick) -> Result<usize> {
        self.recv_inner(WaitFor::Ticks(ticks))
    }

    /// Receive one word without blocking.
    pub fn try_recv(&self) -> Result<usize> {
        self.recv_inner(WaitFor::Poll)
    }

    fn recv_inner(&self, wait: WaitFor) -> Result<usize> {
        let mut lock = lock_cpu();
        let cb = self.cb();

        if cb.entry.get(&*lock) == 0 {
            let timeout = match wait {
                WaitFor::Poll => return Err(Error::Empty),
                WaitFor::Forever => None,
                WaitFor::Ticks(ticks) => {
                    if ticks == 0 {
                        return Err(Error::Timeout);
                    }
                    Some(ticks)
                }
            };

            let cur = cb.wait_queue.suspend_current(lock.borrow_mut(), timeout)?;
            drop(lock);

            sched::schedule();

            lock = lock_cpu();
            if let Err(error) = cur.cb().error.get(&*lock) {
                if error == Error::Timeout {
                    cb.wait_queue.forget_waiter(lock.borrow_mut());
                }
                return Err(error);
            }
        }

        let size = cb.size.get(&*lock);
        let out_offset = cb.out_offset.get(&*lock);
        debug_assert!(cb.entry.get(&*lock) > 0);

        // Safety: `out_offset < size`, and the pool is owned by the mailbox
        let value = unsafe { *cb.slot(lock.borrow_mut(), out_offset) };
        cb.out_offset.replace(&mut *lock, (out_offset + 1) % size);
        cb.entry.replace_with(&mut *lock, |e| *e - 1);

        Ok(value)
    }

    /// The number of words currently queued.
    pub fn entry(&self) -> usize {
        let lock = lock_cpu();
        self.cb().entry.get(&*lock)
    }

    /// The number of threads blocked on the mailbox.
    pub fn waiter_count(&self) -> u32 {
        let mut lock = lock_cpu();
        self.cb().wait_queue.waiter_count(lock.borrow_mut())
    }

    /// Tear down a caller-owned mailbox, releasing every waiter with
    /// [`Error::Failed`]. The pool is returned to the caller untouched.
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

    /// Tear down and free a kernel-allocated mailbox, releasing every waiter
    /// with [`Error::Failed`].
    ///
    /// # Safety
    ///
    /// No other handle to this mailbox may be used afterwards.
    pub unsafe fn delete(self) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();
        if cb.object.is_static(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        cb.wait_queue
            .wake_all_with_error(lock.borrow_mut(), Error::Failed);
        object::unregister(lock.borrow_mut(), &cb.object);

        let pool = cb.pool.get(&*lock) as *mut usize;
        let size = cb.size.get(&*lock);
        drop(lock);

        // Safety: both allocations were leaked from `Box`es in `create` and
        // are no longer reachable; the waiters are gone
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                pool, size,
            )));
            drop(Box::from_raw(self.0.as_ptr()));
        }

        sched::schedule();
        Ok(())
    }
}
