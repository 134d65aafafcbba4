//! Message queues
//!
//! A message queue stores variable-size messages (up to a fixed `msg_size`)
//! in a pool sliced into uniform slots. Each slot starts with one in-band
//! link word; the slots are partitioned between a free list and a FIFO of
//! occupied slots at all times. `urgent` prepends to the FIFO instead of
//! appending. Receivers block on an empty queue; senders never block; a
//! full queue fails the send with [`Error::Full`].
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

const WORD: usize = core::mem::size_of::<usize>();

/// The number of words in one slot: the link word plus the payload rounded
/// up to whole words.
const fn slot_words(msg_size: usize) -> usize {
    1 + (msg_size + WORD - 1) / WORD
}

/// The pool words needed for a queue of `max_msgs` messages of `msg_size`.
pub const fn pool_words(msg_size: usize, max_msgs: usize) -> usize {
    slot_words(msg_size) * max_msgs
}

/// *Message queue control block* - the state data of a message queue.
///
/// Invariant: every slot is on exactly one of the free list and the occupied
/// FIFO, and `entry` equals the length of the FIFO.
pub struct MessageQueueCb {
    object: KernelObject,
    wait_queue: WaitQueue,

    pool: CpuLockCell<usize>,
    msg_size: CpuLockCell<usize>,
    max_msgs: CpuLockCell<usize>,

    entry: CpuLockCell<usize>,

    /// Head and tail of the occupied FIFO. Slot addresses; `0` when empty.
    head: CpuLockCell<usize>,
    tail: CpuLockCell<usize>,

    /// Head of the free list. Slot address; `0` when exhausted.
    free: CpuLockCell<usize>,
}

// Safety: all mutable state is token-gated; the pool is only accessed inside
// the critical section
unsafe impl Send for MessageQueueCb {}
unsafe impl Sync for MessageQueueCb {}

impl Init for MessageQueueCb {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// Read a slot's link word.
unsafe fn slot_next(slot: usize) -> usize {
    // Safety: `slot` is a word-aligned slot address inside the pool
    unsafe { *(slot as *const usize) }
}

/// Write a slot's link word.
unsafe fn set_slot_next(slot: usize, next: usize) {
    // Safety: see `slot_next`
    unsafe { *(slot as *mut usize) = next };
}

/// The payload area immediately after the link word.
fn slot_payload(slot: usize) -> *mut u8 {
    (slot + WORD) as *mut u8
}

impl MessageQueueCb {
    pub const fn new() -> Self {
        Self {
            object: KernelObject::new(),
            wait_queue: WaitQueue::new(),
            pool: CpuLockCell::new(0),
            msg_size: CpuLockCell::new(0),
            max_msgs: CpuLockCell::new(0),
            entry: CpuLockCell::new(0),
            head: CpuLockCell::new(0),
            tail: CpuLockCell::new(0),
            free: CpuLockCell::new(0),
        }
    }

    pub fn as_object(&self) -> &KernelObject {
        &self.object
    }

    /// Initialize a caller-owned message queue over a caller-owned pool of
    /// [`pool_words`]`(msg_size, max_msgs)` machine words.
    ///
    /// # Safety
    ///
    /// `pool` must point to a region of that many words owned exclusively by
    /// this queue for its entire lifetime.
    pub unsafe fn init(
        &'static self,
        name: &str,
        pool: *mut usize,
        msg_size: usize,
        max_msgs: usize,
        order: QueueOrder,
    ) -> MessageQueue {
        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            self,
            name,
            pool,
            msg_size,
            max_msgs,
            order,
            ObjectFlags::STATIC,
        );
        MessageQueue(NonNull::from(self))
    }

    /// Pop a slot off the free list.
    fn alloc_slot(&self, mut lock: CpuLockTokenRefMut<'_>) -> Option<usize> {
        let slot = self.free.get(&*lock);
        if slot == 0 {
            return None;
        }
        // Safety: free-listed slots live inside the pool
        self.free.replace(&mut *lock, unsafe { slot_next(slot) });
        Some(slot)
    }

    /// Return a slot to the free list.
    fn free_slot(&self, mut lock: CpuLockTokenRefMut<'_>, slot: usize) {
        let free = self.free.get(&*lock);
        // Safety: `slot` lives inside the pool
        unsafe { set_slot_next(slot, free) };
        self.free.replace(&mut *lock, slot);
    }
}

#[allow(clippy::too_many_arguments)]
fn init_common(
    mut lock: CpuLockTokenRefMut<'_>,
    cb: &MessageQueueCb,
    name: &str,
    pool: *mut usize,
    msg_size: usize,
    max_msgs: usize,
    order: QueueOrder,
    lifecycle: ObjectFlags,
) {
    assert!(msg_size > 0 && max_msgs > 0, "empty message queue geometry");

    cb.pool.replace(&mut *lock, pool as usize);
    cb.msg_size.replace(&mut *lock, msg_size);
    cb.max_msgs.replace(&mut *lock, max_msgs);
    cb.entry.replace(&mut *lock, 0);
    cb.head.replace(&mut *lock, 0);
    cb.tail.replace(&mut *lock, 0);
    cb.wait_queue.set_order(lock.borrow_mut(), order);

    // Thread every slot onto the free list.
    cb.free.replace(&mut *lock, 0);
    let words = slot_words(msg_size);
    for i in 0..max_msgs {
        let slot = pool.wrapping_add(i * words) as usize;
        cb.free_slot(lock.borrow_mut(), slot);
    }

    let mut flags = lifecycle;
    if order == QueueOrder::Priority {
        flags |= ObjectFlags::PRIORITY;
    }

    object::register(
        lock,
        &cb.object,
        ObjectClass::MessageQueue,
        name,
        flags,
        NonNull::from(cb),
    );
}

/// An opaque message queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueue(NonNull<MessageQueueCb>);

// Safety: `MessageQueueCb` is `Send + Sync`
unsafe impl Send for MessageQueue {}
unsafe impl Sync for MessageQueue {}

impl MessageQueue {
    fn cb(&self) -> &MessageQueueCb {
        // Safety: handles refer to live control blocks; see `delete`
        unsafe { self.0.as_ref() }
    }

    /// Allocate and register a message queue of `max_msgs` messages of up to
    /// `msg_size` bytes each.
    pub fn create(
        name: &str,
        msg_size: usize,
        max_msgs: usize,
        order: QueueOrder,
    ) -> Result<MessageQueue> {
        let cb = Box::leak(Box::new(MessageQueueCb::new()));
        let pool = Box::leak(alloc::vec![0usize; pool_words(msg_size, max_msgs)].into_boxed_slice());

        let mut lock = lock_cpu();
        init_common(
            lock.borrow_mut(),
            cb,
            name,
            pool.as_mut_ptr(),
            msg_size,
            max_msgs,
            order,
            ObjectFlags::empty(),
        );
        Ok(MessageQueue(NonNull::from(cb)))
    }

    /// Find a registered message queue by name.
    pub fn find(name: &str) -> Option<MessageQueue> {
        let mut lock = lock_cpu();
        object::find(lock.borrow_mut(), ObjectClass::MessageQueue, name)
            // Safety: objects registered under `ObjectClass::MessageQueue`
            // are always `MessageQueueCb`s
            .map(|owner| MessageQueue(unsafe { owner.cast() }))
    }

    /// Append a message, waking the head receiver if there is one. Never
    /// blocks; a full queue fails with [`Error::Full`], an oversized message
    /// with [`Error::Failed`]. Safe to call from an interrupt handler.
    pub fn send(&self, msg: &[u8]) -> Result {
        self.send_inner(msg, false)
    }

    /// Like [`send`](Self::send), but the message jumps the FIFO and is
    /// received before everything already queued.
    pub fn urgent(&self, msg: &[u8]) -> Result {
        self.send_inner(msg, true)
    }

    fn send_inner(&self, msg: &[u8], urgent: bool) -> Result {
        let mut lock = lock_cpu();
        let cb = self.cb();

        if msg.len() > cb.msg_size.get(&*lock) {
            return Err(Error::Failed);
        }

        let Some(slot) = cb.alloc_slot(lock.borrow_mut()) else {
            return Err(Error::Full);
        };

        // Safety: the payload area holds `msg_size` bytes and the slot is
        // not reachable from either list at this point
        unsafe {
            core::ptr::copy_nonoverlapping(msg.as_ptr(), slot_payload(slot), msg.len());
        }

        if urgent {
            let head = cb.head.get(&*lock);
            // Safety: `slot` lives inside the pool
            unsafe { set_slot_next(slot, head) };
            cb.head.replace(&mut *lock, slot);
            if head == 0 {
                cb.tail.replace(&mut *lock, slot);
            }
        } else {
            // Safety: `slot` lives inside the pool
            unsafe { set_slot_next(slot, 0) };
            let tail = cb.tail.get(&*lock);
            if tail != 0 {
                // Safety: the old tail is an occupied slot inside the pool
                unsafe { set_slot_next(tail, slot) };
            } else {
                cb.head.replace(&mut *lock, slot);
            }
            cb.tail.replace(&mut *lock, slot);
        }

        cb.entry.replace_with(&mut *lock, |e| *e + 1);

        let woke = cb.wait_queue.wake_one(lock.borrow_mut());
        drop(lock);

        if woke {
            sched::schedule();
        }
        Ok(())
    }

    /// Receive the head message into `buf`, blocking while the queue is
    /// empty. Returns the number of bytes copied (the payload is truncated
    /// to `buf.len()`).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_inner(buf, WaitFor::Forever)
    }

    /// Receive the head message, blocking for at most `ticks`.
    pub fn recv_timeout(&self, buf: &mut [u8], ticks: Tick) -> Result<usize> {
        self.recv_inner(buf, WaitFor::Ticks(ticks))
    }

    /// Receive the head message without blocking.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_inner(buf, WaitFor::Poll)
    }

    fn recv_inner(&self, buf: &mut [u8], wait: WaitFor) -> Result<usize> {
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

        debug_assert!(cb.entry.get(&*lock) > 0);

        let slot = cb.head.get(&*lock);
        // Safety: the head is an occupied slot inside the pool
        let next = unsafe { slot_next(slot) };
        cb.head.replace(&mut *lock, next);
        if next == 0 {
            cb.tail.replace(&mut *lock, 0);
        }
        cb.entry.replace_with(&mut *lock, |e| *e - 1);

        let len = buf.len().min(cb.msg_size.get(&*lock));
        // Safety: the payload area holds `msg_size` bytes
        unsafe {
            core::ptr::copy_nonoverlapping(slot_payload(slot) as *const u8, buf.as_mut_ptr(), len);
        }

        cb.free_slot(lock.borrow_mut(), slot);
        Ok(len)
    }

    /// The number of messages currently queued.
    pub fn entry(&self) -> usize {
        let lock = lock_cpu();
        self.cb().entry.get(&*lock)
    }

    /// The number of threads blocked on the queue.
    pub fn waiter_count(&self) -> u32 {
        let mut lock = lock_cpu();
        self.cb().wait_queue.waiter_count(lock.borrow_mut())
    }

    /// Tear down a caller-owned message queue, releasing every waiter with
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

    /// Tear down and free a kernel-allocated message queue, releasing every
    /// waiter with [`Error::Failed`].
    ///
    /// # Safety
    ///
    /// No other handle to this message queue may be used afterwards.
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
        let words = pool_words(cb.msg_size.get(&*lock), cb.max_msgs.get(&*lock));
        drop(lock);

        // Safety: both allocations were leaked from `Box`es in `create` and
        // are no longer reachable; the waiters are gone
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                pool, words,
            )));
            drop(Box::from_raw(self.0.as_ptr()));
        }

        sched::schedule();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_geometry() {
        assert_eq!(slot_words(1), 2);
        assert_eq!(slot_words(WORD), 2);
        assert_eq!(slot_words(WORD + 1), 3);
        assert_eq!(pool_words(16, 4), 4 * slot_words(16));
    }
}
