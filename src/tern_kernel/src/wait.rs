//! IPC wait queues
//!
//! Every blocking IPC object embeds a [`WaitQueue`]: an intrusive list of
//! suspended threads plus a waiter count. The queue's order is fixed at
//! object initialization from the object's flag byte: FIFO appends at the
//! tail, priority order inserts before the first waiter of strictly lower
//! urgency (FIFO among equals).
use crate::{
    error::{Error, Result},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    sched,
    thread::{self, ThreadCb, ThreadRef},
    timeout::Tick,
    timer,
    utils::{
        intrusive_list::{ListHead, NodeRef},
        Init,
    },
};

/// How the waiters of an object are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// Waiters are queued in arrival order.
    Fifo,
    /// Waiters are queued in priority order; same-priority waiters follow
    /// arrival order.
    Priority,
}

impl Init for QueueOrder {
    const INIT: Self = Self::Fifo;
}

/// How long a blocking operation is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitFor {
    /// Fail with [`Error::Timeout`] instead of blocking.
    Poll,
    /// Block until the resource arrives or the object is torn down.
    Forever,
    /// Block for at most this many ticks.
    Ticks(Tick),
}

/// A queue of threads blocked on one IPC object.
pub(crate) struct WaitQueue {
    waiters: ListHead<ThreadCb>,
    count: CpuLockCell<u32>,
    order: CpuLockCell<QueueOrder>,
}

impl Init for WaitQueue {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: ListHead::new(),
            count: CpuLockCell::new(0),
            order: CpuLockCell::new(QueueOrder::Fifo),
        }
    }

    pub(crate) fn set_order(&self, mut lock: CpuLockTokenRefMut<'_>, order: QueueOrder) {
        self.order.replace(&mut *lock, order);
    }

    pub(crate) fn waiter_count(&self, lock: CpuLockTokenRefMut<'_>) -> u32 {
        self.count.get(&*lock)
    }

    /// Re-balance the waiter count after a timed-out waiter observed its
    /// error: the timeout path removed the thread from the queue but left
    /// the count inflated.
    pub(crate) fn forget_waiter(&self, mut lock: CpuLockTokenRefMut<'_>) {
        let count = self.count.get(&*lock);
        debug_assert!(count > 0);
        self.count.replace(&mut *lock, count - 1);
    }

    /// Suspend the calling thread onto this queue, arming its one-shot timer
    /// for a bounded wait. The caller must leave the critical section and
    /// call [`sched::schedule`] afterwards; the wait outcome is then in the
    /// thread's `error` field.
    ///
    /// Fails with [`Error::Failed`] when called outside a waitable context
    /// (no running thread, or inside an interrupt handler).
    pub(crate) fn suspend_current(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
        timeout: Option<Tick>,
    ) -> Result<ThreadRef> {
        if sched::in_isr(lock.borrow_mut()) {
            return Err(Error::Failed);
        }
        let cur = sched::running(lock.borrow_mut()).ok_or(Error::Failed)?;

        thread::suspend_locked(lock.borrow_mut(), cur)?;
        cur.cb().error.replace(&mut *lock, Ok(()));

        match self.order.get(&*lock) {
            QueueOrder::Fifo => {
                self.waiters
                    .push_back(lock.borrow_mut(), &cur.cb().schedule_node);
            }
            QueueOrder::Priority => {
                let position = self.position_by_priority(lock.borrow_mut(), cur);
                match position {
                    Some(node) => self.waiters.insert_before(
                        lock.borrow_mut(),
                        node,
                        &cur.cb().schedule_node,
                    ),
                    None => self
                        .waiters
                        .push_back(lock.borrow_mut(), &cur.cb().schedule_node),
                }
            }
        }

        self.count.replace_with(&mut *lock, |c| *c + 1);

        if let Some(ticks) = timeout {
            timer::set_ticks_locked(lock.borrow_mut(), &cur.cb().thread_timer, ticks);
            timer::start_locked(lock.borrow_mut(), &cur.cb().thread_timer);
        }

        Ok(cur)
    }

    /// Find the first waiter of strictly lower urgency than `thread`.
    fn position_by_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
        thread: ThreadRef,
    ) -> Option<NodeRef<ThreadCb>> {
        let own = thread.cb().priority.get(&*lock).current();

        let mut cur = self.waiters.first(lock.borrow_mut());
        while let Some(node) = cur {
            let waiter = node.elem(lock.borrow_mut());
            if waiter.get().priority.get(&*lock).current() > own {
                return Some(node);
            }
            cur = self.waiters.next(lock.borrow_mut(), node);
        }
        None
    }

    /// The first waiter, without removing it.
    pub(crate) fn front(&self, mut lock: CpuLockTokenRefMut<'_>) -> Option<ThreadRef> {
        self.waiters
            .front(lock.borrow_mut())
            .map(|elem| ThreadRef::from_nonnull(elem.nonnull()))
    }

    /// The priority of the most urgent waiter, if any. Scans the queue, so
    /// it works for both orderings.
    pub(crate) fn highest_waiter_priority(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
    ) -> Option<u8> {
        let mut best: Option<u8> = None;

        let mut cur = self.waiters.first(lock.borrow_mut());
        while let Some(node) = cur {
            let waiter = node.elem(lock.borrow_mut());
            let priority = waiter.get().priority.get(&*lock).current();
            best = Some(match best {
                Some(best) => best.min(priority),
                None => priority,
            });
            cur = self.waiters.next(lock.borrow_mut(), node);
        }
        best
    }

    pub(crate) fn first_node(
        &self,
        lock: CpuLockTokenRefMut<'_>,
    ) -> Option<NodeRef<ThreadCb>> {
        self.waiters.first(lock)
    }

    pub(crate) fn next_node(
        &self,
        lock: CpuLockTokenRefMut<'_>,
        node: NodeRef<ThreadCb>,
    ) -> Option<NodeRef<ThreadCb>> {
        self.waiters.next(lock, node)
    }

    /// Remove a specific waiter (identified by its queue node) and make it
    /// runnable. The caller is responsible for writing the thread's `error`
    /// field first.
    pub(crate) fn wake_node(&self, mut lock: CpuLockTokenRefMut<'_>, node: NodeRef<ThreadCb>) {
        let waiter = node.elem(lock.borrow_mut());
        let waiter = ThreadRef::from_nonnull(waiter.nonnull());

        waiter.cb().schedule_node.unlink(lock.borrow_mut());
        self.count.replace_with(&mut *lock, |c| *c - 1);
        thread::wake_locked(lock, waiter);
    }

    /// Wake the head waiter with a successful outcome. Returns `false` if
    /// the queue was empty.
    ///
    /// The caller should leave the critical section and call
    /// [`sched::schedule`] when this returns `true`.
    pub(crate) fn wake_one(&self, mut lock: CpuLockTokenRefMut<'_>) -> bool {
        match self.first_node(lock.borrow_mut()) {
            Some(node) => {
                self.wake_node(lock, node);
                true
            }
            None => false,
        }
    }

    /// Release every waiter with the given error. Used when an object is
    /// detached or deleted while threads are blocked on it.
    pub(crate) fn wake_all_with_error(&self, mut lock: CpuLockTokenRefMut<'_>, error: Error) {
        while let Some(node) = self.first_node(lock.borrow_mut()) {
            let waiter = node.elem(lock.borrow_mut());
            waiter.get().error.replace(&mut *lock, Err(error));
            self.wake_node(lock.borrow_mut(), node);
        }
    }
}
