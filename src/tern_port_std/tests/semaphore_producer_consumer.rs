//! Wait-queue ordering: a FIFO semaphore wakes waiters in arrival order, a
//! priority semaphore wakes the most urgent waiter first regardless of
//! arrival.
use std::sync::Mutex;

use tern_kernel::{Error, QueueOrder, Semaphore, SemaphoreCb, Thread, ThreadState};

mod common;
use common::{park_forever, wait_until};

static WAKE_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

/// A semaphore in caller-owned storage for the `init`/`detach` lifecycle.
static STATIC_SEM: SemaphoreCb = SemaphoreCb::new();

unsafe fn fifo_waiter_entry(param: usize) {
    let sem = Semaphore::find("fifo").unwrap();
    sem.take().unwrap();
    WAKE_ORDER.lock().unwrap().push(name_of(param));
    sem.release().unwrap();
    park_forever();
}

unsafe fn prio_waiter_entry(param: usize) {
    let sem = Semaphore::find("prio").unwrap();
    sem.take().unwrap();
    WAKE_ORDER.lock().unwrap().push(name_of(param));
    park_forever();
}

fn name_of(param: usize) -> &'static str {
    ["first", "second", "urgent"][param]
}

#[test]
fn wait_queue_order_follows_the_object_flag() {
    tern_port_std::init();

    // The static lifecycle: init, use, find, detach.
    let stat = STATIC_SEM.init("stat", 1, QueueOrder::Fifo);
    assert_eq!(Semaphore::find("stat"), Some(stat));
    stat.try_take().unwrap();
    assert_eq!(stat.try_take(), Err(Error::Timeout));
    stat.release().unwrap();
    stat.detach().unwrap();
    assert_eq!(Semaphore::find("stat"), None);

    let fifo = Semaphore::create("fifo", 0, QueueOrder::Fifo).unwrap();
    let prio = Semaphore::create("prio", 0, QueueOrder::Priority).unwrap();

    // Two FIFO waiters at the same priority: arrival order wins. They block
    // in startup order because the first one runs, blocks, and hands the
    // processor to the second.
    let w1 = Thread::create("w1", fifo_waiter_entry, 0, 16 * 1024, 5, 10).unwrap();
    let w2 = Thread::create("w2", fifo_waiter_entry, 1, 16 * 1024, 5, 10).unwrap();
    w1.startup().unwrap();
    w2.startup().unwrap();

    tern_port_std::start_scheduler();
    wait_until("both FIFO waiters to block", || {
        w1.state() == ThreadState::Suspend && w2.state() == ThreadState::Suspend
    });
    assert_eq!(fifo.value(), -2);
    assert_eq!(fifo.waiter_count(), 2);

    // One release wakes the head; the woken waiter releases again and wakes
    // the other, so arrival order comes out.
    tern_port_std::isr(|| fifo.release().unwrap());
    wait_until("both FIFO waiters to finish", || {
        WAKE_ORDER.lock().unwrap().len() == 2
    });
    assert_eq!(&*WAKE_ORDER.lock().unwrap(), &["first", "second"]);
    assert_eq!(fifo.value(), 1);
    assert_eq!(fifo.waiter_count(), 0);

    WAKE_ORDER.lock().unwrap().clear();

    // A priority-ordered semaphore: a late but more urgent waiter jumps the
    // queue.
    let slow = Thread::create("slow", prio_waiter_entry, 1, 16 * 1024, 6, 10).unwrap();
    let fast = Thread::create("fast", prio_waiter_entry, 2, 16 * 1024, 3, 10).unwrap();
    slow.startup().unwrap();
    wait_until("the low-priority waiter to block", || {
        slow.state() == ThreadState::Suspend
    });
    tern_port_std::isr(|| fast.startup().unwrap());
    wait_until("the high-priority waiter to block", || {
        fast.state() == ThreadState::Suspend
    });
    assert_eq!(prio.waiter_count(), 2);

    tern_port_std::isr(|| prio.release().unwrap());
    wait_until("the urgent waiter to win", || {
        !WAKE_ORDER.lock().unwrap().is_empty()
    });
    assert_eq!(&*WAKE_ORDER.lock().unwrap(), &["urgent"]);
    assert_eq!(prio.waiter_count(), 1);

    tern_port_std::isr(|| prio.release().unwrap());
    wait_until("the remaining waiter to wake", || {
        WAKE_ORDER.lock().unwrap().len() == 2
    });
    assert_eq!(&*WAKE_ORDER.lock().unwrap(), &["urgent", "second"]);
}
