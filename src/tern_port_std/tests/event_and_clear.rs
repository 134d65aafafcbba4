//! An AND+CLEAR event waiter must stay asleep until every requested bit is
//! present, report the set as it stood at the match, and consume its bits.
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tern_kernel::{Event, EventFlags, QueueOrder, Thread, ThreadState};

mod common;
use common::{park_forever, wait_until};

static DONE: AtomicBool = AtomicBool::new(false);
static RECVED: AtomicI64 = AtomicI64::new(-1);

unsafe fn waiter_entry(_: usize) {
    let event = Event::find("flags").unwrap();

    let recved = event
        .recv(0b0101, EventFlags::AND | EventFlags::CLEAR)
        .unwrap();
    RECVED.store(recved as i64, Ordering::SeqCst);
    DONE.store(true, Ordering::SeqCst);

    park_forever();
}

#[test]
fn event_and_clear_wakes_on_completed_mask() {
    tern_port_std::init();

    let event = Event::create("flags", QueueOrder::Fifo).unwrap();
    let waiter = Thread::create("waiter", waiter_entry, 0, 16 * 1024, 5, 10).unwrap();
    waiter.startup().unwrap();

    tern_port_std::start_scheduler();
    wait_until("waiter to block", || waiter.state() == ThreadState::Suspend);

    // A partial mask leaves the waiter asleep.
    tern_port_std::isr(|| event.send(0b0100).unwrap());
    assert_eq!(waiter.state(), ThreadState::Suspend);
    assert_eq!(event.set(), 0b0100);
    assert_eq!(event.waiter_count(), 1);

    // The completing bit wakes it.
    tern_port_std::isr(|| event.send(0b0001).unwrap());
    wait_until("waiter to receive", || DONE.load(Ordering::SeqCst));

    // The receive reports the set at match time; CLEAR consumed the bits.
    assert_eq!(RECVED.load(Ordering::SeqCst), 0b0101);
    assert_eq!(event.set(), 0);
    assert_eq!(event.waiter_count(), 0);

    // Polled receives see the emptied set.
    assert_eq!(
        event.try_recv(0b0101, EventFlags::OR),
        Err(tern_kernel::Error::Timeout)
    );
}
