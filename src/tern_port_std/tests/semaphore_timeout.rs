//! A bounded semaphore wait that never gets a release must time out at the
//! requested tick, leaving the semaphore's accounting balanced.
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use tern_kernel::{Error, QueueOrder, Semaphore, Thread, ThreadState};

mod common;
use common::{park_forever, wait_until};

static DONE: AtomicBool = AtomicBool::new(false);
static RESULT: AtomicI64 = AtomicI64::new(i64::MIN);
static WAKE_TICK: AtomicU32 = AtomicU32::new(u32::MAX);

unsafe fn taker_entry(_: usize) {
    let sem = Semaphore::find("bounded").unwrap();

    let result = sem.take_timeout(50);
    WAKE_TICK.store(tern_kernel::tick_count(), Ordering::SeqCst);
    RESULT.store(
        match result {
            Ok(()) => 0,
            Err(e) => e as i64,
        },
        Ordering::SeqCst,
    );
    DONE.store(true, Ordering::SeqCst);

    park_forever();
}

#[test]
fn timed_semaphore_wait_expires() {
    tern_port_std::init();

    let sem = Semaphore::create("bounded", 0, QueueOrder::Fifo).unwrap();
    let taker = Thread::create("taker", taker_entry, 0, 16 * 1024, 5, 10).unwrap();
    taker.startup().unwrap();

    tern_port_std::start_scheduler();

    // The taker blocks immediately; the value goes negative by the number of
    // waiters.
    wait_until("taker to block", || taker.state() == ThreadState::Suspend);
    assert_eq!(sem.value(), -1);
    assert_eq!(sem.waiter_count(), 1);

    // One tick short of the deadline nothing happens.
    tern_port_std::tick(49);
    assert_eq!(taker.state(), ThreadState::Suspend);
    assert!(!DONE.load(Ordering::SeqCst));

    // The deadline tick cancels the wait.
    tern_port_std::tick(1);
    wait_until("taker to observe the timeout", || DONE.load(Ordering::SeqCst));

    assert_eq!(RESULT.load(Ordering::SeqCst), Error::Timeout as i64);
    assert_eq!(WAKE_TICK.load(Ordering::SeqCst), 50);

    // The timed-out waiter re-balanced the accounting on its way out.
    assert_eq!(sem.value(), 0);
    assert_eq!(sem.waiter_count(), 0);
}
