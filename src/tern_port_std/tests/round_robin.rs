//! Two equal-priority busy threads with a two-tick budget each must split
//! the processor evenly, rotating at every budget expiry.
use std::{sync::atomic::AtomicBool, thread};

use tern_kernel::{Thread, ThreadState};

mod common;
use common::wait_until;

static STOP: AtomicBool = AtomicBool::new(false);

unsafe fn busy_entry(_: usize) {
    // Pure host-side spinning: the kernel sees an always-running thread.
    while !STOP.load(std::sync::atomic::Ordering::Acquire) {
        thread::yield_now();
    }
}

#[test]
fn equal_priority_threads_share_ticks_evenly() {
    tern_port_std::init();

    let a = Thread::create("busy_a", busy_entry, 0, 16 * 1024, 5, 2).unwrap();
    let b = Thread::create("busy_b", busy_entry, 0, 16 * 1024, 5, 2).unwrap();
    a.startup().unwrap();
    b.startup().unwrap();

    tern_port_std::start_scheduler();
    wait_until("the first thread to be dispatched", || {
        Thread::current() == Some(a)
    });
    assert_eq!(a.state(), ThreadState::Ready);
    assert_eq!(b.state(), ThreadState::Ready);

    // Charge ten ticks and record who owns the processor after each one.
    let mut owners = Vec::new();
    for _ in 0..10 {
        tern_port_std::tick(1);
        owners.push(Thread::current().unwrap());
    }

    let a_ticks = owners.iter().filter(|t| **t == a).count();
    let b_ticks = owners.iter().filter(|t| **t == b).count();
    assert_eq!(a_ticks, 5);
    assert_eq!(b_ticks, 5);

    // The rotation happens exactly when a budget is exhausted: the owner
    // changes after every second tick.
    assert_eq!(
        owners,
        vec![a, b, b, a, a, b, b, a, a, b],
        "unexpected rotation pattern"
    );

    STOP.store(true, std::sync::atomic::Ordering::Release);
}
