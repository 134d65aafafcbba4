//! Shared helpers for the scenario tests.
//!
//! Each test binary hosts exactly one kernel instance (the kernel state is a
//! process-wide singleton), with the test harness thread playing the
//! interrupt controller through [`tern_port_std::isr`]/[`tern_port_std::tick`].
#![allow(dead_code)]
use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

/// Spin until `pred` holds, failing the test after a generous deadline so a
/// scheduling bug hangs the test with a message instead of forever.
pub fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

/// Busy-wait on a flag from inside a simulated thread. Plain host spinning;
/// the kernel still considers the thread running.
pub fn spin_while_clear(flag: &AtomicBool) {
    while !flag.load(Ordering::Acquire) {
        thread::yield_now();
    }
}

/// Park the calling kernel thread for good.
pub fn park_forever() {
    let me = tern_kernel::Thread::current().unwrap();
    me.suspend().unwrap();
    tern_kernel::schedule();
    unreachable!("parked thread was resumed");
}

/// An append-only event log for asserting cross-thread ordering.
pub struct EventLog(Mutex<Vec<&'static str>>);

impl EventLog {
    pub const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub fn push(&self, event: &'static str) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| *e == event)
    }
}
