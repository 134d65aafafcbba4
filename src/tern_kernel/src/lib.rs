//! A fixed-priority preemptive RTOS kernel with the classic IPC primitives:
//! counting semaphores, recursive mutexes with priority inheritance, event
//! flag groups, mailboxes, and message queues.
//!
//! The kernel is a singleton: its state lives in module statics guarded by
//! the interrupt gate (the `klock` token machinery). Everything
//! hardware-specific is behind the [`port::Port`] function table; a hosted
//! simulator port is enough to run the whole kernel on std targets.
//!
//! # Boot sequence
//!
//!  1. [`port::register`] the hardware primitives.
//!  2. [`init`] the kernel (this creates the idle thread).
//!  3. Create and [`Thread::startup`] the application threads.
//!  4. [`start`] the scheduler. Never returns.
//!
//! The port's periodic timer interrupt must call [`interrupt_enter`],
//! [`tick_advance`], [`interrupt_leave`] once per tick.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
extern crate alloc;

mod error;
mod event;
mod idle;
mod klock;
mod mailbox;
mod msgqueue;
mod mutex;
mod object;
pub mod port;
mod sched;
mod semaphore;
mod thread;
mod timeout;
mod timer;
pub mod utils;
mod wait;

pub use error::{Error, Result};
pub use event::{Event, EventCb, EventFlags};
pub use idle::set_hook as set_idle_hook;
pub use mailbox::{Mailbox, MailboxCb};
pub use msgqueue::{pool_words, MessageQueue, MessageQueueCb};
pub use mutex::{Mutex, MutexCb};
pub use object::{KernelObject, ObjectClass, ObjectName, NAME_LEN};
pub use sched::{interrupt_enter, interrupt_leave, schedule, start};
pub use semaphore::{Semaphore, SemaphoreCb};
pub use thread::{
    delay, readyqueue::PRI_MAX, sleep, yield_now, Thread, ThreadCb, ThreadControl, ThreadState,
};
pub use timeout::{tick_advance, tick_count, Tick};
pub use timer::{Timer, TimerCb, TimerFn};
pub use wait::QueueOrder;

/// Initialize the kernel. The port must be registered first; the application
/// threads are created after this and the scheduler is entered with
/// [`start`].
pub fn init() {
    idle::init();
}
