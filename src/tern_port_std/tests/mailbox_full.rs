//! Mailbox capacity semantics: senders never block, a full ring fails with
//! `Full`, and a blocked receiver is woken by the next send.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tern_kernel::{Error, Mailbox, QueueOrder, Thread, ThreadState};

mod common;
use common::{park_forever, wait_until};

static GOT: AtomicUsize = AtomicUsize::new(0);
static DONE: AtomicBool = AtomicBool::new(false);

unsafe fn receiver_entry(_: usize) {
    let mailbox = Mailbox::find("slots").unwrap();

    let value = mailbox.recv().unwrap();
    GOT.store(value, Ordering::SeqCst);
    DONE.store(true, Ordering::SeqCst);

    park_forever();
}

#[test]
fn full_mailbox_rejects_the_sender() {
    tern_port_std::init();

    let mailbox = Mailbox::create("slots", 2, QueueOrder::Fifo).unwrap();

    // Fill the ring; the third send is refused without blocking.
    mailbox.send(0x11).unwrap();
    mailbox.send(0x22).unwrap();
    assert_eq!(mailbox.send(0x33), Err(Error::Full));
    assert_eq!(mailbox.entry(), 2);

    // Drain in order, exercising the ring wrap-around.
    assert_eq!(mailbox.try_recv().unwrap(), 0x11);
    mailbox.send(0x44).unwrap();
    assert_eq!(mailbox.try_recv().unwrap(), 0x22);
    assert_eq!(mailbox.try_recv().unwrap(), 0x44);
    assert_eq!(mailbox.try_recv(), Err(Error::Empty));
    assert_eq!(mailbox.entry(), 0);

    // A blocked receiver is woken by the next send.
    let receiver = Thread::create("receiver", receiver_entry, 0, 16 * 1024, 5, 10).unwrap();
    receiver.startup().unwrap();
    tern_port_std::start_scheduler();
    wait_until("receiver to block", || {
        receiver.state() == ThreadState::Suspend
    });
    assert_eq!(mailbox.waiter_count(), 1);

    tern_port_std::isr(|| mailbox.send(0xabcd).unwrap());
    wait_until("receiver to get the mail", || DONE.load(Ordering::SeqCst));

    assert_eq!(GOT.load(Ordering::SeqCst), 0xabcd);
    assert_eq!(mailbox.entry(), 0);
    assert_eq!(mailbox.waiter_count(), 0);
}
