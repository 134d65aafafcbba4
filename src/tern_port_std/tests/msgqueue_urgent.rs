//! Message queue FIFO order, urgent prepending, payload fidelity, and the
//! non-blocking send semantics.
//!
//! Messages carry no length word: a receive always copies
//! `min(buffer, msg_size)` bytes, so the fixtures use exactly
//! `msg_size`-sized payloads.
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{Error, MessageQueue, QueueOrder, Thread, ThreadState};

mod common;
use common::{park_forever, wait_until};

static GOT_PUSHED: AtomicBool = AtomicBool::new(false);

fn recv_msg(queue: &MessageQueue) -> [u8; 4] {
    let mut buf = [0u8; 4];
    assert_eq!(queue.try_recv(&mut buf).unwrap(), 4);
    buf
}

unsafe fn receiver_entry(_: usize) {
    let queue = MessageQueue::find("inbox").unwrap();

    let mut buf = [0u8; 4];
    let len = queue.recv(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"wake");
    GOT_PUSHED.store(true, Ordering::SeqCst);

    park_forever();
}

#[test]
fn urgent_messages_jump_the_queue() {
    tern_port_std::init();

    let queue = MessageQueue::create("inbox", 4, 4, QueueOrder::Fifo).unwrap();

    // FIFO with an urgent message prepended.
    queue.send(b"aaaa").unwrap();
    queue.send(b"bbbb").unwrap();
    queue.urgent(b"uuuu").unwrap();
    assert_eq!(queue.entry(), 3);

    assert_eq!(&recv_msg(&queue), b"uuuu");
    assert_eq!(&recv_msg(&queue), b"aaaa");
    assert_eq!(&recv_msg(&queue), b"bbbb");
    assert_eq!(queue.entry(), 0);

    // A short receive buffer truncates the payload.
    queue.send(b"cdef").unwrap();
    let mut short = [0u8; 2];
    assert_eq!(queue.try_recv(&mut short).unwrap(), 2);
    assert_eq!(&short, b"cd");

    // Senders never block: capacity exhaustion and oversize are errors.
    for _ in 0..4 {
        queue.send(b"fill").unwrap();
    }
    assert_eq!(queue.send(b"xx"), Err(Error::Full));
    assert_eq!(queue.urgent(b"xx"), Err(Error::Full));
    while queue.entry() > 0 {
        recv_msg(&queue);
    }
    assert_eq!(queue.send(b"toolarge"), Err(Error::Failed));

    // A blocked receiver is woken by the next send.
    let receiver = Thread::create("receiver", receiver_entry, 0, 16 * 1024, 5, 10).unwrap();
    receiver.startup().unwrap();
    tern_port_std::start_scheduler();
    wait_until("receiver to block", || {
        receiver.state() == ThreadState::Suspend
    });

    tern_port_std::isr(|| queue.send(b"wake").unwrap());
    wait_until("receiver to drain the queue", || {
        GOT_PUSHED.load(Ordering::SeqCst)
    });
    assert_eq!(queue.entry(), 0);
    assert_eq!(queue.waiter_count(), 0);
}
