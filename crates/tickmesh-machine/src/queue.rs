//! Shared inbound message queue.
//!
//! Every connection consumer pushes into the same queue and the event loop
//! is the only thing that pops. Per-connection order is preserved; there is
//! no ordering across connections.

use crossbeam_queue::SegQueue;

use crate::wire::Message;

/// Unbounded, lock-free FIFO of messages waiting for the event loop.
#[derive(Debug, Default)]
pub struct InboundQueue {
    inner: SegQueue<Message>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.inner.push(message);
    }

    /// Takes the oldest message without blocking.
    pub fn pop(&self) -> Option<Message> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
