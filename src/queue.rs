//! Message queues.
//!
//! Multi-producer single-consumer FIFOs of message envelopes. The consumer
//! side supports a timed blocking pop so a worker loop can sleep until its
//! next deadline and still wake immediately on new work.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::msg::Msg;

pub struct MsgQueue {
    tx: Sender<Msg>,
    rx: Receiver<Msg>,
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgQueue {
    pub fn new() -> MsgQueue {
        let (tx, rx) = unbounded();
        MsgQueue { tx, rx }
    }

    /// A producer handle. Producers may outlive the queue owner; sends to a
    /// dropped queue fail and the caller decides whether that matters.
    pub fn sender(&self) -> Sender<Msg> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> &Receiver<Msg> {
        &self.rx
    }

    /// Pops one message, waiting up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<Msg> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pops one message without waiting.
    pub fn try_pop(&self) -> Option<Msg> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn fifo_order_across_producers() {
        let q = MsgQueue::new();
        let tx = q.sender();
        for i in 0..10u8 {
            tx.send(Msg::new("t", Value::from(i))).unwrap();
        }
        for i in 0..10u8 {
            let msg = q.try_pop().unwrap();
            assert_eq!(msg.value, Value::from(i));
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q = MsgQueue::new();
        assert!(q.pop(Duration::from_millis(1)).is_none());
    }
}
