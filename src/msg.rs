//! The message envelope routed through the driver's queues.
//!
//! A message has exactly one owner at any instant; enqueueing moves it to
//! the consumer. Delivering to a subscriber hands the subscriber its own
//! copy, so subscriber mutation never aliases the original.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::device::DeviceHandle;
use crate::error::{ErrorCode, Result};
use crate::pubsub::{SubFlags, SubId, SubTarget};
use crate::topic;
use crate::value::{AppClass, Value};
use crate::wire::{StreamHeader, STREAM_HEADER_SIZE, STREAM_PAYLOAD_MAX};

pub struct Msg {
    pub topic: String,
    pub value: Value,
    /// Originating subscriber, used to suppress echo deliveries.
    pub src: Option<SubId>,
    /// Synchronous-completion handle for callers that requested one.
    pub completion: Option<Completion>,
    /// Side-channel payload for bus-internal commands.
    pub extra: Option<MsgExtra>,
}

pub enum MsgExtra {
    Subscribe {
        sub_id: SubId,
        flags: SubFlags,
        target: SubTarget,
    },
    Unsubscribe {
        sub_id: SubId,
    },
    UnsubscribeAll {
        sub_id: SubId,
    },
    Query {
        reply: Sender<Result<Value>>,
    },
    DeviceAdd {
        handle: DeviceHandle,
    },
}

impl Msg {
    pub fn new(topic: impl Into<String>, value: Value) -> Msg {
        Msg {
            topic: topic.into(),
            value,
            src: None,
            completion: None,
            extra: None,
        }
    }

    /// A stream-data message. The payload buffer is reserved at the data
    /// message size class up front so device workers never reallocate while
    /// streaming.
    pub fn stream_data(topic: impl Into<String>, header: &StreamHeader, data: &[u8]) -> Msg {
        let mut buf = Vec::with_capacity(STREAM_HEADER_SIZE + STREAM_PAYLOAD_MAX);
        buf.extend_from_slice(&header.encode(data));
        Msg::new(topic, Value::bin(buf).with_app(AppClass::Stream))
    }

    /// A return-code message completing `base_topic`.
    pub fn return_code(base_topic: &str, rc: i32) -> Msg {
        Msg::new(topic::return_code_topic(base_topic), Value::from(rc))
    }

    pub fn with_src(mut self, src: SubId) -> Msg {
        self.src = Some(src);
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Msg {
        self.completion = Some(completion);
        self
    }

    pub fn with_extra(mut self, extra: MsgExtra) -> Msg {
        self.extra = Some(extra);
        self
    }

    /// The independent copy handed to a subscriber. Completion and command
    /// extras stay with the original owner.
    pub fn clone_for_delivery(&self) -> Msg {
        Msg {
            topic: self.topic.clone(),
            value: self.value.clone(),
            src: self.src,
            completion: None,
            extra: None,
        }
    }
}

struct CompletionState {
    result: Mutex<Option<i32>>,
    event: Condvar,
}

/// The synchronous-completion handle of a message: an event, a result slot,
/// a deadline, and the return-code topic that completes it.
///
/// The caller blocks in [`Completion::wait`]; the frontend signals it from a
/// return-code match, deadline expiry, or finalize.
#[derive(Clone)]
pub struct Completion {
    state: Arc<CompletionState>,
    pub deadline: Instant,
    pub key_topic: String,
}

impl Completion {
    /// `key_topic` is the original topic with `#` appended.
    pub fn new(base_topic: &str, timeout: Duration) -> Completion {
        Completion {
            state: Arc::new(CompletionState {
                result: Mutex::new(None),
                event: Condvar::new(),
            }),
            deadline: Instant::now() + timeout,
            key_topic: topic::return_code_topic(base_topic),
        }
    }

    /// Sets the result and wakes the waiter. The first signal wins.
    pub fn signal(&self, rc: i32) {
        let mut result = self.state.result.lock();
        if result.is_none() {
            *result = Some(rc);
            self.state.event.notify_all();
        }
    }

    pub fn signal_error(&self, e: ErrorCode) {
        self.signal(e.to_i32());
    }

    /// Blocks until signalled. If the frontend itself disappears, a grace
    /// period past the deadline converts the wait into `Timeout`.
    pub fn wait(&self) -> Result<()> {
        let hard_deadline = self.deadline + Duration::from_secs(1);
        let mut result = self.state.result.lock();
        loop {
            if let Some(rc) = *result {
                return ErrorCode::result_from_rc(rc);
            }
            if self
                .state
                .event
                .wait_until(&mut result, hard_deadline)
                .timed_out()
            {
                return Err(ErrorCode::Timeout);
            }
        }
    }

    /// Non-blocking result peek.
    pub fn poll(&self) -> Option<i32> {
        *self.state.result.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_signal_wakes_waiter() {
        let c = Completion::new("a/b", Duration::from_secs(5));
        assert_eq!(c.key_topic, "a/b#");
        let c2 = c.clone();
        let handle = thread::spawn(move || c2.wait());
        thread::sleep(Duration::from_millis(10));
        c.signal(0);
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn completion_first_signal_wins() {
        let c = Completion::new("a", Duration::from_secs(5));
        c.signal(ErrorCode::Timeout.to_i32());
        c.signal(0);
        assert_eq!(c.poll(), Some(ErrorCode::Timeout.to_i32()));
        assert_eq!(c.wait(), Err(ErrorCode::Timeout));
    }

    #[test]
    fn delivery_clone_drops_completion() {
        let msg = Msg::new("t", Value::from(1u8))
            .with_completion(Completion::new("t", Duration::from_millis(1)));
        let copy = msg.clone_for_delivery();
        assert!(copy.completion.is_none());
        assert_eq!(copy.topic, "t");
        assert_eq!(copy.value, Value::from(1u8));
    }
}
