//! Host-side driver engine for precision instruments that stream high-rate
//! measurement samples.
//!
//! Applications talk to attached devices through a single in-process
//! message bus: publish values to hierarchical topics, subscribe to topic
//! updates, and query retained values. The driver multiplexes any number
//! of devices behind this interface and offers in-memory stream buffers
//! that answer raw-sample and multi-resolution summary queries.
//!
//! The engine is queue-based and multi-threaded: a frontend dispatcher
//! owns the topic tree, each device runs a protocol worker, and each
//! memory buffer runs a worker that owns its sample storage. Transport
//! backends and device protocol state machines plug in through the
//! [`Backend`] and [`DeviceWorker`] contracts.
//!
//! ```no_run
//! use jsdrv::{Driver, SubFlags, Value};
//!
//! let driver = Driver::initialize()?;
//! driver.publish("u/js110/123456/hello", Value::str("world").with_retain(), 0)?;
//! let sub_id = driver.subscribe(
//!     "",
//!     SubFlags::RETAIN | SubFlags::PUB,
//!     |topic, value| println!("{topic} <- {value}"),
//!     1000,
//! )?;
//! driver.unsubscribe("", sub_id, 1000)?;
//! driver.finalize()?;
//! # Ok::<(), jsdrv::ErrorCode>(())
//! ```

mod buffer;
mod device;
mod error;
mod frontend;
mod meta;
mod msg;
mod pubsub;
mod queue;
mod statistics;
mod time;
mod tmap;
mod topic;
mod value;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use rustc_hash::FxHashMap;

pub use crate::buffer::BUFFER_ID_MAX;
pub use crate::device::{
    Backend, DeviceFactory, DeviceHandle, DeviceSpawnCtx, DeviceWorker,
};
pub use crate::error::{ErrorCode, Result};
pub use crate::frontend::version_u32;
pub use crate::meta::Meta;
pub use crate::msg::{Completion, Msg, MsgExtra};
pub use crate::pubsub::{next_sub_id, SubFlags, SubId, SubTarget};
pub use crate::queue::MsgQueue;
pub use crate::statistics::{StatisticsAccum, SummaryEntry};
pub use crate::time::{
    counter_to_time, time_to_counter, time_to_counter_rinf, time_to_counter_rzero, TimeMap,
    UtcTime, DAY, HOUR, MICROSECOND, MILLISECOND, MINUTE, SECOND,
};
pub use crate::tmap::Tmap;
pub use crate::topic::{MsgKind, TOPIC_LENGTH_MAX, TOPIC_LEVEL_MAX};
pub use crate::value::{AppClass, Payload, Value};
pub use crate::wire::{
    BufferInfo, BufferRequest, BufferResponse, ElementType, ResponseData, StreamHeader,
    TimeRange, BUFFER_VERSION, STREAM_HEADER_SIZE, STREAM_PAYLOAD_MAX, SUMMARY_LENGTH_MAX,
};

use crate::frontend::FrontendHandle;

/// Default synchronous-call timeout, also retained on `@/timeout`.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Configures backends and device-model factories before starting the
/// driver.
pub struct DriverBuilder {
    factories: FxHashMap<String, DeviceFactory>,
    backends: Vec<Box<dyn Backend>>,
    init_timeout_ms: u32,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverBuilder {
    pub fn new() -> DriverBuilder {
        DriverBuilder {
            factories: FxHashMap::default(),
            backends: Vec::new(),
            init_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Installs the worker factory for a device model string ("js220",
    /// "js110", ...), consulted on `@/!add`.
    pub fn model(mut self, name: impl Into<String>, factory: DeviceFactory) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    /// Installs a transport backend.
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn init_timeout_ms(mut self, ms: u32) -> Self {
        self.init_timeout_ms = ms;
        self
    }

    /// Spawns the frontend, posts `@/!init`, and waits until every backend
    /// has reported. The first backend error becomes the overall result.
    pub fn initialize(self) -> Result<Driver> {
        let frontend = frontend::spawn(self.factories, self.backends)?;
        let driver = Driver { frontend };
        match driver.publish("@/!init", Value::null(), self.init_timeout_ms) {
            Ok(()) => Ok(driver),
            Err(e) => {
                let _ = driver.finalize();
                Err(e)
            }
        }
    }
}

/// A running driver instance.
///
/// All methods are thread-safe; they package a message, enqueue it on the
/// frontend's command queue, and (for a non-zero timeout) wait on the
/// message's completion event. [`Driver::finalize`] must not be called
/// from a subscriber callback.
pub struct Driver {
    frontend: FrontendHandle,
}

impl Driver {
    /// Starts a driver with no backends. Device and buffer plumbing is
    /// fully functional; devices appear only when a backend or test posts
    /// `@/!add`.
    pub fn initialize() -> Result<Driver> {
        DriverBuilder::new().initialize()
    }

    pub fn builder() -> DriverBuilder {
        DriverBuilder::new()
    }

    fn send(&self, msg: Msg) -> Result<()> {
        self.frontend
            .cmd_tx
            .send(msg)
            .map_err(|_| ErrorCode::Unavailable)
    }

    /// Publishes `value` to `topic`.
    ///
    /// With `timeout_ms == 0` the call is fire-and-forget. Otherwise it
    /// blocks until the message's owner publishes `{topic}#`, the bus
    /// terminates the message, or the deadline passes.
    pub fn publish(&self, topic: &str, value: Value, timeout_ms: u32) -> Result<()> {
        topic::validate(topic)?;
        let msg = Msg::new(topic, value);
        if timeout_ms == 0 {
            return self.send(msg);
        }
        let completion = Completion::new(topic, Duration::from_millis(timeout_ms as u64));
        self.send(msg.with_completion(completion.clone()))?;
        completion.wait()
    }

    /// Reads the retained value of `topic` on the frontend thread.
    pub fn query(&self, topic: &str, timeout_ms: u32) -> Result<Value> {
        topic::validate(topic)?;
        let (reply, rx) = bounded(1);
        self.send(Msg::new(topic, Value::null()).with_extra(MsgExtra::Query { reply }))?;
        rx.recv_timeout(Duration::from_millis(timeout_ms.max(1) as u64))
            .map_err(|_| ErrorCode::Timeout)?
    }

    /// Like [`Driver::query`], but copies a string/json/binary value into
    /// a caller-supplied buffer (strings are NUL-terminated). Fails with
    /// `TooSmall` when the retained value does not fit.
    pub fn query_into(&self, topic: &str, out: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.query(topic, timeout_ms)?.copy_into(out)
    }

    fn command(&self, topic: &str, extra: MsgExtra, timeout_ms: u32) -> Result<()> {
        topic::validate(topic)?;
        let msg = Msg::new(topic, Value::null()).with_extra(extra);
        if timeout_ms == 0 {
            return self.send(msg);
        }
        let completion = Completion::new(topic, Duration::from_millis(timeout_ms as u64));
        self.send(msg.with_completion(completion.clone()))?;
        completion.wait()
    }

    /// Registers `callback` for deliveries matching `flags` on `topic` and
    /// its subtree. The callback runs on the frontend thread: it must copy
    /// what it needs, must not block, and must not call back into any
    /// synchronous driver API.
    pub fn subscribe(
        &self,
        topic: &str,
        flags: SubFlags,
        callback: impl Fn(&str, &Value) + Send + Sync + 'static,
        timeout_ms: u32,
    ) -> Result<SubId> {
        let sub_id = next_sub_id();
        self.command(
            topic,
            MsgExtra::Subscribe {
                sub_id,
                flags,
                target: SubTarget::Callback(Arc::new(callback)),
            },
            timeout_ms,
        )?;
        Ok(sub_id)
    }

    /// Removes the subscription on `topic` only.
    pub fn unsubscribe(&self, topic: &str, sub_id: SubId, timeout_ms: u32) -> Result<()> {
        self.command(topic, MsgExtra::Unsubscribe { sub_id }, timeout_ms)
    }

    /// Removes every subscription registered under `sub_id`.
    pub fn unsubscribe_all(&self, sub_id: SubId, timeout_ms: u32) -> Result<()> {
        self.command("", MsgExtra::UnsubscribeAll { sub_id }, timeout_ms)
    }

    /// Stops the frontend: joins device and buffer workers, finalizes
    /// backends, and aborts outstanding synchronous calls with `Aborted`.
    pub fn finalize(mut self) -> Result<()> {
        self.finalize_inner()
    }

    fn finalize_inner(&mut self) -> Result<()> {
        if !self.frontend.is_active() {
            return Ok(());
        }
        let completion = Completion::new("@/!final", Duration::from_millis(1000));
        let _ = self
            .frontend
            .cmd_tx
            .send(Msg::new("@/!final", Value::null()).with_completion(completion.clone()));
        let result = completion.wait();
        self.frontend.join();
        result
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let _ = self.finalize_inner();
    }
}
