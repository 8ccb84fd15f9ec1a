//! Device and backend contracts.
//!
//! Transport backends discover attached instruments and hand the frontend a
//! [`DeviceHandle`] per device through `@/!add`. The frontend then selects
//! an upper-level protocol worker by model name and wires it to the bus.
//! The protocol state machines themselves (handshake, port multiplexing,
//! firmware update, streaming) live outside this crate; the contract here
//! is a command queue and a join.

use crossbeam_channel::{Receiver, Sender};

use crate::error::Result;
use crate::msg::Msg;
use crate::pubsub::SubId;

/// The lower-level queue pair a transport backend provides for one device.
#[derive(Clone)]
pub struct DeviceHandle {
    /// `{backend}/{model}/{serial}`.
    pub prefix: String,
    /// Frames going down to the device.
    pub cmd_tx: Sender<Msg>,
    /// Frames coming up from the device.
    pub rsp_rx: Receiver<Msg>,
}

impl DeviceHandle {
    pub fn backend(&self) -> Option<&str> {
        self.prefix.split('/').next()
    }

    pub fn model(&self) -> Option<&str> {
        self.prefix.split('/').nth(1)
    }

    pub fn serial(&self) -> Option<&str> {
        self.prefix.split('/').nth(2)
    }
}

/// An upper-level per-device protocol worker.
///
/// The frontend clones every message published under the device prefix onto
/// the worker's command queue. The worker answers through the standard
/// publish / return-code pattern on its loopback sender.
pub trait DeviceWorker: Send {
    /// The queue receiving messages for topics under the device prefix.
    fn cmd_sender(&self) -> Sender<Msg>;

    /// Stops the worker and joins its thread.
    fn join(self: Box<Self>);
}

/// Everything a model factory needs to spawn a worker.
pub struct DeviceSpawnCtx {
    pub handle: DeviceHandle,
    /// Publishes back into the bus (the frontend's event queue).
    pub loopback: Sender<Msg>,
}

/// Spawns the upper-level worker for one device of a given model.
pub type DeviceFactory = Box<dyn Fn(DeviceSpawnCtx) -> Result<Box<dyn DeviceWorker>> + Send>;

/// A transport backend. Each backend owns a one-character topic prefix,
/// discovers devices, and reports its initialization result as an i32 on
/// `@/!init`.
pub trait Backend: Send {
    fn prefix(&self) -> char;

    /// Starts the backend. Device add/remove events and the `@/!init`
    /// report flow through `events`.
    fn initialize(&mut self, events: Sender<Msg>) -> Result<()>;

    fn finalize(&mut self);
}

/// A device known to the frontend, from `@/!add` until `@/!remove`.
pub(crate) struct Device {
    pub prefix: String,
    #[allow(dead_code)]
    pub handle: DeviceHandle,
    pub worker: Box<dyn DeviceWorker>,
    pub sub_id: SubId,
}
