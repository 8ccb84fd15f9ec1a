//! The frontend dispatcher thread.
//!
//! One long-lived worker owns the pubsub, the device list, the outstanding
//! synchronous-call timeouts, and the transport backends. It consumes two
//! queues: API commands from caller threads and events from backends and
//! device workers. Each iteration drains the backend queue, drains the
//! command queue, runs pubsub delivery, and expires timeouts whose deadline
//! has passed.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::buffer::BufferMgr;
use crate::device::{Backend, Device, DeviceFactory, DeviceHandle, DeviceSpawnCtx};
use crate::error::{ErrorCode, Result};
use crate::meta::Meta;
use crate::msg::{Completion, Msg, MsgExtra};
use crate::pubsub::{next_sub_id, Pubsub, SubFlags, SubTarget};
use crate::topic;
use crate::value::{Payload, Value};

/// Cap on the frontend's sleep so deadline bookkeeping keeps polling.
const POLL_MAX: Duration = Duration::from_secs(1);

/// Driver version packed major.minor.patch as 8.8.16.
pub fn version_u32() -> u32 {
    let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch: u32 = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    (major << 24) | (minor << 16) | (patch & 0xffff)
}

pub(crate) struct FrontendHandle {
    pub cmd_tx: Sender<Msg>,
    join: Option<JoinHandle<()>>,
}

impl FrontendHandle {
    pub fn is_active(&self) -> bool {
        self.join.is_some()
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("frontend thread panicked");
            }
        }
    }
}

pub(crate) fn spawn(
    factories: FxHashMap<String, DeviceFactory>,
    backends: Vec<Box<dyn Backend>>,
) -> Result<FrontendHandle> {
    let (cmd_tx, cmd_rx) = unbounded();
    let (backend_tx, backend_rx) = unbounded();
    let loopback = cmd_tx.clone();
    let join = thread::Builder::new()
        .name("jsdrv-frontend".to_string())
        .spawn(move || {
            Frontend {
                pubsub: Pubsub::new(),
                cmd_rx,
                backend_rx,
                backend_tx,
                loopback,
                factories,
                backends,
                devices: Vec::new(),
                timeouts: Vec::new(),
                init: None,
                buffers: BufferMgr::new(),
                running: true,
                final_completion: None,
            }
            .run()
        })
        .map_err(|_| ErrorCode::Unspecified)?;
    Ok(FrontendHandle {
        cmd_tx,
        join: Some(join),
    })
}

/// Tracks the reference-counted backend initialization: every backend must
/// report an i32 on `@/!init` before the overall init completes.
struct PendingInit {
    remaining: usize,
    rc: i32,
}

struct Frontend {
    pubsub: Pubsub,
    cmd_rx: Receiver<Msg>,
    backend_rx: Receiver<Msg>,
    /// Event sender handed to backends and device workers.
    backend_tx: Sender<Msg>,
    /// Command-queue sender for frontend-side components.
    loopback: Sender<Msg>,
    factories: FxHashMap<String, DeviceFactory>,
    backends: Vec<Box<dyn Backend>>,
    devices: Vec<Device>,
    /// Outstanding synchronous calls, sorted by deadline.
    timeouts: Vec<Completion>,
    init: Option<PendingInit>,
    buffers: BufferMgr,
    running: bool,
    final_completion: Option<Completion>,
}

impl Frontend {
    fn run(mut self) {
        debug!("frontend start");
        self.publish_startup();
        while self.running {
            let timeout = self.next_wakeup();
            let first: Option<Msg> = select! {
                recv(self.backend_rx) -> msg => msg.ok(),
                recv(self.cmd_rx) -> msg => msg.ok(),
                default(timeout) => None,
            };
            if let Some(msg) = first {
                self.handle(msg);
            }
            while self.running {
                match self.backend_rx.try_recv() {
                    Ok(msg) => self.handle(msg),
                    Err(_) => break,
                }
            }
            while self.running {
                match self.cmd_rx.try_recv() {
                    Ok(msg) => self.handle(msg),
                    Err(_) => break,
                }
            }
            self.expire_timeouts();
        }
        self.shutdown();
    }

    fn publish_startup(&mut self) {
        let entries = [
            (
                "@/version",
                Value::from(version_u32()).with_retain(),
                Meta::new("u32", "Driver version, packed major.minor.patch 8.8.16."),
            ),
            (
                "@/timeout",
                Value::from(1000u32).with_retain(),
                Meta::new("u32", "Default synchronous-call timeout in milliseconds."),
            ),
            (
                "@/list",
                Value::str("").with_retain(),
                Meta::new("str", "Comma-separated list of attached device prefixes."),
            ),
        ];
        for (topic_str, value, meta) in entries {
            let _ = self.pubsub.publish(&Msg::new(topic_str, value));
            let _ = self.pubsub.publish(&Msg::new(
                format!("{topic_str}$"),
                Value::json(meta.to_json()),
            ));
        }
    }

    fn handle(&mut self, mut msg: Msg) {
        if msg.topic.ends_with('#') {
            self.match_return_code(&msg);
            let _ = self.pubsub.publish(&msg);
            return;
        }
        if let Some(result) = self.pubsub.command(&mut msg) {
            if let Some(completion) = msg.completion.take() {
                completion.signal(ErrorCode::rc_from_result(result));
            }
            return;
        }
        match msg.topic.as_str() {
            "@/!final" => {
                self.running = false;
                self.final_completion = msg.completion.take();
                return;
            }
            "@/!init" => {
                self.handle_init(msg);
                return;
            }
            "@/!add" => {
                let result = match msg.extra.take() {
                    Some(MsgExtra::DeviceAdd { handle }) => self.device_add(handle),
                    _ => Err(ErrorCode::ParameterInvalid),
                };
                self.finish_command(&msg.topic, result, msg.completion.take());
                return;
            }
            "@/!remove" => {
                let result = match &msg.value.payload {
                    Payload::Str(s) => {
                        let prefix = s.to_string();
                        self.device_remove(&prefix)
                    }
                    _ => Err(ErrorCode::ParameterInvalid),
                };
                self.finish_command(&msg.topic, result, msg.completion.take());
                return;
            }
            _ => {}
        }
        if BufferMgr::handles(&msg.topic) {
            let _ = self.pubsub.publish(&msg);
            self.buffers.on_msg(&msg, &mut self.pubsub, &self.loopback);
            if let Some(completion) = msg.completion.take() {
                self.pending_insert(completion);
            }
            return;
        }
        match self.pubsub.publish(&msg) {
            Ok(queue_count) => {
                if let Some(completion) = msg.completion.take() {
                    if queue_count > 0 {
                        // A worker owns the message; its return code or the
                        // deadline completes the call.
                        self.pending_insert(completion);
                    } else {
                        // The bus terminated the message.
                        completion.signal(0);
                    }
                }
            }
            Err(e) => {
                debug!("publish {} failed: {e}", msg.topic);
                if let Some(completion) = msg.completion.take() {
                    completion.signal_error(e);
                }
            }
        }
    }

    /// Publishes a return code for a frontend-handled command, and keeps
    /// the caller's completion pending so the return code completes it.
    fn finish_command(&mut self, base_topic: &str, result: Result<()>, completion: Option<Completion>) {
        let _ = self
            .loopback
            .send(Msg::return_code(base_topic, ErrorCode::rc_from_result(result)));
        if let Some(completion) = completion {
            self.pending_insert(completion);
        }
    }

    fn match_return_code(&mut self, msg: &Msg) {
        let rc = msg
            .value
            .to_i32()
            .unwrap_or_else(|e| e.to_i32());
        if let Some(pos) = self
            .timeouts
            .iter()
            .position(|c| c.key_topic == msg.topic)
        {
            let completion = self.timeouts.remove(pos);
            completion.signal(rc);
        }
    }

    fn handle_init(&mut self, mut msg: Msg) {
        match msg.value.payload {
            Payload::Null => {
                // API request: start every registered backend.
                if let Some(completion) = msg.completion.take() {
                    self.pending_insert(completion);
                }
                let mut remaining = 0;
                let mut rc = 0;
                let events = self.backend_tx.clone();
                for backend in &mut self.backends {
                    match backend.initialize(events.clone()) {
                        Ok(()) => remaining += 1,
                        Err(e) => {
                            warn!("backend '{}' failed to start: {e}", backend.prefix());
                            if rc == 0 {
                                rc = e.to_i32();
                            }
                        }
                    }
                }
                self.init = Some(PendingInit { remaining, rc });
                self.init_maybe_complete();
            }
            _ => {
                // A backend reporting its initialization result.
                let report = msg.value.to_i32().unwrap_or(ErrorCode::Unspecified.to_i32());
                if let Some(init) = self.init.as_mut() {
                    if init.remaining > 0 {
                        init.remaining -= 1;
                    }
                    if init.rc == 0 && report != 0 {
                        init.rc = report;
                    }
                }
                self.init_maybe_complete();
            }
        }
    }

    fn init_maybe_complete(&mut self) {
        if let Some(init) = &self.init {
            if init.remaining == 0 {
                let rc = init.rc;
                self.init = None;
                let _ = self.loopback.send(Msg::return_code("@/!init", rc));
            }
        }
    }

    fn device_add(&mut self, handle: DeviceHandle) -> Result<()> {
        let prefix = handle.prefix.clone();
        topic::validate(&prefix)?;
        if prefix.split('/').count() != 3 || topic::is_bus_local(&prefix) {
            return Err(ErrorCode::ParameterInvalid);
        }
        if self.devices.iter().any(|d| d.prefix == prefix) {
            return Err(ErrorCode::AlreadyExists);
        }
        let model = handle.model().ok_or(ErrorCode::ParameterInvalid)?.to_string();
        let loopback = self.backend_tx.clone();
        let worker = {
            let factory = self
                .factories
                .get(&model)
                .ok_or(ErrorCode::NotSupported)?;
            factory(DeviceSpawnCtx {
                handle: handle.clone(),
                loopback,
            })?
        };
        let sub_id = next_sub_id();
        self.pubsub.subscribe(
            &prefix,
            SubFlags::PUB | SubFlags::METADATA_REQ | SubFlags::QUERY_REQ,
            sub_id,
            SubTarget::Queue(worker.cmd_sender()),
        )?;
        info!("device added: {prefix}");
        self.devices.push(Device {
            prefix,
            handle,
            worker,
            sub_id,
        });
        self.publish_device_list();
        Ok(())
    }

    fn device_remove(&mut self, prefix: &str) -> Result<()> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.prefix == prefix)
            .ok_or(ErrorCode::NotFound)?;
        let device = self.devices.remove(pos);
        device.worker.join();
        self.pubsub.unsubscribe_all(device.sub_id);
        info!("device removed: {prefix}");
        self.publish_device_list();
        Ok(())
    }

    /// The comma-separated device prefix list, retained on `@/list`.
    fn publish_device_list(&mut self) {
        let list = self
            .devices
            .iter()
            .map(|d| d.prefix.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let _ = self
            .pubsub
            .publish(&Msg::new("@/list", Value::str(list).with_retain()));
    }

    fn pending_insert(&mut self, completion: Completion) {
        let pos = self
            .timeouts
            .partition_point(|c| c.deadline <= completion.deadline);
        self.timeouts.insert(pos, completion);
    }

    fn expire_timeouts(&mut self) {
        let now = Instant::now();
        while let Some(first) = self.timeouts.first() {
            if first.deadline > now {
                break;
            }
            let completion = self.timeouts.remove(0);
            debug!("synchronous call timed out: {}", completion.key_topic);
            completion.signal_error(ErrorCode::Timeout);
        }
    }

    /// The interval to the nearest deadline, capped for polling.
    fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        match self.timeouts.first() {
            Some(c) if c.deadline > now => (c.deadline - now).min(POLL_MAX),
            Some(_) => Duration::ZERO,
            None => POLL_MAX,
        }
    }

    fn shutdown(&mut self) {
        info!("frontend shutdown");
        let devices: Vec<Device> = self.devices.drain(..).collect();
        for device in devices {
            device.worker.join();
            self.pubsub.unsubscribe_all(device.sub_id);
        }
        self.buffers.finalize(&mut self.pubsub);
        for backend in &mut self.backends {
            backend.finalize();
        }
        for completion in self.timeouts.drain(..) {
            completion.signal_error(ErrorCode::Aborted);
        }
        if let Some(completion) = self.final_completion.take() {
            completion.signal(0);
        }
        debug!("frontend done");
    }
}
