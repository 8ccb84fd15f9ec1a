//! The per-buffer worker thread.
//!
//! Each memory buffer runs one worker that owns its signal storage. The
//! worker is a pubsub queue subscriber for its own topic subtree `m/{id}`
//! and for every bound source topic; it answers commands with return codes
//! and serves at most one data request per loop iteration.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::buffer::bufsig::{r0_for, BufSig, RN, SUMMARY_ENTRY_SIZE};
use crate::error::{ErrorCode, Result};
use crate::msg::{Msg, MsgExtra};
use crate::pubsub::{next_sub_id, SubFlags, SubId, SubTarget};
use crate::queue::MsgQueue;
use crate::value::{AppClass, Payload, Value};
use crate::wire::{
    BufferRequest, BufferResponse, ResponseData, StreamHeader, TimeRange, BUFFER_VERSION,
};

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Buffer signal ids are u8 in [1, 255]; 0 is reserved.
const SIGNAL_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// No byte budget configured.
    Idle,
    /// Budget set; waiting for a stream header on every active signal so
    /// rates and element sizes are known.
    Await,
    Active,
}

/// The frontend-side handle of a running buffer worker.
pub(crate) struct BufferHandle {
    pub id: u32,
    pub tx: Sender<Msg>,
    pub sub_id: SubId,
    join: Option<JoinHandle<()>>,
}

impl BufferHandle {
    /// Stops the worker and joins its thread.
    pub fn finalize(mut self) {
        let topic = format!("m/{}/g/!final", self.id);
        let _ = self.tx.send(Msg::new(topic, Value::null()));
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("buffer {} worker panicked", self.id);
            }
        }
    }
}

pub(crate) fn spawn(id: u32, loopback: Sender<Msg>) -> Result<BufferHandle> {
    let queue = MsgQueue::new();
    let tx = queue.sender();
    let sub_id = next_sub_id();
    let join = thread::Builder::new()
        .name(format!("jsdrv-buf-{id}"))
        .spawn(move || Worker::new(id, sub_id, queue, loopback).run())
        .map_err(|_| ErrorCode::Unspecified)?;
    Ok(BufferHandle {
        id,
        tx,
        sub_id,
        join: Some(join),
    })
}

struct Worker {
    id: u32,
    /// The worker's `m/{id}` subscription identity; outgoing publications
    /// carry it so the pubsub suppresses the echo back to this queue.
    sub_id: SubId,
    /// `m/{id}`.
    prefix: String,
    queue: MsgQueue,
    loopback: Sender<Msg>,
    signals: Vec<Option<BufSig>>,
    /// Source topic to signal id, for stream routing.
    topic_to_signal: FxHashMap<String, u8>,
    /// Per-signal source subscription ids.
    sub_ids: FxHashMap<u8, SubId>,
    size: u64,
    hold: bool,
    state: BufferState,
    requests: VecDeque<(u8, BufferRequest)>,
    running: bool,
}

impl Worker {
    fn new(id: u32, sub_id: SubId, queue: MsgQueue, loopback: Sender<Msg>) -> Worker {
        let mut signals = Vec::with_capacity(SIGNAL_COUNT);
        signals.resize_with(SIGNAL_COUNT, || None);
        Worker {
            id,
            sub_id,
            prefix: format!("m/{id}"),
            queue,
            loopback,
            signals,
            topic_to_signal: FxHashMap::default(),
            sub_ids: FxHashMap::default(),
            size: 0,
            hold: false,
            state: BufferState::Idle,
            requests: VecDeque::new(),
            running: true,
        }
    }

    fn run(mut self) {
        debug!("buffer {} worker start", self.id);
        while self.running {
            let first = if self.requests.is_empty() {
                self.queue.pop(IDLE_POLL)
            } else {
                self.queue.try_pop()
            };
            if let Some(msg) = first {
                self.handle_msg(msg);
            }
            while self.running {
                match self.queue.try_pop() {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                }
            }
            if let Some((signal_id, req)) = self.requests.pop_front() {
                self.serve_request(signal_id, req);
            }
        }
        debug!("buffer {} worker done", self.id);
    }

    fn publish(&self, msg: Msg) {
        if self.loopback.send(msg.with_src(self.sub_id)).is_err() {
            debug!("buffer {}: frontend gone", self.id);
        }
    }

    fn publish_return_code(&self, topic: &str, rc: i32) {
        self.publish(Msg::return_code(topic, rc));
    }

    fn handle_msg(&mut self, msg: Msg) {
        if let Some(rest) = msg
            .topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
        {
            let rc = self.handle_command(rest, &msg);
            if self.running {
                self.publish_return_code(&msg.topic, ErrorCode::rc_from_result(rc));
            }
        } else {
            self.handle_stream(&msg);
        }
    }

    fn handle_command(&mut self, subtopic: &str, msg: &Msg) -> Result<()> {
        match subtopic {
            "a/!add" => self.signal_add(msg.value.to_u8()?),
            "a/!remove" => self.signal_remove(msg.value.to_u8()?),
            "g/size" => {
                self.size = msg.value.as_u64()?;
                if self.size == 0 {
                    for sig in self.signals.iter_mut().flatten() {
                        sig.dealloc();
                    }
                    self.state = BufferState::Idle;
                } else {
                    // Reallocation happens on the next stream header.
                    self.state = BufferState::Await;
                }
                Ok(())
            }
            "g/hold" => {
                self.hold = msg.value.as_bool()?;
                Ok(())
            }
            "g/!clear" => {
                for sig in self.signals.iter_mut().flatten() {
                    sig.clear();
                }
                Ok(())
            }
            "g/!final" => {
                self.running = false;
                Ok(())
            }
            "g/list" => Ok(()),
            _ => {
                if let Some(rest) = subtopic.strip_prefix("s/") {
                    let (sid_str, op) = rest.split_once('/').ok_or(ErrorCode::NotFound)?;
                    let signal_id: u8 =
                        sid_str.parse().map_err(|_| ErrorCode::ParameterInvalid)?;
                    match op {
                        "topic" => self.signal_set_topic(signal_id, &msg.value),
                        "!req" => self.signal_request(signal_id, &msg.value),
                        // Retained outputs are ours; everything else is not
                        // a command.
                        "info" => Ok(()),
                        _ => Err(ErrorCode::NotFound),
                    }
                } else {
                    Err(ErrorCode::NotFound)
                }
            }
        }
    }

    fn signal_add(&mut self, signal_id: u8) -> Result<()> {
        if signal_id == 0 {
            return Err(ErrorCode::ParameterInvalid);
        }
        let slot = &mut self.signals[signal_id as usize];
        match slot {
            Some(sig) => {
                // Re-add frees any previously allocated sample storage.
                sig.dealloc();
                sig.active = true;
            }
            None => {
                let mut sig = BufSig::new(signal_id);
                sig.active = true;
                *slot = Some(sig);
            }
        }
        if self.state == BufferState::Active {
            // The new signal changes the allocation split.
            self.state = BufferState::Await;
        }
        self.publish_signal_list();
        Ok(())
    }

    fn signal_remove(&mut self, signal_id: u8) -> Result<()> {
        if signal_id == 0 {
            return Err(ErrorCode::ParameterInvalid);
        }
        let sig = self.signals[signal_id as usize]
            .take()
            .ok_or(ErrorCode::NotFound)?;
        if !sig.source_topic.is_empty() {
            self.topic_to_signal.remove(&sig.source_topic);
            if let Some(sub_id) = self.sub_ids.remove(&signal_id) {
                self.publish(
                    Msg::new(sig.source_topic.clone(), Value::null())
                        .with_extra(MsgExtra::Unsubscribe { sub_id }),
                );
            }
        }
        self.requests.retain(|(sid, _)| *sid != signal_id);
        self.publish_signal_list();
        Ok(())
    }

    fn signal_set_topic(&mut self, signal_id: u8, value: &Value) -> Result<()> {
        let topic = match &value.payload {
            Payload::Str(s) => s.to_string(),
            _ => return Err(ErrorCode::ParameterInvalid),
        };
        let old_topic = {
            let sig = self.signals[signal_id as usize]
                .as_ref()
                .ok_or(ErrorCode::NotFound)?;
            if sig.source_topic == topic {
                return Ok(());
            }
            sig.source_topic.clone()
        };
        if !old_topic.is_empty() {
            self.topic_to_signal.remove(&old_topic);
            if let Some(sub_id) = self.sub_ids.remove(&signal_id) {
                self.publish(
                    Msg::new(old_topic, Value::null())
                        .with_extra(MsgExtra::Unsubscribe { sub_id }),
                );
            }
        }
        if let Some(sig) = self.signals[signal_id as usize].as_mut() {
            sig.source_topic = topic.clone();
            sig.dealloc();
        }
        self.topic_to_signal.insert(topic.clone(), signal_id);
        let sub_id = next_sub_id();
        self.sub_ids.insert(signal_id, sub_id);
        self.publish(
            Msg::new(topic, Value::null()).with_extra(MsgExtra::Subscribe {
                sub_id,
                flags: SubFlags::PUB,
                target: SubTarget::Queue(self.queue.sender()),
            }),
        );
        Ok(())
    }

    fn signal_request(&mut self, signal_id: u8, value: &Value) -> Result<()> {
        if self.signals[signal_id as usize].is_none() {
            return Err(ErrorCode::NotFound);
        }
        let bytes = value.bytes().ok_or(ErrorCode::ParameterInvalid)?;
        let req = BufferRequest::parse(bytes)?;
        // Identical (signal, rsp_topic, rsp_id) collapse to the latest
        // parameters.
        self.requests.retain(|(sid, r)| {
            !(*sid == signal_id && r.rsp_topic == req.rsp_topic && r.rsp_id == req.rsp_id)
        });
        self.requests.push_back((signal_id, req));
        Ok(())
    }

    fn publish_signal_list(&self) {
        let mut list: Vec<u8> = (1..SIGNAL_COUNT)
            .filter(|&i| self.signals[i].as_ref().is_some_and(|s| s.active))
            .map(|i| i as u8)
            .collect();
        list.push(0);
        self.publish(Msg::new(
            format!("{}/g/list", self.prefix),
            Value::bin(list).with_retain(),
        ));
    }

    fn publish_info(&self, signal_id: u8) {
        let Some(sig) = self.signals[signal_id as usize].as_ref() else {
            return;
        };
        let Ok(info) = sig.info() else { return };
        let Ok(encoded) = info.encode() else { return };
        self.publish(Msg::new(
            format!("{}/s/{}/info", self.prefix, signal_id),
            Value::bin(encoded)
                .with_retain()
                .with_app(AppClass::BufferInfo),
        ));
    }

    fn handle_stream(&mut self, msg: &Msg) {
        let Some(&signal_id) = self.topic_to_signal.get(&msg.topic) else {
            return;
        };
        let Some(bytes) = msg.value.bytes() else {
            return;
        };
        let (header, data) = match StreamHeader::parse(bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("buffer {}: bad stream block on {}: {e}", self.id, msg.topic);
                return;
            }
        };
        if self.hold {
            return;
        }
        match self.state {
            BufferState::Idle => {}
            BufferState::Await => {
                {
                    let Some(sig) = self.signals[signal_id as usize].as_mut() else {
                        return;
                    };
                    if let Err(e) = sig.observe_header(&header) {
                        warn!(
                            "buffer {}: signal {} header refused: {e}",
                            self.id, signal_id
                        );
                        return;
                    }
                }
                if self.try_allocate() {
                    // The block that completed configuration is the first
                    // block stored.
                    self.ingest(signal_id, &header, data);
                }
            }
            BufferState::Active => self.ingest(signal_id, &header, data),
        }
    }

    fn ingest(&mut self, signal_id: u8, header: &StreamHeader, data: &[u8]) {
        let Some(sig) = self.signals[signal_id as usize].as_mut() else {
            return;
        };
        if !sig.is_allocated() {
            return;
        }
        if let Err(e) = sig.recv_data(header, data) {
            warn!("buffer {}: signal {} ingest failed: {e}", self.id, signal_id);
        }
    }

    /// On `Await -> Active`: divide the byte budget by the total per-second
    /// cost of all active signals (including pyramid overhead) and size
    /// each signal for the resulting duration.
    fn try_allocate(&mut self) -> bool {
        if self.size == 0 {
            return false;
        }
        let active: Vec<u8> = (1..SIGNAL_COUNT)
            .filter(|&i| {
                self.signals[i]
                    .as_ref()
                    .is_some_and(|s| s.active && !s.source_topic.is_empty())
            })
            .map(|i| i as u8)
            .collect();
        if active.is_empty() {
            return false;
        }
        if active
            .iter()
            .any(|&id| self.signals[id as usize].as_ref().unwrap().meta().is_none())
        {
            return false;
        }

        // First pass bounds the per-sample pyramid cost with the full
        // geometric tail; the second pass uses the level count the first
        // pass implies.
        let mut seconds = 0.0;
        for pass in 0..2 {
            let mut cost_per_second = 0.0;
            for &id in &active {
                let sig = self.signals[id as usize].as_ref().unwrap();
                let meta = sig.meta().unwrap();
                let rate = meta.effective_rate();
                let r0 = r0_for(meta.element_type);
                let mut cost = meta.element_size_bits as f64 / 8.0;
                if pass == 0 {
                    cost += SUMMARY_ENTRY_SIZE as f64 / r0 as f64 * RN as f64 / (RN - 1) as f64;
                } else {
                    let duration = (seconds * rate) as u64;
                    let mut spe = r0;
                    loop {
                        cost += SUMMARY_ENTRY_SIZE as f64 / spe as f64;
                        if duration >= spe * RN {
                            spe *= RN;
                        } else {
                            break;
                        }
                    }
                }
                cost_per_second += rate * cost;
            }
            seconds = self.size as f64 / cost_per_second;
        }

        for &id in &active {
            let sig = self.signals[id as usize].as_mut().unwrap();
            let rate = sig.meta().unwrap().effective_rate();
            let duration = (seconds * rate) as u64;
            if let Err(e) = sig.alloc(duration) {
                warn!("buffer {}: signal {} allocation failed: {e}", self.id, id);
                return false;
            }
        }
        self.state = BufferState::Active;
        info!(
            "buffer {} active: {} signals, {:.3} s at {} bytes",
            self.id,
            active.len(),
            seconds,
            self.size
        );
        for &id in &active {
            self.publish_info(id);
        }
        true
    }

    fn serve_request(&mut self, signal_id: u8, req: BufferRequest) {
        let Some(sig) = self.signals[signal_id as usize].as_ref() else {
            return;
        };
        if !sig.is_allocated() {
            debug!(
                "buffer {}: request for unallocated signal {}",
                self.id, signal_id
            );
            return;
        }
        let (start, end, length) = match req.time {
            TimeRange::Samples { start, end, length } => {
                // `end` of zero means "start + length samples".
                let end = if end >= start {
                    end
                } else {
                    start + length.saturating_sub(1)
                };
                (start, end, length)
            }
            TimeRange::Utc { start, end, length } => {
                let (s, e) = {
                    sig.tmap.reader_enter();
                    let s = sig.tmap.timestamp_to_sample_id(start);
                    let e = sig.tmap.timestamp_to_sample_id(end);
                    sig.tmap.reader_exit();
                    (s, e)
                };
                match (s, e) {
                    (Ok(s), Ok(e)) if e >= s => (s, e, length),
                    _ => {
                        warn!(
                            "buffer {}: UTC request untranslatable on signal {}",
                            self.id, signal_id
                        );
                        return;
                    }
                }
            }
        };
        let want_samples = length == 0 || length >= end - start + 1;
        let result = if want_samples {
            sig.query_samples(start, end)
                .map(|(info, data)| (info, ResponseData::Samples(data)))
        } else {
            sig.query_summary(start, end, length)
                .map(|(info, entries)| (info, ResponseData::Summary(entries)))
        };
        let (info, data) = match result {
            Ok(out) => out,
            Err(e) => {
                warn!(
                    "buffer {}: request on signal {} refused: {e} \
                     (start {start}, end {end}, length {length})",
                    self.id, signal_id
                );
                return;
            }
        };
        let rsp = BufferResponse {
            version: BUFFER_VERSION,
            rsp_id: req.rsp_id,
            info,
            data,
        };
        match rsp.encode() {
            Ok(encoded) => self.publish(Msg::new(
                req.rsp_topic,
                Value::bin(encoded).with_app(AppClass::BufferResponse),
            )),
            Err(e) => warn!("buffer {}: response encode failed: {e}", self.id),
        }
        self.publish_info(signal_id);
    }
}
