//! Streaming memory buffers.
//!
//! The manager runs on the frontend thread and owns buffer lifecycle behind
//! three bus topics: `m/@/!add` (u32 id), `m/@/!remove`, and the retained
//! `m/@/list`. Each live buffer runs its own worker thread subscribed to
//! the `m/{id}` subtree.

pub(crate) mod bufsig;
pub(crate) mod worker;

use crossbeam_channel::Sender;
use log::info;
use rustc_hash::FxHashMap;

use crate::error::{ErrorCode, Result};
use crate::msg::Msg;
use crate::pubsub::{Pubsub, SubFlags, SubTarget};
use crate::value::Value;

use worker::BufferHandle;

/// Buffer ids are u32 in `[1, BUFFER_ID_MAX]`.
pub const BUFFER_ID_MAX: u32 = 16;

pub(crate) struct BufferMgr {
    buffers: FxHashMap<u32, BufferHandle>,
}

impl BufferMgr {
    pub fn new() -> BufferMgr {
        BufferMgr {
            buffers: FxHashMap::default(),
        }
    }

    /// True for topics the manager consumes.
    pub fn handles(topic: &str) -> bool {
        topic.starts_with("m/@/")
    }

    /// Handles one `m/@` command and publishes its return code. The
    /// retained `m/@/list` is the manager's own output, not a command.
    pub fn on_msg(&mut self, msg: &Msg, pubsub: &mut Pubsub, loopback: &Sender<Msg>) {
        let result = match msg.topic.as_str() {
            "m/@/!add" => msg
                .value
                .to_u32()
                .and_then(|id| self.add(id, pubsub, loopback)),
            "m/@/!remove" => msg
                .value
                .to_u32()
                .and_then(|id| self.remove(id, pubsub, loopback)),
            "m/@/list" => return,
            _ => Err(ErrorCode::NotFound),
        };
        let _ = loopback.send(Msg::return_code(
            &msg.topic,
            ErrorCode::rc_from_result(result),
        ));
    }

    fn add(&mut self, id: u32, pubsub: &mut Pubsub, loopback: &Sender<Msg>) -> Result<()> {
        if id == 0 || id > BUFFER_ID_MAX {
            return Err(ErrorCode::ParameterInvalid);
        }
        if self.buffers.contains_key(&id) {
            return Err(ErrorCode::AlreadyExists);
        }
        let handle = worker::spawn(id, loopback.clone())?;
        pubsub.subscribe(
            &format!("m/{id}"),
            SubFlags::PUB,
            handle.sub_id,
            SubTarget::Queue(handle.tx.clone()),
        )?;
        info!("buffer {id} added");
        self.buffers.insert(id, handle);
        self.publish_list(loopback);
        Ok(())
    }

    fn remove(&mut self, id: u32, pubsub: &mut Pubsub, loopback: &Sender<Msg>) -> Result<()> {
        let handle = self.buffers.remove(&id).ok_or(ErrorCode::NotFound)?;
        pubsub.unsubscribe_all(handle.sub_id);
        handle.finalize();
        info!("buffer {id} removed");
        self.publish_list(loopback);
        Ok(())
    }

    /// Republishes the retained, zero-terminated list of active buffer ids.
    fn publish_list(&self, loopback: &Sender<Msg>) {
        let mut ids: Vec<u8> = self.buffers.keys().map(|&id| id as u8).collect();
        ids.sort_unstable();
        ids.push(0);
        let _ = loopback.send(Msg::new("m/@/list", Value::bin(ids).with_retain()));
    }

    pub fn finalize(&mut self, pubsub: &mut Pubsub) {
        for (_, handle) in self.buffers.drain() {
            pubsub.unsubscribe_all(handle.sub_id);
            handle.finalize();
        }
    }
}
