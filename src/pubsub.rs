//! The hierarchical publish/subscribe bus with retained values.
//!
//! The topic tree is an arena of nodes indexed by position; children keep
//! insertion order so retained-value replay and metadata walks visit nodes
//! in creation order. The tree grows monotonically: nodes are created on
//! first publish or subscribe and never destroyed.
//!
//! All methods run on the frontend thread; concurrency is handled by the
//! queues in front of it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use crossbeam_channel::Sender;
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::error::{ErrorCode, Result};
use crate::msg::{Msg, MsgExtra};
use crate::topic::{self, MsgKind};
use crate::value::Value;

bitflags! {
    /// Selects which delivery categories a subscriber receives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubFlags: u8 {
        /// Replay retained state at subscription time.
        const RETAIN = 0x01;
        /// Value publications.
        const PUB = 0x02;
        /// Metadata requests (`%`).
        const METADATA_REQ = 0x04;
        /// Metadata responses (`$`).
        const METADATA_RSP = 0x08;
        /// Query requests (`?`).
        const QUERY_REQ = 0x10;
        /// Query responses (`&`).
        const QUERY_RSP = 0x20;
        /// Return codes (`#`).
        const RETURN_CODE = 0x40;
    }
}

impl SubFlags {
    /// The flag bit a message of `kind` must match to be delivered.
    pub fn for_kind(kind: MsgKind) -> SubFlags {
        match kind {
            MsgKind::Pub => SubFlags::PUB,
            MsgKind::MetadataReq => SubFlags::METADATA_REQ,
            MsgKind::MetadataRsp => SubFlags::METADATA_RSP,
            MsgKind::QueryReq => SubFlags::QUERY_REQ,
            MsgKind::QueryRsp => SubFlags::QUERY_RSP,
            MsgKind::ReturnCode => SubFlags::RETURN_CODE,
        }
    }
}

/// Subscriber identity. Unique per process; allocated by [`next_sub_id`].
pub type SubId = u64;

static SUB_ID_NEXT: AtomicU64 = AtomicU64::new(1);

pub fn next_sub_id() -> SubId {
    SUB_ID_NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Where a delivery goes.
#[derive(Clone)]
pub enum SubTarget {
    /// An internal worker: the subscriber receives its own message copy on
    /// its command queue.
    Queue(Sender<Msg>),
    /// An external callback, invoked on the frontend thread with the topic
    /// and a borrowed value.
    Callback(Arc<dyn Fn(&str, &Value) + Send + Sync>),
}

struct SubEntry {
    id: SubId,
    flags: SubFlags,
    target: SubTarget,
}

struct Node {
    /// Full base path of this node ("" for the root).
    topic: String,
    parent: Option<usize>,
    /// Insertion order, preserved for replay and metadata walks.
    children: Vec<usize>,
    child_by_name: FxHashMap<String, usize>,
    retained: Option<Value>,
    metadata: Option<Value>,
    subs: Vec<SubEntry>,
}

impl Node {
    fn new(topic: String, parent: Option<usize>) -> Node {
        Node {
            topic,
            parent,
            children: Vec::new(),
            child_by_name: FxHashMap::default(),
            retained: None,
            metadata: None,
            subs: Vec::new(),
        }
    }
}

pub struct Pubsub {
    nodes: Vec<Node>,
}

const ROOT: usize = 0;

impl Default for Pubsub {
    fn default() -> Self {
        Self::new()
    }
}

impl Pubsub {
    pub fn new() -> Pubsub {
        Pubsub {
            nodes: vec![Node::new(String::new(), None)],
        }
    }

    fn node_find(&self, base: &str) -> Option<usize> {
        if base.is_empty() {
            return Some(ROOT);
        }
        let mut idx = ROOT;
        for level in base.split('/') {
            idx = *self.nodes[idx].child_by_name.get(level)?;
        }
        Some(idx)
    }

    fn node_get(&mut self, base: &str) -> usize {
        if base.is_empty() {
            return ROOT;
        }
        let mut idx = ROOT;
        let mut path = String::with_capacity(base.len());
        for level in base.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(level);
            idx = match self.nodes[idx].child_by_name.get(level) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::new(path.clone(), Some(idx)));
                    self.nodes[idx].children.push(child);
                    self.nodes[idx]
                        .child_by_name
                        .insert(level.to_string(), child);
                    child
                }
            };
        }
        idx
    }

    fn deliver(target: &SubTarget, msg: &Msg, queue_count: &mut u32) {
        match target {
            SubTarget::Queue(tx) => {
                if tx.send(msg.clone_for_delivery()).is_err() {
                    debug!("subscriber queue disconnected for {}", msg.topic);
                } else {
                    *queue_count += 1;
                }
            }
            SubTarget::Callback(cb) => cb(&msg.topic, &msg.value),
        }
    }

    /// Delivers `msg` through the topic tree.
    ///
    /// Stores retained values and metadata as a side effect, then emits a
    /// delivery for every matching subscriber on the node and on every
    /// proper ancestor, in registration order. Returns the number of queue
    /// deliveries, which the frontend uses to decide whether anyone owns
    /// the message's return code.
    pub fn publish(&mut self, msg: &Msg) -> Result<u32> {
        topic::validate(&msg.topic)?;
        let (base, kind) = topic::classify(&msg.topic);
        let idx = self.node_get(base);
        match kind {
            MsgKind::Pub => {
                if msg.value.retain && topic::is_retainable(base) {
                    self.nodes[idx].retained = Some(msg.value.clone());
                }
            }
            MsgKind::MetadataRsp => {
                self.nodes[idx].metadata = Some(msg.value.clone());
            }
            _ => {}
        }

        let want = SubFlags::for_kind(kind);
        let mut queue_count = 0;
        let mut at = Some(idx);
        while let Some(n) = at {
            for sub in &self.nodes[n].subs {
                if !sub.flags.contains(want) {
                    continue;
                }
                if msg.src == Some(sub.id) {
                    continue;
                }
                Self::deliver(&sub.target, msg, &mut queue_count);
            }
            at = self.nodes[n].parent;
        }
        Ok(queue_count)
    }

    /// Registers a subscriber. A duplicate subscription (same topic, same
    /// subscriber id) coalesces into the existing entry.
    ///
    /// When `RETAIN` is set, retained state along the subtree is replayed
    /// immediately to the new subscriber, in node creation order, metadata
    /// before value.
    pub fn subscribe(
        &mut self,
        topic_str: &str,
        flags: SubFlags,
        id: SubId,
        target: SubTarget,
    ) -> Result<()> {
        topic::validate(topic_str)?;
        let (base, kind) = topic::classify(topic_str);
        if kind != MsgKind::Pub {
            return Err(ErrorCode::ParameterInvalid);
        }
        let idx = self.node_get(base);
        match self.nodes[idx].subs.iter_mut().find(|s| s.id == id) {
            Some(existing) => {
                existing.flags = flags;
                existing.target = target.clone();
            }
            None => self.nodes[idx].subs.push(SubEntry {
                id,
                flags,
                target: target.clone(),
            }),
        }
        if flags.contains(SubFlags::RETAIN) {
            self.replay(idx, flags, &target);
        }
        Ok(())
    }

    fn replay(&self, idx: usize, flags: SubFlags, target: &SubTarget) {
        let mut queue_count = 0;
        let node = &self.nodes[idx];
        if flags.contains(SubFlags::METADATA_RSP) {
            if let Some(meta) = &node.metadata {
                let mut t = node.topic.clone();
                t.push('$');
                Self::deliver(target, &Msg::new(t, meta.clone()), &mut queue_count);
            }
        }
        if flags.contains(SubFlags::PUB) {
            if let Some(value) = &node.retained {
                Self::deliver(
                    target,
                    &Msg::new(node.topic.clone(), value.clone()),
                    &mut queue_count,
                );
            }
        }
        for &child in &node.children {
            self.replay(child, flags, target);
        }
    }

    /// Removes matching entries on the named node only.
    pub fn unsubscribe(&mut self, topic_str: &str, id: SubId) -> Result<()> {
        let (base, _) = topic::classify(topic_str);
        let idx = self.node_find(base).ok_or(ErrorCode::NotFound)?;
        self.nodes[idx].subs.retain(|s| s.id != id);
        Ok(())
    }

    /// Removes every entry registered under `id`, tree-wide.
    pub fn unsubscribe_all(&mut self, id: SubId) {
        for node in &mut self.nodes {
            node.subs.retain(|s| s.id != id);
        }
    }

    /// The retained value of a topic.
    pub fn query(&self, topic_str: &str) -> Result<&Value> {
        topic::validate(topic_str)?;
        let (base, _) = topic::classify(topic_str);
        let idx = self.node_find(base).ok_or(ErrorCode::NotFound)?;
        self.nodes[idx].retained.as_ref().ok_or(ErrorCode::NotFound)
    }

    /// Copies the retained string/json/binary value into `out`.
    ///
    /// String and JSON values are NUL-terminated in the destination; the
    /// returned length includes the terminator. Fails with `TooSmall` when
    /// the retained value does not fit and `ParameterInvalid` for payloads
    /// that have no byte representation.
    pub fn query_into(&self, topic_str: &str, out: &mut [u8]) -> Result<usize> {
        self.query(topic_str)?.copy_into(out)
    }

    /// The retained metadata document of a topic.
    pub fn metadata(&self, topic_str: &str) -> Option<&Value> {
        let (base, _) = topic::classify(topic_str);
        self.node_find(base)
            .and_then(|idx| self.nodes[idx].metadata.as_ref())
    }

    /// Runs the bus-internal command carried in `msg.extra`, if any.
    ///
    /// Returns `None` when the message is a plain publication or when the
    /// extra is not a bus command (device adds belong to the frontend and
    /// are left in place).
    pub fn command(&mut self, msg: &mut Msg) -> Option<Result<()>> {
        match msg.extra.take() {
            None => None,
            Some(extra @ MsgExtra::DeviceAdd { .. }) => {
                msg.extra = Some(extra);
                None
            }
            Some(MsgExtra::Subscribe {
                sub_id,
                flags,
                target,
            }) => Some(self.subscribe(&msg.topic, flags, sub_id, target)),
            Some(MsgExtra::Unsubscribe { sub_id }) => Some(self.unsubscribe(&msg.topic, sub_id)),
            Some(MsgExtra::UnsubscribeAll { sub_id }) => {
                self.unsubscribe_all(sub_id);
                Some(Ok(()))
            }
            Some(MsgExtra::Query { reply }) => {
                let result = self.query(&msg.topic).cloned();
                if reply.send(result).is_err() {
                    warn!("query caller went away for {}", msg.topic);
                }
                Some(Ok(()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn collector() -> (
        SubTarget,
        crossbeam_channel::Receiver<(String, Value)>,
    ) {
        let (tx, rx) = unbounded();
        let target = SubTarget::Callback(Arc::new(move |topic: &str, value: &Value| {
            let _ = tx.send((topic.to_string(), value.clone()));
        }));
        (target, rx)
    }

    #[test]
    fn retained_round_trip() {
        let mut ps = Pubsub::new();
        let msg = Msg::new(
            "u/js110/123456/hello",
            Value::str("world").with_retain(),
        );
        ps.publish(&msg).unwrap();
        assert_eq!(
            ps.query("u/js110/123456/hello").unwrap(),
            &Value::str("world")
        );
    }

    #[test]
    fn subscribe_replays_then_delivers() {
        let mut ps = Pubsub::new();
        ps.publish(&Msg::new(
            "u/js110/123456/hello",
            Value::str("world").with_retain(),
        ))
        .unwrap();

        let (target, rx) = collector();
        let id = next_sub_id();
        ps.subscribe("", SubFlags::RETAIN | SubFlags::PUB, id, target)
            .unwrap();
        let (topic, value) = rx.try_recv().unwrap();
        assert_eq!(topic, "u/js110/123456/hello");
        assert_eq!(value, Value::str("world"));
        assert!(rx.try_recv().is_err());

        ps.unsubscribe("", id).unwrap();
        ps.publish(&Msg::new(
            "u/js110/123456/hello",
            Value::str("world").with_retain(),
        ))
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_retained_topics_do_not_retain() {
        let mut ps = Pubsub::new();
        ps.publish(&Msg::new("a/!cmd", Value::from(1u8).with_retain()))
            .unwrap();
        assert_eq!(ps.query("a/!cmd"), Err(ErrorCode::NotFound));
    }

    #[test]
    fn replay_in_creation_order_metadata_first() {
        let mut ps = Pubsub::new();
        ps.publish(&Msg::new("d/b", Value::from(1u8).with_retain()))
            .unwrap();
        ps.publish(&Msg::new("d/a", Value::from(2u8).with_retain()))
            .unwrap();
        ps.publish(&Msg::new("d/b$", Value::json(r#"{"dtype":"u8"}"#)))
            .unwrap();

        let (target, rx) = collector();
        ps.subscribe(
            "d",
            SubFlags::RETAIN | SubFlags::PUB | SubFlags::METADATA_RSP,
            next_sub_id(),
            target,
        )
        .unwrap();
        // "d/b" was created first, so it replays before "d/a"; its metadata
        // precedes its value.
        let events: Vec<String> = rx.try_iter().map(|(t, _)| t).collect();
        assert_eq!(events, vec!["d/b$", "d/b", "d/a"]);
    }

    #[test]
    fn ancestors_receive_descendant_publishes() {
        let mut ps = Pubsub::new();
        let (target, rx) = collector();
        ps.subscribe("u/js110", SubFlags::PUB, next_sub_id(), target)
            .unwrap();
        ps.publish(&Msg::new("u/js110/123456/v", Value::from(3u8)))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().0, "u/js110/123456/v");
        // Sibling trees stay quiet.
        ps.publish(&Msg::new("u/js220/x", Value::from(3u8))).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn flag_mask_filters_kinds() {
        let mut ps = Pubsub::new();
        let (target, rx) = collector();
        ps.subscribe("t", SubFlags::RETURN_CODE, next_sub_id(), target)
            .unwrap();
        ps.publish(&Msg::new("t/v", Value::from(0u8))).unwrap();
        assert!(rx.try_recv().is_err());
        ps.publish(&Msg::return_code("t/v", 0)).unwrap();
        assert_eq!(rx.try_recv().unwrap().0, "t/v#");
    }

    #[test]
    fn echo_suppression_by_source() {
        let mut ps = Pubsub::new();
        let (target, rx) = collector();
        let id = next_sub_id();
        ps.subscribe("t", SubFlags::PUB, id, target).unwrap();
        ps.publish(&Msg::new("t/v", Value::from(1u8)).with_src(id))
            .unwrap();
        assert!(rx.try_recv().is_err());
        ps.publish(&Msg::new("t/v", Value::from(1u8))).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn duplicate_subscription_coalesces() {
        let mut ps = Pubsub::new();
        let (target, rx) = collector();
        let id = next_sub_id();
        ps.subscribe("t", SubFlags::PUB, id, target.clone()).unwrap();
        ps.subscribe("t", SubFlags::PUB, id, target).unwrap();
        ps.publish(&Msg::new("t/v", Value::from(1u8))).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn query_into_sizing() {
        let mut ps = Pubsub::new();
        ps.publish(&Msg::new("u/x", Value::str("hello world").with_retain()))
            .unwrap();
        let mut small = [0u8; 5];
        assert_eq!(ps.query_into("u/x", &mut small), Err(ErrorCode::TooSmall));
        let mut buf = [0u8; 12];
        assert_eq!(ps.query_into("u/x", &mut buf), Ok(12));
        assert_eq!(&buf, b"hello world\0");
        assert_eq!(ps.query_into("u/missing", &mut buf), Err(ErrorCode::NotFound));
    }

    #[test]
    fn queue_subscriber_counts_deliveries() {
        let mut ps = Pubsub::new();
        let (tx, rx) = unbounded();
        ps.subscribe("dev", SubFlags::PUB, next_sub_id(), SubTarget::Queue(tx))
            .unwrap();
        let n = ps.publish(&Msg::new("dev/ctl", Value::from(1u8))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(rx.try_recv().unwrap().topic, "dev/ctl");
        let n = ps.publish(&Msg::new("other", Value::from(1u8))).unwrap();
        assert_eq!(n, 0);
    }
}
