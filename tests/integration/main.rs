//! Replay protocol integration tests.
//!
//! Nodes run in-process. `Mesh` moves frames between engines synchronously
//! and under test control, so every scenario is deterministic: time only
//! moves when a test passes a later `Instant`, and a frame is lost only when
//! the test's `lose` filter says so.
//!
//!   cargo test --test integration

use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replay_core::config::ReplayConfig;
use replay_core::wire::Message;
use replay_core::{Fingerprint, NodeId, Packet, Priority};
use replay_services::ports::RouterError;
use replay_services::{HeapPool, NodeIdentity, OutboundMessage, ReplayEngine, Router, WakeReason};

mod daemon;
mod resync;
mod scenario;
mod sequence;
mod throttle;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const A: NodeId = NodeId(0x0000_0A0A);
pub const B: NodeId = NodeId(0x0000_0B0B);

/// Origin of the test traffic; never a member of the mesh.
pub const ORIGIN: NodeId = NodeId(0x0000_7777);

/// Router that keeps outgoing frames until the mesh collects them.
#[derive(Default)]
pub struct Outbox {
    sent: Vec<OutboundMessage>,
}

impl Router for Outbox {
    fn send(&mut self, msg: OutboundMessage) -> Result<(), RouterError> {
        self.sent.push(msg);
        Ok(())
    }

    fn is_queued(&self, _from: NodeId, _id: u32) -> bool {
        false
    }
}

pub type TestEngine = ReplayEngine<Outbox, Arc<AtomicU8>, HeapPool>;

/// Config used by every scenario: no startup delay, so the first flush is
/// due one flush interval after start.
pub fn test_config() -> ReplayConfig {
    let mut config = ReplayConfig::default();
    config.advert.startup_delay_secs = 0;
    config
}

pub struct Node {
    pub id: NodeId,
    pub engine: TestEngine,
    pub chutil: Arc<AtomicU8>,
    next_id: u32,
}

impl Node {
    pub fn new(id: NodeId, config: &ReplayConfig, now: Instant) -> Self {
        let chutil = Arc::new(AtomicU8::new(10));
        let engine = ReplayEngine::new(
            NodeIdentity {
                node: id,
                is_router: false,
            },
            config,
            Outbox::default(),
            chutil.clone(),
            HeapPool::new(1 << 24),
            now,
        );
        Self {
            id,
            engine,
            chutil,
            next_id: 1,
        }
    }

    /// Take in a frame heard on air.
    pub fn receive(&mut self, packet: &Packet, now: Instant) {
        if packet.is_replay_protocol() {
            if let Some(reason) = self.engine.handle_received(packet, now) {
                self.engine.on_notify(reason, now);
            }
        } else if !self.engine.is_known(packet.fingerprint())
            && self.engine.adopt(packet).is_some()
        {
            self.engine.on_notify(WakeReason::Adopted, now);
        }
    }

    /// Frames this node has put on air since the last call.
    fn collect(&mut self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = std::mem::take(&mut self.engine.router_mut().sent)
            .into_iter()
            .map(|msg| {
                self.next_id += 1;
                Frame {
                    sender: self.id,
                    packet: msg.into_packet(self.id, self.next_id),
                }
            })
            .collect();
        while let Some(mut packet) = self.engine.queue_pop() {
            packet.replay_cached = false;
            frames.push(Frame {
                sender: self.id,
                packet,
            });
        }
        frames
    }
}

/// One transmission.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sender: NodeId,
    pub packet: Packet,
}

impl Frame {
    pub fn message(&self) -> Option<Message> {
        if !self.packet.is_replay_protocol() {
            return None;
        }
        Message::decode(&self.packet.payload).ok()
    }
}

pub struct Mesh {
    pub nodes: Vec<Node>,
    pub start: Instant,
}

impl Mesh {
    pub fn new(ids: &[NodeId], config: &ReplayConfig) -> Self {
        let start = Instant::now();
        Self {
            nodes: ids.iter().map(|&id| Node::new(id, config, start)).collect(),
            start,
        }
    }

    pub fn at(&self, secs: u64) -> Instant {
        self.start + Duration::from_secs(secs)
    }

    pub fn node(&mut self, id: NodeId) -> &mut Node {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .unwrap_or_else(|| panic!("{id} is not in the mesh"));
        &mut self.nodes[pos]
    }

    /// Deliver everything on air, and everything that provokes, until the
    /// mesh is quiet. Returns every frame sent, lost ones included.
    pub fn pump(&mut self, now: Instant, mut lose: impl FnMut(NodeId, &Frame) -> bool) -> Vec<Frame> {
        let mut log = Vec::new();
        for _ in 0..64 {
            let frames: Vec<Frame> = self.nodes.iter_mut().flat_map(Node::collect).collect();
            if frames.is_empty() {
                break;
            }
            for frame in &frames {
                self.deliver(frame, now, &mut lose);
            }
            log.extend(frames);
        }
        log
    }

    pub fn deliver(&mut self, frame: &Frame, now: Instant, mut lose: impl FnMut(NodeId, &Frame) -> bool) {
        for node in self.nodes.iter_mut() {
            if node.id != frame.sender && !lose(node.id, frame) {
                node.receive(&frame.packet, now);
            }
        }
    }

    /// Wake every node, then pump.
    pub fn tick(&mut self, now: Instant, lose: impl FnMut(NodeId, &Frame) -> bool) -> Vec<Frame> {
        for node in self.nodes.iter_mut() {
            node.engine.on_notify(WakeReason::Interval, now);
        }
        self.pump(now, lose)
    }
}

pub fn lossless(_receiver: NodeId, _frame: &Frame) -> bool {
    false
}

/// A packet from `ORIGIN`, as if relayed through the mesh.
pub fn traffic(id: u32, priority: Priority) -> Packet {
    Packet::new(ORIGIN, id, priority, format!("payload {id}").into_bytes())
}

pub fn fp(id: u32) -> Fingerprint {
    Fingerprint::of(ORIGIN, id)
}

/// Replay protocol messages `sender` put on air.
pub fn messages_from(log: &[Frame], sender: NodeId) -> Vec<Message> {
    log.iter()
        .filter(|f| f.sender == sender)
        .filter_map(Frame::message)
        .collect()
}

/// Data packets (not protocol frames) `sender` put on air.
pub fn data_from(log: &[Frame], sender: NodeId) -> Vec<Packet> {
    log.iter()
        .filter(|f| f.sender == sender && !f.packet.is_replay_protocol())
        .map(|f| f.packet.clone())
        .collect()
}
