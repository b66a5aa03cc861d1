//! Collaborator traits: the boundary between the replay engine and the
//! node it runs on.
//!
//! The engine never allocates packet memory, touches the radio, or measures
//! the channel itself. Hosts provide these four seams.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use replay_core::packet::REPLAY_PORT;
use replay_core::{NodeId, Packet, Priority};

// ── Packet pool ───────────────────────────────────────────────────────────────

/// Owner of packet memory. The cache hands bodies back through `release`.
pub trait PacketPool {
    /// Copy `packet` into pool-owned memory. The copy is flagged as cached.
    fn allocate_copy(&mut self, packet: &Packet) -> Result<Packet, PoolError>;

    fn release(&mut self, packet: Packet);

    /// Total heap available to the node, in bytes.
    fn heap_size(&self) -> usize;

    fn free_heap(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted: {needed} bytes requested, {free} free")]
    Exhausted { needed: usize, free: usize },
}

/// A pool that accounts packet footprints against a fixed heap size.
#[derive(Debug, Clone)]
pub struct HeapPool {
    heap: usize,
    used: usize,
    /// Bytes in use by everything other than cached packets.
    baseline: usize,
}

impl HeapPool {
    pub fn new(heap: usize) -> Self {
        Self {
            heap,
            used: 0,
            baseline: 0,
        }
    }

    /// Reserve `bytes` for the rest of the node, shrinking free heap.
    pub fn set_baseline(&mut self, bytes: usize) {
        self.baseline = bytes.min(self.heap);
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

impl PacketPool for HeapPool {
    fn allocate_copy(&mut self, packet: &Packet) -> Result<Packet, PoolError> {
        let needed = packet.footprint();
        let free = self.free_heap();
        if needed > free {
            return Err(PoolError::Exhausted { needed, free });
        }
        self.used += needed;
        let mut copy = packet.clone();
        copy.replay_cached = true;
        Ok(copy)
    }

    fn release(&mut self, packet: Packet) {
        self.used = self.used.saturating_sub(packet.footprint());
    }

    fn heap_size(&self) -> usize {
        self.heap
    }

    fn free_heap(&self) -> usize {
        self.heap.saturating_sub(self.used + self.baseline)
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// A replay protocol frame ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Broadcast for advertisements, the server for requests.
    pub to: NodeId,
    pub priority: Priority,
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Wrap as a single-hop mesh packet on the replay port.
    pub fn into_packet(self, from: NodeId, id: u32) -> Packet {
        Packet {
            from,
            to: self.to,
            id,
            priority: self.priority,
            hop_limit: 0,
            hop_start: 0,
            port: REPLAY_PORT,
            payload: self.payload,
            replay_cached: false,
        }
    }
}

/// The mesh router: transmits protocol frames and knows its own queue.
pub trait Router {
    /// Hand a frame to the transmit path. Must not block.
    fn send(&mut self, msg: OutboundMessage) -> Result<(), RouterError>;

    /// Whether the router already has (from, id) queued for transmission.
    fn is_queued(&self, from: NodeId, id: u32) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("transmit queue full")]
    QueueFull,
    #[error("radio unavailable")]
    Unavailable,
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Channel utilisation estimator, polled on demand.
pub trait ChannelMonitor {
    /// Current utilisation, 0..=100.
    fn utilization_percent(&self) -> u8;
}

/// A shared utilisation value, set by whoever measures the channel.
impl ChannelMonitor for Arc<AtomicU8> {
    fn utilization_percent(&self) -> u8 {
        self.load(Ordering::Relaxed).min(100)
    }
}

impl ChannelMonitor for u8 {
    fn utilization_percent(&self) -> u8 {
        (*self).min(100)
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Read-only facts about the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node: NodeId,
    pub is_router: bool,
}
