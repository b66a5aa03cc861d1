//! Mesh packet model as seen by the replay subsystem.
//!
//! The replay layer never interprets application payloads. It only needs the
//! identity of a packet (origin + id), its mesh priority, and the hop fields
//! used to recognise direct neighbours.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Application port carrying replay protocol frames.
/// Packets on this port are never adopted into the cache.
pub const REPLAY_PORT: u16 = 0x4c;

// ── Node identity ─────────────────────────────────────────────────────────────

/// 32-bit mesh node number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Destination used for advertisements.
    pub const BROADCAST: NodeId = NodeId(u32::MAX);

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Truncated identifier carried in advertisement throttle lists.
    pub fn short(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId(0x{:08x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

// ── Priority ──────────────────────────────────────────────────────────────────

/// Mesh packet priority, 0..=127. Higher is more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const UNSET: Priority = Priority(0);
    pub const MIN: Priority = Priority(1);
    pub const BACKGROUND: Priority = Priority(10);
    pub const DEFAULT: Priority = Priority(64);
    pub const RELIABLE: Priority = Priority(70);
    pub const RESPONSE: Priority = Priority(80);
    pub const HIGH: Priority = Priority(100);
    pub const ALERT: Priority = Priority(110);
    pub const ACK: Priority = Priority(120);
    pub const MAX: Priority = Priority(127);

    /// Number of distinct priority levels.
    pub const LEVELS: usize = Self::MAX.0 as usize + 1;

    /// Values above MAX are clamped.
    pub const fn new(value: u8) -> Self {
        if value > Self::MAX.0 {
            Self::MAX
        } else {
            Priority(value)
        }
    }

    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ── Fingerprint ───────────────────────────────────────────────────────────────

/// 16-bit identity of a packet: origin and id XORed, then folded.
///
/// Collisions are possible and accepted. Two packets with the same
/// fingerprint are treated as the same packet for replay purposes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u16);

impl Fingerprint {
    pub fn of(from: NodeId, id: u32) -> Self {
        let x = from.0 ^ id;
        Fingerprint(((x >> 16) ^ (x & 0xFFFF)) as u16)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(0x{:04x})", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded mesh packet.
///
/// `payload` is reference counted, so handing a cached packet to the radio
/// layer does not copy the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub from: NodeId,
    pub to: NodeId,
    pub id: u32,
    pub priority: Priority,
    pub hop_limit: u8,
    pub hop_start: u8,
    pub port: u16,
    pub payload: Bytes,
    /// Set on the copy owned by the replay cache.
    pub replay_cached: bool,
}

impl Packet {
    pub fn new(from: NodeId, id: u32, priority: Priority, payload: impl Into<Bytes>) -> Self {
        Self {
            from,
            to: NodeId::BROADCAST,
            id,
            priority,
            hop_limit: 3,
            hop_start: 3,
            port: 1,
            payload: payload.into(),
            replay_cached: false,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.from, self.id)
    }

    pub fn is_replay_protocol(&self) -> bool {
        self.port == REPLAY_PORT
    }

    /// Received directly from a neighbour, without relaying.
    pub fn is_direct(&self) -> bool {
        self.hop_limit == self.hop_start
    }

    /// Approximate heap cost of keeping this packet cached.
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Packet>() + self.payload.len()
    }
}
