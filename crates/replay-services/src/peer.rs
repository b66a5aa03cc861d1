//! Server registry: nearby nodes we may request replays from.
//!
//! Each tracked server carries what it claims to have (in its own slot
//! coordinates), what we are missing from it, and a sequence tracker that
//! notices missed advertisements.

use std::time::{Duration, Instant};

use replay_core::wire::{SEQUENCE_MASK, SEQUENCE_WINDOW, SLOTS};
use replay_core::{Fingerprint, NodeId, SlotBits};

// ── Sequence tracking ─────────────────────────────────────────────────────────

/// Wire sequences this far behind the last in-order value are regressions;
/// further behind they are taken as a forward wrap.
pub const SEQUENCE_TOLERANCE: u32 = 15;

/// Why a server's state was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    Boot,
    Stale,
    /// Sequence went backwards.
    Regressed,
    /// Too many advertisements missed to catch up with aggregates.
    TooFarBehind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    /// First advertisement; sets the baseline.
    Baseline,
    Tracked,
    Resync(ResyncReason),
}

/// Unwrapped advertisement sequence bookkeeping for one server.
///
/// `last` is the newest sequence received with nothing missing before it,
/// `max` the highest seen. Bit i of `missing` means sequence `last + i`
/// has not been received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    last: u32,
    max: u32,
    missing: u32,
    started: bool,
}

impl SequenceTracker {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Last in-order sequence as carried on the wire.
    pub fn last_wire(&self) -> u8 {
        (self.last & SEQUENCE_MASK) as u8
    }

    /// Missing sequences relative to `last_wire`, as sent in a resend request.
    pub fn missing_mask(&self) -> u16 {
        (self.missing & 0xFFFF) as u16
    }

    pub fn has_gaps(&self) -> bool {
        self.missing != 0
    }

    fn baseline(&mut self, wire: u32) {
        // Keep unwrapped values at least one window above zero.
        self.last = SEQUENCE_WINDOW + wire;
        self.max = self.last;
        self.missing = 0;
        self.started = true;
    }

    /// Feed the sequence of an incoming advertisement. `aggregate_mask` is
    /// present for aggregate resends, whose sequence names the first
    /// covered advertisement rather than a new one.
    pub fn observe(&mut self, wire: u8, aggregate_mask: Option<u16>) -> SequenceEvent {
        let wire = u32::from(wire) & SEQUENCE_MASK;
        if !self.started {
            self.baseline(wire);
            return SequenceEvent::Baseline;
        }

        let mut this = (self.last & !SEQUENCE_MASK) | wire;
        if this + SEQUENCE_TOLERANCE < self.last {
            this += SEQUENCE_WINDOW;
        }

        match aggregate_mask {
            None => {
                let reason = if this < self.last {
                    Some(ResyncReason::Regressed)
                } else if this.max(self.max) - self.last > SEQUENCE_TOLERANCE {
                    Some(ResyncReason::TooFarBehind)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    self.baseline(wire);
                    return SequenceEvent::Resync(reason);
                }
                if this > self.max {
                    for seq in self.max + 1..this {
                        self.missing |= 1 << (seq - self.last);
                    }
                    self.max = this;
                } else if this > self.last {
                    // a late arrival fills its own gap
                    self.missing &= !(1 << (this - self.last));
                }
            }
            Some(mask) => {
                for i in (0..16).filter(|&i| mask & (1 << i) != 0) {
                    let seq = this + i;
                    if seq <= self.last || seq - self.last >= SEQUENCE_WINDOW {
                        continue;
                    }
                    self.missing &= !(1 << (seq - self.last));
                    self.max = self.max.max(seq);
                }
            }
        }
        self.advance();
        SequenceEvent::Tracked
    }

    fn advance(&mut self) {
        while self.last < self.max && self.missing & 0b11 == 0 {
            self.missing >>= 1;
            self.last += 1;
        }
    }
}

// ── Server info ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Heard from, not (yet) admitted to the table.
    Unknown,
    Tracked,
    /// State discarded; rebuilding from the current advertisement.
    Resyncing,
}

/// Everything we know about one server.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: NodeId,
    pub state: PeerState,
    pub discovered: Instant,
    pub last_advert: Instant,
    /// Server is congested and only offers high-priority packets.
    pub priority_only: bool,
    pub router: bool,
    pub adverts_received: u32,
    pub replays_requested: u32,
    pub sequence: SequenceTracker,
    pub available: SlotBits,
    pub priority: SlotBits,
    pub missing: SlotBits,
    /// Fingerprint advertised at each of the server's slots.
    pub fingerprints: Vec<Fingerprint>,
}

impl ServerInfo {
    pub fn new(id: NodeId, now: Instant) -> Self {
        Self {
            id,
            state: PeerState::Unknown,
            discovered: now,
            last_advert: now,
            priority_only: false,
            router: false,
            adverts_received: 0,
            replays_requested: 0,
            sequence: SequenceTracker::default(),
            available: SlotBits::new(),
            priority: SlotBits::new(),
            missing: SlotBits::new(),
            fingerprints: vec![Fingerprint::default(); SLOTS],
        }
    }

    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_advert) > stale_after
    }

    /// Forget availability; the sequence baseline is kept.
    pub fn clear_availability(&mut self) {
        self.available.clear_all();
        self.priority.clear_all();
        self.missing.clear_all();
    }

    /// Forget availability and sequence state.
    pub fn invalidate(&mut self) {
        self.clear_availability();
        self.sequence.reset();
        if self.state == PeerState::Tracked {
            self.state = PeerState::Resyncing;
        }
    }

    /// Slots worth requesting: missing, available, and high priority when
    /// the server is congested.
    pub fn wanted(&self) -> SlotBits {
        let mut wanted = self.missing & self.available;
        if self.priority_only {
            wanted &= self.priority;
        }
        wanted
    }

    /// Clear `missing` wherever the fingerprint is `fp`.
    pub fn forget_missing(&mut self, fp: Fingerprint) -> usize {
        let hits: Vec<usize> = self
            .missing
            .ones()
            .filter(|&idx| self.fingerprints[idx] == fp)
            .collect();
        for &idx in &hits {
            self.missing.clear(idx);
        }
        hits.len()
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// Outcome of offering a server to a full table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Was already tracked.
    Kept,
    Added,
    Replaced(NodeId),
    Rejected,
}

/// Fixed-capacity table of tracked servers.
#[derive(Debug)]
pub struct ServerTable {
    servers: Vec<ServerInfo>,
    capacity: usize,
}

impl ServerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            servers: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerInfo> {
        self.servers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerInfo> {
        self.servers.iter_mut()
    }

    /// Remove a tracked server for processing; hand it back with `admit`.
    pub fn take(&mut self, id: NodeId) -> Option<ServerInfo> {
        let pos = self.servers.iter().position(|s| s.id == id)?;
        Some(self.servers.swap_remove(pos))
    }

    /// Track `server` if there is room, or if it is more useful than the
    /// least useful tracked server. Non-routers are evicted before routers,
    /// older before newer; the victim goes only if it is stale or has served
    /// fewer replays.
    pub fn admit(&mut self, mut server: ServerInfo, now: Instant, stale_after: Duration) -> Admission {
        if matches!(server.state, PeerState::Tracked | PeerState::Resyncing) {
            server.state = PeerState::Tracked;
            self.servers.push(server);
            return Admission::Kept;
        }
        if self.servers.len() < self.capacity {
            server.state = PeerState::Tracked;
            self.servers.push(server);
            return Admission::Added;
        }

        let Some(victim) = self
            .servers
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| (s.router, s.last_advert))
            .map(|(i, _)| i)
        else {
            return Admission::Rejected;
        };
        let target = &self.servers[victim];
        if target.is_stale(now, stale_after) || target.replays_requested < server.replays_requested {
            let evicted = target.id;
            server.state = PeerState::Tracked;
            self.servers[victim] = server;
            Admission::Replaced(evicted)
        } else {
            Admission::Rejected
        }
    }
}
