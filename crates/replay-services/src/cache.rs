//! Replay cache: a circular log of packet fingerprints, some with bodies.
//!
//! Logical positions (`Cursor`) increase forever; the physical slot is the
//! cursor modulo the slot count. Three cursors bound the live window:
//!
//!   tail           oldest fingerprint still tracked
//!   oldest_cached  oldest position that still holds a body
//!   head           next position to be written
//!
//! A fingerprint outlives its body: pruning frees bodies but keeps the
//! fingerprint until the slot is reused, so duplicates are still recognised.

use std::time::Instant;

use replay_core::config::CacheConfig;
use replay_core::wire::SLOTS;
use replay_core::{Fingerprint, NodeId, Packet, Priority};

use crate::ports::PacketPool;

/// Monotonic logical position in the cache.
pub type Cursor = u64;

/// One physical cache slot.
#[derive(Debug, Clone, Default)]
pub struct CacheSlot {
    pub fingerprint: Fingerprint,
    /// Exclusively owned by the cache until pruned.
    pub body: Option<Packet>,
    pub last_replay: Option<Instant>,
    pub replay_count: u32,
}

// ── Memory governor ───────────────────────────────────────────────────────────

/// Heap percentages that decide when cached bodies must be pruned.
#[derive(Debug, Clone, Copy)]
struct HeapGovernor {
    threshold_pct: usize,
    reserve_pct: usize,
    free_min_pct: usize,
    free_target_pct: usize,
}

impl HeapGovernor {
    fn from_config(config: &CacheConfig) -> Self {
        Self {
            threshold_pct: config.heap_threshold_pct.into(),
            reserve_pct: config.heap_reserve_pct.into(),
            free_min_pct: config.heap_free_min_pct.into(),
            free_target_pct: config.heap_free_target_pct.into(),
        }
    }

    /// Bodies to keep, or None when there is no memory pressure.
    ///
    /// Pressure means the cache holds at least `threshold` of the heap while
    /// free heap is under `free_min`. The target frees enough to reach
    /// `free_target`, but never shrinks the cache below `reserve`.
    fn keep(&self, num_cached: usize, cached_bytes: usize, heap: usize, free: usize) -> Option<usize> {
        if heap == 0 || num_cached == 0 {
            return None;
        }
        let cache_pct = cached_bytes * 100 / heap;
        let free_pct = free * 100 / heap;
        if cache_pct < self.threshold_pct || free_pct >= self.free_min_pct {
            return None;
        }
        let want_pct = self
            .free_target_pct
            .saturating_sub(free_pct)
            .min(cache_pct.saturating_sub(self.reserve_pct));
        let per_packet = (cached_bytes / num_cached).max(1);
        let reduce_by = (want_pct * heap / 100).div_ceil(per_packet);
        Some(num_cached.saturating_sub(reduce_by))
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

pub struct ReplayCache {
    slots: Vec<CacheSlot>,
    tail: Cursor,
    oldest_cached: Cursor,
    head: Cursor,
    num_cached: usize,
    cached_bytes: usize,
    max_cached: usize,
    governor: HeapGovernor,
}

impl ReplayCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            slots: vec![CacheSlot::default(); SLOTS],
            tail: 0,
            oldest_cached: 0,
            head: 0,
            num_cached: 0,
            cached_bytes: 0,
            max_cached: config.max_cached.clamp(1, SLOTS),
            governor: HeapGovernor::from_config(config),
        }
    }

    pub fn head(&self) -> Cursor {
        self.head
    }

    pub fn tail(&self) -> Cursor {
        self.tail
    }

    pub fn oldest_cached(&self) -> Cursor {
        self.oldest_cached
    }

    /// Fingerprints tracked.
    pub fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bodies held.
    pub fn num_cached(&self) -> usize {
        self.num_cached
    }

    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    pub fn physical(cursor: Cursor) -> usize {
        (cursor % SLOTS as u64) as usize
    }

    fn in_window(&self, cursor: Cursor) -> bool {
        cursor >= self.tail && cursor < self.head
    }

    pub fn get(&self, cursor: Cursor) -> Option<&CacheSlot> {
        self.in_window(cursor)
            .then(|| &self.slots[Self::physical(cursor)])
    }

    pub fn get_mut(&mut self, cursor: Cursor) -> Option<&mut CacheSlot> {
        if !self.in_window(cursor) {
            return None;
        }
        Some(&mut self.slots[Self::physical(cursor)])
    }

    /// The logical position currently occupying physical slot `idx`.
    pub fn cursor_at(&self, idx: usize) -> Option<Cursor> {
        if self.is_empty() || idx >= SLOTS {
            return None;
        }
        let newest = self.head - 1;
        let back = ((Self::physical(newest) + SLOTS - idx) % SLOTS) as u64;
        let cursor = newest.checked_sub(back)?;
        (cursor >= self.tail).then_some(cursor)
    }

    /// The live slot at physical index `idx`.
    pub fn slot_at(&self, idx: usize) -> Option<&CacheSlot> {
        self.cursor_at(idx).and_then(|c| self.get(c))
    }

    /// The cached body at physical index `idx`.
    pub fn body_at(&self, idx: usize) -> Option<&Packet> {
        self.slot_at(idx).and_then(|slot| slot.body.as_ref())
    }

    /// Newest tracked position with this fingerprint, body or not.
    pub fn search(&self, fp: Fingerprint) -> Option<Cursor> {
        (self.tail..self.head)
            .rev()
            .find(|&c| self.slots[Self::physical(c)].fingerprint == fp)
    }

    /// Newest position holding the body of (from, id).
    pub fn search_origin(&self, from: NodeId, id: u32) -> Option<Cursor> {
        (self.tail..self.head).rev().find(|&c| {
            self.slots[Self::physical(c)]
                .body
                .as_ref()
                .is_some_and(|p| p.from == from && p.id == id)
        })
    }

    /// Copy `packet` into the next slot. Returns its position, or None if it
    /// was a duplicate, a replay protocol frame, or could not be allocated.
    pub fn adopt(&mut self, packet: &Packet, pool: &mut impl PacketPool) -> Option<Cursor> {
        if packet.replay_cached || packet.is_replay_protocol() {
            return None;
        }
        if self.search_origin(packet.from, packet.id).is_some() {
            return None;
        }

        if self.len() == SLOTS {
            self.drop_tail(pool);
        }

        let keep = self.governor.keep(
            self.num_cached,
            self.cached_bytes,
            pool.heap_size(),
            pool.free_heap(),
        );
        if let Some(keep) = keep {
            tracing::debug!(
                cached = self.num_cached,
                keep,
                free = pool.free_heap(),
                "pruning replay cache under memory pressure"
            );
            self.prune(keep, pool);
        } else if self.num_cached >= self.max_cached {
            self.prune(self.max_cached - 1, pool);
        }

        let body = match pool.allocate_copy(packet) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(from = %packet.from, id = packet.id, error = %e, "cannot cache packet");
                return None;
            }
        };
        let footprint = body.footprint();
        let cursor = self.head;
        self.slots[Self::physical(cursor)] = CacheSlot {
            fingerprint: packet.fingerprint(),
            body: Some(body),
            last_replay: None,
            replay_count: 0,
        };
        self.head += 1;
        if self.num_cached == 0 {
            self.oldest_cached = cursor;
        }
        self.num_cached += 1;
        self.cached_bytes += footprint;

        tracing::debug!(
            from = %packet.from,
            id = packet.id,
            fp = %packet.fingerprint(),
            packets = self.len(),
            cached = self.num_cached,
            bytes = self.cached_bytes,
            "adopted packet"
        );
        Some(cursor)
    }

    /// Free bodies, lowest priority first and oldest first within a level,
    /// until at most `keep` remain. Fingerprints are retained. Returns the
    /// number of bodies released.
    pub fn prune(&mut self, keep: usize, pool: &mut impl PacketPool) -> usize {
        if self.num_cached <= keep {
            return 0;
        }
        let excess = self.num_cached - keep;

        let mut per_level = [0usize; Priority::LEVELS];
        for c in self.oldest_cached..self.head {
            if let Some(p) = &self.slots[Self::physical(c)].body {
                per_level[usize::from(p.priority.value())] += 1;
            }
        }

        // Lowest level at which releasing everything below and part of the
        // level itself covers the excess.
        let mut threshold = 0;
        let mut below = 0;
        while threshold + 1 < Priority::LEVELS && below + per_level[threshold] < excess {
            below += per_level[threshold];
            threshold += 1;
        }

        let mut released = 0;
        for c in self.oldest_cached..self.head {
            if self.priority_at(c).is_some_and(|p| usize::from(p) < threshold) {
                self.release(c, pool);
                released += 1;
            }
        }
        for c in self.oldest_cached..self.head {
            if released >= excess {
                break;
            }
            if self.priority_at(c).is_some_and(|p| usize::from(p) == threshold) {
                self.release(c, pool);
                released += 1;
            }
        }
        self.settle_oldest_cached();

        tracing::debug!(released, threshold, cached = self.num_cached, "pruned replay cache");
        released
    }

    /// Drop the oldest positions, fingerprints and bodies alike, until at most
    /// `keep` are tracked.
    pub fn truncate(&mut self, keep: usize, pool: &mut impl PacketPool) {
        while self.len() > keep {
            self.drop_tail(pool);
        }
    }

    /// Record a replay of the packet at `cursor`.
    pub fn mark_replayed(&mut self, cursor: Cursor, now: Instant) {
        if let Some(slot) = self.get_mut(cursor) {
            slot.last_replay = Some(now);
            slot.replay_count += 1;
        }
    }

    fn priority_at(&self, cursor: Cursor) -> Option<u8> {
        self.slots[Self::physical(cursor)]
            .body
            .as_ref()
            .map(|p| p.priority.value())
    }

    fn release(&mut self, cursor: Cursor, pool: &mut impl PacketPool) {
        let slot = &mut self.slots[Self::physical(cursor)];
        if let Some(mut body) = slot.body.take() {
            self.num_cached -= 1;
            self.cached_bytes = self.cached_bytes.saturating_sub(body.footprint());
            body.replay_cached = false;
            pool.release(body);
        }
    }

    fn drop_tail(&mut self, pool: &mut impl PacketPool) {
        self.release(self.tail, pool);
        self.tail += 1;
        self.settle_oldest_cached();
    }

    fn settle_oldest_cached(&mut self) {
        self.oldest_cached = self.oldest_cached.max(self.tail);
        while self.oldest_cached < self.head
            && self.slots[Self::physical(self.oldest_cached)].body.is_none()
        {
            self.oldest_cached += 1;
        }
    }
}
