//! Availability tracker: per-slot advertisement and replay state.
//!
//! `dirty` slots have not been advertised yet; `dirty_prio` is the subset
//! holding high-priority packets; `wanted` slots were requested by a client
//! and await replay. One snapshot per wire sequence number remembers what
//! each advertisement carried so missed ones can be resent as an aggregate.

use replay_core::wire::SEQUENCE_WINDOW;
use replay_core::SlotBits;

use crate::cache::{Cursor, ReplayCache};

/// What one advertisement carried.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvertSnapshot {
    /// Unwrapped sequence number.
    pub sequence: u32,
    pub head: Cursor,
    pub tail: Cursor,
    pub dirty: SlotBits,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct AvailabilityTracker {
    pub dirty: SlotBits,
    pub dirty_prio: SlotBits,
    pub wanted: SlotBits,
    snapshots: Vec<AdvertSnapshot>,
}

impl Default for AvailabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        Self {
            dirty: SlotBits::new(),
            dirty_prio: SlotBits::new(),
            wanted: SlotBits::new(),
            snapshots: vec![AdvertSnapshot::default(); SEQUENCE_WINDOW as usize],
        }
    }

    /// A new packet landed in physical slot `idx`.
    pub fn mark_adopted(&mut self, idx: usize, high_priority: bool) {
        self.wanted.clear(idx);
        self.dirty.set(idx);
        self.dirty_prio.assign(idx, high_priority);
    }

    pub fn clear_advertised(&mut self, idx: usize) {
        self.dirty.clear(idx);
        self.dirty_prio.clear(idx);
    }

    pub fn record(&mut self, sequence: u32, head: Cursor, tail: Cursor, sent: SlotBits) {
        self.snapshots[(sequence % SEQUENCE_WINDOW) as usize] = AdvertSnapshot {
            sequence,
            head,
            tail,
            dirty: sent,
            valid: true,
        };
    }

    pub fn snapshot(&self, wire_sequence: u32) -> Option<&AdvertSnapshot> {
        let snap = &self.snapshots[(wire_sequence % SEQUENCE_WINDOW) as usize];
        snap.valid.then_some(snap)
    }

    /// Union of the snapshots for `from + i` for each bit i of `mask`.
    ///
    /// Slots that have since fallen behind the cache tail are dropped from
    /// each snapshot. Stops before the union would exceed `budget` slots.
    /// Returns the union and the mask of sequences it covers.
    pub fn aggregate(
        &mut self,
        from: u32,
        mask: u16,
        cache: &ReplayCache,
        budget: usize,
    ) -> (SlotBits, u16) {
        let tail = cache.tail();
        let mut union = SlotBits::new();
        let mut covered = 0u16;
        for bit in (0..16).filter(|&b| mask & (1 << b) != 0) {
            let snap = &mut self.snapshots[((from + bit) % SEQUENCE_WINDOW) as usize];
            if snap.valid {
                if tail >= snap.head {
                    snap.dirty.clear_all();
                } else {
                    for c in snap.tail..tail {
                        snap.dirty.clear(ReplayCache::physical(c));
                    }
                }
                if union.count() + snap.dirty.count() > budget {
                    tracing::debug!(from, bit, budget, "aggregate advertisement would exceed budget");
                    break;
                }
                union |= snap.dirty;
            }
            covered |= 1 << bit;
        }
        (union, covered)
    }
}
