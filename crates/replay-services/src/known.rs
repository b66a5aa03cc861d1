//! Ring of recently seen fingerprints.
//!
//! The router remembers every packet it handles here, whether or not the
//! cache adopts it. A fingerprint in the ring counts as known when deciding
//! what to request from a server.

use replay_core::Fingerprint;

#[derive(Debug, Clone)]
pub struct KnownRing {
    ring: Vec<Option<Fingerprint>>,
    next: usize,
}

impl KnownRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![None; capacity.max(1)],
            next: 0,
        }
    }

    pub fn remember(&mut self, fp: Fingerprint) {
        let idx = self.next % self.ring.len();
        self.ring[idx] = Some(fp);
        self.next = self.next.wrapping_add(1);
    }

    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.ring.iter().any(|slot| *slot == Some(fp))
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }
}
