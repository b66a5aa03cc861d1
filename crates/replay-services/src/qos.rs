//! QoS: token bucket rate limiting per client.
//!
//! Every node that asks us for replays gets a bucket of `burst` tokens,
//! refilled at one token per `rate`. Each requested packet costs one token.
//! Empty bucket = the rest of the request is ignored, and the client is
//! named in our next advertisement's throttle list.

use std::time::{Duration, Instant};

use replay_core::NodeId;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_every: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_every: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_every,
            last_refill: now,
        }
    }

    /// Whole tokens earned since the last refill, and the instant that
    /// accounts for them.
    fn earned(&self, now: Instant) -> (u32, Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let step = self.refill_every.as_millis().max(1);
        let earned = u32::try_from(elapsed.as_millis() / step).unwrap_or(u32::MAX);
        let advanced = self.refill_every.checked_mul(earned).map_or(now, |d| self.last_refill + d);
        (earned, advanced)
    }

    pub fn refill(&mut self, now: Instant) {
        let (earned, advanced) = self.earned(now);
        if earned > 0 {
            self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
            self.last_refill = advanced;
        }
        if self.tokens == self.capacity {
            // a full bucket banks nothing
            self.last_refill = now;
        }
    }

    /// Returns true if the request may proceed, false if throttled.
    pub fn allow(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// No token available at `now`. Does not consume or refill.
    pub fn is_empty_at(&self, now: Instant) -> bool {
        self.tokens == 0 && self.earned(now).0 == 0
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }
}

// ── Clients ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: NodeId,
    pub bucket: TokenBucket,
    pub last_request: Instant,
    /// Packets accepted for replay on behalf of this client.
    pub served: u32,
}

/// Fixed-capacity client table. A new client replaces the one whose last
/// request is oldest.
#[derive(Debug)]
pub struct ClientTable {
    clients: Vec<ClientInfo>,
    capacity: usize,
    burst: u32,
    rate: Duration,
}

impl ClientTable {
    pub fn new(capacity: usize, burst: u32, rate: Duration) -> Self {
        Self {
            clients: Vec::new(),
            capacity: capacity.max(1),
            burst,
            rate,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&ClientInfo> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// The entry for `id`, created (or recycled) on first request.
    pub fn entry(&mut self, id: NodeId, now: Instant) -> &mut ClientInfo {
        let fresh = ClientInfo {
            id,
            bucket: TokenBucket::new(self.burst, self.rate, now),
            last_request: now,
            served: 0,
        };
        let idx = match self.clients.iter().position(|c| c.id == id) {
            Some(idx) => idx,
            None if self.clients.len() < self.capacity => {
                self.clients.push(fresh);
                self.clients.len() - 1
            }
            None => {
                let lru = self
                    .clients
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.last_request)
                    .map_or(0, |(i, _)| i);
                tracing::debug!(evicted = %self.clients[lru].id, client = %id, "client table full");
                self.clients[lru] = fresh;
                lru
            }
        };
        &mut self.clients[idx]
    }

    /// Truncated ids of clients with no tokens left, at most `max`.
    pub fn throttled(&self, now: Instant, max: usize) -> Vec<u8> {
        self.clients
            .iter()
            .filter(|c| c.bucket.is_empty_at(now))
            .map(|c| c.id.short())
            .take(max)
            .collect()
    }
}
