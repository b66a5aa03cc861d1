//! Outstanding replay requests we have issued, keyed by fingerprint.
//!
//! Used only to avoid asking for the same packet again before the previous
//! request has had time to be answered.

use std::time::{Duration, Instant};

use replay_core::Fingerprint;

#[derive(Debug, Clone, Copy)]
struct RequestInfo {
    fingerprint: Fingerprint,
    deadline: Instant,
}

/// Result of trying to claim a request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Not requested recently; the slot is now held until the timeout.
    Fresh,
    /// Already requested and not yet timed out.
    Pending,
    /// Too many outstanding requests.
    Full,
}

#[derive(Debug)]
pub struct RequestTable {
    entries: Vec<RequestInfo>,
    capacity: usize,
    timeout: Duration,
}

impl RequestTable {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            timeout,
        }
    }

    pub fn claim(&mut self, fp: Fingerprint, now: Instant) -> Claim {
        if self
            .entries
            .iter()
            .any(|r| r.fingerprint == fp && r.deadline > now)
        {
            return Claim::Pending;
        }
        let fresh = RequestInfo {
            fingerprint: fp,
            deadline: now + self.timeout,
        };
        if let Some(expired) = self.entries.iter_mut().find(|r| r.deadline <= now) {
            *expired = fresh;
            return Claim::Fresh;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(fresh);
            return Claim::Fresh;
        }
        Claim::Full
    }

    /// Drop a claim, e.g. when the request was trimmed before sending.
    pub fn release(&mut self, fp: Fingerprint) {
        self.entries.retain(|r| r.fingerprint != fp);
    }

    pub fn outstanding(&self, now: Instant) -> usize {
        self.entries.iter().filter(|r| r.deadline > now).count()
    }
}
