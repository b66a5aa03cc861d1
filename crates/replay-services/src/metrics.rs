//! Replay counters, serialisable for periodic status output.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub adverts_sent: u64,
    pub aggregate_adverts_sent: u64,
    pub expiry_adverts_sent: u64,
    pub adverts_received: u64,
    pub advert_requests_sent: u64,
    pub packets_requested: u64,
    pub requests_received: u64,
    pub requests_throttled: u64,
    pub packets_replayed: u64,
    pub priority_replayed: u64,
    pub queue_full_drops: u64,
    pub malformed_frames: u64,
    pub send_failures: u64,
    pub resyncs: u64,
    pub servers_evicted: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
