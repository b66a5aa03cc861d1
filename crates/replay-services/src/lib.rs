//! replay-services: the replay protocol state machine and its tables.
//!
//! Everything here is single-threaded and clock-free: callers pass the
//! current `Instant` into every operation that measures time.

pub mod cache;
pub mod engine;
pub mod known;
pub mod metrics;
pub mod peer;
pub mod ports;
pub mod qos;
pub mod queue;
pub mod requests;
pub mod tracker;

pub use cache::{Cursor, ReplayCache};
pub use engine::{ReplayEngine, WakeReason};
pub use metrics::Metrics;
pub use ports::{ChannelMonitor, HeapPool, NodeIdentity, OutboundMessage, PacketPool, Router};
