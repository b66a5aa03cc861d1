//! replay-core: shared types, slot bitmaps, wire format, and configuration.
//! All other replay crates depend on this one.

pub mod bitmap;
pub mod config;
pub mod packet;
pub mod wire;

pub use bitmap::SlotBits;
pub use packet::{Fingerprint, NodeId, Packet, Priority};
