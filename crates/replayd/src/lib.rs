//! Host-side pieces of the replay daemon: the simulated medium and the
//! per-node worker loop.

pub mod sim;
pub mod worker;

pub use sim::{radio_loop, Medium, SimRouter, Transmission};
pub use worker::{Event, ReplayWorker, SimEngine};
