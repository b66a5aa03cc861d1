//! Replay worker: owns one node's engine and serialises everything that
//! touches it: adoptions, received frames and timer wake-ups.

use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use replay_core::{Fingerprint, NodeId, Packet};
use replay_services::{HeapPool, Metrics, ReplayEngine, WakeReason};

use crate::sim::{Medium, SimRouter};

/// Events queued for a worker.
#[derive(Debug, Clone)]
pub enum Event {
    /// Originate a packet: put it on air and cache it.
    Originate(Packet),
    /// The router handled a packet the rest of the mesh may not have heard.
    Adopt(Packet),
    /// A frame arrived from the medium.
    Received(Packet),
    /// The router saw a packet it will not hand over for caching.
    Remember(Fingerprint),
}

pub type SimEngine = ReplayEngine<SimRouter, Arc<AtomicU8>, HeapPool>;

pub struct ReplayWorker {
    node: NodeId,
    engine: SimEngine,
    medium: Medium,
    events: mpsc::Receiver<Event>,
    metrics: watch::Sender<Metrics>,
    shutdown: broadcast::Receiver<()>,
}

impl ReplayWorker {
    pub fn new(
        engine: SimEngine,
        medium: Medium,
        events: mpsc::Receiver<Event>,
        metrics: watch::Sender<Metrics>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            node: engine.identity().node,
            engine,
            medium,
            events,
            metrics,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut wake = self.notify(WakeReason::Interval);
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(node = %self.node, "replay worker shutting down");
                    return Ok(());
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        tracing::info!(node = %self.node, "event channel closed, replay worker exiting");
                        return Ok(());
                    };
                    match self.handle(event) {
                        Some(reason) => wake = self.notify(reason),
                        None => self.publish(),
                    }
                }

                _ = tokio::time::sleep_until(wake) => {
                    wake = self.notify(WakeReason::Interval);
                }
            }
        }
    }

    fn handle(&mut self, event: Event) -> Option<WakeReason> {
        let now = Instant::now().into_std();
        match event {
            Event::Originate(packet) => {
                self.medium.transmit(self.node, packet.clone());
                self.adopt(&packet)
            }
            Event::Adopt(packet) => self.adopt(&packet),
            Event::Received(packet) if packet.is_replay_protocol() => {
                self.engine.handle_received(&packet, now)
            }
            Event::Received(packet) => {
                if self.engine.is_known(packet.fingerprint()) {
                    tracing::trace!(node = %self.node, fp = %packet.fingerprint(), "duplicate packet");
                    return None;
                }
                self.adopt(&packet)
            }
            Event::Remember(fp) => {
                self.engine.remember(fp);
                None
            }
        }
    }

    fn adopt(&mut self, packet: &Packet) -> Option<WakeReason> {
        let fp = packet.fingerprint();
        if self.engine.adopt(packet).is_some() {
            Some(WakeReason::Adopted)
        } else {
            self.engine.remember(fp);
            None
        }
    }

    /// Run the engine, put queued replays on air, and return the next wake-up.
    fn notify(&mut self, reason: WakeReason) -> Instant {
        let now = Instant::now();
        let delay = self.engine.on_notify(reason, now.into_std());
        while let Some(packet) = self.engine.queue_pop() {
            tracing::debug!(
                node = %self.node,
                from = %packet.from,
                id = packet.id,
                "transmitting replay"
            );
            self.medium.transmit(self.node, packet);
        }
        self.publish();
        now + delay
    }

    fn publish(&self) {
        self.metrics.send_if_modified(|m| {
            let changed = *m != *self.engine.metrics();
            if changed {
                *m = self.engine.metrics().clone();
            }
            changed
        });
    }
}
