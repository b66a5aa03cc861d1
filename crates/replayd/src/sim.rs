//! Simulated LoRa medium: every transmission reaches every node, minus a
//! configurable random loss applied per receiver.

use rand::Rng;
use tokio::sync::{broadcast, mpsc};

use replay_core::{NodeId, Packet};
use replay_services::ports::RouterError;
use replay_services::{OutboundMessage, Router};

use crate::worker::Event;

/// Frames in flight before a slow receiver starts losing them.
const MEDIUM_BACKLOG: usize = 1024;

/// One frame on air.
#[derive(Debug, Clone)]
pub struct Transmission {
    /// Node whose radio sent it; differs from `packet.from` for replays.
    pub sender: NodeId,
    pub packet: Packet,
}

/// The shared broadcast channel. Cheap to clone.
#[derive(Clone)]
pub struct Medium {
    tx: broadcast::Sender<Transmission>,
    loss_pct: u8,
}

impl Medium {
    pub fn new(loss_pct: u8) -> Self {
        let (tx, _) = broadcast::channel(MEDIUM_BACKLOG);
        Self {
            tx,
            loss_pct: loss_pct.min(100),
        }
    }

    pub fn loss_pct(&self) -> u8 {
        self.loss_pct
    }

    /// Put a packet on air. Returns false if nobody is listening.
    pub fn transmit(&self, sender: NodeId, mut packet: Packet) -> bool {
        // the cache flag is local to the sender
        packet.replay_cached = false;
        self.tx.send(Transmission { sender, packet }).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transmission> {
        self.tx.subscribe()
    }

    fn lost(&self) -> bool {
        self.loss_pct > 0 && rand::thread_rng().gen_range(0..100u8) < self.loss_pct
    }
}

/// Receive side of one node's radio: filters its own transmissions, drops a
/// share of frames, and forwards the rest to the node's worker.
pub async fn radio_loop(
    node: NodeId,
    medium: Medium,
    mut rx: broadcast::Receiver<Transmission>,
    events: mpsc::Sender<Event>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            frame = rx.recv() => match frame {
                Ok(Transmission { sender, packet }) => {
                    if sender == node {
                        continue;
                    }
                    if medium.lost() {
                        tracing::trace!(%node, from = %packet.from, id = packet.id, "frame lost");
                        continue;
                    }
                    if events.send(Event::Received(packet)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(%node, missed = n, "radio fell behind the medium");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Transmits replay protocol frames straight onto the medium. Nothing is
/// ever held in a queue, so `is_queued` is always false.
pub struct SimRouter {
    node: NodeId,
    medium: Medium,
    next_id: u32,
}

impl SimRouter {
    pub fn new(node: NodeId, medium: Medium) -> Self {
        Self {
            node,
            medium,
            next_id: rand::thread_rng().gen(),
        }
    }
}

impl Router for SimRouter {
    fn send(&mut self, msg: OutboundMessage) -> Result<(), RouterError> {
        self.next_id = self.next_id.wrapping_add(1);
        if self.medium.transmit(self.node, msg.into_packet(self.node, self.next_id)) {
            Ok(())
        } else {
            Err(RouterError::Unavailable)
        }
    }

    fn is_queued(&self, _from: NodeId, _id: u32) -> bool {
        false
    }
}
