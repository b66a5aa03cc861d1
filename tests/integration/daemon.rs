use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};

use replay_services::{HeapPool, Metrics};
use replayd::{radio_loop, Event, Medium, ReplayWorker, SimRouter};

use crate::*;

struct Daemon {
    events: mpsc::Sender<Event>,
    metrics: watch::Receiver<Metrics>,
}

fn spawn_node(node: NodeId, medium: &Medium, shutdown: &broadcast::Sender<()>) -> Daemon {
    let engine = ReplayEngine::new(
        NodeIdentity {
            node,
            is_router: false,
        },
        &ReplayConfig::default(),
        SimRouter::new(node, medium.clone()),
        Arc::new(AtomicU8::new(10)),
        HeapPool::new(1 << 20),
        tokio::time::Instant::now().into_std(),
    );
    let (events_tx, events_rx) = mpsc::channel(64);
    let (metrics_tx, metrics_rx) = watch::channel(Metrics::default());
    tokio::spawn(radio_loop(
        node,
        medium.clone(),
        medium.subscribe(),
        events_tx.clone(),
        shutdown.subscribe(),
    ));
    tokio::spawn(ReplayWorker::new(engine, medium.clone(), events_rx, metrics_tx, shutdown.subscribe()).run());
    Daemon {
        events: events_tx,
        metrics: metrics_rx,
    }
}

/// Two workers over the simulated medium: A holds a packet B never heard,
/// and after A's first advertisement B gets it replayed.
#[tokio::test(start_paused = true)]
async fn test_worker_replays_over_medium() -> Result<()> {
    let medium = Medium::new(0);
    let mut air = medium.subscribe();
    let (shutdown, _) = broadcast::channel(1);
    let a = spawn_node(A, &medium, &shutdown);
    let b = spawn_node(B, &medium, &shutdown);

    let packet = traffic(42, Priority::DEFAULT);
    a.events.send(Event::Adopt(packet.clone())).await?;

    let replay = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let heard = air.recv().await?;
            if heard.sender == A && heard.packet.id == packet.id && !heard.packet.is_replay_protocol() {
                return anyhow::Ok(heard.packet);
            }
        }
    })
    .await
    .context("no replay within two minutes")??;
    assert_eq!(replay.payload, packet.payload);
    assert_eq!(replay.from, ORIGIN);

    let mut b_metrics = b.metrics.clone();
    tokio::time::timeout(
        Duration::from_secs(5),
        b_metrics.wait_for(|m| m.packets_requested == 1),
    )
    .await
    .context("B's metrics never showed the request")??;
    assert!(a.metrics.borrow().packets_replayed >= 1);

    shutdown.send(())?;
    Ok(())
}
