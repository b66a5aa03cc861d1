//! replayd: runs a handful of replay nodes over a simulated LoRa medium.

use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use replay_core::config::ReplayConfig;
use replay_core::{NodeId, Packet, Priority};
use replay_services::{HeapPool, Metrics, NodeIdentity, ReplayEngine};

use replayd::{radio_loop, Event, Medium, ReplayWorker, SimRouter};

const EVENT_BACKLOG: usize = 256;

/// Priorities the traffic generator picks from.
const TRAFFIC_PRIORITIES: [Priority; 4] = [
    Priority::BACKGROUND,
    Priority::DEFAULT,
    Priority::RELIABLE,
    Priority::HIGH,
];

struct NodeHandle {
    node: NodeId,
    events: mpsc::Sender<Event>,
    metrics: watch::Receiver<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ReplayConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ReplayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ReplayConfig::default()
    });
    anyhow::ensure!(config.sim.nodes > 0, "sim.nodes must be at least 1");

    let base = match config.identity.node_id {
        0 => rand::thread_rng().gen_range(0x1000..0x7fff_0000),
        id => id,
    };
    tracing::info!(
        nodes = config.sim.nodes,
        base = %NodeId(base),
        loss_pct = config.sim.loss_pct,
        chutil_pct = config.sim.chutil_pct,
        "replayd starting"
    );

    let medium = Medium::new(config.sim.loss_pct);
    let chutil = Arc::new(AtomicU8::new(config.sim.chutil_pct));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn nodes ──────────────────────────────────────────────────────────

    let mut workers = JoinSet::new();
    let mut handles = Vec::with_capacity(config.sim.nodes);
    for i in 0..config.sim.nodes {
        let node = NodeId(base.wrapping_add(i as u32));
        let identity = NodeIdentity {
            node,
            is_router: config.identity.is_router,
        };
        let engine = ReplayEngine::new(
            identity,
            &config,
            SimRouter::new(node, medium.clone()),
            chutil.clone(),
            HeapPool::new(config.sim.heap_bytes),
            tokio::time::Instant::now().into_std(),
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BACKLOG);
        let (metrics_tx, metrics_rx) = watch::channel(Metrics::default());

        tokio::spawn(radio_loop(
            node,
            medium.clone(),
            medium.subscribe(),
            events_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        workers.spawn(
            ReplayWorker::new(
                engine,
                medium.clone(),
                events_rx,
                metrics_tx,
                shutdown_tx.subscribe(),
            )
            .run(),
        );
        handles.push(NodeHandle {
            node,
            events: events_tx,
            metrics: metrics_rx,
        });
        tracing::info!(%node, "node started");
    }
    let handles = Arc::new(handles);

    // ── Traffic generator ────────────────────────────────────────────────────

    let traffic_task = {
        let handles = handles.clone();
        let every = Duration::from_millis(config.sim.traffic_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            let mut next_id: u32 = rand::thread_rng().gen();
            loop {
                interval.tick().await;
                next_id = next_id.wrapping_add(1);
                let (target, packet) = {
                    let mut rng = rand::thread_rng();
                    let Some(target) = handles.choose(&mut rng) else {
                        return;
                    };
                    let priority = TRAFFIC_PRIORITIES
                        .choose(&mut rng)
                        .copied()
                        .unwrap_or_default();
                    let mut payload = vec![0u8; rng.gen_range(8..64)];
                    rng.fill(&mut payload[..]);
                    (target, Packet::new(target.node, next_id, priority, payload))
                };
                tracing::debug!(node = %target.node, id = next_id, priority = packet.priority.value(), "originating packet");
                if target.events.send(Event::Originate(packet)).await.is_err() {
                    tracing::warn!(node = %target.node, "worker gone, traffic generator exiting");
                    return;
                }
            }
        })
    };

    // ── Stats printer ────────────────────────────────────────────────────────

    let stats_printer = config.sim.stats_interval().map(|every| {
        let handles = handles.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                for h in handles.iter() {
                    let snapshot = h.metrics.borrow().snapshot();
                    tracing::info!(node = %h.node, metrics = %snapshot, "replay statistics");
                }
            }
        })
    });
    let stats_done = async move {
        match stats_printer {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()          => tracing::info!("shutting down"),
        r = traffic_task                => tracing::error!("traffic generator exited: {:?}", r),
        r = stats_done                  => tracing::error!("stats printer exited: {:?}", r),
        Some(r) = workers.join_next()   => {
            let r = r.context("replay worker panicked")?;
            tracing::error!("replay worker exited: {:?}", r);
        }
    }

    let _ = shutdown_tx.send(());
    while let Some(r) = workers.join_next().await {
        r.context("replay worker panicked")??;
    }
    Ok(())
}
