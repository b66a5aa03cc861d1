//! Replay engine: advertises what we cache, requests what we miss, and
//! replays what others ask for.
//!
//! One engine per node, driven by a single cooperative worker. The worker
//! feeds it adopted packets and received protocol frames, and calls
//! `on_notify` whenever a wake-up is due; `on_notify` returns how long the
//! worker may sleep before the next one. Nothing in here blocks or keeps a
//! clock of its own.

use std::time::{Duration, Instant};

use replay_core::config::{AdvertConfig, PeersConfig, ReplayConfig, ReplaySettings};
use replay_core::wire::{
    AdvertEntry, Advertisement, Header, Message, MessageKind, SEQUENCE_MASK, SLOTS,
};
use replay_core::{Fingerprint, NodeId, Packet, Priority, SlotBits};

use crate::cache::{Cursor, ReplayCache};
use crate::known::KnownRing;
use crate::metrics::Metrics;
use crate::peer::{Admission, PeerState, ResyncReason, SequenceEvent, ServerInfo, ServerTable};
use crate::ports::{ChannelMonitor, NodeIdentity, OutboundMessage, PacketPool, Router};
use crate::qos::ClientTable;
use crate::queue::TxQueue;
use crate::requests::{Claim, RequestTable};
use crate::tracker::AvailabilityTracker;

/// Mesh priority of replay protocol frames.
pub const PROTOCOL_PRIORITY: Priority = Priority::RESPONSE;

/// Why the worker woke the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A packet was adopted into the cache.
    Adopted,
    /// The advertisement deadline elapsed.
    Interval,
    /// A replay is pending.
    Replay,
}

enum AdvertBody<'a> {
    Available(&'a Advertisement),
    Expired(&'a SlotBits),
}

pub struct ReplayEngine<R, C, P> {
    identity: NodeIdentity,
    advert: AdvertConfig,
    replay: ReplaySettings,
    peers: PeersConfig,

    router: R,
    channel: C,
    pool: P,

    cache: ReplayCache,
    tracker: AvailabilityTracker,
    known: KnownRing,
    servers: ServerTable,
    clients: ClientTable,
    requests: RequestTable,
    queue: TxQueue,
    metrics: Metrics,

    booted: Instant,
    /// Last availability advertisement actually sent.
    last_advert: Option<Instant>,
    /// Last time the flush deadline was acted on.
    last_flush: Instant,
    next_sequence: u32,
    packets_since_advert: usize,
    replay_pending: bool,
    want_expired: bool,
    last_expired: Option<Instant>,
}

impl<R: Router, C: ChannelMonitor, P: PacketPool> ReplayEngine<R, C, P> {
    pub fn new(
        identity: NodeIdentity,
        config: &ReplayConfig,
        router: R,
        channel: C,
        pool: P,
        now: Instant,
    ) -> Self {
        let peers = config.peers.clone();
        Self {
            identity,
            advert: config.advert.clone(),
            replay: config.replay.clone(),
            router,
            channel,
            pool,
            cache: ReplayCache::new(&config.cache),
            tracker: AvailabilityTracker::new(),
            known: KnownRing::new(config.cache.remember),
            servers: ServerTable::new(peers.servers),
            clients: ClientTable::new(peers.clients, peers.client_burst, peers.client_rate()),
            requests: RequestTable::new(peers.request_max_outstanding, peers.request_timeout()),
            queue: TxQueue::default(),
            metrics: Metrics::default(),
            booted: now,
            last_advert: None,
            last_flush: now,
            next_sequence: 0,
            packets_since_advert: 0,
            replay_pending: false,
            want_expired: false,
            last_expired: None,
            peers,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn cache(&self) -> &ReplayCache {
        &self.cache
    }

    pub fn tracker(&self) -> &AvailabilityTracker {
        &self.tracker
    }

    pub fn servers(&self) -> &ServerTable {
        &self.servers
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Sequence number the next availability advertisement will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn replay_pending(&self) -> bool {
        self.replay_pending
    }

    fn congested(&self) -> bool {
        self.channel.utilization_percent() >= self.advert.chutil_threshold_pct
    }

    fn is_high(&self, priority: Priority) -> bool {
        priority >= self.advert.high_priority()
    }

    fn header(&self, kind: MessageKind) -> Header {
        let mut header = Header::new(kind);
        header.priority = self.congested();
        header.router = self.identity.is_router;
        header
    }

    // ── Local traffic ─────────────────────────────────────────────────────────

    /// Cache a packet the router has just handled. Returns its position, or
    /// None if it was not adopted.
    pub fn adopt(&mut self, packet: &Packet) -> Option<Cursor> {
        let cursor = self.cache.adopt(packet, &mut self.pool)?;
        let high = self.is_high(packet.priority);
        self.tracker.mark_adopted(ReplayCache::physical(cursor), high);
        self.packets_since_advert += 1;
        self.note_known(packet.fingerprint());
        Some(cursor)
    }

    /// Record a fingerprint the router has seen, cached or not.
    pub fn remember(&mut self, fp: Fingerprint) {
        self.known.remember(fp);
        self.note_known(fp);
    }

    pub fn is_known(&self, fp: Fingerprint) -> bool {
        self.known.contains(fp) || self.cache.search(fp).is_some()
    }

    fn note_known(&mut self, fp: Fingerprint) {
        for server in self.servers.iter_mut() {
            server.forget_missing(fp);
        }
    }

    /// Free cached bodies down to `keep`, lowest priority first.
    pub fn prune_cache(&mut self, keep: usize) -> usize {
        self.cache.prune(keep, &mut self.pool)
    }

    /// Forget all but the newest `keep` positions.
    pub fn truncate_cache(&mut self, keep: usize) {
        self.cache.truncate(keep, &mut self.pool);
    }

    // ── Transmit queue ────────────────────────────────────────────────────────

    pub fn queue_peek(&mut self) -> Option<&Packet> {
        self.queue.peek(&self.cache)
    }

    /// Next packet to put on air, shared with the cache.
    pub fn queue_pop(&mut self) -> Option<Packet> {
        self.queue.pop(&self.cache)
    }

    // ── Incoming frames ───────────────────────────────────────────────────────

    /// Handle a packet on the replay port. Returns a wake reason when the
    /// worker should run `on_notify` promptly.
    pub fn handle_received(&mut self, packet: &Packet, now: Instant) -> Option<WakeReason> {
        if !packet.is_replay_protocol() || packet.from == self.identity.node {
            return None;
        }
        if !packet.is_direct() {
            tracing::debug!(
                from = %packet.from,
                hop_limit = packet.hop_limit,
                hop_start = packet.hop_start,
                "ignoring relayed replay frame"
            );
            return None;
        }
        let msg = match Message::decode(&packet.payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.malformed_frames += 1;
                tracing::warn!(from = %packet.from, error = %e, "dropping malformed replay frame");
                return None;
            }
        };
        tracing::trace!(from = %packet.from, frame = %hex::encode(&packet.payload), "replay frame");

        match msg {
            Message::Available(advert) => {
                let body = AdvertBody::Available(&advert);
                self.handle_advertisement(packet.from, advert.header, body, now);
                None
            }
            Message::Expired { header, slots } => {
                self.handle_advertisement(packet.from, header, AdvertBody::Expired(&slots), now);
                None
            }
            Message::RequestPackets { .. } | Message::RequestAdvertisement { .. } => {
                if packet.to != self.identity.node {
                    tracing::debug!(from = %packet.from, to = %packet.to, "ignoring request for another node");
                    return None;
                }
                self.handle_request(packet.from, msg, now)
            }
        }
    }

    // ── Server role ───────────────────────────────────────────────────────────

    fn handle_request(&mut self, from: NodeId, msg: Message, now: Instant) -> Option<WakeReason> {
        self.metrics.requests_received += 1;
        match msg {
            Message::RequestAdvertisement { header, missing } => {
                self.clients.entry(from, now).last_request = now;
                if missing == 0 {
                    tracing::warn!(client = %from, "advertisement request names no sequences");
                    return None;
                }
                tracing::info!(
                    client = %from,
                    seq = header.sequence,
                    missing = format_args!("{missing:#06x}"),
                    "advertisement resend requested"
                );
                self.advertise_aggregate(now, header.sequence, missing);
                None
            }
            Message::RequestPackets { header, slots } => {
                let high = self.advert.high_priority();
                let max_pending = self.replay.max_pending;
                let congested = self.congested();
                let client = self.clients.entry(from, now);
                client.last_request = now;

                let mut accepted = 0u32;
                let mut throttled = false;
                let mut expired = false;
                for idx in slots.ones() {
                    // only replays that could go on air now count against the backlog
                    let backlog = if congested {
                        self.tracker
                            .wanted
                            .ones()
                            .filter(|&i| self.cache.body_at(i).is_some_and(|p| p.priority >= high))
                            .count()
                    } else {
                        self.tracker.wanted.count()
                    };
                    if backlog >= max_pending {
                        tracing::debug!(client = %from, max_pending, "replay backlog full");
                        break;
                    }
                    let Some(cursor) = self.cache.cursor_at(idx) else {
                        continue;
                    };
                    let body = self.cache.get(cursor).and_then(|slot| slot.body.as_ref());
                    match body {
                        Some(p) => {
                            if self.router.is_queued(p.from, p.id) || self.queue.contains(cursor) {
                                continue;
                            }
                            if header.priority && p.priority < high {
                                continue;
                            }
                        }
                        None if header.priority => continue,
                        None => {}
                    }
                    if !client.bucket.allow(now) {
                        throttled = true;
                        break;
                    }
                    if body.is_some() {
                        self.tracker.wanted.set(idx);
                        accepted += 1;
                    } else {
                        expired = true;
                    }
                }
                client.served += accepted;

                if throttled {
                    self.metrics.requests_throttled += 1;
                    tracing::warn!(client = %from, "client is being rate limited");
                }
                if expired {
                    self.want_expired = true;
                }
                tracing::info!(
                    client = %from,
                    requested = slots.count(),
                    accepted,
                    pending = self.tracker.wanted.count(),
                    want_expired = self.want_expired,
                    "replay request"
                );
                if accepted > 0 || expired {
                    self.replay_pending = true;
                    Some(WakeReason::Replay)
                } else {
                    None
                }
            }
            Message::Available(_) | Message::Expired { .. } => None,
        }
    }

    /// Send the next wanted packet, high priority first and oldest first.
    /// Normal-priority packets only go out while the channel is quiet.
    pub fn replay(&mut self, now: Instant) {
        if !self.replay_pending {
            return;
        }
        if self.want_expired && self.advertise_expired(now) {
            return;
        }
        if self.tracker.wanted.none() {
            tracing::debug!("nothing left to replay");
            self.replay_pending = self.want_expired;
            return;
        }

        let congested = self.congested();
        let pick = match self.next_wanted(true) {
            Some(c) => Some(c),
            None if !congested => self.next_wanted(false),
            None => None,
        };
        let Some(cursor) = pick else {
            if congested && self.tracker.wanted.any() {
                // keep polling until the channel quietens
                tracing::debug!(pending = self.tracker.wanted.count(), "normal replays wait for a quiet channel");
            } else {
                // whatever is left fell out of the window
                self.tracker.wanted.clear_all();
                self.replay_pending = self.want_expired;
            }
            return;
        };

        let idx = ReplayCache::physical(cursor);
        self.tracker.wanted.clear(idx);
        let Some(slot) = self.cache.get(cursor) else {
            return;
        };
        let fp = slot.fingerprint;
        let count = slot.replay_count + 1;
        let high = slot.body.as_ref().is_some_and(|p| self.is_high(p.priority));

        match self.queue.push(cursor) {
            Ok(()) => {
                self.cache.mark_replayed(cursor, now);
                self.metrics.packets_replayed += 1;
                if high {
                    self.metrics.priority_replayed += 1;
                }
                tracing::info!(%fp, cursor, count, high, "replaying packet");
            }
            Err(e) => {
                self.metrics.queue_full_drops += 1;
                tracing::warn!(%fp, error = %e, "dropping replay");
            }
        }
    }

    fn next_wanted(&mut self, high_only: bool) -> Option<Cursor> {
        for cursor in self.cache.tail()..self.cache.head() {
            let idx = ReplayCache::physical(cursor);
            if !self.tracker.wanted.test(idx) {
                continue;
            }
            let Some(slot) = self.cache.get(cursor) else {
                continue;
            };
            let Some(body) = &slot.body else {
                self.tracker.wanted.clear(idx);
                self.want_expired = true;
                continue;
            };
            if high_only && !self.is_high(body.priority) {
                continue;
            }
            let replayed_since_advert = slot
                .last_replay
                .is_some_and(|t| self.last_advert.map_or(true, |a| t > a));
            if replayed_since_advert {
                self.tracker.wanted.clear(idx);
                continue;
            }
            return Some(cursor);
        }
        None
    }

    // ── Advertising ───────────────────────────────────────────────────────────

    fn entries_for(&self, slots: &[usize]) -> Vec<AdvertEntry> {
        slots
            .iter()
            .filter_map(|&idx| {
                let slot = self.cache.slot_at(idx)?;
                let body = slot.body.as_ref()?;
                Some(AdvertEntry {
                    slot: idx,
                    fingerprint: slot.fingerprint,
                    priority: self.is_high(body.priority),
                })
            })
            .collect()
    }

    /// Advertise unadvertised cached packets. When congested only high
    /// priority ones are offered. Returns true if more remain than fit in
    /// one advertisement.
    pub fn advertise(&mut self, now: Instant) -> bool {
        let congested = self.congested();
        let mut candidates = if congested {
            self.tracker.dirty_prio
        } else {
            self.tracker.dirty
        };
        for idx in candidates.ones().collect::<Vec<_>>() {
            if self.cache.body_at(idx).is_none() {
                candidates.clear(idx);
                self.tracker.clear_advertised(idx);
            }
        }
        if candidates.none() {
            return false;
        }

        let max = self.advert.max_packets.max(1);
        let again = candidates.count() > max;
        let chosen: Vec<usize> = (self.cache.tail()..self.cache.head())
            .map(ReplayCache::physical)
            .filter(|&idx| candidates.test(idx))
            .take(max)
            .collect();
        let entries = self.entries_for(&chosen);
        for &idx in &chosen {
            self.tracker.clear_advertised(idx);
        }

        let sequence = self.next_sequence;
        self.tracker.record(
            sequence,
            self.cache.head(),
            self.cache.tail(),
            chosen.iter().copied().collect(),
        );

        let mut header = self.header(MessageKind::AdvertiseAvailable);
        header.boot = self.last_advert.is_none();
        header.sequence = (sequence & SEQUENCE_MASK) as u8;
        let advert = Advertisement {
            header,
            entries,
            aggregate_mask: None,
            throttled: self.clients.throttled(now, self.advert.throttle_max),
        };
        let count = advert.entries.len();
        let throttled = advert.throttled.len();

        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.packets_since_advert = self.packets_since_advert.saturating_sub(count);
        self.last_advert = Some(now);
        if self.send(NodeId::BROADCAST, Message::Available(advert)) {
            self.metrics.adverts_sent += 1;
        }
        tracing::info!(
            count,
            cached = self.cache.num_cached(),
            tracked = self.cache.len(),
            seq = header.sequence,
            priority_only = congested,
            boot = header.boot,
            throttled,
            "advertising cached packets"
        );
        again
    }

    /// Resend earlier advertisements, `from` plus each bit of `mask`.
    fn advertise_aggregate(&mut self, now: Instant, from: u8, mask: u16) {
        let congested = self.congested();
        let (mut slots, covered) = self.tracker.aggregate(
            u32::from(from),
            mask,
            &self.cache,
            self.advert.max_packets,
        );
        for idx in slots.ones().collect::<Vec<_>>() {
            let keep = self
                .cache
                .body_at(idx)
                .is_some_and(|p| !congested || self.is_high(p.priority));
            if !keep {
                slots.clear(idx);
            }
        }

        let chosen: Vec<usize> = slots.ones().collect();
        let entries = self.entries_for(&chosen);
        for &idx in &chosen {
            self.tracker.clear_advertised(idx);
        }

        let mut header = self.header(MessageKind::AdvertiseAvailable);
        header.sequence = from & SEQUENCE_MASK as u8;
        let advert = Advertisement {
            header,
            entries,
            aggregate_mask: Some(covered),
            throttled: self.clients.throttled(now, self.advert.throttle_max),
        };
        let count = advert.entries.len();
        self.last_advert = Some(now);
        if self.send(NodeId::BROADCAST, Message::Available(advert)) {
            self.metrics.aggregate_adverts_sent += 1;
        }
        tracing::info!(
            from,
            covered = format_args!("{covered:#06x}"),
            count,
            "sending aggregate advertisement"
        );
    }

    /// Tell clients which slots no longer hold a body. Rate limited; returns
    /// false when it is too soon to send another.
    pub fn advertise_expired(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_expired {
            if now < last + self.advert.expired_spacing() {
                return false;
            }
        }
        let slots: SlotBits = (0..SLOTS)
            .filter(|&idx| self.cache.body_at(idx).is_none())
            .collect();
        let mut header = self.header(MessageKind::AdvertiseExpired);
        header.boot = self.last_advert.is_none();

        self.want_expired = false;
        self.last_expired = Some(now);
        let expired = slots.count();
        if self.send(NodeId::BROADCAST, Message::Expired { header, slots }) {
            self.metrics.expiry_adverts_sent += 1;
        }
        tracing::info!(expired, "advertising expired packets");
        true
    }

    // ── Client role ───────────────────────────────────────────────────────────

    fn handle_advertisement(
        &mut self,
        from: NodeId,
        header: Header,
        body: AdvertBody<'_>,
        now: Instant,
    ) {
        self.metrics.adverts_received += 1;
        let stale_after = self.peers.server_stale();
        let mut server = self
            .servers
            .take(from)
            .unwrap_or_else(|| ServerInfo::new(from, now));

        if server.state != PeerState::Unknown && server.is_stale(now, stale_after) {
            tracing::info!(
                server = %from,
                silent_secs = now.saturating_duration_since(server.last_advert).as_secs(),
                "stale server active again"
            );
            self.resync(&mut server, ResyncReason::Stale);
        }
        if header.boot && server.sequence.is_started() {
            self.resync(&mut server, ResyncReason::Boot);
        }

        server.last_advert = now;
        server.priority_only = header.priority;
        server.router = header.router;
        server.adverts_received += 1;

        match body {
            AdvertBody::Available(advert) => self.handle_availability(&mut server, advert, now),
            AdvertBody::Expired(slots) => self.handle_expiry(&mut server, slots),
        }

        tracing::info!(
            server = %from,
            adverts = server.adverts_received,
            requested = server.replays_requested,
            missing = server.missing.count(),
            available = server.available.count(),
            seq = header.sequence,
            priority_only = header.priority,
            router = header.router,
            aggregate = header.aggregate,
            boot = header.boot,
            "replay advertisement"
        );

        match self.servers.admit(server, now, stale_after) {
            Admission::Added => tracing::info!(server = %from, "now tracking server"),
            Admission::Replaced(evicted) => {
                self.metrics.servers_evicted += 1;
                tracing::info!(server = %from, %evicted, "now tracking server in place of another");
            }
            Admission::Rejected => {
                tracing::debug!(server = %from, "server table full; not tracking")
            }
            Admission::Kept => {}
        }
    }

    fn resync(&mut self, server: &mut ServerInfo, reason: ResyncReason) {
        tracing::warn!(server = %server.id, ?reason, "resyncing server state");
        server.invalidate();
        self.metrics.resyncs += 1;
    }

    fn handle_availability(&mut self, server: &mut ServerInfo, advert: &Advertisement, now: Instant) {
        let header = advert.header;
        match server.sequence.observe(header.sequence, advert.aggregate_mask) {
            SequenceEvent::Resync(reason) => {
                tracing::warn!(
                    server = %server.id,
                    ?reason,
                    seq = header.sequence,
                    "advertisement sequence out of step"
                );
                server.clear_availability();
                self.metrics.resyncs += 1;
            }
            SequenceEvent::Baseline => {
                tracing::debug!(server = %server.id, seq = header.sequence, "sequence baseline")
            }
            SequenceEvent::Tracked => {}
        }

        for entry in &advert.entries {
            server.available.set(entry.slot);
            server.priority.assign(entry.slot, entry.priority);
            server.fingerprints[entry.slot] = entry.fingerprint;
            let known = self.is_known(entry.fingerprint);
            server.missing.assign(entry.slot, !known);
            if !known {
                tracing::debug!(fp = %entry.fingerprint, server = %server.id, "discovered missing packet");
            }
        }

        if server.sequence.has_gaps() {
            self.request_missing_adverts(server);
        }

        if advert.throttled.contains(&self.identity.node.short()) {
            tracing::info!(server = %server.id, "throttled by server; not requesting");
            return;
        }

        let settled: Vec<usize> = server
            .missing
            .ones()
            .filter(|&idx| !server.available.test(idx) || self.is_known(server.fingerprints[idx]))
            .collect();
        for idx in settled {
            server.missing.clear(idx);
        }
        if server.missing.any() {
            self.request_replay(server, now);
        }
    }

    fn handle_expiry(&mut self, server: &mut ServerInfo, slots: &SlotBits) {
        for idx in slots.ones() {
            server.available.clear(idx);
            server.missing.clear(idx);
        }
        tracing::info!(server = %server.id, expired = slots.count(), "expiry advertisement");
    }

    /// Ask `server` for packets it has and we lack.
    pub fn request_replay(&mut self, server: &mut ServerInfo, now: Instant) {
        let mut request = server.wanted();
        if request.none() {
            return;
        }
        if server.is_stale(now, self.peers.server_stale()) {
            tracing::debug!(server = %server.id, "not requesting from stale server");
            self.resync(server, ResyncReason::Stale);
            return;
        }

        let mut claimed = Vec::new();
        for idx in request.ones().collect::<Vec<_>>() {
            let fp = server.fingerprints[idx];
            if self.is_known(fp) {
                server.missing.clear(idx);
                request.clear(idx);
                continue;
            }
            match self.requests.claim(fp, now) {
                Claim::Fresh => claimed.push(idx),
                Claim::Pending => {
                    tracing::debug!(%fp, server = %server.id, "already requested recently");
                    request.clear(idx);
                }
                Claim::Full => {
                    tracing::warn!(%fp, server = %server.id, "too many outstanding requests");
                    request.clear(idx);
                }
            }
        }

        let max = self.peers.request_max_packets;
        if claimed.len() > max {
            let (normal, high): (Vec<usize>, Vec<usize>) =
                claimed.iter().partition(|&&idx| !server.priority.test(idx));
            for idx in normal.into_iter().chain(high).take(claimed.len() - max) {
                request.clear(idx);
                self.requests.release(server.fingerprints[idx]);
            }
        }
        if request.none() {
            return;
        }

        let count = request.count();
        let mut header = self.header(MessageKind::RequestPackets);
        header.sequence = server.sequence.last_wire();
        let msg = Message::RequestPackets {
            header,
            slots: request,
        };
        if self.send(server.id, msg) {
            server.replays_requested += count as u32;
            self.metrics.packets_requested += count as u64;
            tracing::info!(server = %server.id, count, priority_only = header.priority, "requesting missing packets");
        } else {
            for idx in request.ones() {
                self.requests.release(server.fingerprints[idx]);
            }
        }
    }

    /// Ask `server` to resend the advertisements we missed.
    pub fn request_missing_adverts(&mut self, server: &ServerInfo) {
        let missing = server.sequence.missing_mask();
        if missing == 0 {
            return;
        }
        let mut header = self.header(MessageKind::RequestAdvertisement);
        header.sequence = server.sequence.last_wire();
        if self.send(server.id, Message::RequestAdvertisement { header, missing }) {
            self.metrics.advert_requests_sent += 1;
            tracing::info!(
                server = %server.id,
                seq = header.sequence,
                missing = format_args!("{missing:#06x}"),
                "requesting missed advertisements"
            );
        }
    }

    fn expire_stale_servers(&mut self, now: Instant) {
        let stale_after = self.peers.server_stale();
        for server in self.servers.iter_mut() {
            if server.sequence.is_started() && server.is_stale(now, stale_after) {
                tracing::info!(server = %server.id, "server went stale");
                server.invalidate();
                self.metrics.resyncs += 1;
            }
        }
    }

    fn send(&mut self, to: NodeId, msg: Message) -> bool {
        let payload = msg.encode();
        tracing::trace!(%to, frame = %hex::encode(&payload), "sending replay frame");
        let out = OutboundMessage {
            to,
            priority: PROTOCOL_PRIORITY,
            payload,
        };
        match self.router.send(out) {
            Ok(()) => true,
            Err(e) => {
                self.metrics.send_failures += 1;
                tracing::warn!(%to, error = %e, "failed to send replay frame");
                false
            }
        }
    }

    // ── Scheduling ────────────────────────────────────────────────────────────

    fn flush_deadline(&self) -> Instant {
        let startup = self.booted + self.advert.startup_delay();
        (self.last_flush + self.advert.flush_interval()).max(startup)
    }

    /// Run one scheduling step. Returns the delay until the next wake-up.
    pub fn on_notify(&mut self, reason: WakeReason, now: Instant) -> Duration {
        tracing::debug!(?reason, "replay wake");
        self.expire_stale_servers(now);

        if self.replay_pending {
            self.replay(now);
        }

        let started = now >= self.booted + self.advert.startup_delay();
        let due = self.packets_since_advert > self.advert.flush_packets
            || now >= self.flush_deadline();
        if started && due {
            self.last_flush = now;
            let rounds = SLOTS / self.advert.max_packets.max(1) + 1;
            for _ in 0..rounds {
                if !self.advertise(now) {
                    break;
                }
            }
        }

        self.next_wake(now)
    }

    fn next_wake(&self, now: Instant) -> Duration {
        if self.replay_pending {
            if self.tracker.wanted.any() {
                return self.replay.spacing();
            }
            if self.want_expired {
                let ready = self
                    .last_expired
                    .map_or(now, |t| t + self.advert.expired_spacing());
                return ready
                    .saturating_duration_since(now)
                    .max(self.replay.spacing());
            }
        }
        self.flush_deadline().saturating_duration_since(now)
    }
}
