//! Replay wire format: on-air encoding of advertisements and requests.
//!
//! Every frame starts with a 16-bit header followed by a kind-specific
//! payload. All multi-byte fields are little-endian. Nothing here depends on
//! in-memory layout: every field is packed and unpacked explicitly.
//!
//! ```text
//! header (u16):
//!   bits  0-1  kind
//!   bit     2  priority-only
//!   bit     3  boot            (advertisements only)
//!   bit     4  router
//!   bit     5  aggregate       (advertisements only)
//!   bit     6  throttle        (advertisements only)
//!   bit     7  reserved
//!   bits 8-12  sequence
//!   bits 13-15 reserved
//!
//! available:  range map, { packet map, priority map, fingerprint* }*,
//!             [aggregate mask], [throttled client ids (u8)*]
//! expired:    range map, { slot map }*
//! request:    range map, { slot map }*
//! resend:     sequence mask
//! ```
//!
//! The range map selects which of the 16 ranges of 16 slots follow, so a
//! payload never carries more than the populated ranges.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::const_assert_eq;

use crate::bitmap::{SlotBits, RANGE_WIDTH};
use crate::packet::Fingerprint;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Physical slots addressable on the wire.
pub const SLOTS: usize = SlotBits::BITS;

/// Ranges in a range map.
pub const RANGES: usize = SlotBits::ranges();

const_assert_eq!(SLOTS, RANGES * RANGE_WIDTH);
const_assert_eq!(RANGES, 16);

/// Mask applied to advertisement sequence numbers.
pub const SEQUENCE_MASK: u32 = 0x1F;

/// Distinct wire sequence numbers.
pub const SEQUENCE_WINDOW: u32 = SEQUENCE_MASK + 1;

const HEADER_LEN: usize = 2;

// ── Header ────────────────────────────────────────────────────────────────────

/// Frame kind, the low two header bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    AdvertiseAvailable = 0,
    AdvertiseExpired = 1,
    RequestPackets = 2,
    RequestAdvertisement = 3,
}

impl MessageKind {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => MessageKind::AdvertiseAvailable,
            1 => MessageKind::AdvertiseExpired,
            2 => MessageKind::RequestPackets,
            _ => MessageKind::RequestAdvertisement,
        }
    }

    pub fn is_advertisement(self) -> bool {
        matches!(
            self,
            MessageKind::AdvertiseAvailable | MessageKind::AdvertiseExpired
        )
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    /// Sender is congested: only high-priority packets are offered or wanted.
    pub priority: bool,
    /// First advertisement since the sender booted.
    pub boot: bool,
    /// Sender has the router role.
    pub router: bool,
    /// Advertisement is a resend of earlier sequence numbers.
    pub aggregate: bool,
    /// Advertisement carries a throttle list.
    pub throttle: bool,
    /// Advertisement sequence, or the echoed server sequence in requests.
    pub sequence: u8,
}

const PRIORITY_BIT: u16 = 1 << 2;
const BOOT_BIT: u16 = 1 << 3;
const ROUTER_BIT: u16 = 1 << 4;
const AGGREGATE_BIT: u16 = 1 << 5;
const THROTTLE_BIT: u16 = 1 << 6;
const SEQUENCE_SHIFT: u16 = 8;

impl Header {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            priority: false,
            boot: false,
            router: false,
            aggregate: false,
            throttle: false,
            sequence: 0,
        }
    }

    pub fn to_bits(&self) -> u16 {
        let mut bits = self.kind as u16;
        if self.priority {
            bits |= PRIORITY_BIT;
        }
        if self.boot {
            bits |= BOOT_BIT;
        }
        if self.router {
            bits |= ROUTER_BIT;
        }
        if self.aggregate {
            bits |= AGGREGATE_BIT;
        }
        if self.throttle {
            bits |= THROTTLE_BIT;
        }
        bits | ((u16::from(self.sequence) & SEQUENCE_MASK as u16) << SEQUENCE_SHIFT)
    }

    /// Reserved bits are ignored.
    pub fn from_bits(bits: u16) -> Self {
        Self {
            kind: MessageKind::from_bits(bits),
            priority: bits & PRIORITY_BIT != 0,
            boot: bits & BOOT_BIT != 0,
            router: bits & ROUTER_BIT != 0,
            aggregate: bits & AGGREGATE_BIT != 0,
            throttle: bits & THROTTLE_BIT != 0,
            sequence: ((bits >> SEQUENCE_SHIFT) & SEQUENCE_MASK as u16) as u8,
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// One advertised slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertEntry {
    pub slot: usize,
    pub fingerprint: Fingerprint,
    pub priority: bool,
}

/// Availability advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub header: Header,
    /// Ascending by slot after decoding.
    pub entries: Vec<AdvertEntry>,
    /// Which sequences (header sequence + bit) an aggregate covers.
    pub aggregate_mask: Option<u16>,
    /// Truncated ids of clients asked not to request replays.
    pub throttled: Vec<u8>,
}

impl Advertisement {
    pub fn slots(&self) -> SlotBits {
        self.entries.iter().map(|e| e.slot).collect()
    }
}

/// Any replay protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Available(Advertisement),
    Expired { header: Header, slots: SlotBits },
    RequestPackets { header: Header, slots: SlotBits },
    RequestAdvertisement { header: Header, missing: u16 },
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::Available(advert) => &advert.header,
            Message::Expired { header, .. }
            | Message::RequestPackets { header, .. }
            | Message::RequestAdvertisement { header, .. } => header,
        }
    }

    /// Encode to wire bytes. The header kind and the aggregate/throttle flags
    /// are derived from the message contents.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        match self {
            Message::Available(advert) => {
                let mut header = advert.header;
                header.kind = MessageKind::AdvertiseAvailable;
                header.aggregate = advert.aggregate_mask.is_some();
                header.throttle = !advert.throttled.is_empty();
                out.put_u16_le(header.to_bits());
                encode_entries(&advert.entries, &mut out);
                if let Some(mask) = advert.aggregate_mask {
                    out.put_u16_le(mask);
                }
                out.put_slice(&advert.throttled);
            }
            Message::Expired { header, slots } => {
                out.put_u16_le(with_kind(header, MessageKind::AdvertiseExpired));
                encode_slots(slots, &mut out);
            }
            Message::RequestPackets { header, slots } => {
                out.put_u16_le(with_kind(header, MessageKind::RequestPackets));
                encode_slots(slots, &mut out);
            }
            Message::RequestAdvertisement { header, missing } => {
                out.put_u16_le(with_kind(header, MessageKind::RequestAdvertisement));
                out.put_u16_le(*missing);
            }
        }
        out.freeze()
    }

    fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Message::Available(a) => {
                    let ranges = a.slots().range_map().count_ones() as usize;
                    2 + ranges * 4
                        + a.entries.len() * 2
                        + if a.aggregate_mask.is_some() { 2 } else { 0 }
                        + a.throttled.len()
                }
                Message::Expired { slots, .. } | Message::RequestPackets { slots, .. } => {
                    2 + slots.range_map().count_ones() as usize * 2
                }
                Message::RequestAdvertisement { .. } => 2,
            }
    }

    /// Decode a frame. Payloads shorter than their declared bitmap
    /// population are rejected.
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        let header = Header::from_bits(take_u16(&mut buf, "header")?);
        match header.kind {
            MessageKind::AdvertiseAvailable => {
                let entries = decode_entries(&mut buf)?;
                let aggregate_mask = if header.aggregate {
                    Some(take_u16(&mut buf, "aggregate mask")?)
                } else {
                    None
                };
                let throttled = if header.throttle {
                    buf.to_vec()
                } else {
                    Vec::new()
                };
                Ok(Message::Available(Advertisement {
                    header,
                    entries,
                    aggregate_mask,
                    throttled,
                }))
            }
            MessageKind::AdvertiseExpired => Ok(Message::Expired {
                header,
                slots: decode_slots(&mut buf)?,
            }),
            MessageKind::RequestPackets => Ok(Message::RequestPackets {
                header,
                slots: decode_slots(&mut buf)?,
            }),
            MessageKind::RequestAdvertisement => Ok(Message::RequestAdvertisement {
                header,
                missing: take_u16(&mut buf, "sequence mask")?,
            }),
        }
    }
}

fn with_kind(header: &Header, kind: MessageKind) -> u16 {
    let mut header = *header;
    header.kind = kind;
    header.to_bits()
}

// ── Range codecs ──────────────────────────────────────────────────────────────

fn encode_slots(slots: &SlotBits, out: &mut BytesMut) {
    let map = slots.range_map() as u16;
    out.put_u16_le(map);
    for range in (0..RANGES).filter(|&r| map & (1 << r) != 0) {
        out.put_u16_le(slots.range(range));
    }
}

fn decode_slots(buf: &mut &[u8]) -> Result<SlotBits, WireError> {
    let map = take_u16(buf, "range map")?;
    need(buf, map.count_ones() as usize * 2, "range bitmaps")?;
    let mut slots = SlotBits::new();
    for range in (0..RANGES).filter(|&r| map & (1 << r) != 0) {
        slots.set_range(range, buf.get_u16_le());
    }
    Ok(slots)
}

fn encode_entries(entries: &[AdvertEntry], out: &mut BytesMut) {
    let mut sorted: Vec<&AdvertEntry> = entries.iter().filter(|e| e.slot < SLOTS).collect();
    sorted.sort_by_key(|e| e.slot);
    sorted.dedup_by_key(|e| e.slot);

    let map = sorted
        .iter()
        .fold(0u16, |map, e| map | (1 << (e.slot / RANGE_WIDTH)));
    out.put_u16_le(map);

    for range in (0..RANGES).filter(|&r| map & (1 << r) != 0) {
        let in_range: Vec<&&AdvertEntry> = sorted
            .iter()
            .filter(|e| e.slot / RANGE_WIDTH == range)
            .collect();
        let (packets, priority) = in_range.iter().fold((0u16, 0u16), |(p, q), e| {
            let bit = 1 << (e.slot % RANGE_WIDTH);
            (p | bit, if e.priority { q | bit } else { q })
        });
        out.put_u16_le(packets);
        out.put_u16_le(priority);
        for e in in_range {
            out.put_u16_le(e.fingerprint.0);
        }
    }
}

fn decode_entries(buf: &mut &[u8]) -> Result<Vec<AdvertEntry>, WireError> {
    let map = take_u16(buf, "range map")?;
    need(buf, map.count_ones() as usize * 4, "range bitmaps")?;
    let mut entries = Vec::new();
    for range in (0..RANGES).filter(|&r| map & (1 << r) != 0) {
        let packets = take_u16(buf, "packet map")?;
        let priority = take_u16(buf, "priority map")?;
        need(buf, packets.count_ones() as usize * 2, "fingerprints")?;
        for j in (0..RANGE_WIDTH).filter(|&j| packets & (1 << j) != 0) {
            entries.push(AdvertEntry {
                slot: range * RANGE_WIDTH + j,
                fingerprint: Fingerprint(buf.get_u16_le()),
                priority: priority & (1 << j) != 0,
            });
        }
    }
    Ok(entries)
}

fn need(buf: &&[u8], needed: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            what,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take_u16(buf: &mut &[u8], what: &'static str) -> Result<u16, WireError> {
    need(buf, 2, what)?;
    Ok(buf.get_u16_le())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated {what}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
