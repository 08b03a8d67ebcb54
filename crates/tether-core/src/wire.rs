//! Tether wire format — the packets exchanged by the reliable blob pipe.
//!
//! Every packet is a 4-byte big-endian body length followed by the body,
//! zero-padded to a 4-byte boundary. Padding is not counted in the length.
//!
//!   body[0]    packet kind (DATA=0 … SYNC=5)
//!   body[1..4] 24-bit message id, big-endian
//!   body[4..]  kind-specific payload
//!
//! These types ARE the protocol. Changing a kind byte or the header layout
//! breaks every agent already deployed.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Packet Prefix ─────────────────────────────────────────────────────────────

/// The fixed prefix of every packet: the length field followed by the
/// 4-byte body header.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PacketPrefix {
    /// Body length in bytes, header included, padding excluded.
    pub length: U32<BigEndian>,

    /// Packet kind. See [`PacketKind`].
    pub kind: u8,

    /// 24-bit message id, big-endian.
    /// SYNC packets carry zero here; their ids live in the quads.
    pub id: [u8; 3],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketPrefix, [u8; 8]);

impl PacketPrefix {
    pub fn new(body_len: usize, kind: PacketKind, id: MessageId) -> Self {
        Self {
            length: U32::new(body_len as u32),
            kind: kind.into(),
            id: id.to_be_bytes(),
        }
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::from_be_bytes(self.id)
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the big-endian length field that precedes every body.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Size of the kind + id header at the start of every body.
pub const BODY_HEADER_LEN: usize = 4;

/// Message ids are 24 bits wide.
pub const MESSAGE_ID_MASK: u32 = 0x00FF_FFFF;

/// Number of distinct message ids before wrap-around.
pub const MESSAGE_ID_SPACE: usize = 1 << 24;

/// Default upper bound on a packet body. Larger declared lengths are
/// treated as stream corruption.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

/// Round a body length up to the 4-byte boundary used on the wire.
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

// ── Message Id ────────────────────────────────────────────────────────────────

/// A 24-bit message sequence number.
///
/// Ids wrap at 2^24. The pipe bounds its in-flight count far below that and
/// skips ids still in use, so an id is unique among unacknowledged messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u32);

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    /// Build an id from a raw value. Bits above 24 are discarded.
    pub fn new(raw: u32) -> Self {
        Self(raw & MESSAGE_ID_MASK)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The following id, wrapping at 2^24.
    pub fn next(self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }

    pub fn to_be_bytes(self) -> [u8; 3] {
        let b = self.0.to_be_bytes();
        [b[1], b[2], b[3]]
    }

    pub fn from_be_bytes(b: [u8; 3]) -> Self {
        Self(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Packet Kind ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Application payload.
    Data = 0,

    /// The receiver has stored the message; the sender may free the body.
    AckReceived = 1,

    /// The receiver's application processed the message successfully.
    AckDelivered = 2,

    /// The receiver's application failed; payload is a UTF-8 reason.
    Nack = 3,

    /// The sender has retired the message and will never retransmit it.
    AckOfNack = 4,

    /// Liveness probe sent after a stream attaches. May carry batched
    /// ack states as 4-byte quads.
    Sync = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Data),
            1 => Ok(PacketKind::AckReceived),
            2 => Ok(PacketKind::AckDelivered),
            3 => Ok(PacketKind::Nack),
            4 => Ok(PacketKind::AckOfNack),
            5 => Ok(PacketKind::Sync),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(k: PacketKind) -> u8 {
        k as u8
    }
}

// ── Packets ───────────────────────────────────────────────────────────────────

/// One ack state inside a batched SYNC packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckQuad {
    /// Either [`PacketKind::AckReceived`] or [`PacketKind::AckDelivered`].
    pub kind: PacketKind,
    pub id: MessageId,
}

/// A decoded pipe packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data { id: MessageId, payload: Bytes },
    AckReceived(MessageId),
    AckDelivered(MessageId),
    Nack { id: MessageId, reason: String },
    AckOfNack(MessageId),
    /// Empty quads = bare liveness SYNC.
    Sync(Vec<AckQuad>),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Data { .. } => PacketKind::Data,
            Packet::AckReceived(_) => PacketKind::AckReceived,
            Packet::AckDelivered(_) => PacketKind::AckDelivered,
            Packet::Nack { .. } => PacketKind::Nack,
            Packet::AckOfNack(_) => PacketKind::AckOfNack,
            Packet::Sync(_) => PacketKind::Sync,
        }
    }

    /// The id in the body header. SYNC packets report zero.
    pub fn id(&self) -> MessageId {
        match self {
            Packet::Data { id, .. } | Packet::Nack { id, .. } => *id,
            Packet::AckReceived(id) | Packet::AckDelivered(id) | Packet::AckOfNack(id) => *id,
            Packet::Sync(_) => MessageId::ZERO,
        }
    }

    /// Encode with length prefix and padding, ready to write to a stream.
    pub fn encode(&self) -> Bytes {
        let payload_len = match self {
            Packet::Data { payload, .. } => payload.len(),
            Packet::Nack { reason, .. } => reason.len(),
            Packet::Sync(quads) => quads.len() * 4,
            _ => 0,
        };
        let body_len = BODY_HEADER_LEN + payload_len;
        let frame_len = LENGTH_FIELD_LEN + padded_len(body_len);

        let mut buf = BytesMut::with_capacity(frame_len);
        buf.put_slice(PacketPrefix::new(body_len, self.kind(), self.id()).as_bytes());
        match self {
            Packet::Data { payload, .. } => buf.put_slice(payload),
            Packet::Nack { reason, .. } => buf.put_slice(reason.as_bytes()),
            Packet::Sync(quads) => {
                for quad in quads {
                    buf.put_u8(quad.kind.into());
                    buf.put_slice(&quad.id.to_be_bytes());
                }
            }
            _ => {}
        }
        buf.resize(frame_len, 0);
        buf.freeze()
    }

    /// Decode a body (length field and padding already stripped).
    pub fn decode_body(body: Bytes) -> Result<Packet, WireError> {
        if body.len() < BODY_HEADER_LEN {
            return Err(WireError::BodyTooShort(body.len()));
        }
        let kind = PacketKind::try_from(body[0])?;
        let id = MessageId::from_be_bytes([body[1], body[2], body[3]]);
        let payload = body.slice(BODY_HEADER_LEN..);

        match kind {
            PacketKind::Data => Ok(Packet::Data { id, payload }),
            PacketKind::AckReceived => Ok(Packet::AckReceived(id)),
            PacketKind::AckDelivered => Ok(Packet::AckDelivered(id)),
            PacketKind::AckOfNack => Ok(Packet::AckOfNack(id)),
            PacketKind::Nack => {
                let reason =
                    String::from_utf8(payload.to_vec()).map_err(|_| WireError::InvalidReason)?;
                Ok(Packet::Nack { id, reason })
            }
            PacketKind::Sync => {
                if payload.len() % 4 != 0 {
                    return Err(WireError::MalformedSync(payload.len()));
                }
                let mut quads = Vec::with_capacity(payload.len() / 4);
                for quad in payload.chunks_exact(4) {
                    let kind = PacketKind::try_from(quad[0])?;
                    if !matches!(kind, PacketKind::AckReceived | PacketKind::AckDelivered) {
                        return Err(WireError::InvalidSyncEntry(quad[0]));
                    }
                    quads.push(AckQuad {
                        kind,
                        id: MessageId::from_be_bytes([quad[1], quad[2], quad[3]]),
                    });
                }
                Ok(Packet::Sync(quads))
            }
        }
    }
}

// ── Packet Reader ─────────────────────────────────────────────────────────────

/// Reassembles packets from arbitrarily split push-style buffers.
///
/// One reader per attached stream. A stream that produces an error is
/// corrupt and must be discarded along with its reader.
#[derive(Debug)]
pub struct PacketReader {
    buf: BytesMut,
    max_body: usize,
}

impl PacketReader {
    pub fn new(max_body: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_body: max_body.max(BODY_HEADER_LEN),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed as a whole packet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete packet, or `None` if more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, WireError> {
        if self.buf.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }
        let body_len = (&self.buf[..LENGTH_FIELD_LEN]).get_u32() as usize;
        if body_len < BODY_HEADER_LEN || body_len > self.max_body {
            return Err(WireError::BadLength {
                len: body_len,
                max: self.max_body,
            });
        }

        let frame_len = LENGTH_FIELD_LEN + padded_len(body_len);
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(frame_len).freeze();
        frame.advance(LENGTH_FIELD_LEN);
        frame.truncate(body_len);
        Packet::decode_body(frame).map(Some)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
/// Every one of them means the stream is corrupt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown packet kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("packet body length {len} outside 4..={max}")]
    BadLength { len: usize, max: usize },

    #[error("packet body too short: {0} bytes")]
    BodyTooShort(usize),

    #[error("SYNC payload of {0} bytes is not a whole number of quads")]
    MalformedSync(usize),

    #[error("SYNC entry carries non-ack kind 0x{0:02x}")]
    InvalidSyncEntry(u8),

    #[error("NACK reason is not valid UTF-8")]
    InvalidReason,

    #[error("envelope chunk of {len} bytes exceeds working buffer of {capacity}")]
    ChunkTooLarge { len: usize, capacity: usize },

    #[error("stream ended inside an envelope chunk ({0} bytes pending)")]
    TruncatedChunk(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
