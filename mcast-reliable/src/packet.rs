//! Wire-format definitions.
//!
//! Two formats cross the wire:
//!
//! - **Multicast data frames.**  The payload travels unmodified; the fabric
//!   prepends a [`GRH_LENGTH`]-byte routing header and the packet sequence
//!   number rides out of band in the 32-bit immediate field, in network byte
//!   order ([`encode_imm`] / [`decode_imm`]).
//! - **Control packets.**  Point-to-point reliability traffic (ACK, NACK and
//!   retransmitted data) uses [`ControlPacket`].
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Control packet layout
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |                Communicator Id                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |                  From Rank                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |                    PSN                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |               Payload Length                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |               Payload ...                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 17 bytes.
//! type(1) + comm_id(4) + from(4) + psn(4) + payload_len(4)

use thiserror::Error;

use crate::Rank;

/// Bytes of global routing header the fabric prepends to every multicast frame.
pub const GRH_LENGTH: usize = 40;

/// Byte length of the fixed control header on the wire.
pub const HEADER_LEN: usize = 17;

const OFF_TYPE: usize = 0;
const OFF_COMM_ID: usize = 1;
const OFF_FROM: usize = 5;
const OFF_PSN: usize = 9;
const OFF_PAYLOAD_LEN: usize = 13;

/// Convert a psn into the value stored in a work request's immediate field
/// (`htonl`).
#[inline]
pub fn encode_imm(psn: u32) -> u32 {
    psn.to_be()
}

/// Recover the psn from a completion's immediate field (`ntohl`).
#[inline]
pub fn decode_imm(imm_data: u32) -> u32 {
    u32::from_be(imm_data)
}

/// Payload length of a received multicast frame.
///
/// Returns `None` when the completion is shorter than the routing header.
#[inline]
pub fn payload_len(byte_len: usize) -> Option<usize> {
    byte_len.checked_sub(GRH_LENGTH)
}

/// Kind of point-to-point reliability message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Child → parent: everything up to the round tag in `psn` arrived.
    Ack = 1,
    /// Child → parent: please retransmit `psn`.
    Nack = 2,
    /// Parent → child: retransmitted payload for `psn`.
    Data = 3,
}

impl ControlKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ControlKind::Ack),
            2 => Some(ControlKind::Nack),
            3 => Some(ControlKind::Data),
            _ => None,
        }
    }
}

/// A complete control message: header fields plus optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub kind: ControlKind,
    /// Communicator the message belongs to.
    pub comm_id: u32,
    /// Rank of the sender.
    pub from: Rank,
    pub psn: u32,
    /// Only [`ControlKind::Data`] carries bytes.
    pub payload: Vec<u8>,
}

impl ControlPacket {
    pub fn ack(comm_id: u32, from: Rank, round_tag: u32) -> Self {
        Self {
            kind: ControlKind::Ack,
            comm_id,
            from,
            psn: round_tag,
            payload: Vec::new(),
        }
    }

    pub fn nack(comm_id: u32, from: Rank, psn: u32) -> Self {
        Self {
            kind: ControlKind::Nack,
            comm_id,
            from,
            psn,
            payload: Vec::new(),
        }
    }

    pub fn data(comm_id: u32, from: Rank, psn: u32, payload: &[u8]) -> Self {
        Self {
            kind: ControlKind::Data,
            comm_id,
            from,
            psn,
            payload: payload.to_vec(),
        }
    }

    /// Serialise into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[OFF_TYPE] = self.kind as u8;
        buf[OFF_COMM_ID..OFF_COMM_ID + 4].copy_from_slice(&self.comm_id.to_be_bytes());
        buf[OFF_FROM..OFF_FROM + 4].copy_from_slice(&self.from.to_be_bytes());
        buf[OFF_PSN..OFF_PSN + 4].copy_from_slice(&self.psn.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 4]
            .copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse a control packet from a raw byte slice.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }
        let kind = ControlKind::from_u8(buf[OFF_TYPE]).ok_or(PacketError::UnknownType(buf[OFF_TYPE]))?;
        let comm_id = be_u32(buf, OFF_COMM_ID);
        let from = be_u32(buf, OFF_FROM);
        let psn = be_u32(buf, OFF_PSN);
        let payload_len = be_u32(buf, OFF_PAYLOAD_LEN) as usize;

        if buf.len() != HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch);
        }

        Ok(ControlPacket {
            kind,
            comm_id,
            from,
            psn,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Errors that can arise when parsing a control packet.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    /// `payload_len` field does not match the actual remaining bytes.
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    /// The type byte names no known message.
    #[error("unknown control message type {0}")]
    UnknownType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imm_is_network_byte_order() {
        let imm = encode_imm(0x0102_0304);
        assert_eq!(imm.to_ne_bytes(), [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(decode_imm(imm), 0x0102_0304);
    }

    #[test]
    fn payload_len_strips_routing_header() {
        assert_eq!(payload_len(GRH_LENGTH + 100), Some(100));
        assert_eq!(payload_len(GRH_LENGTH), Some(0));
        assert_eq!(payload_len(GRH_LENGTH - 1), None);
    }

    #[test]
    fn data_packet_roundtrip() {
        let pkt = ControlPacket::data(7, 3, 1234, b"payload");
        let decoded = ControlPacket::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn header_fields_big_endian_on_wire() {
        let bytes = ControlPacket::nack(0x0a0b_0c0d, 2, 0x0102_0304).encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[OFF_TYPE], ControlKind::Nack as u8);
        assert_eq!(&bytes[OFF_COMM_ID..OFF_COMM_ID + 4], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&bytes[OFF_PSN..OFF_PSN + 4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(
            ControlPacket::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort)
        );
    }

    #[test]
    fn decode_unknown_type_returns_error() {
        let mut bytes = ControlPacket::ack(1, 0, 64).encode();
        bytes[OFF_TYPE] = 0x7f;
        assert_eq!(ControlPacket::decode(&bytes), Err(PacketError::UnknownType(0x7f)));
    }

    #[test]
    fn decode_truncated_payload_returns_error() {
        let mut bytes = ControlPacket::data(1, 0, 5, b"data").encode();
        bytes.pop();
        assert_eq!(ControlPacket::decode(&bytes), Err(PacketError::LengthMismatch));
    }
}
