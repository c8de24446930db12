//! Wire frame codec for tree network messages.
//!
//! Every message travels as one self-delimited frame:
//!
//! ```text
//! 0      1      2..4   4..6   6..8          8     9     10..10+N  10+N  11+N
//! +------+------+------+------+-------------+-----+-----+---------+-----+------+
//! | 0xAA | len  | dest | src  | broadcaster | typ | seq | payload | crc | 0x55 |
//! +------+------+------+------+-------------+-----+-----+---------+-----+------+
//! ```
//!
//! Multi-byte fields are little-endian. `len` is the total frame length, so a
//! frame is at most 255 bytes and carries at most 243 payload bytes. The CRC-8
//! (poly 0x07, init 0, no reflection) covers `len` through the end of the
//! payload. Relays rewrite only `broadcaster` and the CRC.

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_8_SMBUS};
use serde::Serialize;
use thiserror::Error;

pub const START_DELIMITER: u8 = 0xAA;
pub const END_DELIMITER: u8 = 0x55;
pub const HEADER_SIZE: usize = 10;
/// Header + CRC + end delimiter.
pub const FRAME_OVERHEAD: usize = 12;
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_OVERHEAD;

const BROADCASTER_OFFSET: usize = 6;

// SMBUS is the plain CRC-8: poly 0x07, init 0x00, no reflection, no xorout.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageType {
    DataReport,
    Ack,
    Nack,
    SetOutputs,
    DistributedIoUpdate,
    RequestBitIndex,
    AssignBitIndex,
    ConfirmBitIndex,
    Unknown(u8),
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::DataReport => 0x01,
            MessageType::Ack => 0x02,
            MessageType::Nack => 0x03,
            MessageType::SetOutputs => 0x10,
            MessageType::DistributedIoUpdate => 0x22,
            MessageType::RequestBitIndex => 0x30,
            MessageType::AssignBitIndex => 0x31,
            MessageType::ConfirmBitIndex => 0x32,
            MessageType::Unknown(v) => v,
        }
    }

    /// Flood messages address the whole tree regardless of destination.
    pub fn is_flood(self) -> bool {
        self == MessageType::DistributedIoUpdate
    }
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v {
            0x01 => MessageType::DataReport,
            0x02 => MessageType::Ack,
            0x03 => MessageType::Nack,
            0x10 => MessageType::SetOutputs,
            0x22 => MessageType::DistributedIoUpdate,
            0x30 => MessageType::RequestBitIndex,
            0x31 => MessageType::AssignBitIndex,
            0x32 => MessageType::ConfirmBitIndex,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t.as_u8()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad start delimiter 0x{0:02X}")]
    BadStart(u8),
    #[error("bad end delimiter 0x{0:02X}")]
    BadEnd(u8),
    #[error("declared length {declared} does not match received {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("crc mismatch: computed 0x{computed:02X}, frame carries 0x{carried:02X}")]
    CrcMismatch { computed: u8, carried: u8 },
    #[error("payload of {0} bytes exceeds the {max} byte limit", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),
    #[error("frame needs {needed} bytes but buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
}

/// A decoded (or about to be encoded) tree message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub dest: u16,
    pub src: u16,
    pub broadcaster: u16,
    pub msg_type: MessageType,
    pub seq: u8,
    #[serde(serialize_with = "serialize_hex")]
    pub payload: Vec<u8>,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

impl Frame {
    /// A fresh, unforwarded frame: the originator is also the broadcaster.
    pub fn new(dest: u16, src: u16, msg_type: MessageType, seq: u8, payload: Vec<u8>) -> Self {
        Self {
            dest,
            src,
            broadcaster: src,
            msg_type,
            seq,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let total = self.encoded_len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(START_DELIMITER);
        buf.put_u8(total as u8);
        buf.put_u16_le(self.dest);
        buf.put_u16_le(self.src);
        buf.put_u16_le(self.broadcaster);
        buf.put_u8(self.msg_type.as_u8());
        buf.put_u8(self.seq);
        buf.put_slice(&self.payload);
        let crc = CRC8.checksum(&buf[1..]);
        buf.put_u8(crc);
        buf.put_u8(END_DELIMITER);
        Ok(buf.to_vec())
    }

    /// Encode into a caller-provided buffer, returning the number of bytes written.
    /// Nothing is written when the frame does not fit.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, FrameError> {
        let total = self.encoded_len();
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        if total > out.len() {
            return Err(FrameError::BufferTooSmall {
                needed: total,
                capacity: out.len(),
            });
        }
        let bytes = self.encode()?;
        out[..total].copy_from_slice(&bytes);
        Ok(total)
    }
}

/// Build and serialize an unforwarded frame in one step.
pub fn encode(
    dest: u16,
    src: u16,
    msg_type: MessageType,
    seq: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    Frame::new(dest, src, msg_type, seq, payload.to_vec()).encode()
}

/// Validate a received frame. Any mismatch rejects the whole frame.
pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    if raw.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort(raw.len()));
    }
    if raw[0] != START_DELIMITER {
        return Err(FrameError::BadStart(raw[0]));
    }
    let last = raw[raw.len() - 1];
    if last != END_DELIMITER {
        return Err(FrameError::BadEnd(last));
    }
    let declared = raw[1] as usize;
    if declared != raw.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: raw.len(),
        });
    }
    let crc_pos = raw.len() - 2;
    let computed = CRC8.checksum(&raw[1..crc_pos]);
    if computed != raw[crc_pos] {
        return Err(FrameError::CrcMismatch {
            computed,
            carried: raw[crc_pos],
        });
    }

    let mut header = &raw[2..HEADER_SIZE];
    let dest = header.get_u16_le();
    let src = header.get_u16_le();
    let broadcaster = header.get_u16_le();
    let msg_type = MessageType::from(header.get_u8());
    let seq = header.get_u8();
    Ok(Frame {
        dest,
        src,
        broadcaster,
        msg_type,
        seq,
        payload: raw[HEADER_SIZE..crc_pos].to_vec(),
    })
}

/// Copy of a validated frame with `broadcaster` set to the relaying node and
/// the CRC recomputed. All other bytes are left untouched.
pub fn rewrite_for_forward(raw: &[u8], my_hid: u16) -> Result<Vec<u8>, FrameError> {
    decode(raw)?;
    let mut out = raw.to_vec();
    out[BROADCASTER_OFFSET..BROADCASTER_OFFSET + 2].copy_from_slice(&my_hid.to_le_bytes());
    let crc_pos = out.len() - 2;
    out[crc_pos] = CRC8.checksum(&out[1..crc_pos]);
    Ok(out)
}

/// CRC-8 over an arbitrary slice, exposed for diagnostics.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_matches_reference_check_value() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc8(&[]), 0x00);
    }

    #[test]
    fn layout_is_little_endian_and_delimited() {
        let bytes = encode(0x0102, 0x0304, MessageType::SetOutputs, 7, &[0xAB]).unwrap();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0], START_DELIMITER);
        assert_eq!(bytes[1], 13);
        assert_eq!(&bytes[2..4], &[0x02, 0x01]);
        assert_eq!(&bytes[4..6], &[0x04, 0x03]);
        // broadcaster starts out as the source
        assert_eq!(&bytes[6..8], &[0x04, 0x03]);
        assert_eq!(bytes[8], 0x10);
        assert_eq!(bytes[9], 7);
        assert_eq!(bytes[10], 0xAB);
        assert_eq!(bytes[11], crc8(&bytes[1..11]));
        assert_eq!(bytes[12], END_DELIMITER);
    }

    #[test]
    fn round_trip_at_payload_boundaries() {
        for len in [0usize, 1, MAX_PAYLOAD_LEN] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let bytes = encode(1, 121, MessageType::DataReport, 9, &payload).unwrap();
            assert_eq!(bytes.len(), len + FRAME_OVERHEAD);
            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.dest, 1);
            assert_eq!(frame.src, 121);
            assert_eq!(frame.broadcaster, 121);
            assert_eq!(frame.msg_type, MessageType::DataReport);
            assert_eq!(frame.seq, 9);
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn oversized_payload_is_refused() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode(1, 12, MessageType::DataReport, 0, &payload),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn encode_into_respects_caller_buffer() {
        let frame = Frame::new(1, 12, MessageType::Ack, 3, vec![1, 2]);
        let mut small = [0u8; 13];
        assert_eq!(
            frame.encode_into(&mut small),
            Err(FrameError::BufferTooSmall {
                needed: 14,
                capacity: 13
            })
        );
        assert!(small.iter().all(|b| *b == 0));
        let mut big = [0u8; 32];
        assert_eq!(frame.encode_into(&mut big), Ok(14));
        assert_eq!(decode(&big[..14]).unwrap(), frame);
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let bytes = encode(12, 1, MessageType::SetOutputs, 200, &[0x55, 0x01, 0xFE]).unwrap();
        for byte in 0..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    decode(&corrupted).is_err(),
                    "flip of byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn truncated_and_padded_frames_are_rejected() {
        let bytes = encode(1, 12, MessageType::DataReport, 1, &[1, 2, 3]).unwrap();
        assert!(matches!(decode(&bytes[..5]), Err(FrameError::TooShort(5))));
        let mut padded = bytes.clone();
        padded.insert(bytes.len() - 1, 0);
        assert!(matches!(
            decode(&padded),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn forward_rewrite_touches_only_broadcaster_and_crc() {
        let original = encode(1, 121, MessageType::DataReport, 42, &[9, 8, 7, 6]).unwrap();
        let forwarded = rewrite_for_forward(&original, 12).unwrap();
        assert_eq!(forwarded.len(), original.len());
        for (i, (a, b)) in original.iter().zip(forwarded.iter()).enumerate() {
            let is_broadcaster = i == 6 || i == 7;
            let is_crc = i == original.len() - 2;
            if !(is_broadcaster || is_crc) {
                assert_eq!(a, b, "byte {} changed", i);
            }
        }
        let frame = decode(&forwarded).unwrap();
        assert_eq!(frame.broadcaster, 12);
        assert_eq!(frame.src, 121);
        assert_eq!(frame.dest, 1);
        assert_eq!(frame.seq, 42);
    }

    #[test]
    fn forward_rewrite_refuses_invalid_input() {
        let mut bytes = encode(1, 121, MessageType::DataReport, 42, &[]).unwrap();
        bytes[10] ^= 0xFF;
        assert!(rewrite_for_forward(&bytes, 12).is_err());
    }

    #[test]
    fn unknown_types_survive_decoding() {
        let bytes = encode(12, 1, MessageType::Unknown(0x7E), 0, &[]).unwrap();
        assert_eq!(decode(&bytes).unwrap().msg_type, MessageType::Unknown(0x7E));
        assert_eq!(MessageType::from(0x22), MessageType::DistributedIoUpdate);
        assert!(MessageType::DistributedIoUpdate.is_flood());
        assert!(!MessageType::DataReport.is_flood());
    }
}
