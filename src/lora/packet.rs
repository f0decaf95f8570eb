//! Over-the-air frame format.
//!
//! ```text
//! [netkey0 netkey1]  dst  type  src  packnum  payload...
//!  (optional)        |------ link header -----|
//! ```
//!
//! The link header is left out entirely in raw format. An ACK is a fixed
//! 7-byte frame `dst type src packnum 2 status snr` and never carries a
//! network key.

use std::fmt;

/// Largest frame the modem FIFO accepts.
pub const MAX_LENGTH: usize = 255;
/// Largest payload behind a link header (255 - 4).
pub const MAX_PAYLOAD: usize = 251;
pub const HEADER_LENGTH: usize = 4;
pub const NET_KEY_LENGTH: usize = 2;
pub const ACK_LENGTH: usize = 7;
/// Payload length carried by an ACK frame.
pub const ACK_PAYLOAD_LENGTH: u8 = 2;

pub const BROADCAST_0: u8 = 0x00;
pub const DEFAULT_NET_KEY: [u8; NET_KEY_LENGTH] = [0x12, 0x34];

/// Default wait for send and receive operations.
pub const MAX_TIMEOUT: u32 = 10_000;
/// Longest receive wait accepted.
pub const MAX_WAIT: u32 = 12_000;

pub const PKT_TYPE_MASK: u8 = 0xF0;
pub const PKT_FLAG_MASK: u8 = 0x0F;
pub const PKT_TYPE_DATA: u8 = 0x10;
pub const PKT_TYPE_ACK: u8 = 0x20;
pub const PKT_FLAG_ACK_REQ: u8 = 0x08;
pub const PKT_FLAG_DATA_ENCRYPTED: u8 = 0x04;
pub const PKT_FLAG_DATA_WAPPKEY: u8 = 0x02;
pub const PKT_FLAG_DATA_DOWNLINK: u8 = 0x01;

/// The type byte: frame kind in the high nibble, flags in the low one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketType(pub u8);

impl PacketType {
    pub const DATA: Self = Self(PKT_TYPE_DATA);
    pub const ACK: Self = Self(PKT_TYPE_ACK);

    pub fn kind(self) -> u8 {
        self.0 & PKT_TYPE_MASK
    }

    pub fn flags(self) -> u8 {
        self.0 & PKT_FLAG_MASK
    }

    pub fn is_data(self) -> bool {
        self.kind() == PKT_TYPE_DATA
    }

    pub fn is_ack(self) -> bool {
        self.kind() == PKT_TYPE_ACK
    }

    /// DATA or ACK.
    pub fn is_known(self) -> bool {
        self.is_data() || self.is_ack()
    }

    pub fn ack_requested(self) -> bool {
        self.0 & PKT_FLAG_ACK_REQ != 0
    }

    pub fn with_flags(self, flags: u8) -> Self {
        Self(self.0 | (flags & PKT_FLAG_MASK))
    }
}

/// Result of the CRC check, echoed back in ACKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionStatus {
    Correct = 0,
    Incorrect = 1,
    IncorrectType = 2,
}

impl ReceptionStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// How frames are framed on this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameLayout {
    pub net_key: Option<[u8; NET_KEY_LENGTH]>,
    /// No link header; the payload is the whole frame.
    pub raw: bool,
}

impl FrameLayout {
    /// Bytes in front of the payload.
    pub fn overhead(&self) -> usize {
        let key = if self.net_key.is_some() {
            NET_KEY_LENGTH
        } else {
            0
        };
        let header = if self.raw { 0 } else { HEADER_LENGTH };
        key + header
    }

    /// Largest payload that still fits in the FIFO.
    pub fn max_payload(&self) -> usize {
        MAX_LENGTH - self.overhead()
    }
}

/// A data frame, sent or received.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub dst: u8,
    pub ptype: PacketType,
    pub src: u8,
    pub packnum: u8,
    /// Frame length as programmed into the modem (payload + overhead).
    pub length: u8,
    pub data: Vec<u8>,
    pub retry: u8,
}

impl Packet {
    /// Bytes written to the FIFO for this frame, in order.
    pub fn encode(&self, layout: &FrameLayout) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(layout.overhead() + self.data.len());
        if let Some(key) = layout.net_key {
            bytes.extend_from_slice(&key);
        }
        if !layout.raw {
            bytes.extend_from_slice(&[self.dst, self.ptype.0, self.src, self.packnum]);
        }
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Parse a complete received frame. A wrong network key is not checked
    /// here; address filtering happens before the frame is read.
    pub fn decode(frame: &[u8], layout: &FrameLayout) -> Result<Self, FrameError> {
        if frame.len() > MAX_LENGTH {
            return Err(FrameError::TooLong(frame.len()));
        }
        let mut rest = frame;
        if layout.net_key.is_some() {
            if rest.len() < NET_KEY_LENGTH {
                return Err(FrameError::TooShort(frame.len()));
            }
            rest = &rest[NET_KEY_LENGTH..];
        }
        if layout.raw {
            return Ok(Self {
                length: frame.len() as u8,
                data: rest.to_vec(),
                ..Default::default()
            });
        }
        if rest.len() < 2 {
            return Err(FrameError::TooShort(frame.len()));
        }
        let ptype = PacketType(rest[1]);
        if !ptype.is_known() {
            return Err(FrameError::UnknownType(ptype.0));
        }
        if rest.len() < HEADER_LENGTH {
            return Err(FrameError::TooShort(frame.len()));
        }
        Ok(Self {
            dst: rest[0],
            ptype,
            src: rest[2],
            packnum: rest[3],
            length: frame.len() as u8,
            data: rest[HEADER_LENGTH..].to_vec(),
            retry: 0,
        })
    }
}

/// Why a received frame could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    TooShort(usize),
    TooLong(usize),
    UnknownType(u8),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "frame too short: {} bytes", len),
            Self::TooLong(len) => write!(f, "frame too long: {} bytes", len),
            Self::UnknownType(t) => write!(f, "unknown packet type 0x{:02X}", t),
        }
    }
}

impl std::error::Error for FrameError {}

/// Acknowledgment frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub dst: u8,
    pub ptype: PacketType,
    pub src: u8,
    pub packnum: u8,
    pub length: u8,
    /// Reception status of the acknowledged frame.
    pub status: u8,
    /// REG_PKT_SNR_VALUE at the receiver, undecoded.
    pub snr_raw: u8,
}

impl AckFrame {
    /// ACK for a frame that was just received.
    pub fn reply_to(received: &Packet, status: ReceptionStatus, snr_raw: u8) -> Self {
        Self {
            dst: received.src,
            ptype: PacketType::ACK,
            src: received.dst,
            packnum: received.packnum,
            length: ACK_PAYLOAD_LENGTH,
            status: status.code(),
            snr_raw,
        }
    }

    pub fn to_bytes(&self) -> [u8; ACK_LENGTH] {
        [
            self.dst,
            self.ptype.0,
            self.src,
            self.packnum,
            self.length,
            self.status,
            self.snr_raw,
        ]
    }

    pub fn from_bytes(bytes: &[u8; ACK_LENGTH]) -> Self {
        Self {
            dst: bytes[0],
            ptype: PacketType(bytes[1]),
            src: bytes[2],
            packnum: bytes[3],
            length: bytes[4],
            status: bytes[5],
            snr_raw: bytes[6],
        }
    }

    /// Check that this ACK answers `sent`.
    pub fn matches(&self, sent: &Packet) -> Result<(), AckMismatch> {
        if self.ptype != PacketType::ACK {
            return Err(AckMismatch::Type(self.ptype.0));
        }
        if self.dst != sent.src {
            return Err(AckMismatch::Destination {
                expected: sent.src,
                got: self.dst,
            });
        }
        if self.src != sent.dst {
            return Err(AckMismatch::Source {
                expected: sent.dst,
                got: self.src,
            });
        }
        if self.packnum != sent.packnum {
            return Err(AckMismatch::PacketNumber {
                expected: sent.packnum,
                got: self.packnum,
            });
        }
        if self.length != ACK_PAYLOAD_LENGTH {
            return Err(AckMismatch::Length(self.length));
        }
        if self.status != ReceptionStatus::Correct.code() {
            return Err(AckMismatch::Status(self.status));
        }
        Ok(())
    }

    /// SNR the peer measured on our frame, in dB.
    pub fn snr(&self) -> i8 {
        decode_snr(self.snr_raw)
    }
}

/// Which ACK field did not match the frame it should acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMismatch {
    Type(u8),
    Destination { expected: u8, got: u8 },
    Source { expected: u8, got: u8 },
    PacketNumber { expected: u8, got: u8 },
    Length(u8),
    /// The peer received our frame with a bad CRC or type.
    Status(u8),
}

impl fmt::Display for AckMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(t) => write!(f, "not an ACK (type 0x{:02X})", t),
            Self::Destination { expected, got } => {
                write!(f, "destination {} (expected {})", got, expected)
            }
            Self::Source { expected, got } => write!(f, "source {} (expected {})", got, expected),
            Self::PacketNumber { expected, got } => {
                write!(f, "packet number {} (expected {})", got, expected)
            }
            Self::Length(len) => write!(f, "length {} (expected 2)", len),
            Self::Status(status) => write!(f, "peer reported reception status {}", status),
        }
    }
}

/// Decode REG_PKT_SNR_VALUE: two's complement, quarter-dB steps.
pub fn decode_snr(raw: u8) -> i8 {
    if raw & 0x80 != 0 {
        -((((!raw).wrapping_add(1)) >> 2) as i8)
    } else {
        (raw >> 2) as i8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet() -> Packet {
        Packet {
            dst: 2,
            ptype: PacketType::DATA.with_flags(PKT_FLAG_ACK_REQ),
            src: 1,
            packnum: 7,
            length: 6,
            data: vec![0x41, 0x42],
            retry: 0,
        }
    }

    #[test]
    fn test_packet_type_flags() {
        let t = PacketType(0x18);
        assert!(t.is_data());
        assert!(t.ack_requested());
        assert_eq!(t.flags(), PKT_FLAG_ACK_REQ);
        assert!(PacketType::ACK.is_known());
        assert!(!PacketType(0x30).is_known());
        assert!(!PacketType(0x00).is_known());
    }

    #[test]
    fn test_layout_overhead() {
        assert_eq!(FrameLayout::default().overhead(), 4);
        assert_eq!(FrameLayout::default().max_payload(), MAX_PAYLOAD);
        let keyed = FrameLayout {
            net_key: Some(DEFAULT_NET_KEY),
            raw: false,
        };
        assert_eq!(keyed.overhead(), 6);
        let raw = FrameLayout {
            net_key: None,
            raw: true,
        };
        assert_eq!(raw.max_payload(), MAX_LENGTH);
    }

    #[test]
    fn test_encode_with_and_without_key() {
        let packet = data_packet();
        assert_eq!(
            packet.encode(&FrameLayout::default()),
            vec![2, 0x18, 1, 7, 0x41, 0x42]
        );
        let keyed = FrameLayout {
            net_key: Some(DEFAULT_NET_KEY),
            raw: false,
        };
        assert_eq!(
            packet.encode(&keyed),
            vec![0x12, 0x34, 2, 0x18, 1, 7, 0x41, 0x42]
        );
        let raw = FrameLayout {
            net_key: None,
            raw: true,
        };
        assert_eq!(packet.encode(&raw), vec![0x41, 0x42]);
    }

    #[test]
    fn test_decode_data_frame() {
        let packet = Packet::decode(&[2, 0x10, 5, 9, b'h', b'i'], &FrameLayout::default()).unwrap();
        assert_eq!(packet.dst, 2);
        assert_eq!(packet.src, 5);
        assert_eq!(packet.packnum, 9);
        assert_eq!(packet.length, 6);
        assert_eq!(packet.data, b"hi");
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_short_frames() {
        let layout = FrameLayout::default();
        assert_eq!(
            Packet::decode(&[2, 0x40, 5, 9], &layout),
            Err(FrameError::UnknownType(0x40))
        );
        assert_eq!(
            Packet::decode(&[2, 0x10, 5], &layout),
            Err(FrameError::TooShort(3))
        );
        assert_eq!(Packet::decode(&[2], &layout), Err(FrameError::TooShort(1)));
    }

    #[test]
    fn test_decode_raw_frame() {
        let raw = FrameLayout {
            net_key: None,
            raw: true,
        };
        let packet = Packet::decode(&[1, 2, 3], &raw).unwrap();
        assert_eq!(packet.dst, 0);
        assert_eq!(packet.ptype, PacketType(0));
        assert_eq!(packet.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_ack_reply_and_match() {
        let sent = data_packet();
        // what node 2 would receive
        let received = sent.clone();
        let ack = AckFrame::reply_to(&received, ReceptionStatus::Correct, 0x28);
        assert_eq!(ack.to_bytes(), [1, 0x20, 2, 7, 2, 0, 0x28]);
        assert_eq!(ack.matches(&sent), Ok(()));
        assert_eq!(ack.snr(), 10);
        assert_eq!(AckFrame::from_bytes(&ack.to_bytes()), ack);
    }

    #[test]
    fn test_ack_mismatches() {
        let sent = data_packet();
        let good = AckFrame::reply_to(&sent, ReceptionStatus::Correct, 0);

        let ack = AckFrame { packnum: 8, ..good };
        assert!(matches!(
            ack.matches(&sent),
            Err(AckMismatch::PacketNumber { expected: 7, got: 8 })
        ));
        let ack = AckFrame { dst: 9, ..good };
        assert!(matches!(ack.matches(&sent), Err(AckMismatch::Destination { .. })));
        let ack = AckFrame { src: 9, ..good };
        assert!(matches!(ack.matches(&sent), Err(AckMismatch::Source { .. })));
        let ack = AckFrame { length: 3, ..good };
        assert_eq!(ack.matches(&sent), Err(AckMismatch::Length(3)));
        let ack = AckFrame {
            status: ReceptionStatus::Incorrect.code(),
            ..good
        };
        assert_eq!(ack.matches(&sent), Err(AckMismatch::Status(1)));
        let ack = AckFrame {
            ptype: PacketType::DATA,
            ..good
        };
        assert_eq!(ack.matches(&sent), Err(AckMismatch::Type(0x10)));
    }

    #[test]
    fn test_decode_snr() {
        assert_eq!(decode_snr(0x00), 0);
        assert_eq!(decode_snr(0x28), 10);
        assert_eq!(decode_snr(0x7F), 31);
        assert_eq!(decode_snr(0xF0), -4);
        assert_eq!(decode_snr(0xFF), 0);
        assert_eq!(decode_snr(0x80), -32);
    }
}
