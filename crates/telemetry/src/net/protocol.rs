use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

pub const HEADER_SIZE: usize = 12;
pub const READING_SIZE: usize = 2;
pub const MAX_DATAGRAM_SIZE: usize = 1024;
pub const DEFAULT_PORT: u16 = 12000;

const ALIVE_BYTE: u8 = 4;
const ACK_BYTE: u8 = 1;
const ACK_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0,
    Data = 1,
    Init = 2,
    Alive = 4,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Data => "DATA",
            MessageType::Init => "INIT",
            MessageType::Alive => "ALIVE",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Heartbeat),
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::Init),
            4 => Ok(MessageType::Alive),
            other => Err(FormatError::UnknownMessageType(other)),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u8 {
        /// Reading crossed the danger threshold; the collector must acknowledge it.
        const DANGER = 1 << 0;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("datagram too short: {len} bytes, need at least {}", HEADER_SIZE)]
    TooShort { len: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("undeclared flag bits {0:#04x}")]
    InvalidFlags(u8),
    #[error("DATA payload of {0} bytes is not a whole number of readings")]
    OddPayload(usize),
    #[error("DATA packet carries no readings")]
    EmptyPayload,
    #[error("expected {expected:?}, found {found:?}")]
    WrongType {
        expected: MessageType,
        found: MessageType,
    },
    #[error("unrecognised reply of {0} bytes")]
    UnknownReply(usize),
}

pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| unix_secs(d.as_secs()))
        .unwrap_or(0)
}

/// The header carries 32-bit seconds; later times pin at `u32::MAX` rather than wrapping.
fn unix_secs(secs: u64) -> u32 {
    u32::try_from(secs).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub device_id: u16,
    pub seq_num: u32,
    pub timestamp: u32,
    pub msg_type: MessageType,
    pub flags: HeaderFlags,
}

impl Header {
    pub fn new(device_id: u16, seq_num: u32, msg_type: MessageType, flags: HeaderFlags) -> Self {
        Self {
            device_id,
            seq_num,
            timestamp: unix_now(),
            msg_type,
            flags,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn heartbeat(device_id: u16) -> Self {
        Self::new(device_id, 0, MessageType::Heartbeat, HeaderFlags::empty())
    }

    pub fn init(device_id: u16) -> Self {
        Self::new(device_id, 0, MessageType::Init, HeaderFlags::empty())
    }

    #[inline]
    pub fn is_danger(&self) -> bool {
        self.flags.contains(HeaderFlags::DANGER)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.device_id.to_be_bytes());
        out[2..6].copy_from_slice(&self.seq_num.to_be_bytes());
        out[6..10].copy_from_slice(&self.timestamp.to_be_bytes());
        out[10] = self.msg_type as u8;
        out[11] = self.flags.bits();
        out
    }

    /// Parses the first [`HEADER_SIZE`] bytes; anything after them is left to the caller.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::TooShort { len: bytes.len() });
        }

        let msg_type = MessageType::try_from(bytes[10])?;
        let flags = HeaderFlags::from_bits(bytes[11]).ok_or(FormatError::InvalidFlags(bytes[11]))?;

        Ok(Self {
            device_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            seq_num: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            timestamp: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            msg_type,
            flags,
        })
    }
}

pub fn heartbeat_packet(device_id: u16) -> [u8; HEADER_SIZE] {
    Header::heartbeat(device_id).encode()
}

pub fn init_packet(device_id: u16) -> [u8; HEADER_SIZE] {
    Header::init(device_id).encode()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub header: Header,
    pub readings: Vec<u16>,
}

impl DataPacket {
    pub fn single(device_id: u16, seq_num: u32, value: u16, danger: bool) -> Self {
        let flags = if danger {
            HeaderFlags::DANGER
        } else {
            HeaderFlags::empty()
        };
        Self {
            header: Header::new(device_id, seq_num, MessageType::Data, flags),
            readings: vec![value],
        }
    }

    /// Sequence numbers carried by this packet, one per reading.
    pub fn sequences(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.readings.len() as u32).map(|i| self.header.seq_num.wrapping_add(i))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.readings.len() * READING_SIZE);
        out.extend_from_slice(&self.header.encode());
        for value in &self.readings {
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let header = Header::decode(bytes)?;
        if header.msg_type != MessageType::Data {
            return Err(FormatError::WrongType {
                expected: MessageType::Data,
                found: header.msg_type,
            });
        }
        let readings = decode_readings(&bytes[HEADER_SIZE..])?;
        Ok(Self { header, readings })
    }
}

pub fn decode_readings(payload: &[u8]) -> Result<Vec<u16>, FormatError> {
    if payload.is_empty() {
        return Err(FormatError::EmptyPayload);
    }
    if payload.len() % READING_SIZE != 0 {
        return Err(FormatError::OddPayload(payload.len()));
    }
    Ok(payload
        .chunks_exact(READING_SIZE)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Collector-to-device replies. These are not header-framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Alive,
    Ack { seq: u32 },
}

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Alive => vec![ALIVE_BYTE],
            Reply::Ack { seq } => {
                let mut out = Vec::with_capacity(ACK_SIZE);
                out.push(ACK_BYTE);
                out.extend_from_slice(&seq.to_be_bytes());
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        match bytes {
            [ALIVE_BYTE] => Ok(Reply::Alive),
            [ACK_BYTE, a, b, c, d] => Ok(Reply::Ack {
                seq: u32::from_be_bytes([*a, *b, *c, *d]),
            }),
            _ => Err(FormatError::UnknownReply(bytes.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_saturates_past_u32() {
        assert_eq!(unix_secs(1_700_000_000), 1_700_000_000);
        assert_eq!(unix_secs(u32::MAX as u64 + 5), u32::MAX);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = Header {
            device_id: 0x0102,
            seq_num: 0x0304_0506,
            timestamp: 0x0708_090A,
            msg_type: MessageType::Data,
            flags: HeaderFlags::DANGER,
        };

        assert_eq!(
            header.encode(),
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 1, 1]
        );
    }

    #[test]
    fn test_decode_then_encode_is_identity() {
        let samples: [[u8; HEADER_SIZE]; 4] = [
            [0, 101, 0, 0, 0, 0, 0x65, 0x1F, 0x2A, 0x10, 0, 0],
            [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 1, 1],
            [0, 7, 0, 0, 0, 42, 0, 0, 0, 1, 2, 0],
            [0x12, 0x34, 0, 1, 0, 0, 0x80, 0, 0, 0, 4, 0],
        ];

        for bytes in samples {
            let header = Header::decode(&bytes).unwrap();
            assert_eq!(header.encode(), bytes);
        }
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert_eq!(
            Header::decode(&[0u8; 11]),
            Err(FormatError::TooShort { len: 11 })
        );
        assert_eq!(Header::decode(&[]), Err(FormatError::TooShort { len: 0 }));
    }

    #[test]
    fn test_out_of_range_fields_rejected() {
        let mut bytes = Header::heartbeat(1).encode();
        bytes[10] = 3;
        assert_eq!(
            Header::decode(&bytes),
            Err(FormatError::UnknownMessageType(3))
        );

        let mut bytes = Header::heartbeat(1).encode();
        bytes[11] = 0b10;
        assert_eq!(Header::decode(&bytes), Err(FormatError::InvalidFlags(0b10)));
    }

    #[test]
    fn test_builders() {
        let hb = Header::decode(&heartbeat_packet(9)).unwrap();
        assert_eq!(hb.device_id, 9);
        assert_eq!(hb.seq_num, 0);
        assert_eq!(hb.msg_type, MessageType::Heartbeat);
        assert!(hb.flags.is_empty());

        let init = Header::decode(&init_packet(9)).unwrap();
        assert_eq!(init.msg_type, MessageType::Init);
    }

    #[test]
    fn test_data_packet_sequences() {
        let packet = DataPacket {
            header: Header::new(7, 40, MessageType::Data, HeaderFlags::empty()),
            readings: vec![10, 20, 30],
        };

        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 6);

        let decoded = DataPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.sequences().collect::<Vec<_>>(), vec![40, 41, 42]);
        assert_eq!(decoded.readings, vec![10, 20, 30]);
    }

    #[test]
    fn test_data_payload_validation() {
        let mut bytes = DataPacket::single(7, 0, 12, false).encode();
        bytes.push(0xAB);
        assert_eq!(DataPacket::decode(&bytes), Err(FormatError::OddPayload(3)));

        let bare = Header::new(7, 0, MessageType::Data, HeaderFlags::empty()).encode();
        assert_eq!(DataPacket::decode(&bare), Err(FormatError::EmptyPayload));
    }

    #[test]
    fn test_reply_wire_format() {
        assert_eq!(Reply::Alive.encode(), vec![4]);
        assert_eq!(Reply::Ack { seq: 258 }.encode(), vec![1, 0, 0, 1, 2]);

        assert_eq!(Reply::decode(&[4]), Ok(Reply::Alive));
        assert_eq!(Reply::decode(&[1, 0, 0, 1, 2]), Ok(Reply::Ack { seq: 258 }));
        assert_eq!(Reply::decode(&[1, 0]), Err(FormatError::UnknownReply(2)));
        assert_eq!(Reply::decode(&[9]), Err(FormatError::UnknownReply(1)));
    }
}
