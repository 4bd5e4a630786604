//! Wire protocol for the network audio gateway.
//!
//! Every frame on the socket carries an 8-byte big-endian header followed by
//! the payload:
//!
//! ```text
//! ┌──────────────┬─────────┬─────────┬───────────────┬─────────────┐
//! │ Byte 0-3     │ Byte 4  │ Byte 5  │ Byte 6-7      │ Byte 8..N   │
//! │ payload_len  │ version │ type    │ checksum      │ payload     │
//! │ (u32 BE)     │ (u8)    │ (u8)    │ (u16 BE)      │             │
//! └──────────────┴─────────┴─────────┴───────────────┴─────────────┘
//! ```
//!
//! A transfer is `Handshake → { Data }* → DataEnd`, each frame acknowledged.
//! The checksum is Fletcher-16 over the payload; a mismatch draws a `Nack`
//! and the sender retransmits the frame up to the retry cap.

use std::io::{Read, Write};

use thiserror::Error;

/// Magic prefix of every handshake payload.
pub const HANDSHAKE_MAGIC: [u8; 4] = [0xA5, 0x5A, 0xB2, 0x2B];

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 8192;

/// Largest complete message (all data frames combined).
pub const MAX_MESSAGE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("protocol version {0} not supported")]
    VersionMismatch(u8),
    #[error("handshake magic mismatch")]
    BadMagic,
    #[error("payload length {0} exceeds the frame cap")]
    FrameTooLarge(u32),
    #[error("message exceeds {MAX_MESSAGE} bytes")]
    MessageTooLarge,
    #[error("payload checksum mismatch (expected {expected:#06x}, got {actual:#06x})")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("peer sent {got:?} while {wanted} was expected")]
    UnexpectedPacket { got: PacketType, wanted: &'static str },
    #[error("retransmission cap of {0} reached")]
    RetryExhausted(u32),
}

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 1,
    Data = 2,
    DataEnd = 3,
    Ack = 4,
    Nack = 5,
    Retry = 6,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(PacketType::Handshake),
            2 => Ok(PacketType::Data),
            3 => Ok(PacketType::DataEnd),
            4 => Ok(PacketType::Ack),
            5 => Ok(PacketType::Nack),
            6 => Ok(PacketType::Retry),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Fletcher-16 over a byte slice. The empty slice sums to zero.
pub fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + byte as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_len: u32,
    pub version: u8,
    pub kind: PacketType,
    pub checksum: u16,
}

impl PacketHeader {
    pub fn new(kind: PacketType, payload: &[u8]) -> Self {
        Self { payload_len: payload.len() as u32, version: PROTOCOL_VERSION, kind, checksum: fletcher16(payload) }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.kind as u8;
        buf[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }
        let kind = PacketType::try_from(buf[5])?;
        if payload_len as usize > MAX_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge(payload_len));
        }
        let checksum = u16::from_be_bytes([buf[6], buf[7]]);
        Ok(Self { payload_len, version, kind, checksum })
    }
}

/// Write one frame.
pub fn write_packet(stream: &mut impl Write, kind: PacketType, payload: &[u8]) -> Result<(), ProtocolError> {
    let header = PacketHeader::new(kind, payload);
    stream.write_all(&header.encode())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame and verify its checksum.
pub fn read_packet(stream: &mut impl Read) -> Result<(PacketType, Vec<u8>), ProtocolError> {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf)?;
    let header = PacketHeader::parse(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload)?;

    let actual = fletcher16(&payload);
    if actual != header.checksum {
        return Err(ProtocolError::ChecksumMismatch { expected: header.checksum, actual });
    }
    Ok((header.kind, payload))
}

fn expect_ack(stream: &mut impl Read) -> Result<bool, ProtocolError> {
    let (kind, _) = read_packet(stream)?;
    match kind {
        PacketType::Ack => Ok(true),
        PacketType::Nack | PacketType::Retry => Ok(false),
        got => Err(ProtocolError::UnexpectedPacket { got, wanted: "Ack or Nack" }),
    }
}

fn send_acked<S: Read + Write>(stream: &mut S, kind: PacketType, payload: &[u8], max_retries: u32) -> Result<(), ProtocolError> {
    for _ in 0..=max_retries {
        write_packet(stream, kind, payload)?;
        if expect_ack(stream)? {
            return Ok(());
        }
    }
    Err(ProtocolError::RetryExhausted(max_retries))
}

/// Transmit a complete message: handshake, data frames, end marker, each
/// waiting for acknowledgement.
pub fn send_message<S: Read + Write>(stream: &mut S, message: &[u8], max_retries: u32) -> Result<(), ProtocolError> {
    if message.len() > MAX_MESSAGE {
        return Err(ProtocolError::MessageTooLarge);
    }

    let mut handshake = Vec::with_capacity(5);
    handshake.extend_from_slice(&HANDSHAKE_MAGIC);
    handshake.push(PROTOCOL_VERSION);
    send_acked(stream, PacketType::Handshake, &handshake, max_retries)?;

    for chunk in message.chunks(MAX_PAYLOAD) {
        send_acked(stream, PacketType::Data, chunk, max_retries)?;
    }

    send_acked(stream, PacketType::DataEnd, &[], max_retries)
}

/// Receive a complete message, acknowledging each frame and requesting
/// retransmission on checksum failures.
pub fn recv_message<S: Read + Write>(stream: &mut S, max_retries: u32) -> Result<Vec<u8>, ProtocolError> {
    let mut message = Vec::new();
    let mut handshaken = false;
    let mut nacks: u32 = 0;

    loop {
        let (kind, payload) = match read_packet(stream) {
            Ok(frame) => frame,
            Err(ProtocolError::ChecksumMismatch { expected, actual }) => {
                nacks += 1;
                if nacks > max_retries {
                    return Err(ProtocolError::RetryExhausted(max_retries));
                }
                write_packet(stream, PacketType::Nack, &[])?;
                tracing::debug!("Checksum mismatch (expected {expected:#06x}, got {actual:#06x}), nack {nacks}/{max_retries}");
                continue;
            }
            Err(e) => return Err(e),
        };

        match kind {
            PacketType::Handshake => {
                if payload.len() < 5 || payload[0..4] != HANDSHAKE_MAGIC {
                    return Err(ProtocolError::BadMagic);
                }
                if payload[4] != PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch(payload[4]));
                }
                handshaken = true;
                write_packet(stream, PacketType::Ack, &[])?;
            }
            PacketType::Data => {
                if !handshaken {
                    return Err(ProtocolError::UnexpectedPacket { got: kind, wanted: "Handshake" });
                }
                if message.len() + payload.len() > MAX_MESSAGE {
                    return Err(ProtocolError::MessageTooLarge);
                }
                message.extend_from_slice(&payload);
                write_packet(stream, PacketType::Ack, &[])?;
            }
            PacketType::DataEnd => {
                if !handshaken {
                    return Err(ProtocolError::UnexpectedPacket { got: kind, wanted: "Handshake" });
                }
                write_packet(stream, PacketType::Ack, &[])?;
                return Ok(message);
            }
            got => return Err(ProtocolError::UnexpectedPacket { got, wanted: "Handshake, Data or DataEnd" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn fletcher16_reference_vectors() {
        assert_eq!(fletcher16(b""), 0x0000);
        assert_eq!(fletcher16(b"abcde"), 0xC8F0);
        assert_eq!(fletcher16(b"abcdef"), 0x2057);
    }

    #[test]
    fn header_round_trip() {
        let payload = b"hello world";
        let header = PacketHeader::new(PacketType::Data, payload);
        let parsed = PacketHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_len, payload.len() as u32);
        assert_eq!(parsed.checksum, fletcher16(payload));
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut buf = PacketHeader::new(PacketType::Ack, &[]).encode();
        buf[4] = 9;
        assert!(matches!(PacketHeader::parse(&buf), Err(ProtocolError::VersionMismatch(9))));
    }

    #[test]
    fn header_rejects_unknown_type() {
        let mut buf = PacketHeader::new(PacketType::Ack, &[]).encode();
        buf[5] = 77;
        assert!(matches!(PacketHeader::parse(&buf), Err(ProtocolError::UnknownType(77))));
    }

    #[test]
    fn header_rejects_oversized_frame() {
        let mut buf = PacketHeader::new(PacketType::Data, &[]).encode();
        buf[0..4].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_be_bytes());
        assert!(matches!(PacketHeader::parse(&buf), Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn message_survives_the_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Body longer than one frame so the Data loop is exercised.
        let body: Vec<u8> = (0..MAX_PAYLOAD * 2 + 123).map(|i| (i % 255) as u8).collect();
        let sent = body.clone();

        let sender = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            send_message(&mut stream, &sent, 3).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        let received = recv_message(&mut stream, 3).unwrap();
        sender.join().unwrap();

        assert_eq!(received, body);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let payload = b"payload".to_vec();
        let mut framed = PacketHeader::new(PacketType::Data, &payload).encode().to_vec();
        framed.extend_from_slice(&payload);
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;

        let mut cursor = std::io::Cursor::new(framed);
        assert!(matches!(read_packet(&mut cursor), Err(ProtocolError::ChecksumMismatch { .. })));
    }
}
