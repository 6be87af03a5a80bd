// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Frame envelope shared by client invocations and server-to-server traffic.
//!
//! Every frame is a fixed 24-byte big-endian header followed by an opaque
//! payload:
//!
//! ```text
//!  0        4        6        8        10       12          16                24
//!  ┌────────┬────────┬────────┬────────┬────────┬───────────┬─────────────────┐
//!  │ magic  │version │hdr len │  type  │ flags  │ total len │    sequence     │
//!  │  u32   │  u16   │  u16   │  u16   │  u16   │    u32    │       u64       │
//!  └────────┴────────┴────────┴────────┴────────┴───────────┴─────────────────┘
//! ```
//!
//! The declared header length must equal [`HEADER_LENGTH`]. Any validation
//! failure is a [`FramingError`], which is fatal for the connection: the
//! reader stops and the caller closes the socket. Frames are never skipped
//! or resynchronized in place.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed header size in bytes.
pub const HEADER_LENGTH: usize = 24;

/// "STRP"
pub const MAGIC: u32 = 0x5354_5250;

/// Wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default upper bound on a whole frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Header flag bits.
pub mod flags {
    /// Receiver must answer with an ACK.
    pub const REQUIRES_ACK: u16 = 0x0001;
    /// Frame carries replicated (active to passive) traffic.
    pub const REPLICATED: u16 = 0x0002;
}

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Hello = 0x0001,
    Goodbye = 0x0002,
    Heartbeat = 0x0003,
    RoleAnnounce = 0x0010,
    VoteRequest = 0x0011,
    VoteResponse = 0x0012,
    SyncBegin = 0x0020,
    SyncEntityBegin = 0x0021,
    SyncEntity = 0x0022,
    SyncEntityEnd = 0x0023,
    SyncComplete = 0x0024,
    Invoke = 0x0030,
    Ack = 0x0031,
}

impl MessageType {
    pub fn from_code(code: u16) -> Option<Self> {
        let t = match code {
            0x0001 => MessageType::Hello,
            0x0002 => MessageType::Goodbye,
            0x0003 => MessageType::Heartbeat,
            0x0010 => MessageType::RoleAnnounce,
            0x0011 => MessageType::VoteRequest,
            0x0012 => MessageType::VoteResponse,
            0x0020 => MessageType::SyncBegin,
            0x0021 => MessageType::SyncEntityBegin,
            0x0022 => MessageType::SyncEntity,
            0x0023 => MessageType::SyncEntityEnd,
            0x0024 => MessageType::SyncComplete,
            0x0030 => MessageType::Invoke,
            0x0031 => MessageType::Ack,
            _ => return None,
        };
        Some(t)
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::Goodbye => "GOODBYE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::RoleAnnounce => "ROLE_ANNOUNCE",
            MessageType::VoteRequest => "VOTE_REQUEST",
            MessageType::VoteResponse => "VOTE_RESPONSE",
            MessageType::SyncBegin => "SYNC_BEGIN",
            MessageType::SyncEntityBegin => "SYNC_ENTITY_BEGIN",
            MessageType::SyncEntity => "SYNC_ENTITY",
            MessageType::SyncEntityEnd => "SYNC_ENTITY_END",
            MessageType::SyncComplete => "SYNC_COMPLETE",
            MessageType::Invoke => "INVOKE",
            MessageType::Ack => "ACK",
        };
        f.write_str(name)
    }
}

/// Frame validation failures. All of them end the connection.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("header length mismatch: declared {declared}, expected {expected}")]
    HeaderLength { declared: usize, expected: usize },

    #[error("unknown message type 0x{0:04x}")]
    UnknownMessageType(u16),

    #[error("total length {total} outside [{min}, {max}]")]
    TotalLength { total: usize, min: usize, max: usize },

    #[error("sequence regression: previous {previous}, got {got}")]
    SequenceRegression { previous: u64, got: u64 },

    #[error("payload decodes as {payload} but header says {header}")]
    TypeMismatch { header: MessageType, payload: MessageType },

    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub flags: u16,
    /// Header plus payload.
    pub total_length: u32,
    pub sequence: u64,
}

impl MessageHeader {
    pub fn payload_length(&self) -> usize {
        (self.total_length as usize).saturating_sub(HEADER_LENGTH)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LENGTH);
        buf.put_u32(MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(HEADER_LENGTH as u16);
        buf.put_u16(self.message_type.code());
        buf.put_u16(self.flags);
        buf.put_u32(self.total_length);
        buf.put_u64(self.sequence);
    }

    /// Decode and validate a header from exactly `HEADER_LENGTH` bytes.
    pub fn decode(mut src: &[u8]) -> Result<Self, FramingError> {
        if src.len() < HEADER_LENGTH {
            return Err(FramingError::Truncated {
                expected: HEADER_LENGTH,
                got: src.len(),
            });
        }

        let magic = src.get_u32();
        if magic != MAGIC {
            return Err(FramingError::BadMagic(magic));
        }
        let version = src.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(FramingError::UnsupportedVersion(version));
        }
        let declared = src.get_u16() as usize;
        if declared != HEADER_LENGTH {
            return Err(FramingError::HeaderLength {
                declared,
                expected: HEADER_LENGTH,
            });
        }
        let code = src.get_u16();
        let message_type = MessageType::from_code(code).ok_or(FramingError::UnknownMessageType(code))?;
        let flags = src.get_u16();
        let total_length = src.get_u32();
        if (total_length as usize) < HEADER_LENGTH {
            return Err(FramingError::TotalLength {
                total: total_length as usize,
                min: HEADER_LENGTH,
                max: u32::MAX as usize,
            });
        }
        let sequence = src.get_u64();

        Ok(Self {
            message_type,
            flags,
            total_length,
            sequence,
        })
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Bytes,
}

/// Stamps outgoing frames with a strictly increasing per-connection sequence.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    next_sequence: u64,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, message_type: MessageType, flags: u16, payload: &[u8]) -> Result<Bytes, FramingError> {
        let total = HEADER_LENGTH + payload.len();
        if total > u32::MAX as usize {
            return Err(FramingError::TotalLength {
                total,
                min: HEADER_LENGTH,
                max: u32::MAX as usize,
            });
        }
        let header = MessageHeader {
            message_type,
            flags,
            total_length: total as u32,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        let mut buf = BytesMut::with_capacity(total);
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }
}

/// Validating decoder for one inbound connection.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
    last_sequence: Option<u64>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.max(HEADER_LENGTH),
            last_sequence: None,
        }
    }

    fn validate(&mut self, header: &MessageHeader) -> Result<(), FramingError> {
        if header.total_length as usize > self.max_frame_bytes {
            return Err(FramingError::TotalLength {
                total: header.total_length as usize,
                min: HEADER_LENGTH,
                max: self.max_frame_bytes,
            });
        }
        if let Some(previous) = self.last_sequence {
            if header.sequence <= previous {
                return Err(FramingError::SequenceRegression {
                    previous,
                    got: header.sequence,
                });
            }
        }
        Ok(())
    }

    /// Incremental decode from a buffer. Returns `Ok(None)` until a whole
    /// frame is buffered. Consumes the frame's bytes on success.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let header = MessageHeader::decode(&buf[..HEADER_LENGTH])?;
        self.validate(&header)?;

        let total = header.total_length as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        frame.advance(HEADER_LENGTH);
        self.last_sequence = Some(header.sequence);
        Ok(Some(Frame {
            header,
            payload: frame.freeze(),
        }))
    }

    /// Read one frame. `Ok(None)` on clean EOF at a frame boundary.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, FramingError>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; HEADER_LENGTH];
        let mut filled = 0;
        while filled < HEADER_LENGTH {
            let n = reader.read(&mut head[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FramingError::Truncated {
                    expected: HEADER_LENGTH,
                    got: filled,
                });
            }
            filled += n;
        }

        let header = MessageHeader::decode(&head)?;
        self.validate(&header)?;

        let len = header.payload_length();
        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload).await {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(FramingError::Truncated {
                    expected: header.total_length as usize,
                    got: HEADER_LENGTH,
                });
            }
            return Err(e.into());
        }

        self.last_sequence = Some(header.sequence);
        Ok(Some(Frame {
            header,
            payload: Bytes::from(payload),
        }))
    }
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W>(
    writer: &mut W,
    encoder: &mut FrameEncoder,
    message_type: MessageType,
    flags: u16,
    payload: &[u8],
) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encoder.encode(message_type, flags, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Short hex rendering of raw bytes for error logs.
pub fn hex_preview(bytes: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(limit.min(bytes.len()) * 3);
    for (i, b) in bytes.iter().take(limit).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", b));
    }
    if bytes.len() > limit {
        out.push_str(" ..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_header(declared_len: u16, code: u16, total: u32, seq: u64) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(declared_len);
        buf.put_u16(code);
        buf.put_u16(0);
        buf.put_u32(total);
        buf.put_u64(seq);
        buf
    }

    #[test]
    fn test_encode_decode_frame() {
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode(MessageType::SyncEntity, flags::REQUIRES_ACK, b"payload").unwrap();
        assert_eq!(bytes.len(), HEADER_LENGTH + 7);

        let mut buf = BytesMut::from(&bytes[..]);
        let mut dec = FrameDecoder::default();
        let frame = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.message_type, MessageType::SyncEntity);
        assert!(frame.header.has_flag(flags::REQUIRES_ACK));
        assert!(!frame.header.has_flag(flags::REPLICATED));
        assert_eq!(&frame.payload[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode(MessageType::Ack, 0, b"abcdef").unwrap();
        let mut dec = FrameDecoder::default();

        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(dec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[10..HEADER_LENGTH + 2]);
        assert!(dec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[HEADER_LENGTH + 2..]);
        assert!(dec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_header_length_mismatch_is_rejected() {
        let mut buf = raw_header(40, MessageType::SyncEntity.code(), HEADER_LENGTH as u32, 0);
        let err = FrameDecoder::default().decode(&mut buf).unwrap_err();
        match err {
            FramingError::HeaderLength { declared, expected } => {
                assert_eq!(declared, 40);
                assert_eq!(expected, HEADER_LENGTH);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut buf = raw_header(HEADER_LENGTH as u16, 0x7777, HEADER_LENGTH as u32, 0);
        assert!(matches!(
            FrameDecoder::default().decode(&mut buf),
            Err(FramingError::UnknownMessageType(0x7777))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = raw_header(HEADER_LENGTH as u16, 1, HEADER_LENGTH as u32, 0);
        buf[0] = 0;
        assert!(matches!(
            FrameDecoder::default().decode(&mut buf),
            Err(FramingError::BadMagic(_))
        ));
    }

    #[test]
    fn test_total_length_bounds() {
        let mut buf = raw_header(HEADER_LENGTH as u16, 1, 3, 0);
        assert!(matches!(
            FrameDecoder::default().decode(&mut buf),
            Err(FramingError::TotalLength { .. })
        ));

        let mut buf = raw_header(HEADER_LENGTH as u16, 1, 10_000, 0);
        assert!(matches!(
            FrameDecoder::new(1024).decode(&mut buf),
            Err(FramingError::TotalLength { max: 1024, .. })
        ));
    }

    #[test]
    fn test_sequence_must_increase() {
        let mut dec = FrameDecoder::default();
        let mut buf = raw_header(HEADER_LENGTH as u16, 1, HEADER_LENGTH as u32, 5);
        assert!(dec.decode(&mut buf).unwrap().is_some());
        let mut buf = raw_header(HEADER_LENGTH as u16, 1, HEADER_LENGTH as u32, 5);
        assert!(matches!(
            dec.decode(&mut buf),
            Err(FramingError::SequenceRegression { previous: 5, got: 5 })
        ));
    }

    #[test]
    fn test_message_type_codes() {
        for code in 0u16..0x40 {
            if let Some(t) = MessageType::from_code(code) {
                assert_eq!(t.code(), code);
            }
        }
        assert_eq!(MessageType::SyncEntity.to_string(), "SYNC_ENTITY");
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut enc = FrameEncoder::new();
        write_frame(&mut client, &mut enc, MessageType::Invoke, 0, b"one").await.unwrap();
        write_frame(&mut client, &mut enc, MessageType::Invoke, 0, b"two").await.unwrap();
        drop(client);

        let mut dec = FrameDecoder::default();
        let a = dec.read_frame(&mut server).await.unwrap().unwrap();
        let b = dec.read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(&a.payload[..], b"one");
        assert_eq!(&b.payload[..], b"two");
        assert!(b.header.sequence > a.header.sequence);
        assert!(dec.read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_async_truncated_header() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0x53, 0x54, 0x52]).await.unwrap();
        drop(client);
        let err = FrameDecoder::default().read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FramingError::Truncated { got: 3, .. }));
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0xde, 0xad, 0xbe, 0xef], 3), "de ad be ..");
        assert_eq!(hex_preview(&[], 3), "");
    }
}
