//! Frame header, codec entry points and framing errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::ProtocolMessage;

/// Size of the frame header: 4 bytes length word + 2 bytes message type.
pub const HEADER_SIZE: usize = 6;

/// Largest payload the 26-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = LENGTH_MASK as usize;

const LENGTH_MASK: u32 = (1 << 26) - 1;
const COMPRESSION_SHIFT: u32 = 26;

/// Reasons a byte sequence is not a valid frame.
///
/// Malformed input is an expected condition: tests send it on purpose and
/// assert on how the remote side reacts, so this is a plain value, never a
/// panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    /// Not enough bytes to read the named part of the frame.
    #[error("truncated {what}: need {needed} bytes, have {have}")]
    Truncated {
        /// What was being read (`header`, `payload` or a field name).
        what: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// The length prefix is beyond the codec limit.
    #[error("invalid length prefix: {length} bytes (limit {limit})")]
    InvalidLength {
        /// Declared payload length.
        length: usize,
        /// Limit in force.
        limit: usize,
    },

    /// The message type is not one the codec knows.
    #[error("unknown message tag {0}")]
    UnknownTag(u16),

    /// The compression bits name an algorithm the codec does not speak.
    #[error("unsupported compression algorithm {0}")]
    UnsupportedCompression(u8),

    /// A payload field holds a value outside its domain.
    #[error("invalid {field}: {detail}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        detail: String,
    },

    /// Bytes left over after a complete frame.
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    /// The payload is not a valid encoding of the message its tag names.
    #[error("invalid {kind} payload: {detail}")]
    InvalidPayload {
        /// Message kind the tag selected.
        kind: &'static str,
        /// Decoder error.
        detail: String,
    },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Compression algorithm (0 = none).
    pub compression: u8,
    /// Payload length in bytes.
    pub payload_len: usize,
    /// Message type.
    pub tag: u16,
}

impl FrameHeader {
    /// Uncompressed header for a payload of the given length.
    pub const fn new(tag: u16, payload_len: usize) -> Self {
        Self {
            compression: 0,
            payload_len,
            tag,
        }
    }

    /// Encode header to bytes (big-endian).
    ///
    /// Only the low 26 bits of `payload_len` fit; [`Codec::encode`] refuses
    /// longer payloads before a header is built.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let word = ((self.compression as u32) << COMPRESSION_SHIFT)
            | (self.payload_len as u32 & LENGTH_MASK);
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&word.to_be_bytes());
        buf[4..6].copy_from_slice(&self.tag.to_be_bytes());
        buf
    }

    /// Decode header from bytes (big-endian).
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut cursor = &buf[..];
        let word = cursor.get_u32();
        let tag = cursor.get_u16();
        Self {
            compression: (word >> COMPRESSION_SHIFT) as u8,
            payload_len: (word & LENGTH_MASK) as usize,
            tag,
        }
    }

    /// Parse a header from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, MalformedMessage> {
        match buf.get(..HEADER_SIZE) {
            Some(head) => {
                let mut raw = [0u8; HEADER_SIZE];
                raw.copy_from_slice(head);
                Ok(Self::from_bytes(&raw))
            }
            None => Err(MalformedMessage::Truncated {
                what: "header",
                needed: HEADER_SIZE,
                have: buf.len(),
            }),
        }
    }
}

/// Frame codec with a configurable payload limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    max_payload: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Codec accepting any payload the length field can express.
    pub const fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Codec rejecting payloads longer than `max_payload` (clamped to the wire limit).
    pub const fn with_max_payload(max_payload: usize) -> Self {
        let max_payload = if max_payload > MAX_PAYLOAD_SIZE {
            MAX_PAYLOAD_SIZE
        } else {
            max_payload
        };
        Self { max_payload }
    }

    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a message into a new buffer.
    pub fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes, MalformedMessage> {
        let mut dst = BytesMut::new();
        self.encode_into(msg, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append an encoded message to `dst`.
    ///
    /// Fails with [`MalformedMessage::InvalidLength`], leaving `dst`
    /// untouched, when the payload is longer than this codec accepts.
    pub fn encode_into(
        &self,
        msg: &ProtocolMessage,
        dst: &mut BytesMut,
    ) -> Result<(), MalformedMessage> {
        let payload = msg.encode_payload();
        if payload.len() > self.max_payload {
            return Err(MalformedMessage::InvalidLength {
                length: payload.len(),
                limit: self.max_payload,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&FrameHeader::new(msg.tag(), payload.len()).to_bytes());
        dst.put_slice(&payload);
        Ok(())
    }

    /// Decode exactly one frame from `src`.
    pub fn decode(&self, src: &[u8]) -> Result<ProtocolMessage, MalformedMessage> {
        let header = self.check_header(src)?;
        let body = &src[HEADER_SIZE..];

        if body.len() < header.payload_len {
            return Err(MalformedMessage::Truncated {
                what: "payload",
                needed: header.payload_len,
                have: body.len(),
            });
        }
        if body.len() > header.payload_len {
            return Err(MalformedMessage::TrailingBytes(
                body.len() - header.payload_len,
            ));
        }

        ProtocolMessage::decode_payload(header.tag, body)
    }

    /// Decode the next frame from a stream buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A bad header is
    /// reported as soon as its six bytes are available, before any payload
    /// is buffered.
    pub fn decode_frame(
        &self,
        src: &mut BytesMut,
    ) -> Result<Option<ProtocolMessage>, MalformedMessage> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = self.check_header(src)?;
        let frame_len = HEADER_SIZE + header.payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        ProtocolMessage::decode_payload(header.tag, &frame[HEADER_SIZE..]).map(Some)
    }

    fn check_header(&self, src: &[u8]) -> Result<FrameHeader, MalformedMessage> {
        let header = FrameHeader::parse(src)?;
        if header.compression != 0 {
            return Err(MalformedMessage::UnsupportedCompression(header.compression));
        }
        if header.payload_len > self.max_payload {
            return Err(MalformedMessage::InvalidLength {
                length: header.payload_len,
                limit: self.max_payload,
            });
        }
        Ok(header)
    }
}

/// Encode with the default codec.
pub fn encode(msg: &ProtocolMessage) -> Result<Bytes, MalformedMessage> {
    Codec::new().encode(msg)
}

/// Decode one frame with the default codec.
pub fn decode(src: &[u8]) -> Result<ProtocolMessage, MalformedMessage> {
    Codec::new().decode(src)
}

/// Streaming decode with the default codec.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<ProtocolMessage>, MalformedMessage> {
    Codec::new().decode_frame(src)
}
