//! Message framing for the standard wire protocol.
//!
//! Every frame starts with a fixed header: payload length (u32, big endian),
//! frame kind (u8) and a CRC32 of the payload (u32, zero when absent). The
//! kind byte lets a reader route a frame before decoding its body.

use crate::error::{CodecError, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::push::PushType;

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size (4 bytes length + 1 byte kind + 4 bytes checksum).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Kind of frame being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Client-to-server request.
    Request = 0x01,
    /// Server-to-client response.
    Response = 0x02,
    /// Server-initiated push call.
    PushRequest = 0x03,
    /// Client answer to a push call.
    PushResponse = 0x04,
    /// Client push registration.
    RegisterRequest = 0x05,
    /// Server answer to a push registration.
    RegisterResponse = 0x06,
}

impl FrameKind {
    /// Frame kind that carries a message with the given push type.
    #[must_use]
    pub const fn for_push_type(push_type: PushType) -> Self {
        match push_type {
            PushType::Request => Self::Request,
            PushType::Response => Self::Response,
            PushType::PushRequest => Self::PushRequest,
            PushType::PushResponse => Self::PushResponse,
            PushType::RegisterRequest => Self::RegisterRequest,
            PushType::RegisterResponse => Self::RegisterResponse,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::PushRequest),
            0x04 => Ok(Self::PushResponse),
            0x05 => Ok(Self::RegisterRequest),
            0x06 => Ok(Self::RegisterResponse),
            _ => Err(ProtocolError::InvalidFrame(format!(
                "Unknown frame kind: {value:#x}"
            ))),
        }
    }
}

/// A frame in the wire protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Kind of this frame.
    pub kind: FrameKind,
    /// Frame payload.
    pub payload: Bytes,
    /// Optional checksum for integrity.
    pub checksum: Option<u32>,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub fn new(kind: FrameKind, payload: Bytes) -> Self {
        let checksum = Some(crc32fast::hash(&payload));
        Self {
            kind,
            payload,
            checksum,
        }
    }

    /// Verify the checksum if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the checksum is invalid.
    pub fn verify_checksum(&self) -> Result<()> {
        if let Some(expected) = self.checksum {
            let actual = crc32fast::hash(&self.payload);
            if expected != actual {
                return Err(ProtocolError::ChecksumMismatch { expected, actual }.into());
            }
        }
        Ok(())
    }
}

/// Codec for encoding/decoding frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    verify_checksum: bool,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            verify_checksum: true,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Disable checksum verification.
    #[must_use]
    pub const fn without_checksum_verification(mut self) -> Self {
        self.verify_checksum = false;
        self
    }

    /// Encode a frame into a standalone buffer.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload exceeds the maximum frame size.
    pub fn encode_to_bytes(&self, frame: Frame) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
        self.clone()
            .encode(frame, &mut buf)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        Ok(buf.freeze())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;
        let kind_byte = header.get_u8();
        let checksum = header.get_u32();

        if payload_len > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::FrameTooLarge {
                    size: payload_len,
                    max: self.max_frame_size,
                },
            ));
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let kind = FrameKind::try_from(kind_byte)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let frame = Frame {
            kind,
            payload,
            checksum: if checksum != 0 { Some(checksum) } else { None },
        };

        if self.verify_checksum {
            frame
                .verify_checksum()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        if payload_len > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::FrameTooLarge {
                    size: payload_len,
                    max: self.max_frame_size,
                },
            ));
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload_len as u32);
        buf.put_u8(frame.kind as u8);
        buf.put_u32(frame.checksum.unwrap_or(0));
        buf.put(frame.payload);

        Ok(())
    }
}
