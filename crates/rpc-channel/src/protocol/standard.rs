//! Length-prefixed CBOR protocol, with or without server push.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::Decoder;

use super::framing::{Frame, FrameCodec, FrameKind};
use super::message::{RpcRequest, RpcResponse};
use super::push::{PushHeader, PushType};
use super::{Packet, PushCapability, PushFrame, WireProtocol, codec};
use crate::error::{ProtocolError, Result};

/// The built-in wire protocol.
///
/// Frames use [`FrameCodec`] and bodies are CBOR. The push-capable flavour
/// additionally accepts push and registration frames.
#[derive(Debug, Clone)]
pub struct StandardProtocol {
    codec: FrameCodec,
    push: bool,
}

impl StandardProtocol {
    /// Request/response only.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            codec: FrameCodec::new(),
            push: false,
        }
    }

    /// Request/response plus server push.
    #[must_use]
    pub const fn with_push() -> Self {
        Self {
            codec: FrameCodec::new(),
            push: true,
        }
    }

    /// Use a custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.codec = self.codec.with_max_frame_size(size);
        self
    }

    fn encode_body<T: Serialize>(&self, kind: FrameKind, body: &T) -> Result<Bytes> {
        let payload = codec::encode(body)?;
        self.codec.encode_to_bytes(Frame::new(kind, payload))
    }

    fn frame_kind(&self, header: Option<PushHeader>, default: FrameKind) -> FrameKind {
        match header {
            Some(header) if self.push => FrameKind::for_push_type(header.push_type),
            _ => default,
        }
    }

    fn require_push(&self, kind: FrameKind) -> Result<()> {
        if self.push {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedFrame(format!(
                "{kind:?} frame on protocol {}",
                self.name()
            ))
            .into())
        }
    }
}

impl Default for StandardProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl WireProtocol for StandardProtocol {
    fn name(&self) -> &'static str {
        if self.push { "standard-push" } else { "standard" }
    }

    fn encode_request(&self, request: &RpcRequest) -> Result<Bytes> {
        let kind = self.frame_kind(request.push_header, FrameKind::Request);
        self.encode_body(kind, request)
    }

    fn encode_response(&self, response: &RpcResponse) -> Result<Bytes> {
        let kind = self.frame_kind(response.push_header, FrameKind::Response);
        self.encode_body(kind, response)
    }

    fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let mut codec = self.codec.clone();
        codec
            .decode(buf)
            .map_err(|e| ProtocolError::InvalidFrame(e.to_string()).into())
    }

    fn decode(&self, frame: Frame) -> Result<Packet> {
        let kind = frame.kind;
        match kind {
            FrameKind::Request => Ok(Packet::Request(codec::decode(&frame.payload)?)),
            FrameKind::Response => Ok(Packet::Response(codec::decode(&frame.payload)?)),
            FrameKind::PushRequest | FrameKind::RegisterRequest => {
                self.require_push(kind)?;
                let mut request: RpcRequest = codec::decode(&frame.payload)?;
                request
                    .push_header
                    .get_or_insert(PushHeader::new(push_type_of(kind)));
                Ok(Packet::Push(PushFrame::Request(request)))
            }
            FrameKind::PushResponse | FrameKind::RegisterResponse => {
                self.require_push(kind)?;
                let mut response: RpcResponse = codec::decode(&frame.payload)?;
                response
                    .push_header
                    .get_or_insert(PushHeader::new(push_type_of(kind)));
                Ok(Packet::Push(PushFrame::Response(response)))
            }
        }
    }

    fn push(&self) -> Option<&dyn PushCapability> {
        if self.push { Some(self) } else { None }
    }
}

impl PushCapability for StandardProtocol {
    fn create_push_header(&self, push_type: PushType) -> PushHeader {
        PushHeader::new(push_type)
    }
}

const fn push_type_of(kind: FrameKind) -> PushType {
    match kind {
        FrameKind::Request => PushType::Request,
        FrameKind::Response => PushType::Response,
        FrameKind::PushRequest => PushType::PushRequest,
        FrameKind::PushResponse => PushType::PushResponse,
        FrameKind::RegisterRequest => PushType::RegisterRequest,
        FrameKind::RegisterResponse => PushType::RegisterResponse,
    }
}
