//! Protocol layer for the RPC channel runtime.
//!
//! This module contains:
//! - The [`WireProtocol`] abstraction and its push capability
//! - Request/response message types
//! - Framing and body codec used by the standard protocol

pub mod codec;
pub mod framing;
pub mod message;
pub mod push;
pub mod standard;

use bytes::{Bytes, BytesMut};
use std::fmt::Debug;

use crate::error::Result;

pub use framing::{Frame, FrameCodec, FrameKind};
pub use message::{CorrelationId, ErrorInfo, RpcRequest, RpcResponse};
pub use push::{PushHeader, PushType, REGISTER_METHOD_NAME, REGISTER_SERVICE_NAME};
pub use standard::StandardProtocol;

/// A fully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Ordinary request (seen by servers).
    Request(RpcRequest),
    /// Ordinary response to one of our calls.
    Response(RpcResponse),
    /// Push-control traffic.
    Push(PushFrame),
}

/// Push-control frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    /// Push call or registration request.
    Request(RpcRequest),
    /// Push answer or registration response.
    Response(RpcResponse),
}

impl PushFrame {
    /// The push type from the frame's header.
    #[must_use]
    pub fn push_type(&self) -> Option<PushType> {
        match self {
            Self::Request(request) => request.push_header.map(|h| h.push_type),
            Self::Response(response) => response.push_header.map(|h| h.push_type),
        }
    }
}

/// Pluggable wire protocol.
///
/// An implementation owns the whole wire format: framing, header fields and
/// body codec. The channel only relies on the frame kind being available
/// before the body is decoded, so push traffic can be routed apart from call
/// responses.
pub trait WireProtocol: Send + Sync + Debug + 'static {
    /// Short protocol name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Encode a request into a complete wire frame.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the request cannot be encoded.
    fn encode_request(&self, request: &RpcRequest) -> Result<Bytes>;

    /// Encode a response into a complete wire frame.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the response cannot be encoded.
    fn encode_response(&self, response: &RpcResponse) -> Result<Bytes>;

    /// Split the next frame off `buf`, returning `None` until one is complete.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the buffered bytes are not a valid frame.
    fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<Frame>>;

    /// Decode a frame's body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed or the frame kind is not
    /// supported by this protocol.
    fn decode(&self, frame: Frame) -> Result<Packet>;

    /// Push capability, if this protocol supports server push.
    fn push(&self) -> Option<&dyn PushCapability> {
        None
    }

    /// Whether connections using this protocol run the push handshake.
    fn supports_push(&self) -> bool {
        self.push().is_some()
    }
}

/// Operations only available on push-capable protocols.
pub trait PushCapability: Send + Sync {
    /// Build a push-control header of the given type.
    fn create_push_header(&self, push_type: PushType) -> PushHeader;
}
