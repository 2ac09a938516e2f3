//! Push-control headers for server push.

use serde::{Deserialize, Serialize};

/// Service the client addresses when registering for push.
pub const REGISTER_SERVICE_NAME: &str = "RegisterService";

/// Method the client invokes when registering for push.
pub const REGISTER_METHOD_NAME: &str = "registerClient";

/// Role of a message in the push protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushType {
    /// Ordinary client-to-server request.
    Request,
    /// Ordinary server-to-client response.
    Response,
    /// Server-initiated call to the client.
    PushRequest,
    /// Client answer to a server-initiated call.
    PushResponse,
    /// Client announcing its identity.
    RegisterRequest,
    /// Server acknowledgement of a registration.
    RegisterResponse,
}

/// Push-control header attached to messages on push-capable protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushHeader {
    /// Header format version.
    pub version: u8,
    /// What kind of push message this is.
    pub push_type: PushType,
}

impl PushHeader {
    /// Current header version.
    pub const VERSION: u8 = 1;

    /// Header of the given type at the current version.
    #[must_use]
    pub const fn new(push_type: PushType) -> Self {
        Self {
            version: Self::VERSION,
            push_type,
        }
    }
}
