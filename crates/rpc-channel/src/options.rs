//! Configuration shared by every connection a caller opens.

use std::sync::Arc;
use std::time::Duration;

use crate::health::DEFAULT_LATENCY_WINDOW_SIZE;
use crate::protocol::{StandardProtocol, WireProtocol};
use crate::push::PushHandlers;

/// How `connect()` treats the push registration handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistrationMode {
    /// Write the registration frame and return; the server's answer is
    /// tracked in the background.
    #[default]
    FireAndForget,
    /// Wait for the server's registration response before returning.
    AwaitConfirmation,
}

/// Configuration for connections to remote service instances.
#[derive(Debug, Clone)]
pub struct CommunicationOptions {
    /// Wire protocol used on every connection.
    pub protocol: Arc<dyn WireProtocol>,
    /// Default time to wait for a response.
    pub read_timeout: Duration,
    /// Default time allowed for writing a request.
    pub write_timeout: Duration,
    /// Time allowed for the transport connect.
    pub connect_timeout: Duration,
    /// Identity announced to servers during push registration.
    pub client_name: String,
    /// Maximum open connections per service instance.
    pub max_connections_per_instance: usize,
    /// Latency samples kept per connection.
    pub latency_window_size: usize,
    /// Disable Nagle's algorithm on new sockets.
    pub tcp_nodelay: bool,
    /// Enable TCP keep-alive on new sockets.
    pub keep_alive: bool,
    /// Push registration behaviour.
    pub registration_mode: RegistrationMode,
    /// Handlers for server-initiated calls.
    pub push_handlers: Arc<PushHandlers>,
}

impl Default for CommunicationOptions {
    fn default() -> Self {
        Self {
            protocol: Arc::new(StandardProtocol::new()),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            client_name: String::new(),
            max_connections_per_instance: 8,
            latency_window_size: DEFAULT_LATENCY_WINDOW_SIZE,
            tcp_nodelay: true,
            keep_alive: false,
            registration_mode: RegistrationMode::default(),
            push_handlers: Arc::new(PushHandlers::new()),
        }
    }
}

impl CommunicationOptions {
    /// Create a new options builder.
    #[must_use]
    pub fn builder() -> CommunicationOptionsBuilder {
        CommunicationOptionsBuilder::new()
    }
}

/// Builder for [`CommunicationOptions`].
#[derive(Debug, Default)]
pub struct CommunicationOptionsBuilder {
    options: CommunicationOptions,
}

impl CommunicationOptionsBuilder {
    /// Start from the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wire protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl WireProtocol) -> Self {
        self.options.protocol = Arc::new(protocol);
        self
    }

    /// Set the default read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.options.read_timeout = timeout;
        self
    }

    /// Set the default write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.options.write_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set the client identity used for push registration.
    #[must_use]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.options.client_name = name.into();
        self
    }

    /// Set the per-instance connection limit.
    #[must_use]
    pub const fn max_connections_per_instance(mut self, max: usize) -> Self {
        self.options.max_connections_per_instance = max;
        self
    }

    /// Set the latency window size.
    #[must_use]
    pub const fn latency_window_size(mut self, size: usize) -> Self {
        self.options.latency_window_size = size;
        self
    }

    /// Toggle `TCP_NODELAY`.
    #[must_use]
    pub const fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.options.tcp_nodelay = nodelay;
        self
    }

    /// Toggle TCP keep-alive.
    #[must_use]
    pub const fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.options.keep_alive = keep_alive;
        self
    }

    /// Set the push registration mode.
    #[must_use]
    pub const fn registration_mode(mut self, mode: RegistrationMode) -> Self {
        self.options.registration_mode = mode;
        self
    }

    /// Use the given push handler table.
    #[must_use]
    pub fn push_handlers(mut self, handlers: Arc<PushHandlers>) -> Self {
        self.options.push_handlers = handlers;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> CommunicationOptions {
        self.options
    }
}
