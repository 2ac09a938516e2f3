//! A single transport connection to one service instance.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::{BytesCodec, Decoder, FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ConnectionError, Error, Result};
use crate::health::{HealthSnapshot, HealthStats, LatencySample};
use crate::instance::ServiceInstance;
use crate::options::CommunicationOptions;
use crate::protocol::{Frame, Packet, PushFrame, PushType, RpcResponse, WireProtocol};
use crate::push::PushSession;
use crate::registry::TransportFactory;
use crate::store::CorrelationStore;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Writer = FramedWrite<OwnedWriteHalf, BytesCodec>;
type Reader = FramedRead<OwnedReadHalf, ProtocolDecoder>;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet connected.
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Usable for calls.
    Connected,
    /// Closed on request.
    Closed,
    /// Connect failed or the transport broke.
    Failed,
}

/// Splits inbound bytes into frames using the connection's protocol.
struct ProtocolDecoder {
    protocol: Arc<dyn WireProtocol>,
}

impl Decoder for ProtocolDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        self.protocol.decode_frame(src)
    }
}

/// One live transport socket to a [`ServiceInstance`].
///
/// Calls are multiplexed over the socket and matched to responses by
/// correlation id. Equality and hashing use only the instance address, so two
/// connections to the same `(host, port)` are the same logical channel.
pub struct Connection {
    id: ConnectionId,
    instance: ServiceInstance,
    options: Arc<CommunicationOptions>,
    factory: Arc<TransportFactory>,
    store: Arc<CorrelationStore>,
    state: RwLock<ConnectionState>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    health: HealthStats,
    push: Option<PushSession>,
}

impl Connection {
    /// Create a disconnected connection to `instance`.
    #[must_use]
    pub fn new(
        instance: ServiceInstance,
        options: Arc<CommunicationOptions>,
        factory: Arc<TransportFactory>,
        store: Arc<CorrelationStore>,
    ) -> Arc<Self> {
        let push = options
            .protocol
            .supports_push()
            .then(|| PushSession::new(Arc::clone(&options.push_handlers)));

        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            health: HealthStats::new(options.latency_window_size),
            instance,
            options,
            factory,
            store,
            state: RwLock::new(ConnectionState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            push,
        })
    }

    /// Connect the transport and, on push-capable protocols, register for push.
    ///
    /// The caller is suspended until the outcome is known. On failure the
    /// connection ends up [`ConnectionState::Failed`] and must be discarded.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the transport connect fails, or a
    /// serialization error if the registration request cannot be encoded.
    #[instrument(skip(self), fields(instance = %self.instance, id = self.id))]
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ConnectionState::Disconnected {
                return Err(ConnectionError::NotConnected(*state).into());
            }
            *state = ConnectionState::Connecting;
        }

        let stream = match self.factory.connect(&self.instance).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("connect to {} failed: {}", self.instance, e);
                let mut state = self.state.write();
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Failed;
                }
                return Err(e);
            }
        };

        self.attach(stream).await?;
        debug!("connected to {} (connection {})", self.instance, self.id);

        if let Some(push) = &self.push {
            if let Err(e) = push.register(self).await {
                error!("push registration with {} failed: {}", self.instance, e);
                self.fail();
                return Err(e);
            }
        }

        info!("connection {} to {} ready", self.id, self.instance);
        Ok(())
    }

    /// Install `stream` as the transport and start reading from it.
    ///
    /// Only a connection still in [`ConnectionState::Connecting`] moves to
    /// `Connected`; one closed meanwhile drops the stream instead.
    async fn attach(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut writer = self.writer.lock().await;

        let shutdown_rx = {
            let mut state = self.state.write();
            if *state != ConnectionState::Connecting {
                debug!(
                    "connection {} left {:?} during connect, dropping transport",
                    self.id, *state
                );
                return Err(Error::ConnectionClosed);
            }

            *writer = Some(FramedWrite::new(write_half, BytesCodec::new()));
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            *self.shutdown_tx.lock() = Some(shutdown_tx);
            *state = ConnectionState::Connected;
            shutdown_rx
        };
        drop(writer);

        let reader = FramedRead::new(
            read_half,
            ProtocolDecoder {
                protocol: Arc::clone(&self.options.protocol),
            },
        );
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            Self::handle_stream(weak, reader, shutdown_rx).await;
        });
        Ok(())
    }

    /// Write already-encoded bytes, bounded by the default write timeout.
    ///
    /// Does not wait for any response.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not connected, the write fails,
    /// or the write timeout elapses.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        self.send_until(bytes, Instant::now() + self.options.write_timeout)
            .await
    }

    /// Write already-encoded bytes, failing if not done by `deadline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not connected, the write fails,
    /// or the deadline passes.
    pub async fn send_until(&self, bytes: Bytes, deadline: Instant) -> Result<()> {
        let started = Instant::now();
        let mut writer = self.writer.lock().await;

        // A teardown that found the writer busy leaves it for the next holder.
        let state = self.state();
        if state != ConnectionState::Connected {
            writer.take();
            return Err(ConnectionError::NotConnected(state).into());
        }
        let Some(sink) = writer.as_mut() else {
            return Err(Error::ConnectionClosed);
        };

        let result = match timeout_at(deadline, sink.send(bytes)).await {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => Err(Error::Timeout(deadline.saturating_duration_since(started))),
        };
        if !self.is_connected() {
            writer.take();
        }
        result
    }

    /// Tear down the transport and fail every invocation still pending on it.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = SinkExt::<Bytes>::close(&mut sink).await;
        }

        self.store.drain_all(self.id, || Error::ConnectionClosed);
        info!("connection {} to {} closed", self.id, self.instance);
    }

    /// Mark the transport broken and fail everything pending on it.
    fn fail(&self) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Failed;
        }

        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
        }
        // Otherwise the current sender drops it on its way out.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        self.store.drain_all(self.id, || Error::ConnectionClosed);
    }

    /// Handle incoming frames from the transport.
    #[allow(clippy::cognitive_complexity)]
    async fn handle_stream(
        conn: Weak<Self>,
        mut reader: Reader,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                frame = reader.next() => {
                    let Some(conn) = conn.upgrade() else {
                        break;
                    };
                    match frame {
                        Some(Ok(frame)) => conn.route(frame),
                        Some(Err(e)) => {
                            error!("stream error on connection {}: {}", conn.id, e);
                            conn.inc_failed_num();
                            conn.fail();
                            break;
                        }
                        None => {
                            debug!("connection {} closed by peer", conn.id);
                            conn.fail();
                            break;
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    debug!("connection shutdown requested");
                    break;
                }
            }
        }
    }

    /// Route one inbound frame to the store or the push session.
    fn route(self: &Arc<Self>, frame: Frame) {
        let kind = frame.kind;
        let packet = match self.options.protocol.decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                error!("failed to decode {:?} frame on connection {}: {}", kind, self.id, e);
                self.inc_failed_num();
                return;
            }
        };

        match packet {
            Packet::Response(response) => self.resolve(response),
            Packet::Push(frame) => match (frame.push_type(), frame) {
                (Some(PushType::RegisterResponse), PushFrame::Response(response)) => {
                    self.resolve(response);
                }
                (Some(PushType::PushRequest), PushFrame::Request(request)) => match &self.push {
                    Some(push) => push.dispatch(self, request),
                    None => warn!("push request on non-push connection {}", self.id),
                },
                (push_type, _) => {
                    warn!("unexpected {:?} push frame on connection {}", push_type, self.id);
                }
            },
            Packet::Request(request) => {
                warn!(
                    "unexpected request {}.{} on connection {}",
                    request.service_name, request.method_name, self.id
                );
            }
        }
    }

    fn resolve(&self, response: RpcResponse) {
        let correlation_id = response.correlation_id;
        if !self.store.resolve(correlation_id, Ok(response)) {
            warn!(
                "received response for unknown correlation id {} on connection {}",
                correlation_id, self.id
            );
        }
    }

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote instance this connection points at.
    #[must_use]
    pub const fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// Options the connection was created with.
    #[must_use]
    pub fn options(&self) -> &Arc<CommunicationOptions> {
        &self.options
    }

    /// Wire protocol in use.
    #[must_use]
    pub fn protocol(&self) -> &Arc<dyn WireProtocol> {
        &self.options.protocol
    }

    /// Correlation store shared with the dispatcher.
    #[must_use]
    pub fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the connection can carry calls.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of calls currently awaiting a response on this connection.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.store.in_flight(self.id)
    }

    /// Whether the server has acknowledged push registration.
    #[must_use]
    pub fn push_registered(&self) -> bool {
        self.push.as_ref().is_some_and(PushSession::is_registered)
    }

    /// Record one failure attributable to this connection.
    pub fn inc_failed_num(&self) {
        self.health.inc_failed_num();
    }

    /// Failures recorded so far.
    #[must_use]
    pub fn failed_num(&self) -> u64 {
        self.health.failed_num()
    }

    /// Record a completed call's round-trip time.
    pub fn update_latency(&self, latency: Duration) {
        self.health.update_latency(latency);
    }

    /// Record a call that hit its read timeout.
    pub fn update_latency_with_read_timeout(&self, read_timeout: Duration) {
        self.health.update_latency_with_read_timeout(read_timeout);
    }

    /// Copy of the latency window, oldest first.
    #[must_use]
    pub fn latency_window(&self) -> Vec<LatencySample> {
        self.health.latency_window()
    }

    /// Copy of all health counters.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.get_mut().take() {
            let _ = shutdown_tx.send(());
        }
        self.store.drain_all(self.id, || Error::ConnectionClosed);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.instance == other.instance
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance.hash(state);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .field("protocol", &self.options.protocol.name())
            .finish_non_exhaustive()
    }
}
