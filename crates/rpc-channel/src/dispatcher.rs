//! Entry point for issuing calls.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::error::Result;
use crate::instance::ServiceInstance;
use crate::invocation::PendingInvocation;
use crate::options::CommunicationOptions;
use crate::protocol::{PushType, RpcRequest};
use crate::registry::ConnectionPoolRegistry;
use crate::store::CorrelationStore;

/// Acquires connections, sends requests and matches responses to callers.
///
/// ```no_run
/// use proven_rpc_channel::{CommunicationOptions, InvocationDispatcher, ServiceInstance};
/// use serde_json::json;
///
/// # async fn example() -> proven_rpc_channel::Result<()> {
/// let dispatcher = InvocationDispatcher::new(CommunicationOptions::default());
/// let instance = ServiceInstance::new("user-service", "127.0.0.1", 8080);
///
/// let name = dispatcher
///     .call(&instance, "UserService", "getName", vec![json!(42)])
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InvocationDispatcher {
    options: Arc<CommunicationOptions>,
    registry: Arc<ConnectionPoolRegistry>,
}

impl InvocationDispatcher {
    /// Dispatcher with its own correlation store and registry.
    #[must_use]
    pub fn new(options: CommunicationOptions) -> Self {
        let store = Arc::new(CorrelationStore::new());
        Self::with_registry(
            Arc::new(options),
            Arc::new(ConnectionPoolRegistry::new(store)),
        )
    }

    /// Dispatcher sharing an existing registry.
    #[must_use]
    pub const fn with_registry(
        options: Arc<CommunicationOptions>,
        registry: Arc<ConnectionPoolRegistry>,
    ) -> Self {
        Self { options, registry }
    }

    /// Options used for new connections.
    #[must_use]
    pub const fn options(&self) -> &Arc<CommunicationOptions> {
        &self.options
    }

    /// Registry holding the pooled connections.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionPoolRegistry> {
        &self.registry
    }

    /// Correlation store shared by all connections.
    #[must_use]
    pub fn store(&self) -> &Arc<CorrelationStore> {
        self.registry.store()
    }

    /// A connected channel to `instance`.
    ///
    /// # Errors
    ///
    /// Returns the connect error if no pooled connection is usable and a new
    /// one cannot be opened.
    pub async fn acquire(&self, instance: &ServiceInstance) -> Result<Arc<Connection>> {
        self.registry.acquire(instance, &self.options).await
    }

    /// Register and send `request` on `conn`, returning the handle to await.
    ///
    /// The request's own timeouts take precedence over the connection's
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the request cannot be encoded, or the
    /// write error if it cannot be sent. In both cases nothing stays
    /// registered.
    pub async fn start(
        &self,
        conn: &Arc<Connection>,
        mut request: RpcRequest,
    ) -> Result<PendingInvocation> {
        let options = conn.options();
        let read_timeout = request.read_timeout.unwrap_or(options.read_timeout);
        let write_timeout = request.write_timeout.unwrap_or(options.write_timeout);

        let invocation = conn
            .store()
            .allocate(Some(conn.id()), read_timeout, write_timeout);
        request.correlation_id = invocation.correlation_id();

        let protocol = conn.protocol();
        if request.push_header.is_none() {
            if let Some(push) = protocol.push() {
                request.push_header = Some(push.create_push_header(PushType::Request));
            }
        }

        let bytes = protocol.encode_request(&request)?;
        if let Err(e) = conn.send_until(bytes, invocation.write_deadline()).await {
            warn!(
                "failed to send {}.{} on connection {}: {}",
                request.service_name,
                request.method_name,
                conn.id(),
                e
            );
            conn.inc_failed_num();
            return Err(e);
        }

        debug!(
            "sent {}.{} as {} on connection {}",
            request.service_name,
            request.method_name,
            request.correlation_id,
            conn.id()
        );
        Ok(invocation)
    }

    /// Send `request` on `conn` and wait for its result.
    ///
    /// `timeout` overrides the read timeout for this call. Outcomes feed the
    /// connection's health counters: completions record their latency,
    /// timeouts record a timeout sample and a failure, and transport
    /// failures record a failure. An error reported by the remote handler is
    /// a completed call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`](crate::Error::Timeout) when no response
    /// arrives in time, [`Error::ConnectionClosed`](crate::Error::ConnectionClosed)
    /// when the connection goes away first, or
    /// [`HandlerError::Remote`](crate::HandlerError::Remote) when the remote
    /// side reports a failure.
    #[instrument(skip(self, conn, request), fields(
        service = %request.service_name,
        method = %request.method_name,
        connection = conn.id(),
    ))]
    pub async fn invoke(
        &self,
        conn: &Arc<Connection>,
        mut request: RpcRequest,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if let Some(timeout) = timeout {
            request.read_timeout = Some(timeout);
        }

        let started = Instant::now();
        let invocation = self.start(conn, request).await?;
        let read_timeout = invocation.read_timeout();

        match invocation.wait().await {
            Ok(response) => {
                conn.update_latency(started.elapsed());
                response.into_result()
            }
            Err(e) if e.is_timeout() => {
                conn.update_latency_with_read_timeout(read_timeout);
                conn.inc_failed_num();
                Err(e)
            }
            Err(e) => {
                conn.inc_failed_num();
                Err(e)
            }
        }
    }

    /// Call `service.method` on `instance` over a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns the connect error, or any error [`invoke`](Self::invoke) returns.
    pub async fn call(
        &self,
        instance: &ServiceInstance,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let conn = self.acquire(instance).await?;
        self.invoke(&conn, RpcRequest::new(service, method, args), None)
            .await
    }
}
