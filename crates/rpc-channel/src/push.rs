//! Server push: client registration and handling of server-initiated calls.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{ConnectionError, Error, HandlerError, ProtocolError, Result};
use crate::options::RegistrationMode;
use crate::protocol::{
    ErrorInfo, PushHeader, PushType, REGISTER_METHOD_NAME, REGISTER_SERVICE_NAME, RpcRequest,
    RpcResponse,
};

/// Read and write timeout of the registration request.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles one server-initiated method.
#[async_trait]
pub trait PushHandler: Send + Sync + 'static {
    /// Handle a push call and produce its result.
    async fn handle(&self, request: RpcRequest) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> PushHandler for FnHandler<F>
where
    F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, request: RpcRequest) -> Result<Value> {
        (self.0)(request).await
    }
}

/// Push handlers keyed by service and method name.
#[derive(Default)]
pub struct PushHandlers {
    handlers: DashMap<(String, String), Arc<dyn PushHandler>>,
}

impl PushHandlers {
    /// Empty handler table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `service.method`, replacing any previous one.
    pub fn register(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
        handler: impl PushHandler,
    ) {
        self.handlers
            .insert((service.into(), method.into()), Arc::new(handler));
    }

    /// Register an async closure for `service.method`.
    pub fn register_fn<F, Fut>(&self, service: impl Into<String>, method: impl Into<String>, f: F)
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(service, method, FnHandler(f));
    }

    /// Handler for `service.method`, if any.
    #[must_use]
    pub fn get(&self, service: &str, method: &str) -> Option<Arc<dyn PushHandler>> {
        self.handlers
            .get(&(service.to_string(), method.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for PushHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| format!("{}.{}", entry.key().0, entry.key().1))
            .collect();
        f.debug_struct("PushHandlers")
            .field("methods", &methods)
            .finish()
    }
}

/// Push state of one connection.
pub(crate) struct PushSession {
    handlers: Arc<PushHandlers>,
    registered: Arc<AtomicBool>,
}

impl PushSession {
    pub(crate) fn new(handlers: Arc<PushHandlers>) -> Self {
        Self {
            handlers,
            registered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Announce the client identity on a freshly connected channel.
    pub(crate) async fn register(&self, conn: &Arc<Connection>) -> Result<()> {
        let protocol = conn.protocol();
        let Some(push) = protocol.push() else {
            return Err(ProtocolError::PushUnsupported(protocol.name()).into());
        };
        let options = conn.options();

        // Registration is not a call; it must not make the connection look busy.
        let invocation =
            conn.store()
                .allocate_untracked(conn.id(), REGISTRATION_TIMEOUT, REGISTRATION_TIMEOUT);
        let mut request = RpcRequest::new(
            REGISTER_SERVICE_NAME,
            REGISTER_METHOD_NAME,
            vec![Value::String(options.client_name.clone())],
        )
        .with_push_header(push.create_push_header(PushType::RegisterRequest))
        .with_read_timeout(REGISTRATION_TIMEOUT)
        .with_write_timeout(REGISTRATION_TIMEOUT);
        request.correlation_id = invocation.correlation_id();

        let bytes = protocol.encode_request(&request)?;
        conn.send_until(bytes, invocation.write_deadline())
            .await
            .map_err(|e| ConnectionError::RegistrationFailed(e.to_string()))?;

        debug!(
            "sent push registration for client {:?} to {}",
            options.client_name,
            conn.instance()
        );

        match options.registration_mode {
            RegistrationMode::FireAndForget => {
                let registered = Arc::clone(&self.registered);
                let instance = conn.instance().clone();
                tokio::spawn(async move {
                    match invocation.wait().await.and_then(RpcResponse::into_result) {
                        Ok(_) => {
                            registered.store(true, Ordering::Release);
                            info!("push registration with {} confirmed", instance);
                        }
                        Err(e) => warn!("push registration with {} failed: {}", instance, e),
                    }
                });
            }
            RegistrationMode::AwaitConfirmation => {
                invocation
                    .wait()
                    .await
                    .and_then(RpcResponse::into_result)
                    .map_err(|e| ConnectionError::RegistrationFailed(e.to_string()))?;
                self.registered.store(true, Ordering::Release);
                info!("push registration with {} confirmed", conn.instance());
            }
        }

        Ok(())
    }

    /// Run the handler for a push call and write its answer back.
    pub(crate) fn dispatch(&self, conn: &Arc<Connection>, request: RpcRequest) {
        let handler = self.handlers.get(&request.service_name, &request.method_name);
        let conn = Arc::clone(conn);

        tokio::spawn(async move {
            let correlation_id = request.correlation_id;
            let outcome = match handler {
                Some(handler) => handler.handle(request).await,
                None => Err(HandlerError::NotFound {
                    service: request.service_name,
                    method: request.method_name,
                }
                .into()),
            };

            let response = match outcome {
                Ok(result) => RpcResponse::success(correlation_id, result),
                Err(e) => {
                    warn!("push call {} failed: {}", correlation_id, e);
                    RpcResponse::failure(correlation_id, error_info(&e))
                }
            };

            let protocol = conn.protocol();
            let header = protocol.push().map_or_else(
                || PushHeader::new(PushType::PushResponse),
                |push| push.create_push_header(PushType::PushResponse),
            );
            let bytes = match protocol.encode_response(&response.with_push_header(header)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("failed to encode push response {}: {}", correlation_id, e);
                    return;
                }
            };

            if let Err(e) = conn.send(bytes).await {
                warn!("failed to send push response {}: {}", correlation_id, e);
                conn.inc_failed_num();
            }
        });
    }
}

fn error_info(error: &Error) -> ErrorInfo {
    let code = match error {
        Error::Handler(HandlerError::NotFound { .. }) => "NOT_FOUND",
        Error::Handler(HandlerError::Remote { code, .. }) => code.as_str(),
        Error::Serialization(_) => "SERIALIZATION_ERROR",
        Error::Timeout(_) => "TIMEOUT",
        _ => "INTERNAL",
    };
    ErrorInfo::new(code, error.to_string())
}
