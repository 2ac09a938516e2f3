//! Client-side RPC channel runtime.
//!
//! Calls are multiplexed over pooled TCP connections and matched to their
//! responses by correlation id. On push-capable protocols a connection also
//! registers the client with the server and serves server-initiated calls.
//!
//! # Features
//!
//! - **Correlation**: sharded store of in-flight calls with exactly-once completion
//! - **Pluggable Protocols**: wire format behind the [`WireProtocol`] trait
//! - **Connection Pooling**: per-instance pools, transport factories per service group
//! - **Server Push**: registration handshake and handler dispatch
//! - **Health**: failure counters and latency windows per connection
//!
//! # Example
//!
//! ```no_run
//! use proven_rpc_channel::{
//!     CommunicationOptions, InvocationDispatcher, PushHandlers, ServiceInstance,
//!     StandardProtocol,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let handlers = Arc::new(PushHandlers::new());
//!     handlers.register_fn("UserPushApi", "clientReceive", |request| async move {
//!         Ok(json!(format!("got data:{}", request.args[0])))
//!     });
//!
//!     let options = CommunicationOptions::builder()
//!         .protocol(StandardProtocol::with_push())
//!         .client_name("clientA")
//!         .push_handlers(handlers)
//!         .build();
//!
//!     let dispatcher = InvocationDispatcher::new(options);
//!     let instance = ServiceInstance::new("user-service", "127.0.0.1", 8080);
//!     let greeting = dispatcher
//!         .call(&instance, "UserService", "hello", vec![json!("world")])
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod instance;
pub mod invocation;
pub mod options;
pub mod protocol;
pub mod push;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dispatcher::InvocationDispatcher;
pub use error::{CodecError, ConnectionError, Error, HandlerError, ProtocolError, Result};
pub use health::{HealthSnapshot, LatencySample};
pub use instance::ServiceInstance;
pub use invocation::PendingInvocation;
pub use options::{CommunicationOptions, CommunicationOptionsBuilder, RegistrationMode};
pub use protocol::{
    CorrelationId, ErrorInfo, Packet, PushCapability, PushFrame, PushHeader, PushType,
    RpcRequest, RpcResponse, StandardProtocol, WireProtocol,
};
pub use push::{PushHandler, PushHandlers};
pub use registry::{ConnectionPoolRegistry, TransportFactory};
pub use store::CorrelationStore;

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use serde_json::Value;
