//! Request and response messages carried over a channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::push::PushHeader;
use crate::error::{HandlerError, Result};

/// Identifier linking an outbound request to its response.
///
/// Only the low 63 bits are ever used.
pub type CorrelationId = u64;

/// An RPC request.
///
/// Arguments are positional and already in their dynamic form; turning typed
/// method parameters into values is the job of the stub layer above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id assigned when the call is registered.
    pub correlation_id: CorrelationId,
    /// Destination service identifier.
    pub service_name: String,
    /// Destination method name.
    pub method_name: String,
    /// Positional call arguments.
    pub args: Vec<Value>,
    /// Push-control header, only set on push-capable protocols.
    pub push_header: Option<PushHeader>,
    /// Read timeout for this call. Not sent on the wire.
    #[serde(skip)]
    pub read_timeout: Option<Duration>,
    /// Write timeout for this call. Not sent on the wire.
    #[serde(skip)]
    pub write_timeout: Option<Duration>,
}

impl RpcRequest {
    /// Create a request for `service_name.method_name` with no id yet.
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            correlation_id: 0,
            service_name: service_name.into(),
            method_name: method_name.into(),
            args,
            push_header: None,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Attach a push-control header.
    #[must_use]
    pub const fn with_push_header(mut self, header: PushHeader) -> Self {
        self.push_header = Some(header);
        self
    }
}

/// An RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation id of the request being answered.
    pub correlation_id: CorrelationId,
    /// Result value on success.
    pub result: Option<Value>,
    /// Error information on failure.
    pub error: Option<ErrorInfo>,
    /// Push-control header, only set on push-capable protocols.
    pub push_header: Option<PushHeader>,
}

impl RpcResponse {
    /// Successful response.
    #[must_use]
    pub const fn success(correlation_id: CorrelationId, result: Value) -> Self {
        Self {
            correlation_id,
            result: Some(result),
            error: None,
            push_header: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub const fn failure(correlation_id: CorrelationId, error: ErrorInfo) -> Self {
        Self {
            correlation_id,
            result: None,
            error: Some(error),
            push_header: None,
        }
    }

    /// Attach a push-control header.
    #[must_use]
    pub const fn with_push_header(mut self, header: PushHeader) -> Self {
        self.push_header = Some(header);
        self
    }

    /// Turn the response into the call's result.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Remote`] when the response carries an error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(HandlerError::Remote {
                code: error.code,
                message: error.message,
            }
            .into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Error information for failed requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code for categorization.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorInfo {
    /// Create error info from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
