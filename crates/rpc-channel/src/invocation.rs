//! Handle for one outstanding call.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{CorrelationId, RpcResponse};
use crate::store::CorrelationStore;

/// An in-flight call awaiting its response.
///
/// Completes exactly once: with the response, with [`Error::Timeout`] once the
/// read deadline passes, or with [`Error::ConnectionClosed`] when the carrying
/// connection is torn down. Dropping an unfinished handle removes its entry
/// from the store.
#[must_use = "a pending invocation does nothing unless waited on"]
pub struct PendingInvocation {
    correlation_id: CorrelationId,
    created_at: Instant,
    read_timeout: Duration,
    write_timeout: Duration,
    receiver: oneshot::Receiver<Result<RpcResponse>>,
    store: Arc<CorrelationStore>,
    finished: bool,
}

impl PendingInvocation {
    pub(crate) const fn new(
        correlation_id: CorrelationId,
        created_at: Instant,
        read_timeout: Duration,
        write_timeout: Duration,
        receiver: oneshot::Receiver<Result<RpcResponse>>,
        store: Arc<CorrelationStore>,
    ) -> Self {
        Self {
            correlation_id,
            created_at,
            read_timeout,
            write_timeout,
            receiver,
            store,
            finished: false,
        }
    }

    /// Correlation id of this call.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// When the call was registered.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Read timeout of this call.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Write timeout of this call.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Instant after which the call times out.
    #[must_use]
    pub fn read_deadline(&self) -> Instant {
        self.created_at + self.read_timeout
    }

    /// Instant after which sending the request counts as failed.
    #[must_use]
    pub fn write_deadline(&self) -> Instant {
        self.created_at + self.write_timeout
    }

    /// Wait for the outcome of this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no response arrives before the read
    /// deadline, [`Error::ConnectionClosed`] if the connection went away, or
    /// whatever failure the call was resolved with.
    pub async fn wait(mut self) -> Result<RpcResponse> {
        let outcome = timeout_at(self.read_deadline(), &mut self.receiver).await;
        self.finished = true;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                if self.store.remove(self.correlation_id) {
                    debug!(
                        "invocation {} timed out after {:?}",
                        self.correlation_id, self.read_timeout
                    );
                    return Err(Error::Timeout(self.read_timeout));
                }

                // Resolved between the deadline firing and the removal.
                match self.receiver.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(self.read_timeout)),
                }
            }
        }
    }
}

impl Drop for PendingInvocation {
    fn drop(&mut self) {
        if !self.finished {
            self.store.remove(self.correlation_id);
        }
    }
}

impl std::fmt::Debug for PendingInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInvocation")
            .field("correlation_id", &self.correlation_id)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}
