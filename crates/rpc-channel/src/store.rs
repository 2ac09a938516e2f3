//! Sharded table of outstanding invocations keyed by correlation id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connection::ConnectionId;
use crate::error::{Error, Result};
use crate::invocation::PendingInvocation;
use crate::protocol::{CorrelationId, RpcResponse};

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 32;

/// Correlation ids never use the top bit.
const ID_MASK: u64 = u64::MAX >> 1;

/// Type alias for the completion half of a pending invocation.
pub type ResponseSender = oneshot::Sender<Result<RpcResponse>>;

struct PendingEntry {
    sender: ResponseSender,
    connection_id: Option<ConnectionId>,
    counts_as_load: bool,
    created_at: Instant,
}

#[derive(Default)]
struct Shard {
    next_seq: AtomicU64,
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

/// Table mapping correlation ids to pending invocations.
///
/// Ids encode their shard in the low bits, so a shard can mint ids from its own
/// counter and `resolve` finds the shard without any shared lock. A given id
/// maps to at most one pending invocation at a time.
pub struct CorrelationStore {
    shards: Box<[Shard]>,
    shard_bits: u32,
    next_shard: AtomicUsize,
}

impl CorrelationStore {
    /// Create a store with [`DEFAULT_SHARD_COUNT`] shards.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    /// Create a store with at least `shard_count` shards (rounded up to a power of two).
    #[must_use]
    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count).map(|_| Shard::default()).collect();

        Self {
            shards,
            shard_bits: shard_count.trailing_zeros(),
            next_shard: AtomicUsize::new(0),
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Register a new pending invocation and return its handle.
    ///
    /// `connection_id` ties the invocation to the connection it is sent on so
    /// that [`drain_all`](Self::drain_all) can fail it when that connection
    /// goes away.
    pub fn allocate(
        self: &Arc<Self>,
        connection_id: Option<ConnectionId>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> PendingInvocation {
        self.allocate_entry(connection_id, true, read_timeout, write_timeout)
    }

    /// Register a control invocation that is drained with its connection but
    /// not reported by [`in_flight`](Self::in_flight).
    ///
    /// Used for connection housekeeping such as push registration, which
    /// should not make a connection look busy.
    pub fn allocate_untracked(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> PendingInvocation {
        self.allocate_entry(Some(connection_id), false, read_timeout, write_timeout)
    }

    fn allocate_entry(
        self: &Arc<Self>,
        connection_id: Option<ConnectionId>,
        counts_as_load: bool,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> PendingInvocation {
        let (sender, receiver) = oneshot::channel();
        let created_at = Instant::now();
        let correlation_id = self.insert(PendingEntry {
            sender,
            connection_id,
            counts_as_load,
            created_at,
        });

        PendingInvocation::new(
            correlation_id,
            created_at,
            read_timeout,
            write_timeout,
            receiver,
            Arc::clone(self),
        )
    }

    fn insert(&self, entry: PendingEntry) -> CorrelationId {
        let shard_index = self.next_shard.fetch_add(1, Ordering::Relaxed) & self.shard_mask();
        let shard = &self.shards[shard_index];
        let mut entries = shard.entries.lock();

        // A wrapped counter may land on an id that is still outstanding.
        loop {
            let seq = shard.next_seq.fetch_add(1, Ordering::Relaxed);
            let id = ((seq << self.shard_bits) | shard_index as u64) & ID_MASK;
            if !entries.contains_key(&id) {
                entries.insert(id, entry);
                trace!("allocated correlation id {id}");
                return id;
            }
        }
    }

    /// Complete the invocation registered under `correlation_id`.
    ///
    /// Returns `false` when no invocation is registered under that id, which
    /// happens for late responses after a timeout and for duplicate
    /// deliveries. Callers treat that as benign.
    pub fn resolve(&self, correlation_id: CorrelationId, result: Result<RpcResponse>) -> bool {
        match self.take(correlation_id) {
            Some(entry) => {
                trace!(
                    "resolved correlation id {correlation_id} after {:?}",
                    entry.created_at.elapsed()
                );
                // The receiver may already be gone if the caller gave up.
                let _ = entry.sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the invocation registered under `correlation_id` without completing it.
    ///
    /// Returns `false` when nothing was registered under that id.
    pub fn remove(&self, correlation_id: CorrelationId) -> bool {
        self.take(correlation_id).is_some()
    }

    /// Fail every invocation tied to `connection_id` with the error built by `reason`.
    ///
    /// Returns the ids that were drained; none of them remain resolvable.
    pub fn drain_all<F>(&self, connection_id: ConnectionId, reason: F) -> Vec<CorrelationId>
    where
        F: Fn() -> Error,
    {
        let mut drained = Vec::new();

        for shard in &self.shards {
            let owned: Vec<(CorrelationId, PendingEntry)> = {
                let mut entries = shard.entries.lock();
                let ids: Vec<CorrelationId> = entries
                    .iter()
                    .filter(|(_, entry)| entry.connection_id == Some(connection_id))
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                    .collect()
            };

            for (id, entry) in owned {
                let _ = entry.sender.send(Err(reason()));
                drained.push(id);
            }
        }

        if !drained.is_empty() {
            debug!(
                "drained {} pending invocations of connection {connection_id}",
                drained.len()
            );
        }

        drained
    }

    /// Whether an invocation is registered under `correlation_id`.
    #[must_use]
    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.shard_for(correlation_id)
            .entries
            .lock()
            .contains_key(&correlation_id)
    }

    /// Number of calls tied to `connection_id`, excluding control invocations.
    #[must_use]
    pub fn in_flight(&self, connection_id: ConnectionId) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .entries
                    .lock()
                    .values()
                    .filter(|entry| {
                        entry.counts_as_load && entry.connection_id == Some(connection_id)
                    })
                    .count()
            })
            .sum()
    }

    /// Total number of pending invocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.entries.lock().len()).sum()
    }

    /// Whether no invocation is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, correlation_id: CorrelationId) -> Option<PendingEntry> {
        self.shard_for(correlation_id)
            .entries
            .lock()
            .remove(&correlation_id)
    }

    fn shard_for(&self, correlation_id: CorrelationId) -> &Shard {
        #[allow(clippy::cast_possible_truncation)]
        let index = (correlation_id as usize) & self.shard_mask();
        &self.shards[index]
    }

    const fn shard_mask(&self) -> usize {
        (1 << self.shard_bits) - 1
    }
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CorrelationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationStore")
            .field("shards", &self.shards.len())
            .field("pending", &self.len())
            .finish()
    }
}
