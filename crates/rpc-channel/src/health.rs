//! Per-connection health counters.
//!
//! Counters are written by the owning connection and read by external routing
//! policy. Reads return copies and may lag concurrent writes.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default number of latency samples kept per connection.
pub const DEFAULT_LATENCY_WINDOW_SIZE: usize = 30;

/// One entry in a latency window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencySample {
    /// A call that completed after the given round-trip time.
    Completed(Duration),
    /// A call that hit its read timeout; carries the timeout that elapsed.
    ReadTimeout(Duration),
}

impl LatencySample {
    /// The latency this sample contributes.
    #[must_use]
    pub const fn latency(&self) -> Duration {
        match self {
            Self::Completed(latency) | Self::ReadTimeout(latency) => *latency,
        }
    }

    /// Whether the sample records a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimeout(_))
    }
}

/// Fixed-capacity sliding window of latency samples, oldest evicted first.
#[derive(Debug)]
pub struct LatencyWindow {
    capacity: usize,
    samples: Mutex<VecDeque<LatencySample>>,
}

impl LatencyWindow {
    /// Create an empty window holding at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum number of samples retained.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&self, sample: LatencySample) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Copy of the current samples, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LatencySample> {
        self.samples.lock().iter().copied().collect()
    }
}

/// Monotonic failure counter plus latency window.
#[derive(Debug)]
pub struct HealthStats {
    failed_num: AtomicU64,
    latency: LatencyWindow,
}

impl HealthStats {
    /// Fresh stats with the given latency window capacity.
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self {
            failed_num: AtomicU64::new(0),
            latency: LatencyWindow::new(window_size),
        }
    }

    /// Record one observed failure.
    pub fn inc_failed_num(&self) {
        self.failed_num.fetch_add(1, Ordering::Relaxed);
    }

    /// Failures observed so far.
    #[must_use]
    pub fn failed_num(&self) -> u64 {
        self.failed_num.load(Ordering::Relaxed)
    }

    /// Record a completed call's round-trip time.
    pub fn update_latency(&self, latency: Duration) {
        self.latency.push(LatencySample::Completed(latency));
    }

    /// Record a call that hit its read timeout.
    pub fn update_latency_with_read_timeout(&self, read_timeout: Duration) {
        self.latency.push(LatencySample::ReadTimeout(read_timeout));
    }

    /// Copy of the latency window.
    #[must_use]
    pub fn latency_window(&self) -> Vec<LatencySample> {
        self.latency.snapshot()
    }

    /// Copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            failed_num: self.failed_num(),
            latency_window: self.latency_window(),
        }
    }
}

/// Point-in-time copy of a connection's health counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Failures observed so far.
    pub failed_num: u64,
    /// Latency samples, oldest first.
    pub latency_window: Vec<LatencySample>,
}
