//! Remote endpoint identity.

use std::fmt;
use std::hash::{Hash, Hasher};

/// One remote endpoint inside a named service group.
///
/// Equality and hashing consider only `(host, port)`. Two instances that point
/// at the same address are interchangeable for pooling and deduplication even
/// when their service-group names differ.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    service_name: String,
    host: String,
    port: u16,
}

impl ServiceInstance {
    /// Create a new instance for `service_name` at `host:port`.
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
        }
    }

    /// Logical service-group name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Host name or IP literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for ServiceInstance {}

impl Hash for ServiceInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
