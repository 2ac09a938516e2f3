//! Transport factories per service group and connection pools per instance.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::connection::Connection;
use crate::error::{ConnectionError, Error, Result};
use crate::instance::ServiceInstance;
use crate::options::CommunicationOptions;
use crate::store::CorrelationStore;

/// Socket configuration shared by every instance of one service group.
#[derive(Debug)]
pub struct TransportFactory {
    service_name: String,
    connect_timeout: Duration,
    tcp_nodelay: bool,
    keep_alive: bool,
    connections_opened: AtomicU64,
}

impl TransportFactory {
    /// Create a factory for `service_name` from the given options.
    #[must_use]
    pub fn new(service_name: impl Into<String>, options: &CommunicationOptions) -> Self {
        Self {
            service_name: service_name.into(),
            connect_timeout: options.connect_timeout,
            tcp_nodelay: options.tcp_nodelay,
            keep_alive: options.keep_alive,
            connections_opened: AtomicU64::new(0),
        }
    }

    /// Service group this factory belongs to.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Connect timeout applied to every socket.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Sockets successfully opened by this factory.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Open a TCP socket to `instance`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the address does not resolve, the
    /// connect fails, or the connect timeout elapses.
    pub async fn connect(&self, instance: &ServiceInstance) -> Result<TcpStream> {
        let target = if instance.host().contains(':') {
            format!("[{}]:{}", instance.host(), instance.port())
        } else {
            instance.to_string()
        };
        let addr = tokio::net::lookup_host(&target)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConnectionError::InvalidAddress(target.clone()))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| ConnectionError::ConnectFailed { addr, source })?;
        socket
            .set_keepalive(self.keep_alive)
            .map_err(|source| ConnectionError::ConnectFailed { addr, source })?;

        let stream = match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectionError::ConnectFailed { addr, source }.into()),
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout {
                    addr,
                    timeout: self.connect_timeout,
                }
                .into());
            }
        };

        stream
            .set_nodelay(self.tcp_nodelay)
            .map_err(|source| ConnectionError::ConnectFailed { addr, source })?;

        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        debug!("opened socket to {} for group {}", addr, self.service_name);
        Ok(stream)
    }
}

/// Pools are per instance and per options, so callers configured for
/// different protocols never share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    instance: ServiceInstance,
    options: usize,
}

impl PoolKey {
    fn new(instance: &ServiceInstance, options: &Arc<CommunicationOptions>) -> Self {
        Self {
            instance: instance.clone(),
            options: Arc::as_ptr(options) as usize,
        }
    }

    fn of(conn: &Connection) -> Self {
        Self::new(conn.instance(), conn.options())
    }
}

/// Open connections to one instance.
#[derive(Default)]
struct InstancePool {
    connections: RwLock<Vec<Arc<Connection>>>,
    create_lock: Mutex<()>,
}

impl InstancePool {
    /// Drop connections that can no longer carry calls.
    fn prune(&self) {
        self.connections.write().retain(|conn| conn.is_connected());
    }

    /// Least-loaded connection, unless every one is busy and there is room
    /// for another.
    fn pick(&self, max: usize) -> Option<Arc<Connection>> {
        let connections = self.connections.read();
        let best = connections
            .iter()
            .filter(|conn| conn.is_connected())
            .min_by_key(|conn| conn.in_flight())?;

        if best.in_flight() == 0 || connections.len() >= max {
            Some(Arc::clone(best))
        } else {
            None
        }
    }
}

/// Owns transport factories per service group and pooled connections per
/// instance.
///
/// Create one per application and share it; nothing here is global. A pool
/// is keyed by the instance together with the options it was acquired with,
/// and is forgotten once it holds no connections.
pub struct ConnectionPoolRegistry {
    store: Arc<CorrelationStore>,
    factories: DashMap<String, Arc<TransportFactory>>,
    pools: DashMap<PoolKey, Arc<InstancePool>>,
}

impl ConnectionPoolRegistry {
    /// Create an empty registry whose connections resolve into `store`.
    #[must_use]
    pub fn new(store: Arc<CorrelationStore>) -> Self {
        Self {
            store,
            factories: DashMap::new(),
            pools: DashMap::new(),
        }
    }

    /// Correlation store shared by every connection of this registry.
    #[must_use]
    pub const fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    /// Factory for `service_name`, creating it from `options` on first use.
    ///
    /// Concurrent callers for the same name all receive the same factory. A
    /// factory is configured once; later options for the same group are
    /// ignored.
    pub fn get_or_create_factory(
        &self,
        service_name: &str,
        options: &CommunicationOptions,
    ) -> Arc<TransportFactory> {
        if let Some(factory) = self.factories.get(service_name) {
            return Arc::clone(factory.value());
        }

        let factory = self
            .factories
            .entry(service_name.to_string())
            .or_insert_with(|| {
                debug!("creating transport factory for group {}", service_name);
                Arc::new(TransportFactory::new(service_name, options))
            });
        Arc::clone(factory.value())
    }

    /// Number of service groups with a factory.
    #[must_use]
    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    /// A usable connection to `instance`, reusing a pooled one where possible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when the pool allows no connections,
    /// or the connect error of a new connection. Failed connections are not
    /// pooled.
    #[instrument(skip(self, instance, options), fields(instance = %instance))]
    pub async fn acquire(
        &self,
        instance: &ServiceInstance,
        options: &Arc<CommunicationOptions>,
    ) -> Result<Arc<Connection>> {
        let max = options.max_connections_per_instance;
        let key = PoolKey::new(instance, options);
        let pool = Arc::clone(self.pools.entry(key.clone()).or_default().value());

        let result = self.acquire_from(&pool, instance, options, max).await;
        if result.is_err() {
            drop(pool);
            self.forget_if_idle(&key);
        }
        result
    }

    async fn acquire_from(
        &self,
        pool: &InstancePool,
        instance: &ServiceInstance,
        options: &Arc<CommunicationOptions>,
        max: usize,
    ) -> Result<Arc<Connection>> {
        pool.prune();
        if let Some(conn) = pool.pick(max) {
            return Ok(conn);
        }

        let _guard = pool.create_lock.lock().await;
        pool.prune();
        if let Some(conn) = pool.pick(max) {
            return Ok(conn);
        }
        if max == 0 {
            return Err(Error::PoolExhausted(instance.to_string()));
        }

        let factory = self.get_or_create_factory(instance.service_name(), options);
        let conn = Connection::new(
            instance.clone(),
            Arc::clone(options),
            factory,
            Arc::clone(&self.store),
        );
        conn.connect().await?;

        pool.connections.write().push(Arc::clone(&conn));
        debug!(
            "pooled connection {} ({} open)",
            conn.id(),
            pool.connections.read().len()
        );
        Ok(conn)
    }

    /// Currently pooled connections to `instance`, across all options.
    #[must_use]
    pub fn connections(&self, instance: &ServiceInstance) -> Vec<Arc<Connection>> {
        self.pools
            .iter()
            .filter(|entry| entry.key().instance == *instance)
            .flat_map(|entry| entry.value().connections.read().clone())
            .collect()
    }

    /// Number of pools currently tracked.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Take `conn` out of its pool without closing it.
    ///
    /// Returns whether it was pooled.
    pub fn remove(&self, conn: &Connection) -> bool {
        let key = PoolKey::of(conn);
        let removed = {
            let Some(pool) = self.pools.get(&key) else {
                return false;
            };
            let mut connections = pool.connections.write();
            let before = connections.len();
            connections.retain(|pooled| pooled.id() != conn.id());
            connections.len() != before
        };
        self.forget_if_idle(&key);
        removed
    }

    /// Drop unusable connections from every pool and forget empty pools.
    pub fn prune(&self) {
        let keys: Vec<PoolKey> = self
            .pools
            .iter()
            .map(|entry| {
                entry.value().prune();
                entry.key().clone()
            })
            .collect();
        for key in &keys {
            self.forget_if_idle(key);
        }
    }

    /// Forget the pool for `key` if it is empty and nobody is acquiring from
    /// it.
    fn forget_if_idle(&self, key: &PoolKey) {
        let forgotten = self.pools.remove_if(key, |_, pool| {
            Arc::strong_count(pool) == 1 && pool.connections.read().is_empty()
        });
        if forgotten.is_some() {
            debug!("forgot empty pool for {}", key.instance);
        }
    }

    /// Close and forget every pooled connection.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<InstancePool>> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.pools.clear();

        let mut closed = 0usize;
        for pool in pools {
            let connections = std::mem::take(&mut *pool.connections.write());
            for conn in connections {
                conn.close().await;
                closed += 1;
            }
        }
        info!("closed {} pooled connections", closed);
    }
}

impl std::fmt::Debug for ConnectionPoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolRegistry")
            .field("factories", &self.factories.len())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}
