//! Connection lease strategies: a bounded exclusive pool and a shared
//! multiplexed connection per endpoint.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::endpoint::{BearerToken, Endpoint};
use crate::error::RpcError;
use crate::request::IdGenerator;
use crate::transport::{Connection, Connector, PooledConnection, Transport};

/// Configuration for [`TransportPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on open connections per endpoint.
    pub capacity_per_endpoint: usize,
    /// How long `acquire` waits for a free slot before failing with `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// How long opening a new connection may take.
    pub connect_timeout: Duration,
    /// Idle connections older than this are closed.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_per_endpoint: 8,
            acquire_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            max_idle: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of one endpoint's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    pub leased: usize,
    pub idle: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.leased + self.idle
    }
}

struct IdleConn {
    id: u64,
    conn: Arc<dyn Connection>,
    created_at: Instant,
    idle_since: Instant,
}

struct EndpointSlots {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
}

/// Bounded pool of exclusively leased connections, keyed by endpoint.
///
/// A slot is a semaphore permit carried inside the lease; it is returned
/// whenever the lease is released or dropped, so capacity cannot leak.
pub struct TransportPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: RwLock<HashMap<Endpoint, Arc<EndpointSlots>>>,
    ids: IdGenerator,
}

impl TransportPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            slots: RwLock::new(HashMap::new()),
            ids: IdGenerator::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slots_for(&self, endpoint: &Endpoint) -> Arc<EndpointSlots> {
        if let Some(slots) = self.slots.read().get(endpoint) {
            return Arc::clone(slots);
        }
        let mut map = self.slots.write();
        Arc::clone(map.entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(EndpointSlots {
                permits: Arc::new(Semaphore::new(self.config.capacity_per_endpoint)),
                idle: Mutex::new(Vec::new()),
            })
        }))
    }

    /// Slot usage for `endpoint`.
    pub fn stats(&self, endpoint: &Endpoint) -> PoolStats {
        let Some(slots) = self.slots.read().get(endpoint).cloned() else {
            return PoolStats {
                capacity: self.config.capacity_per_endpoint,
                ..PoolStats::default()
            };
        };
        let idle = slots.idle.lock().len();
        let leased = self.config.capacity_per_endpoint - slots.permits.available_permits();
        PoolStats {
            capacity: self.config.capacity_per_endpoint,
            leased,
            idle,
        }
    }

    /// Close every idle connection that has outlived `max_idle` or died.
    /// Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let all: Vec<_> = self.slots.read().values().cloned().collect();
        let mut evicted = 0;
        for slots in all {
            let mut idle = slots.idle.lock();
            idle.retain(|c| {
                let keep = c.conn.is_open() && c.idle_since.elapsed() <= self.config.max_idle;
                if !keep {
                    c.conn.close();
                    evicted += 1;
                }
                keep
            });
        }
        if evicted > 0 {
            tracing::debug!(evicted, "closed idle connections");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until the pool is
    /// dropped or the returned handle is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => {
                        pool.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }

    fn take_idle(&self, slots: &EndpointSlots, auth: Option<&BearerToken>) -> Option<IdleConn> {
        let mut idle = slots.idle.lock();
        while let Some(candidate) = idle.pop() {
            if candidate.conn.is_open()
                && candidate.conn.accepts(auth)
                && candidate.idle_since.elapsed() <= self.config.max_idle
            {
                return Some(candidate);
            }
            candidate.conn.close();
        }
        None
    }
}

#[async_trait]
impl Transport for TransportPool {
    async fn acquire(
        &self,
        endpoint: &Endpoint,
        auth: Option<&BearerToken>,
    ) -> Result<PooledConnection, RpcError> {
        let slots = self.slots_for(endpoint);
        let started = Instant::now();

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&slots.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RpcError::Transport("connection pool closed".into())),
            Err(_) => {
                tracing::warn!(endpoint = %endpoint, "connection pool exhausted");
                return Err(RpcError::PoolExhausted {
                    endpoint: endpoint.url().to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        if let Some(idle) = self.take_idle(&slots, auth) {
            let mut lease = PooledConnection::new(
                idle.id,
                endpoint.clone(),
                idle.conn,
                Arc::new(AtomicU32::new(0)),
                Some(permit),
            );
            lease.created_at = idle.created_at;
            lease.last_used = idle.idle_since;
            return Ok(lease);
        }

        let conn = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(endpoint, auth))
            .await
            .map_err(|_| RpcError::ConnectTimeout {
                endpoint: endpoint.url().to_string(),
                ms: self.config.connect_timeout.as_millis() as u64,
            })??;

        let id = self.ids.next();
        tracing::debug!(endpoint = %endpoint, connection = id, "opened connection");
        Ok(PooledConnection::new(
            id,
            endpoint.clone(),
            conn,
            Arc::new(AtomicU32::new(0)),
            Some(permit),
        ))
    }

    fn release(&self, conn: PooledConnection, healthy: bool) {
        let healthy = healthy && conn.is_healthy();
        let PooledConnection {
            id,
            endpoint,
            conn,
            created_at,
            permit,
            ..
        } = conn;

        if healthy {
            let slots = self.slots_for(&endpoint);
            slots.idle.lock().push(IdleConn {
                id,
                conn,
                created_at,
                idle_since: Instant::now(),
            });
        } else {
            tracing::debug!(endpoint = %endpoint, connection = id, "retiring unhealthy connection");
            conn.close();
        }
        // The slot frees only after the connection is back on the idle list.
        drop(permit);
    }

    fn open_connections(&self, endpoint: &Endpoint) -> usize {
        self.stats(endpoint).total()
    }
}

struct SharedConn {
    id: u64,
    conn: Arc<dyn Connection>,
    in_flight: Arc<AtomicU32>,
}

/// One shared connection per endpoint, for backends that multiplex many
/// in-flight requests over a single link (WebSocket).
///
/// Leases are not exclusive here; replies are correlated by wire id inside
/// the connection. A failed attempt never tears the link down for its
/// siblings: the shared connection is retired only once the link itself
/// reports closed, or replaced when it does not accept the caller's
/// credential.
pub struct DirectTransport {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    conns: Mutex<HashMap<Endpoint, SharedConn>>,
    connecting: tokio::sync::Mutex<()>,
    ids: IdGenerator,
}

impl DirectTransport {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            conns: Mutex::new(HashMap::new()),
            connecting: tokio::sync::Mutex::new(()),
            ids: IdGenerator::new(),
        }
    }

    fn lease_existing(
        &self,
        endpoint: &Endpoint,
        auth: Option<&BearerToken>,
    ) -> Option<PooledConnection> {
        let mut conns = self.conns.lock();
        match conns.get(endpoint) {
            Some(shared) if shared.conn.is_open() && shared.conn.accepts(auth) => Some(PooledConnection::new(
                shared.id,
                endpoint.clone(),
                Arc::clone(&shared.conn),
                Arc::clone(&shared.in_flight),
                None,
            )),
            Some(shared) if shared.conn.is_open() => {
                // Credential rotated. Calls already on the old link finish
                // there; it closes when the last lease drops.
                tracing::debug!(endpoint = %endpoint, connection = shared.id, "credential changed, replacing shared connection");
                conns.remove(endpoint);
                None
            }
            Some(_) => {
                if let Some(dead) = conns.remove(endpoint) {
                    dead.conn.close();
                }
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn acquire(
        &self,
        endpoint: &Endpoint,
        auth: Option<&BearerToken>,
    ) -> Result<PooledConnection, RpcError> {
        if let Some(lease) = self.lease_existing(endpoint, auth) {
            return Ok(lease);
        }

        let _guard = self.connecting.lock().await;
        if let Some(lease) = self.lease_existing(endpoint, auth) {
            return Ok(lease);
        }

        let conn = tokio::time::timeout(self.connect_timeout, self.connector.connect(endpoint, auth))
            .await
            .map_err(|_| RpcError::ConnectTimeout {
                endpoint: endpoint.url().to_string(),
                ms: self.connect_timeout.as_millis() as u64,
            })??;

        let id = self.ids.next();
        let in_flight = Arc::new(AtomicU32::new(0));
        self.conns.lock().insert(
            endpoint.clone(),
            SharedConn {
                id,
                conn: Arc::clone(&conn),
                in_flight: Arc::clone(&in_flight),
            },
        );
        tracing::debug!(endpoint = %endpoint, connection = id, "opened shared connection");
        Ok(PooledConnection::new(id, endpoint.clone(), conn, in_flight, None))
    }

    /// Other calls may still be in flight on the shared link, so a failed
    /// attempt alone does not retire it. Only a link that reports closed is
    /// dropped from the map.
    fn release(&self, conn: PooledConnection, healthy: bool) {
        if conn.conn.is_open() {
            if !healthy {
                tracing::debug!(endpoint = %conn.endpoint, connection = conn.id, "attempt failed, keeping shared connection");
            }
            return;
        }
        let mut conns = self.conns.lock();
        if conns.get(&conn.endpoint).map(|s| s.id) == Some(conn.id) {
            if let Some(shared) = conns.remove(&conn.endpoint) {
                tracing::debug!(endpoint = %conn.endpoint, connection = shared.id, "retiring shared connection");
                shared.conn.close();
            }
        }
    }

    fn open_connections(&self, endpoint: &Endpoint) -> usize {
        usize::from(self.conns.lock().contains_key(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::BearerToken;
    use crate::request::{JsonRpcRequest, JsonRpcResponse};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockConn {
        open: AtomicBool,
        token: Option<BearerToken>,
        pins_token: bool,
    }

    #[async_trait]
    impl Connection for MockConn {
        async fn send(
            &self,
            req: &JsonRpcRequest,
            _auth: Option<&BearerToken>,
        ) -> Result<JsonRpcResponse, RpcError> {
            let id = req.id.as_number().unwrap_or(0);
            Ok(JsonRpcResponse::success(id, serde_json::json!("ok")))
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::Relaxed)
        }
        fn close(&self) {
            self.open.store(false, Ordering::Relaxed);
        }
        fn accepts(&self, auth: Option<&BearerToken>) -> bool {
            !self.pins_token || self.token.as_ref() == auth
        }
    }

    /// `pins_token` mimics a backend that authenticates at the handshake.
    #[derive(Default)]
    struct MockConnector {
        connects: AtomicUsize,
        hang: bool,
        pins_token: bool,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            _endpoint: &Endpoint,
            auth: Option<&BearerToken>,
        ) -> Result<Arc<dyn Connection>, RpcError> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            if self.hang {
                futures::future::pending::<()>().await;
            }
            Ok(Arc::new(MockConn {
                open: AtomicBool::new(true),
                token: auth.cloned(),
                pins_token: self.pins_token,
            }))
        }
    }

    fn pool(capacity: usize) -> (Arc<MockConnector>, TransportPool) {
        let connector = Arc::new(MockConnector::default());
        let pool = TransportPool::new(
            connector.clone(),
            PoolConfig {
                capacity_per_endpoint: capacity,
                acquire_timeout: Duration::from_millis(500),
                connect_timeout: Duration::from_secs(1),
                max_idle: Duration::from_secs(60),
            },
        );
        (connector, pool)
    }

    fn ep() -> Endpoint {
        Endpoint::new("https://rpc.example")
    }

    #[tokio::test(start_paused = true)]
    async fn released_connection_is_reused() {
        let (connector, pool) = pool(2);
        let a = pool.acquire(&ep(), None).await.unwrap();
        let id = a.id();
        pool.release(a, true);
        let b = pool.acquire(&ep(), None).await.unwrap();
        assert_eq!(b.id(), id);
        assert_eq!(connector.connects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_beyond_capacity_waits_for_release() {
        let (_, pool) = pool(1);
        let pool = Arc::new(pool);
        let first = pool.acquire(&ep(), None).await.unwrap();
        let first_id = first.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&ep(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        pool.release(first, true);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.id(), first_id);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_with_pool_exhausted() {
        let (_, pool) = pool(1);
        let _held = pool.acquire(&ep(), None).await.unwrap();
        let err = pool.acquire(&ep(), None).await.unwrap_err();
        assert!(matches!(err, RpcError::PoolExhausted { .. }), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_connection_is_never_handed_out_again() {
        let (connector, pool) = pool(1);
        let a = pool.acquire(&ep(), None).await.unwrap();
        let bad_id = a.id();
        pool.release(a, false);
        let b = pool.acquire(&ep(), None).await.unwrap();
        assert_ne!(b.id(), bad_id);
        assert_eq!(connector.connects.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lease_frees_its_slot() {
        let (_, pool) = pool(1);
        let a = pool.acquire(&ep(), None).await.unwrap();
        drop(a);
        assert!(pool.acquire(&ep(), None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_evicted() {
        let (connector, pool) = pool(2);
        let a = pool.acquire(&ep(), None).await.unwrap();
        pool.release(a, true);
        assert_eq!(pool.stats(&ep()).idle, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.stats(&ep()).total(), 0);

        let _b = pool.acquire(&ep(), None).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_fails_with_connect_timeout() {
        let connector = Arc::new(MockConnector {
            hang: true,
            ..Default::default()
        });
        let pool = TransportPool::new(connector, PoolConfig::default());
        let err = pool.acquire(&ep(), None).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectTimeout { .. }), "got {err:?}");
        assert_eq!(pool.stats(&ep()).leased, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_transport_shares_one_connection() {
        let connector = Arc::new(MockConnector::default());
        let direct = DirectTransport::new(connector.clone(), Duration::from_secs(1));
        let a = direct.acquire(&ep(), None).await.unwrap();
        let b = direct.acquire(&ep(), None).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(connector.connects.load(Ordering::Relaxed), 1);

        a.conn.close();
        direct.release(a, false);
        assert_eq!(direct.open_connections(&ep()), 0);
        let c = direct.acquire(&ep(), None).await.unwrap();
        assert_ne!(c.id(), b.id());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_keeps_shared_connection_open() {
        let connector = Arc::new(MockConnector::default());
        let direct = DirectTransport::new(connector.clone(), Duration::from_secs(1));
        let timed_out = direct.acquire(&ep(), None).await.unwrap();
        let sibling = direct.acquire(&ep(), None).await.unwrap();

        direct.release(timed_out, false);
        assert!(sibling.is_healthy());
        assert_eq!(direct.open_connections(&ep()), 1);

        let next = direct.acquire(&ep(), None).await.unwrap();
        assert_eq!(next.id(), sibling.id());
        assert_eq!(connector.connects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rotated_credential_replaces_shared_connection() {
        let connector = Arc::new(MockConnector {
            pins_token: true,
            ..Default::default()
        });
        let direct = DirectTransport::new(connector.clone(), Duration::from_secs(1));
        let old = BearerToken::new("old");
        let new = BearerToken::new("new");

        let first = direct.acquire(&ep(), Some(&old)).await.unwrap();
        let again = direct.acquire(&ep(), Some(&old)).await.unwrap();
        assert_eq!(first.id(), again.id());

        let rotated = direct.acquire(&ep(), Some(&new)).await.unwrap();
        assert_ne!(rotated.id(), first.id());
        assert_eq!(connector.connects.load(Ordering::Relaxed), 2);
        // The old link stays usable for calls already leased on it.
        assert!(first.is_healthy());
        assert_eq!(direct.open_connections(&ep()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_with_stale_credential_is_not_reused() {
        let connector = Arc::new(MockConnector {
            pins_token: true,
            ..Default::default()
        });
        let pool = TransportPool::new(connector.clone(), PoolConfig::default());
        let old = BearerToken::new("old");
        let a = pool.acquire(&ep(), Some(&old)).await.unwrap();
        let stale_id = a.id();
        pool.release(a, true);

        let b = pool.acquire(&ep(), Some(&BearerToken::new("new"))).await.unwrap();
        assert_ne!(b.id(), stale_id);
        assert_eq!(connector.connects.load(Ordering::Relaxed), 2);
        assert_eq!(pool.stats(&ep()).idle, 0);
    }
}
