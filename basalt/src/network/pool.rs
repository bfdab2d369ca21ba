//! The per-host connection pool.
//!
//! A background refiller task keeps between `core_size` and `max_size`
//! connections open to its host, growing when the mean number of in-flight
//! requests per connection crosses a threshold and shrinking when it falls
//! back. Acquisition picks the connection with the fewest requests in
//! flight and never blocks; when every connection is saturated and the
//! pool cannot grow any more, the caller gets `Busy` and moves on to the
//! next node of its plan.

use arc_swap::ArcSwap;
use futures::future::RemoteHandle;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use super::connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};
use crate::errors::{ConnectionError, ConnectionPoolError, QueryError, RequestAttemptError};
use crate::policies::reconnection::ReconnectionPolicy;

/// Fraction of the stream-id space a connection must have in flight for
/// the pool to consider it loaded. The pool grows when the mean in-flight
/// count exceeds the grow threshold and shrinks below core usage when it
/// falls under the shrink threshold.
const GROW_THRESHOLD_NUM: usize = 3;
const GROW_THRESHOLD_DEN: usize = 4;
const SHRINK_THRESHOLD_NUM: usize = 1;
const SHRINK_THRESHOLD_DEN: usize = 4;

/// How often the refiller re-evaluates the pool size.
const POOL_RESIZE_INTERVAL: Duration = Duration::from_millis(500);

/// The target size of a per-host connection pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSize {
    /// Number of connections the pool keeps open at all times.
    pub core_size: NonZeroUsize,
    /// Number of connections the pool may grow to under load.
    pub max_size: NonZeroUsize,
}

impl Default for PoolSize {
    fn default() -> Self {
        Self {
            core_size: NonZeroUsize::new(1).unwrap(),
            max_size: NonZeroUsize::new(2).unwrap(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pool_size: PoolSize,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: Default::default(),
            pool_size: Default::default(),
            reconnection_policy: Arc::new(
                crate::policies::reconnection::ExponentialReconnectionPolicy::default(),
            ),
        }
    }
}

enum MaybePoolConnections {
    /// The pool is being filled for the first time.
    Initializing,

    /// The pool is empty: the initial fill failed or all connections broke.
    /// Holds the error from the last connection attempt.
    Broken(ConnectionError),

    /// The pool has connections ready to serve requests.
    Ready(Vec<Arc<Connection>>),
}

impl std::fmt::Debug for MaybePoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybePoolConnections::Initializing => write!(f, "Initializing"),
            MaybePoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            MaybePoolConnections::Ready(conns) => {
                write!(f, "Ready({} connections)", conns.len())
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct HostConnectionPool {
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    _refiller_handle: Arc<RemoteHandle<()>>,
    pool_updated_notify: Arc<Notify>,
    endpoint: SocketAddr,
}

impl std::fmt::Debug for HostConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("conns", &self.conns)
            .finish_non_exhaustive()
    }
}

struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), QueryError>>,
}

impl HostConnectionPool {
    pub(crate) fn new(
        endpoint: SocketAddr,
        pool_config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        let pool_updated_notify = Arc::new(Notify::new());

        let refiller = PoolRefiller::new(
            endpoint,
            pool_config,
            current_keyspace,
            pool_updated_notify.clone(),
        );

        let conns = refiller.get_shared_connections();
        let (fut, refiller_handle) = refiller.run(use_keyspace_request_receiver).remote_handle();
        tokio::spawn(fut);

        Self {
            conns,
            use_keyspace_request_sender,
            _refiller_handle: Arc::new(refiller_handle),
            pool_updated_notify,
            endpoint,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(**self.conns.load(), MaybePoolConnections::Ready(_))
    }

    /// Picks the connection with the fewest requests in flight. Returns
    /// `Busy` when every connection is saturated; the pool grows in the
    /// background, the caller should move on to its next candidate node.
    pub(crate) fn least_loaded_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        let conns = self.conns.load();
        match &**conns {
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Ready(conns) => {
                let least_loaded = conns
                    .iter()
                    .min_by_key(|conn| conn.in_flight())
                    .expect("pool is never Ready with zero connections");
                if least_loaded.in_flight() >= least_loaded.request_limit() {
                    trace!("All connections to {} saturated", self.endpoint);
                    return Err(ConnectionPoolError::Busy);
                }
                Ok(least_loaded.clone())
            }
        }
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        match &**self.conns.load() {
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Ready(conns) => Ok(conns.clone()),
        }
    }

    /// Waits until the pool has left the `Initializing` state.
    pub(crate) async fn wait_until_initialized(&self) {
        loop {
            let notified = self.pool_updated_notify.notified();
            if !matches!(**self.conns.load(), MaybePoolConnections::Initializing) {
                return;
            }
            notified.await;
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .map_err(|_| {
                QueryError::BrokenConnection(crate::errors::BrokenConnectionError::ChannelError)
            })?;

        response_receiver.await.map_err(|_| {
            QueryError::BrokenConnection(crate::errors::BrokenConnectionError::ChannelError)
        })?
    }
}

struct PoolRefiller {
    endpoint: SocketAddr,
    pool_config: PoolConfig,

    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    conns: Vec<Arc<Connection>>,

    current_keyspace: Option<VerifiedKeyspaceName>,
    pool_updated_notify: Arc<Notify>,

    last_connection_error: Option<ConnectionError>,
}

impl PoolRefiller {
    fn new(
        endpoint: SocketAddr,
        pool_config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_updated_notify: Arc<Notify>,
    ) -> Self {
        Self {
            endpoint,
            pool_config,
            shared_conns: Arc::new(ArcSwap::from_pointee(MaybePoolConnections::Initializing)),
            conns: Vec::new(),
            current_keyspace,
            pool_updated_notify,
            last_connection_error: None,
        }
    }

    fn get_shared_connections(&self) -> Arc<ArcSwap<MaybePoolConnections>> {
        self.shared_conns.clone()
    }

    async fn run(mut self, mut use_keyspace_request_receiver: mpsc::Receiver<UseKeyspaceRequest>) {
        // Error receivers of the open connections, tagged with the
        // connection address identity so broken connections can be evicted.
        let mut connection_errors: FuturesUnordered<_> = FuturesUnordered::new();

        fn watch_connection(
            conn: Arc<Connection>,
            error_receiver: ErrorReceiver,
        ) -> impl std::future::Future<Output = (Arc<Connection>, ConnectionError)> {
            async move {
                let error = match error_receiver.await {
                    Ok(error) => error,
                    // The router task was dropped; treat as a broken
                    // connection.
                    Err(_) => ConnectionError::BrokenConnection(
                        crate::errors::BrokenConnectionError::ChannelError,
                    ),
                };
                (conn, error)
            }
        }

        let mut reconnection_schedule = None;
        let mut resize_interval = tokio::time::interval(POOL_RESIZE_INTERVAL);
        resize_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Fill up to core size; grow past it only under load.
            let target = self.target_size();
            while self.conns.len() < target {
                match open_connection(self.endpoint, &self.pool_config.connection_config).await {
                    Ok((connection, error_receiver)) => {
                        let connection = Arc::new(connection);
                        if let Some(keyspace_name) = &self.current_keyspace {
                            if let Err(err) = connection.use_keyspace(keyspace_name).await {
                                warn!(
                                    "Failed to set keyspace on new connection to {}: {}",
                                    self.endpoint, err
                                );
                            }
                        }
                        connection_errors
                            .push(watch_connection(connection.clone(), error_receiver));
                        self.conns.push(connection);
                        reconnection_schedule = None;
                        self.publish();
                    }
                    Err(err) => {
                        debug!("Failed to open connection to {}: {}", self.endpoint, err);
                        self.last_connection_error = Some(err);
                        if self.conns.is_empty() {
                            self.publish();
                        }
                        // Back off before the next attempt, per the
                        // reconnection policy.
                        let schedule = reconnection_schedule.get_or_insert_with(|| {
                            self.pool_config.reconnection_policy.new_schedule()
                        });
                        let delay = schedule.next_delay();
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            tokio::select! {
                maybe_broken = connection_errors.next(), if !connection_errors.is_empty() => {
                    if let Some((broken_conn, error)) = maybe_broken {
                        debug!("Connection to {} broke: {}", self.endpoint, error);
                        self.last_connection_error = Some(error);
                        self.conns.retain(|conn| !Arc::ptr_eq(conn, &broken_conn));
                        self.publish();
                    }
                }
                maybe_request = use_keyspace_request_receiver.recv() => {
                    match maybe_request {
                        Some(request) => {
                            self.current_keyspace = Some(request.keyspace_name.clone());
                            let result = self.apply_keyspace(&request.keyspace_name).await;
                            // The requester may have given up; ignore.
                            let _ = request.response_sender.send(result);
                        }
                        None => {
                            // The pool handle was dropped; stop refilling.
                            return;
                        }
                    }
                }
                _ = resize_interval.tick() => {
                    self.maybe_shrink();
                }
            }
        }
    }

    /// The size the pool should have right now: core size, plus one for
    /// each step the mean in-flight load exceeds the grow threshold, up to
    /// max size.
    fn target_size(&self) -> usize {
        let core = self.pool_config.pool_size.core_size.get();
        let max = self.pool_config.pool_size.max_size.get();

        if self.conns.is_empty() {
            return core;
        }

        let request_limit = self
            .conns
            .first()
            .map(|conn| conn.request_limit())
            .unwrap_or(1);
        let total_in_flight: usize = self.conns.iter().map(|conn| conn.in_flight()).sum();
        let mean_in_flight = total_in_flight / self.conns.len();

        if mean_in_flight * GROW_THRESHOLD_DEN >= request_limit * GROW_THRESHOLD_NUM {
            (self.conns.len() + 1).clamp(core, max)
        } else {
            self.conns.len().clamp(core, max)
        }
    }

    /// Drops one connection when the pool is above core size and the load
    /// has fallen below the shrink threshold.
    fn maybe_shrink(&mut self) {
        let core = self.pool_config.pool_size.core_size.get();
        if self.conns.len() <= core {
            return;
        }

        let request_limit = self
            .conns
            .first()
            .map(|conn| conn.request_limit())
            .unwrap_or(1);
        let total_in_flight: usize = self.conns.iter().map(|conn| conn.in_flight()).sum();
        let mean_in_flight = total_in_flight / self.conns.len();

        if mean_in_flight * SHRINK_THRESHOLD_DEN < request_limit * SHRINK_THRESHOLD_NUM {
            // Drop the most idle connection; its pending requests (if any)
            // finish first because the Arc keeps it alive until then.
            if let Some((idx, _)) = self
                .conns
                .iter()
                .enumerate()
                .min_by_key(|(_, conn)| conn.in_flight())
            {
                debug!("Shrinking pool to {}", self.endpoint);
                self.conns.swap_remove(idx);
                self.publish();
            }
        }
    }

    async fn apply_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        if self.conns.is_empty() {
            // The keyspace is remembered and set on future connections.
            return Ok(());
        }

        let use_keyspace_futures = self
            .conns
            .iter()
            .map(|conn| conn.use_keyspace(keyspace_name));
        let use_keyspace_results: Vec<Result<(), RequestAttemptError>> =
            futures::future::join_all(use_keyspace_futures).await;

        // If at least one connection succeeded, the keyspace name is valid
        // and will apply to the broken connections when they reconnect.
        let mut was_ok = false;
        let mut last_error = None;
        for result in use_keyspace_results {
            match result {
                Ok(()) => was_ok = true,
                Err(err) => match err {
                    RequestAttemptError::BrokenConnection(_)
                    | RequestAttemptError::UnableToAllocStreamId => {
                        last_error = Some(err.into_query_error())
                    }
                    _ => return Err(err.into_query_error()),
                },
            }
        }

        if was_ok {
            return Ok(());
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn publish(&self) {
        let new_state = if self.conns.is_empty() {
            match &self.last_connection_error {
                Some(err) => MaybePoolConnections::Broken(err.clone()),
                None => MaybePoolConnections::Initializing,
            }
        } else {
            MaybePoolConnections::Ready(self.conns.clone())
        };
        self.shared_conns.store(Arc::new(new_state));
        self.pool_updated_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::mock_server::{MockNode, MockNodeOptions};
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;

    fn test_pool_config(core: usize, max: usize) -> PoolConfig {
        PoolConfig {
            connection_config: ConnectionConfig {
                keepalive_interval: None,
                ..Default::default()
            },
            pool_size: PoolSize {
                core_size: NonZeroUsize::new(core).unwrap(),
                max_size: NonZeroUsize::new(max).unwrap(),
            },
            reconnection_policy: Arc::new(
                crate::policies::reconnection::ConstantReconnectionPolicy::new(
                    Duration::from_millis(50),
                ),
            ),
        }
    }

    #[tokio::test]
    async fn pool_fills_to_core_size() {
        setup_tracing();
        let node = MockNode::start(MockNodeOptions::default()).await;

        let pool = HostConnectionPool::new(node.address(), test_pool_config(2, 3), None);
        pool.wait_until_initialized().await;

        let conns = pool.get_working_connections().unwrap();
        assert_eq!(conns.len(), 2);
        assert!(pool.is_connected());
    }

    #[tokio::test]
    async fn pool_hands_out_least_loaded_connection() {
        setup_tracing();
        let node = MockNode::start(MockNodeOptions {
            // Responses withheld: requests stay in flight.
            respond_to_requests: false,
            ..Default::default()
        })
        .await;

        let pool = HostConnectionPool::new(node.address(), test_pool_config(2, 2), None);
        pool.wait_until_initialized().await;

        let first = pool.least_loaded_connection().unwrap();
        let _pending = tokio::spawn({
            let first = first.clone();
            async move { first.query_unpaged("SELECT x FROM ks.t").await }
        });

        // Give the spawned request a moment to become in-flight.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = pool.least_loaded_connection().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.in_flight(), 0);
    }

    #[tokio::test]
    async fn pool_recovers_after_node_restart() {
        setup_tracing();
        let node = MockNode::start(MockNodeOptions::default()).await;
        let address = node.address();

        let pool = HostConnectionPool::new(address, test_pool_config(1, 1), None);
        pool.wait_until_initialized().await;
        assert!(pool.is_connected());

        node.kill().await;

        // The pool notices the broken connection and keeps retrying with
        // the reconnection policy's backoff; eventually it is Broken.
        let mut broken_seen = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            match pool.least_loaded_connection() {
                Ok(_) => continue,
                Err(ConnectionPoolError::Broken { .. }) => {
                    broken_seen = true;
                    break;
                }
                Err(_) => continue,
            }
        }
        assert!(broken_seen, "pool never transitioned to Broken");
    }

    #[tokio::test]
    async fn empty_pool_reports_initializing_then_broken() {
        setup_tracing();
        // An address nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let pool = HostConnectionPool::new(address, test_pool_config(1, 1), None);
        pool.wait_until_initialized().await;
        assert_matches!(
            pool.least_loaded_connection(),
            Err(ConnectionPoolError::Broken { .. })
        );
    }
}
