//! A cluster node together with its connection pool.

use itertools::Itertools;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::warn;
use uuid::Uuid;

use crate::cluster::metadata::PeerEndpoint;
use crate::errors::ConnectionPoolError;
use crate::network::connection::{Connection, VerifiedKeyspaceName};
use crate::network::pool::{HostConnectionPool, PoolConfig};

/// A cluster node as seen by the driver.
///
/// The node is identified by its endpoint; if a node changes its broadcast
/// address it is represented by a fresh instance.
#[derive(Debug)]
pub struct Node {
    /// Address used to connect to the node.
    pub address: SocketAddr,
    /// Unique identifier of the node, if known.
    pub host_id: Option<Uuid>,
    /// Datacenter the node is in, if known.
    pub datacenter: Option<String>,
    /// Rack the node is in, if known.
    pub rack: Option<String>,
    /// Server release version, as reported in `system.local`/`system.peers`.
    pub release_version: Option<String>,

    down_marker: AtomicBool,

    pool: Option<HostConnectionPool>,

    // Unit tests mock Nodes without real pools; this flag lets them count
    // as connected anyway.
    #[cfg(test)]
    enabled_as_connected: AtomicBool,
}

/// The way nodes are usually passed around in driver code.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    /// Creates a new node which starts opening its connection pool in the
    /// background.
    pub(crate) fn new(
        peer: PeerEndpoint,
        pool_config: &PoolConfig,
        keyspace_name: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let pool = Some(HostConnectionPool::new(
            peer.address,
            pool_config.clone(),
            keyspace_name,
        ));

        Node {
            address: peer.address,
            host_id: peer.host_id,
            datacenter: peer.datacenter,
            rack: peer.rack,
            release_version: peer.release_version,
            down_marker: AtomicBool::new(false),
            pool,
            #[cfg(test)]
            enabled_as_connected: AtomicBool::new(false),
        }
    }

    /// Recreates the node with fresh endpoint attributes, keeping the pool.
    pub(crate) fn inherit_with_refreshed_attributes(node: &Node, peer: PeerEndpoint) -> Self {
        Self {
            address: peer.address,
            host_id: peer.host_id,
            datacenter: peer.datacenter,
            rack: peer.rack,
            release_version: peer.release_version,
            down_marker: AtomicBool::new(node.is_down()),
            pool: node.pool.clone(),
            #[cfg(test)]
            enabled_as_connected: AtomicBool::new(
                node.enabled_as_connected.load(Ordering::SeqCst),
            ),
        }
    }

    pub fn is_down(&self) -> bool {
        self.down_marker.load(Ordering::Relaxed)
    }

    pub fn is_up(&self) -> bool {
        !self.is_down()
    }

    pub(crate) fn change_down_marker(&self, is_down: bool) {
        self.down_marker.store(is_down, Ordering::Relaxed);
    }

    /// True if the driver has any open connection to this node.
    pub fn is_connected(&self) -> bool {
        #[cfg(test)]
        if self.enabled_as_connected.load(Ordering::SeqCst) {
            return true;
        }
        self.pool.as_ref().is_some_and(|pool| pool.is_connected())
    }

    /// Picks the pooled connection with the fewest requests in flight.
    pub(crate) fn connection_for_request(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.get_pool()?.least_loaded_connection()
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.get_pool()?.get_working_connections()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), crate::errors::QueryError> {
        if let Some(pool) = &self.pool {
            pool.use_keyspace(keyspace_name).await?;
        }
        Ok(())
    }

    pub(crate) async fn wait_until_pool_initialized(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_until_initialized().await;
        }
    }

    fn get_pool(&self) -> Result<&HostConnectionPool, ConnectionPoolError> {
        self.pool.as_ref().ok_or(ConnectionPoolError::Closed)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// A database node known on session startup.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname, resolved via DNS.
    Hostname(String),
    /// A node identified by its IP address and port.
    Address(SocketAddr),
}

/// Performs a DNS lookup with an optional timeout.
async fn lookup_host_with_timeout(
    host: &str,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<Vec<SocketAddr>, std::io::Error> {
    let lookup = async { lookup_host(host).await.map(|addrs| addrs.collect()) };
    if let Some(timeout) = hostname_resolution_timeout {
        match tokio::time::timeout(timeout, lookup).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("DNS lookup of {} timed out", host),
            )),
        }
    } else {
        lookup.await
    }
}

// Resolves the given hostname, preferring IPv4 addresses over IPv6 ones.
pub(crate) async fn resolve_hostname(
    hostname: &str,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<SocketAddr, std::io::Error> {
    // `lookup_host` requires a port; if the hostname carries none, retry
    // with the default CQL port appended.
    let addrs = match lookup_host_with_timeout(hostname, hostname_resolution_timeout).await {
        Ok(addrs) => addrs,
        Err(first_err) => {
            let with_port = format!("{}:9042", hostname);
            match lookup_host_with_timeout(&with_port, hostname_resolution_timeout).await {
                Ok(addrs) => addrs,
                Err(_) => return Err(first_err),
            }
        }
    };

    addrs
        .into_iter()
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Empty address list returned by DNS for {}", hostname),
            )
        })
}

/// Resolves the given known nodes into socket addresses, dropping (with a
/// warning) the ones that fail to resolve. Returns the resolved addresses
/// and the list of hostnames that were looked up.
pub(crate) async fn resolve_contact_points(
    known_nodes: &[KnownNode],
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut contact_points: Vec<SocketAddr> = Vec::with_capacity(known_nodes.len());
    let mut to_resolve: Vec<&String> = Vec::new();
    let mut hostnames: Vec<String> = Vec::new();

    for node in known_nodes.iter() {
        match node {
            KnownNode::Hostname(hostname) => {
                to_resolve.push(hostname);
                hostnames.push(hostname.clone());
            }
            KnownNode::Address(address) => contact_points.push(*address),
        };
    }

    let resolve_futures = to_resolve.into_iter().map(|hostname| async move {
        match resolve_hostname(hostname, hostname_resolution_timeout).await {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Hostname resolution failed for {}: {}", hostname, &e);
                None
            }
        }
    });
    let resolved: Vec<_> = futures::future::join_all(resolve_futures).await;
    contact_points.extend(resolved.into_iter().flatten());

    (contact_points, hostnames)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    impl Node {
        pub(crate) fn new_for_test(
            address: SocketAddr,
            datacenter: Option<String>,
            rack: Option<String>,
        ) -> Self {
            Self {
                address,
                host_id: Some(Uuid::new_v4()),
                datacenter,
                rack,
                release_version: None,
                down_marker: AtomicBool::new(false),
                pool: None,
                enabled_as_connected: AtomicBool::new(false),
            }
        }

        pub(crate) fn use_enabled_as_connected(&self) {
            self.enabled_as_connected.store(true, Ordering::SeqCst);
        }
    }

    /// Shorthand used by routing and load-balancing tests: node `id` lives
    /// at 255.255.255.255:`id`.
    pub(crate) fn id_to_invalid_addr(id: u16) -> SocketAddr {
        SocketAddr::from(([255, 255, 255, 255], id))
    }

    pub(crate) fn mock_node(id: u16, dc: Option<&str>, rack: Option<&str>) -> Arc<Node> {
        let node = Node::new_for_test(
            id_to_invalid_addr(id),
            dc.map(ToOwned::to_owned),
            rack.map(ToOwned::to_owned),
        );
        node.use_enabled_as_connected();
        Arc::new(node)
    }
}
