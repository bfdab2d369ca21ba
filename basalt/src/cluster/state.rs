//! An immutable snapshot of the cluster as seen at one point in time:
//! nodes, keyspaces and the token-to-replica mapping. Published wholesale
//! by the cluster worker via an atomic pointer swap; readers never block.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::metadata::{Keyspace, Metadata, Strategy};
use crate::cluster::node::Node;
use crate::routing::locator::ReplicaLocator;
use crate::routing::partitioner::PartitionerName;
use crate::routing::{RoutingInfo, Token};

pub struct ClusterState {
    pub(crate) known_peers: HashMap<SocketAddr, Arc<Node>>,
    keyspaces: HashMap<String, Keyspace>,
    locator: ReplicaLocator,
    partitioner: PartitionerName,
    all_nodes: Vec<Arc<Node>>,
    cluster_name: Option<String>,
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("cluster_name", &self.cluster_name)
            .field("nodes", &self.all_nodes.len())
            .field("keyspaces", &self.keyspaces.len())
            .finish_non_exhaustive()
    }
}

impl ClusterState {
    /// Builds a snapshot out of freshly read metadata and the node handles
    /// (which carry the pools and down markers and survive across
    /// snapshots).
    pub(crate) fn new(metadata: &Metadata, nodes: &HashMap<SocketAddr, Arc<Node>>) -> Self {
        let ring_iter = metadata.peers.iter().flat_map(|peer| {
            let node = nodes.get(&peer.address).cloned();
            peer.tokens.iter().filter_map(move |token| {
                node.as_ref().map(|node| (*token, node.clone()))
            })
        });

        let keyspace_strategies: HashMap<String, Strategy> = metadata
            .keyspaces
            .iter()
            .map(|(name, keyspace)| (name.clone(), keyspace.strategy.clone()))
            .collect();

        let locator = ReplicaLocator::new(ring_iter, &keyspace_strategies);

        // Stable node ordering: ring order of first appearance, then any
        // node that (unusually) owns no tokens.
        let mut all_nodes: Vec<Arc<Node>> = locator.unique_nodes_in_global_ring().to_vec();
        for node in nodes.values() {
            if !all_nodes.iter().any(|n| n.address == node.address) {
                all_nodes.push(node.clone());
            }
        }

        Self {
            known_peers: nodes.clone(),
            keyspaces: metadata.keyspaces.clone(),
            locator,
            partitioner: metadata.partitioner.clone(),
            all_nodes,
            cluster_name: metadata.cluster_name.clone(),
        }
    }

    pub(crate) fn new_empty() -> Self {
        Self {
            known_peers: HashMap::new(),
            keyspaces: HashMap::new(),
            locator: ReplicaLocator::new_empty(),
            partitioner: PartitionerName::default(),
            all_nodes: Vec::new(),
            cluster_name: None,
        }
    }

    /// The name of the cluster, as reported by `system.local`.
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    /// All known nodes.
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    pub(crate) fn known_peers(&self) -> &HashMap<SocketAddr, Arc<Node>> {
        &self.known_peers
    }

    /// All nodes currently marked up, in stable order.
    pub(crate) fn up_nodes(&self) -> Vec<Arc<Node>> {
        self.all_nodes
            .iter()
            .filter(|node| node.is_up())
            .cloned()
            .collect()
    }

    /// Keyspace schemas known to this snapshot.
    pub fn keyspaces(&self) -> &HashMap<String, Keyspace> {
        &self.keyspaces
    }

    pub fn replica_locator(&self) -> &ReplicaLocator {
        &self.locator
    }

    pub(crate) fn partitioner(&self) -> &PartitionerName {
        &self.partitioner
    }

    /// Replicas holding the given token in the given keyspace.
    pub fn replicas_for_token(&self, keyspace: &str, token: Token) -> Vec<Arc<Node>> {
        self.locator.replicas(keyspace, token).to_vec()
    }

    /// The nodes a request with this routing info would prefer, in replica
    /// order.
    pub fn endpoints_for(&self, routing: &RoutingInfo) -> Vec<Arc<Node>> {
        match (routing.token, routing.keyspace.as_deref()) {
            (Some(token), Some(keyspace)) => self.replicas_for_token(keyspace, token),
            _ => Vec::new(),
        }
    }

    pub(crate) async fn wait_until_all_pools_are_initialized(&self) {
        for node in &self.all_nodes {
            node.wait_until_pool_initialized().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(
        nodes: Vec<Arc<Node>>,
        ring: Vec<(Token, Arc<Node>)>,
        keyspace_strategies: HashMap<String, Strategy>,
    ) -> Self {
        use itertools::Itertools;

        let locator = ReplicaLocator::new(ring.into_iter(), &keyspace_strategies);
        let keyspaces = keyspace_strategies
            .into_iter()
            .map(|(name, strategy)| {
                (
                    name,
                    Keyspace {
                        strategy,
                        tables: HashMap::new(),
                        user_defined_types: HashMap::new(),
                    },
                )
            })
            .collect();
        Self {
            known_peers: nodes
                .iter()
                .map(|node| (node.address, node.clone()))
                .collect(),
            keyspaces,
            locator,
            partitioner: PartitionerName::default(),
            all_nodes: nodes.into_iter().unique_by(|node| node.address).collect(),
            cluster_name: Some("test-cluster".to_string()),
        }
    }
}
