//! Replica location: an immutable snapshot mapping (keyspace, token) to the
//! ordered list of replicas owning that token.

use itertools::Itertools;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::cluster::metadata::Strategy;
use crate::cluster::node::Node;
use crate::routing::{Token, TokenRing};

static EMPTY_REPLICA_LIST: Vec<Arc<Node>> = Vec::new();

/// Per-datacenter view of the ring.
#[derive(Debug, Clone)]
struct DatacenterInfo {
    unique_nodes: Vec<Arc<Node>>,
    /// Number of distinct racks; nodes with no rack count as one rack.
    rack_count: usize,
}

/// An immutable snapshot of the token ring with precomputed replica lists.
///
/// For every keyspace the replica list of each ring segment is computed
/// once at build time, so a lookup is a binary search plus a slice borrow.
/// Rebuilt wholesale whenever the host/token set or keyspace replication
/// changes; readers always see a single consistent snapshot.
#[derive(Debug, Clone)]
pub struct ReplicaLocator {
    ring: TokenRing<Arc<Node>>,
    unique_nodes: Vec<Arc<Node>>,
    datacenters: HashMap<String, DatacenterInfo>,
    /// keyspace -> per-ring-segment replica lists, parallel to the sorted ring.
    keyspace_replicas: HashMap<String, Vec<Vec<Arc<Node>>>>,
}

impl ReplicaLocator {
    pub(crate) fn new(
        ring_iter: impl Iterator<Item = (Token, Arc<Node>)>,
        keyspace_strategies: &HashMap<String, Strategy>,
    ) -> Self {
        let ring = TokenRing::new(ring_iter);

        let unique_nodes: Vec<Arc<Node>> =
            ring.iter().map(|(_t, n)| n).unique().cloned().collect();

        let mut datacenters: HashMap<String, DatacenterInfo> = HashMap::new();
        for node in unique_nodes.iter() {
            if let Some(dc) = node.datacenter.as_deref() {
                let info = datacenters.entry(dc.to_owned()).or_insert(DatacenterInfo {
                    unique_nodes: Vec::new(),
                    rack_count: 0,
                });
                info.unique_nodes.push(node.clone());
            }
        }
        for info in datacenters.values_mut() {
            info.rack_count = info
                .unique_nodes
                .iter()
                .map(|node| node.rack.as_deref())
                .unique()
                .count();
        }

        let mut locator = Self {
            ring,
            unique_nodes,
            datacenters,
            keyspace_replicas: HashMap::new(),
        };

        let mut keyspace_replicas = HashMap::with_capacity(keyspace_strategies.len());
        for (keyspace_name, strategy) in keyspace_strategies {
            let per_segment: Vec<Vec<Arc<Node>>> = locator
                .ring
                .iter()
                .map(|(token, _node)| locator.compute_replicas(strategy, *token))
                .collect();
            keyspace_replicas.insert(keyspace_name.clone(), per_segment);
        }
        locator.keyspace_replicas = keyspace_replicas;

        locator
    }

    pub(crate) fn new_empty() -> Self {
        Self {
            ring: TokenRing::new_empty(),
            unique_nodes: Vec::new(),
            datacenters: HashMap::new(),
            keyspace_replicas: HashMap::new(),
        }
    }

    /// The precomputed replica list for the given keyspace and token.
    /// Unknown keyspaces yield an empty list.
    pub fn replicas(&self, keyspace: &str, token: Token) -> &[Arc<Node>] {
        let per_segment = match self.keyspace_replicas.get(keyspace) {
            Some(per_segment) => per_segment,
            None => return &EMPTY_REPLICA_LIST,
        };
        match self.ring.segment_index(token) {
            Some(idx) => &per_segment[idx],
            None => &EMPTY_REPLICA_LIST,
        }
    }

    pub fn ring(&self) -> &TokenRing<Arc<Node>> {
        &self.ring
    }

    /// All distinct nodes present on the ring, in ring order of first
    /// appearance.
    pub fn unique_nodes_in_global_ring(&self) -> &[Arc<Node>] {
        &self.unique_nodes
    }

    pub fn unique_nodes_in_datacenter(&self, datacenter: &str) -> Option<&[Arc<Node>]> {
        self.datacenters
            .get(datacenter)
            .map(|dc| dc.unique_nodes.as_slice())
    }

    pub fn datacenter_names(&self) -> impl Iterator<Item = &str> {
        self.datacenters.keys().map(String::as_str)
    }

    fn compute_replicas(&self, strategy: &Strategy, token: Token) -> Vec<Arc<Node>> {
        match strategy {
            Strategy::SimpleStrategy { replication_factor } => {
                self.simple_strategy_replicas(token, *replication_factor)
            }
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => self.network_topology_strategy_replicas(token, datacenter_repfactors),
            // LocalStrategy and unrecognized strategies degrade to a single
            // replica: the ring owner.
            Strategy::LocalStrategy | Strategy::Other { .. } => {
                self.simple_strategy_replicas(token, 1)
            }
        }
    }

    /// SimpleStrategy: walk the ring clockwise, take the next RF distinct
    /// nodes.
    fn simple_strategy_replicas(&self, token: Token, replication_factor: usize) -> Vec<Arc<Node>> {
        let num_to_take = std::cmp::min(replication_factor, self.unique_nodes.len());
        self.ring
            .ring_range(token)
            .unique()
            .take(num_to_take)
            .cloned()
            .collect()
    }

    /// NetworkTopologyStrategy: per datacenter, walk the ring clockwise
    /// taking that datacenter's nodes until its RF is satisfied, skipping
    /// nodes on already-used racks while distinct racks remain. Datacenter
    /// groups are concatenated in the order each datacenter is first
    /// encountered on the walk.
    fn network_topology_strategy_replicas(
        &self,
        token: Token,
        datacenter_repfactors: &HashMap<String, usize>,
    ) -> Vec<Arc<Node>> {
        let mut dc_order: Vec<&str> = Vec::with_capacity(datacenter_repfactors.len());
        let mut picks: HashMap<&str, Vec<Arc<Node>>> = HashMap::new();
        let mut used_racks: HashMap<&str, BTreeSet<Option<&str>>> = HashMap::new();
        let mut acceptable_repeats: HashMap<&str, usize> = datacenter_repfactors
            .iter()
            .map(|(dc, rf)| {
                let rack_count = self
                    .datacenters
                    .get(dc)
                    .map(|info| info.rack_count)
                    .unwrap_or(0);
                (dc.as_str(), rf.saturating_sub(rack_count))
            })
            .collect();

        let desired_result_len: usize = datacenter_repfactors.values().sum();
        let mut picked_total = 0;

        for node in self.ring.ring_range(token).unique() {
            let dc = match node.datacenter.as_deref() {
                Some(dc) => dc,
                None => continue,
            };
            let repfactor = match datacenter_repfactors.get(dc) {
                Some(rf) => *rf,
                None => continue,
            };

            let dc_key = match datacenter_repfactors.get_key_value(dc) {
                Some((key, _)) => key.as_str(),
                None => continue,
            };

            let dc_picks = picks.entry(dc_key).or_default();
            if dc_picks.len() == repfactor {
                continue;
            }

            let rack = node.rack.as_deref();
            let racks = used_racks.entry(dc_key).or_default();
            if !racks.contains(&rack) {
                racks.insert(rack);
            } else {
                let repeats = acceptable_repeats.get_mut(dc_key).unwrap();
                if *repeats == 0 {
                    continue;
                }
                *repeats -= 1;
            }

            if dc_picks.is_empty() {
                dc_order.push(dc_key);
            }
            dc_picks.push(node.clone());
            picked_total += 1;

            if picked_total == desired_result_len {
                break;
            }
        }

        let mut result = Vec::with_capacity(picked_total);
        for dc in dc_order {
            if let Some(dc_picks) = picks.remove(dc) {
                result.extend(dc_picks);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::tests::mock_node;

    fn ring_of(entries: &[(i64, &Arc<Node>)]) -> impl Iterator<Item = (Token, Arc<Node>)> {
        entries
            .iter()
            .map(|(token, node)| (Token::new(*token), Arc::clone(node)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn addresses(replicas: &[Arc<Node>]) -> Vec<u16> {
        replicas.iter().map(|node| node.address.port()).collect()
    }

    #[test]
    fn simple_strategy_walks_ring_clockwise() {
        let a = mock_node(1, None, None);
        let b = mock_node(2, None, None);
        let c = mock_node(3, None, None);

        let keyspaces: HashMap<String, Strategy> = [(
            "ks".to_string(),
            Strategy::SimpleStrategy {
                replication_factor: 2,
            },
        )]
        .into_iter()
        .collect();

        let locator = ReplicaLocator::new(
            ring_of(&[(10, &a), (20, &b), (30, &c)]),
            &keyspaces,
        );

        // Token 15 falls between A and B: the walk starts at B.
        assert_eq!(addresses(locator.replicas("ks", Token::new(15))), vec![2, 3]);
        // Exact token boundary belongs to its owner.
        assert_eq!(addresses(locator.replicas("ks", Token::new(10))), vec![1, 2]);
        // Wrap-around past the highest token.
        assert_eq!(addresses(locator.replicas("ks", Token::new(35))), vec![1, 2]);
        // Unknown keyspace -> no replicas.
        assert!(locator.replicas("unknown", Token::new(15)).is_empty());
    }

    #[test]
    fn simple_strategy_caps_at_node_count() {
        let a = mock_node(1, None, None);
        let b = mock_node(2, None, None);

        let keyspaces: HashMap<String, Strategy> = [(
            "ks".to_string(),
            Strategy::SimpleStrategy {
                replication_factor: 5,
            },
        )]
        .into_iter()
        .collect();

        let locator = ReplicaLocator::new(ring_of(&[(10, &a), (20, &b), (30, &a)]), &keyspaces);

        assert_eq!(addresses(locator.replicas("ks", Token::new(0))), vec![1, 2]);
    }

    #[test]
    fn network_topology_strategy_one_per_dc() {
        let a = mock_node(1, Some("dc1"), None);
        let b = mock_node(2, Some("dc2"), None);
        let c = mock_node(3, Some("dc1"), None);
        let d = mock_node(4, Some("dc2"), None);

        let keyspaces: HashMap<String, Strategy> = [(
            "ks".to_string(),
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("dc1".to_string(), 1), ("dc2".to_string(), 1)]
                    .into_iter()
                    .collect(),
            },
        )]
        .into_iter()
        .collect();

        let locator = ReplicaLocator::new(
            ring_of(&[(10, &a), (20, &b), (30, &c), (40, &d)]),
            &keyspaces,
        );

        // First dc1 node clockwise from 0 is A, first dc2 node is B; dc1
        // comes first because its replica appears first on the walk.
        assert_eq!(addresses(locator.replicas("ks", Token::new(0))), vec![1, 2]);
        // Starting at 15 the walk sees B(dc2) first.
        assert_eq!(addresses(locator.replicas("ks", Token::new(15))), vec![2, 3]);
    }

    #[test]
    fn network_topology_strategy_prefers_distinct_racks() {
        // dc1 has two racks; with RF=2 replicas must come from both even
        // though r1 nodes appear first on the ring.
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        let c = mock_node(3, Some("dc1"), Some("r2"));

        let keyspaces: HashMap<String, Strategy> = [(
            "ks".to_string(),
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("dc1".to_string(), 2)].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect();

        let locator = ReplicaLocator::new(
            ring_of(&[(10, &a), (20, &b), (30, &c)]),
            &keyspaces,
        );

        assert_eq!(addresses(locator.replicas("ks", Token::new(0))), vec![1, 3]);
    }

    #[test]
    fn network_topology_strategy_allows_rack_repeats_when_needed() {
        // dc1 has one rack but RF=2; both replicas must share the rack.
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));

        let keyspaces: HashMap<String, Strategy> = [(
            "ks".to_string(),
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("dc1".to_string(), 2)].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect();

        let locator = ReplicaLocator::new(ring_of(&[(10, &a), (20, &b)]), &keyspaces);

        assert_eq!(addresses(locator.replicas("ks", Token::new(0))), vec![1, 2]);
    }

    #[test]
    fn replica_lookup_is_deterministic_across_rebuilds() {
        let a = mock_node(1, Some("dc1"), None);
        let b = mock_node(2, Some("dc2"), None);
        let c = mock_node(3, Some("dc1"), None);

        let keyspaces: HashMap<String, Strategy> = [
            (
                "simple".to_string(),
                Strategy::SimpleStrategy {
                    replication_factor: 2,
                },
            ),
            (
                "nts".to_string(),
                Strategy::NetworkTopologyStrategy {
                    datacenter_repfactors: [("dc1".to_string(), 2), ("dc2".to_string(), 1)]
                        .into_iter()
                        .collect(),
                },
            ),
        ]
        .into_iter()
        .collect();

        let build = || {
            ReplicaLocator::new(
                ring_of(&[(10, &a), (20, &b), (30, &c), (40, &a)]),
                &keyspaces,
            )
        };
        let locator_x = build();
        let locator_y = build();

        for token in [-100, 0, 10, 15, 25, 35, 45, 1000] {
            for ks in ["simple", "nts"] {
                assert_eq!(
                    addresses(locator_x.replicas(ks, Token::new(token))),
                    addresses(locator_y.replicas(ks, Token::new(token))),
                );
            }
        }
    }

    #[test]
    fn local_and_unknown_strategies_degrade_to_ring_owner() {
        let a = mock_node(1, None, None);
        let b = mock_node(2, None, None);

        let keyspaces: HashMap<String, Strategy> = [
            ("local".to_string(), Strategy::LocalStrategy),
            (
                "other".to_string(),
                Strategy::Other {
                    name: "com.example.CustomStrategy".to_string(),
                    data: HashMap::new(),
                },
            ),
        ]
        .into_iter()
        .collect();

        let locator = ReplicaLocator::new(ring_of(&[(10, &a), (20, &b)]), &keyspaces);

        assert_eq!(addresses(locator.replicas("local", Token::new(15))), vec![2]);
        assert_eq!(addresses(locator.replicas("other", Token::new(5))), vec![1]);
    }
}
