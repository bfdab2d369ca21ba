use super::{ChildLoadBalancingPolicy, LoadBalancingPolicy, Plan};
use crate::cluster::node::Node;
use crate::cluster::state::ClusterState;
use crate::routing::RoutingInfo;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

/// A wrapper policy that adds token awareness to a child policy.
///
/// When the request carries a token and a keyspace, the replicas owning
/// that token come first - shuffled among themselves so reads spread over
/// replicas - followed by the child policy's plan minus the nodes already
/// listed. Requests without routing information fall through to the child
/// policy unchanged.
pub struct TokenAwarePolicy {
    child_policy: Box<dyn ChildLoadBalancingPolicy>,
    shuffle_replicas: bool,
}

impl TokenAwarePolicy {
    pub fn new(child_policy: Box<dyn ChildLoadBalancingPolicy>) -> Self {
        Self {
            child_policy,
            shuffle_replicas: true,
        }
    }

    /// Disables replica shuffling; used by tests that assert exact plans.
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle_replicas = false;
        self
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn plan<'a>(&self, request: &RoutingInfo, cluster: &'a ClusterState) -> Plan<'a> {
        let (token, keyspace) = match (request.token, request.keyspace.as_deref()) {
            (Some(token), Some(keyspace)) => (token, keyspace),
            _ => return self.child_policy.plan(request, cluster),
        };

        let mut replicas: Vec<Arc<Node>> = cluster
            .replica_locator()
            .replicas(keyspace, token)
            .iter()
            .filter(|node| node.is_up())
            .cloned()
            .collect();
        if self.shuffle_replicas {
            replicas.shuffle(&mut thread_rng());
        }

        let listed: HashSet<SocketAddr> = replicas.iter().map(|node| node.address).collect();
        let fallback = self
            .child_policy
            .plan(request, cluster)
            .filter(move |node| !listed.contains(&node.address));

        Box::new(replicas.into_iter().chain(fallback))
    }

    fn name(&self) -> String {
        format!(
            "TokenAwarePolicy{{child_policy: {}}}",
            self.child_policy.name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::metadata::Strategy;
    use crate::cluster::node::tests::mock_node;
    use crate::cluster::state::ClusterState;
    use crate::policies::load_balancing::tests::get_plan_and_collect_node_identifiers;
    use crate::policies::load_balancing::{DcAwareRoundRobinPolicy, RoundRobinPolicy};
    use crate::routing::{RoutingInfo, Token};
    use std::collections::HashMap;

    // Three nodes in one datacenter; ring:
    // tokens:   50 100 150 200 250 300 400 500
    // node ids: 2  1   2   3   1   2   3   1
    fn mock_cluster_state_for_token_aware_tests() -> ClusterState {
        let n1 = mock_node(1, Some("eu"), None);
        let n2 = mock_node(2, Some("eu"), None);
        let n3 = mock_node(3, Some("us"), None);

        let ring = vec![
            (Token::new(50), n2.clone()),
            (Token::new(100), n1.clone()),
            (Token::new(150), n2.clone()),
            (Token::new(200), n3.clone()),
            (Token::new(250), n1.clone()),
            (Token::new(300), n2.clone()),
            (Token::new(400), n3.clone()),
            (Token::new(500), n1.clone()),
        ];

        let keyspaces: HashMap<String, Strategy> = [
            (
                "simple_rf2".to_string(),
                Strategy::SimpleStrategy {
                    replication_factor: 2,
                },
            ),
            (
                "simple_rf3".to_string(),
                Strategy::SimpleStrategy {
                    replication_factor: 3,
                },
            ),
        ]
        .into_iter()
        .collect();

        ClusterState::new_for_test(vec![n1, n2, n3], ring, keyspaces)
    }

    #[test]
    fn token_aware_prepends_replicas() {
        let cluster = mock_cluster_state_for_token_aware_tests();

        struct Test {
            request: RoutingInfo,
            expected_replicas: usize,
        }

        let tests = [
            Test {
                request: RoutingInfo {
                    token: Some(Token::new(160)),
                    keyspace: Some("simple_rf2".into()),
                },
                expected_replicas: 2,
            },
            Test {
                request: RoutingInfo {
                    token: Some(Token::new(60)),
                    keyspace: Some("simple_rf3".into()),
                },
                expected_replicas: 3,
            },
        ];

        for test in &tests {
            let policy =
                TokenAwarePolicy::new(Box::new(RoundRobinPolicy::new())).without_shuffle();
            let plan = get_plan_and_collect_node_identifiers(&policy, &test.request, &cluster);

            // All nodes appear exactly once: replicas first, then the rest.
            assert_eq!(plan.len(), 3);
            let mut sorted = plan.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![1, 2, 3]);

            let replicas: Vec<u16> = cluster
                .replica_locator()
                .replicas(
                    test.request.keyspace.as_deref().unwrap(),
                    test.request.token.unwrap(),
                )
                .iter()
                .map(|node| node.address.port())
                .collect();
            assert_eq!(replicas.len(), test.expected_replicas);
            assert_eq!(&plan[..test.expected_replicas], &replicas[..]);
        }
    }

    #[test]
    fn token_aware_exact_replica_order() {
        let cluster = mock_cluster_state_for_token_aware_tests();

        let policy = TokenAwarePolicy::new(Box::new(RoundRobinPolicy::new())).without_shuffle();

        // Token 160 falls before 200(node 3); walk: 3, 1, ...
        let request = RoutingInfo {
            token: Some(Token::new(160)),
            keyspace: Some("simple_rf2".into()),
        };
        let plan = get_plan_and_collect_node_identifiers(&policy, &request, &cluster);
        assert_eq!(&plan[..2], &[3, 1]);
    }

    #[test]
    fn token_aware_falls_through_without_routing_info() {
        let cluster = mock_cluster_state_for_token_aware_tests();
        let policy = TokenAwarePolicy::new(Box::new(RoundRobinPolicy::new())).without_shuffle();

        // No token: the child policy's plan is returned as-is.
        let request = RoutingInfo {
            token: None,
            keyspace: Some("simple_rf2".into()),
        };
        let plan = get_plan_and_collect_node_identifiers(&policy, &request, &cluster);
        assert_eq!(plan.len(), 3);

        // Unknown keyspace: replica list is empty, child plan still covers
        // all nodes.
        let request = RoutingInfo {
            token: Some(Token::new(160)),
            keyspace: Some("no_such_keyspace".into()),
        };
        let plan = get_plan_and_collect_node_identifiers(&policy, &request, &cluster);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn token_aware_skips_down_replicas() {
        let cluster = mock_cluster_state_for_token_aware_tests();
        // Mark node 3 down.
        cluster
            .known_peers()
            .values()
            .find(|node| node.address.port() == 3)
            .unwrap()
            .change_down_marker(true);

        let policy = TokenAwarePolicy::new(Box::new(RoundRobinPolicy::new())).without_shuffle();
        let request = RoutingInfo {
            token: Some(Token::new(160)),
            keyspace: Some("simple_rf2".into()),
        };
        let plan = get_plan_and_collect_node_identifiers(&policy, &request, &cluster);
        // Node 3 is a replica but down; only up nodes may appear.
        assert!(!plan.contains(&3));
    }

    #[test]
    fn token_aware_with_dc_aware_child() {
        let cluster = mock_cluster_state_for_token_aware_tests();
        let policy = TokenAwarePolicy::new(Box::new(
            DcAwareRoundRobinPolicy::new("eu").with_used_hosts_per_remote_dc(1),
        ))
        .without_shuffle();

        let request = RoutingInfo {
            token: Some(Token::new(60)),
            keyspace: Some("simple_rf2".into()),
        };
        // Replicas of token 60: walk from 100 -> nodes 1, 2.
        let plan = get_plan_and_collect_node_identifiers(&policy, &request, &cluster);
        assert_eq!(&plan[..2], &[1, 2]);
    }
}
