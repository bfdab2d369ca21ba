use super::{ChildLoadBalancingPolicy, LoadBalancingPolicy, Plan};
use crate::cluster::node::Node;
use crate::cluster::state::ClusterState;
use crate::routing::RoutingInfo;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tracing::trace;

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// A round-robin load balancing policy: all up nodes, with the starting
/// point rotated on every plan.
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan<'a>(&self, _request: &RoutingInfo, cluster: &'a ClusterState) -> Plan<'a> {
        let index = self.index.fetch_add(1, ORDER_TYPE);

        let nodes = cluster.up_nodes();
        let rotation = super::compute_rotation(index, nodes.len());
        let rotated_nodes: Vec<Arc<Node>> =
            super::slice_rotated_left(&nodes, rotation).cloned().collect();
        trace!(
            nodes = %rotated_nodes.len(),
            "RoundRobin plan"
        );

        Box::new(rotated_nodes.into_iter())
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

impl ChildLoadBalancingPolicy for RoundRobinPolicy {
    fn apply_child_policy(
        &self,
        mut plan: Vec<Arc<Node>>,
    ) -> Box<dyn Iterator<Item = Arc<Node>> + Send + Sync> {
        let index = self.index.fetch_add(1, ORDER_TYPE);

        let len = plan.len();
        plan.rotate_left(super::compute_rotation(index, len));
        Box::new(plan.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::load_balancing::tests::{
        get_plan_and_collect_node_identifiers, mock_cluster_state_for_round_robin_tests,
        EMPTY_ROUTING_INFO,
    };

    #[test]
    fn round_robin_rotates_plans() {
        let cluster = mock_cluster_state_for_round_robin_tests();

        let policy = RoundRobinPolicy::new();

        let plans = (0..6)
            .map(|_| {
                get_plan_and_collect_node_identifiers(&policy, &EMPTY_ROUTING_INFO, &cluster)
            })
            .collect::<Vec<_>>();

        let expected_plans = vec![
            vec![1, 2, 3, 4, 5],
            vec![2, 3, 4, 5, 1],
            vec![3, 4, 5, 1, 2],
            vec![4, 5, 1, 2, 3],
            vec![5, 1, 2, 3, 4],
            vec![1, 2, 3, 4, 5],
        ];

        assert_eq!(plans, expected_plans);
    }

    #[test]
    fn round_robin_skips_down_nodes() {
        let cluster = mock_cluster_state_for_round_robin_tests();
        cluster.known_peers().values().for_each(|node| {
            if node.address.port() == 2 {
                node.change_down_marker(true);
            }
        });

        let policy = RoundRobinPolicy::new();
        let plan = get_plan_and_collect_node_identifiers(&policy, &EMPTY_ROUTING_INFO, &cluster);
        assert_eq!(plan, vec![1, 3, 4, 5]);
    }
}
