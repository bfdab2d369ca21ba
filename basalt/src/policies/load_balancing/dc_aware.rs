use super::{ChildLoadBalancingPolicy, LoadBalancingPolicy, Plan};
use crate::cluster::node::Node;
use crate::cluster::state::ClusterState;
use crate::routing::RoutingInfo;
use itertools::Itertools;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tracing::trace;

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// A datacenter-aware round-robin policy: nodes of the local datacenter
/// first (rotated), followed by at most `used_hosts_per_remote_dc` nodes
/// from each remote datacenter.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    index: AtomicUsize,
    local_dc: String,
    used_hosts_per_remote_dc: usize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            index: AtomicUsize::new(0),
            local_dc: local_dc.into(),
            used_hosts_per_remote_dc: 0,
        }
    }

    /// Allows using up to `count` nodes of each remote datacenter as a
    /// fallback after the local ones.
    pub fn with_used_hosts_per_remote_dc(mut self, count: usize) -> Self {
        self.used_hosts_per_remote_dc = count;
        self
    }

    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }

    fn is_local_node(&self, node: &Node) -> bool {
        node.datacenter.as_deref() == Some(self.local_dc.as_str())
    }

    fn pick_local_nodes(&self, cluster: &ClusterState) -> Vec<Arc<Node>> {
        cluster
            .up_nodes()
            .into_iter()
            .filter(|node| self.is_local_node(node))
            .collect()
    }

    /// Up to `used_hosts_per_remote_dc` nodes of every remote datacenter,
    /// datacenters in name order so plans stay stable.
    fn pick_remote_nodes(&self, cluster: &ClusterState) -> Vec<Arc<Node>> {
        if self.used_hosts_per_remote_dc == 0 {
            return Vec::new();
        }

        cluster
            .up_nodes()
            .into_iter()
            .filter(|node| !self.is_local_node(node) && node.datacenter.is_some())
            .into_group_map_by(|node| node.datacenter.clone().unwrap())
            .into_iter()
            .sorted_by(|(dc_a, _), (dc_b, _)| dc_a.cmp(dc_b))
            .flat_map(|(_dc, nodes)| nodes.into_iter().take(self.used_hosts_per_remote_dc))
            .collect()
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn plan<'a>(&self, _request: &RoutingInfo, cluster: &'a ClusterState) -> Plan<'a> {
        let index = self.index.fetch_add(1, ORDER_TYPE);

        let local_nodes = self.pick_local_nodes(cluster);
        let local_rotation = super::compute_rotation(index, local_nodes.len());
        let rotated_local_nodes: Vec<Arc<Node>> =
            super::slice_rotated_left(&local_nodes, local_rotation)
                .cloned()
                .collect();

        let remote_nodes = self.pick_remote_nodes(cluster);

        trace!(
            local_nodes = rotated_local_nodes.len(),
            remote_nodes = remote_nodes.len(),
            "DC-aware plan"
        );

        Box::new(rotated_local_nodes.into_iter().chain(remote_nodes))
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}

impl ChildLoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn apply_child_policy(
        &self,
        plan: Vec<Arc<Node>>,
    ) -> Box<dyn Iterator<Item = Arc<Node>> + Send + Sync> {
        let index = self.index.fetch_add(1, ORDER_TYPE);

        let (local_nodes, remote_nodes): (Vec<_>, Vec<_>) = plan
            .into_iter()
            .partition(|node| self.is_local_node(node));

        let local_rotation = super::compute_rotation(index, local_nodes.len());
        let mut reordered: Vec<Arc<Node>> =
            super::slice_rotated_left(&local_nodes, local_rotation)
                .cloned()
                .collect();
        reordered.extend(
            remote_nodes
                .into_iter()
                .take(self.used_hosts_per_remote_dc),
        );
        Box::new(reordered.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::load_balancing::tests::{
        get_plan_and_collect_node_identifiers, mock_cluster_state_for_round_robin_tests,
        EMPTY_ROUTING_INFO,
    };
    use std::collections::HashSet;

    #[test]
    fn dc_aware_local_nodes_first() {
        let cluster = mock_cluster_state_for_round_robin_tests();
        let policy = DcAwareRoundRobinPolicy::new("eu").with_used_hosts_per_remote_dc(2);

        let plans = (0..6)
            .map(|_| {
                get_plan_and_collect_node_identifiers(&policy, &EMPTY_ROUTING_INFO, &cluster)
            })
            .collect::<HashSet<_>>();

        // Local "eu" nodes (1, 2, 3) rotate in front; the remote "us" pair
        // follows.
        let expected_plans: HashSet<Vec<u16>> = [
            vec![1, 2, 3, 4, 5],
            vec![2, 3, 1, 4, 5],
            vec![3, 1, 2, 4, 5],
        ]
        .into_iter()
        .collect();

        assert_eq!(plans, expected_plans);
    }

    #[test]
    fn dc_aware_without_remote_nodes() {
        let cluster = mock_cluster_state_for_round_robin_tests();
        let policy = DcAwareRoundRobinPolicy::new("eu");

        let plans = (0..3)
            .map(|_| {
                get_plan_and_collect_node_identifiers(&policy, &EMPTY_ROUTING_INFO, &cluster)
            })
            .collect::<HashSet<_>>();

        let expected_plans: HashSet<Vec<u16>> =
            [vec![1, 2, 3], vec![2, 3, 1], vec![3, 1, 2]].into_iter().collect();

        assert_eq!(plans, expected_plans);
    }

    #[test]
    fn dc_aware_limits_hosts_per_remote_dc() {
        let cluster = mock_cluster_state_for_round_robin_tests();
        let policy = DcAwareRoundRobinPolicy::new("eu").with_used_hosts_per_remote_dc(1);

        let plan = get_plan_and_collect_node_identifiers(&policy, &EMPTY_ROUTING_INFO, &cluster);
        // Exactly one "us" node may appear, after all local nodes.
        assert_eq!(plan.len(), 4);
        assert!(plan[3] == 4 || plan[3] == 5);
    }
}
