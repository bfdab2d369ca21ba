//! Load-balancing policies produce, per request, a *query plan*: a lazy,
//! finite sequence of distinct up nodes to try in order.

mod dc_aware;
mod round_robin;
mod token_aware;

use std::sync::Arc;

use crate::cluster::node::Node;
use crate::cluster::state::ClusterState;
use crate::routing::RoutingInfo;

pub use dc_aware::DcAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// A lazy sequence of candidate nodes for one request. The executor stops
/// consuming as soon as an attempt succeeds.
pub type Plan<'a> = Box<dyn Iterator<Item = Arc<Node>> + Send + Sync + 'a>;

/// Produces a query plan for each request.
pub trait LoadBalancingPolicy: Send + Sync {
    fn plan<'a>(&self, request: &RoutingInfo, cluster: &'a ClusterState) -> Plan<'a>;

    fn name(&self) -> String;
}

/// A policy that can also reorder a replica list handed to it by a
/// wrapping policy (see [TokenAwarePolicy]).
pub trait ChildLoadBalancingPolicy: LoadBalancingPolicy {
    fn apply_child_policy(
        &self,
        plan: Vec<Arc<Node>>,
    ) -> Box<dyn Iterator<Item = Arc<Node>> + Send + Sync>;
}

// Does safe modulo and additionally returns 0 for empty collections.
fn compute_rotation(index: usize, collection_len: usize) -> usize {
    if collection_len != 0 {
        index % collection_len
    } else {
        0
    }
}

// Rotates the slice to the left by `mid` positions, lazily.
fn slice_rotated_left<T>(slice: &[T], mid: usize) -> impl Iterator<Item = &T> + Clone {
    slice[mid..].iter().chain(slice[..mid].iter())
}
