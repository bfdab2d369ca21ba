//! Cluster topology: nodes, metadata, the host registry and the worker
//! that keeps it all current through the control connection.

pub(crate) mod control_connection;
pub(crate) mod events;
pub mod metadata;
pub mod node;
pub(crate) mod registry;
pub mod state;
pub(crate) mod worker;

pub use metadata::{Column, ColumnKind, Keyspace, Peer, Strategy, Table, UserDefinedType};
pub use node::{KnownNode, Node, NodeRef};
pub use state::ClusterState;

pub(crate) use worker::{Cluster, ClusterConfig};
