//! Cluster metadata: topology (peers, tokens) and schema (keyspaces,
//! tables, user defined types), together with the reader that keeps it
//! current over the control connection.

use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::cluster::control_connection::ControlConnection;
use crate::errors::{NewSessionError, QueryError};
use crate::network::connection::{open_connection, ConnectionConfig};
use crate::policies::address_translator::AddressTranslator;
use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;
use basalt_cql::frame::response::event::Event;

/// Everything fetched from the cluster in one metadata read.
#[derive(Debug)]
pub(crate) struct Metadata {
    pub(crate) peers: Vec<Peer>,
    pub(crate) keyspaces: HashMap<String, Keyspace>,
    pub(crate) partitioner: PartitionerName,
    pub(crate) cluster_name: Option<String>,
}

/// A node of the cluster, as described by `system.local`/`system.peers`.
#[derive(Debug, Clone)]
pub struct Peer {
    pub host_id: Option<Uuid>,
    pub address: SocketAddr,
    pub tokens: Vec<Token>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub release_version: Option<String>,
}

/// The endpoint attributes of a peer, without its token list.
#[derive(Debug, Clone)]
pub(crate) struct PeerEndpoint {
    pub(crate) host_id: Option<Uuid>,
    pub(crate) address: SocketAddr,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
    pub(crate) release_version: Option<String>,
}

impl Peer {
    pub(crate) fn to_peer_endpoint(&self) -> PeerEndpoint {
        PeerEndpoint {
            host_id: self.host_id,
            address: self.address,
            datacenter: self.datacenter.clone(),
            rack: self.rack.clone(),
            release_version: self.release_version.clone(),
        }
    }
}

/// A keyspace and the parts of its schema the driver tracks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keyspace {
    /// Replication strategy used by the keyspace.
    pub strategy: Strategy,
    /// Tables in the keyspace; empty when schema fetching is disabled.
    pub tables: HashMap<String, Table>,
    /// User defined types in the keyspace; empty when schema fetching is
    /// disabled.
    pub user_defined_types: HashMap<String, UserDefinedType>,
}

/// A table's column layout.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Table {
    pub columns: HashMap<String, Column>,
    /// Names of the partition key columns, in key order.
    pub partition_key: Vec<String>,
    /// Names of the clustering key columns, in key order.
    pub clustering_key: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    /// The CQL type of the column, as its source text.
    pub type_text: String,
    pub kind: ColumnKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Regular,
    Static,
    Clustering,
    PartitionKey,
}

impl std::str::FromStr for ColumnKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "static" => Ok(Self::Static),
            "clustering" => Ok(Self::Clustering),
            "partition_key" => Ok(Self::PartitionKey),
            _ => Err(()),
        }
    }
}

/// A user defined type: field names and their type texts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDefinedType {
    pub name: String,
    pub field_names: Vec<String>,
    pub field_types: Vec<String>,
}

/// Replication strategy of a keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Strategy {
    /// Replicas are the next RF distinct nodes on the ring, topology
    /// ignored.
    SimpleStrategy {
        replication_factor: usize,
    },
    /// Per-datacenter replication factors; replicas spread over racks.
    NetworkTopologyStrategy {
        /// Replication factors of datacenters with given names.
        datacenter_repfactors: HashMap<String, usize>,
    },
    /// Used by system keyspaces.
    LocalStrategy,
    /// A strategy the driver does not recognize.
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

pub(crate) fn strategy_from_string_map(
    mut strategy_map: HashMap<String, String>,
) -> Result<Strategy, QueryError> {
    let strategy_name = strategy_map
        .remove("class")
        .ok_or(QueryError::ProtocolError(
            "replication map should have a 'class' field",
        ))?;

    let strategy = match strategy_name.as_str() {
        name if name.ends_with("SimpleStrategy") => {
            let replication_factor: usize = strategy_map
                .remove("replication_factor")
                .ok_or(QueryError::ProtocolError(
                    "SimpleStrategy replication map misses a replication factor",
                ))?
                .parse()
                .map_err(|_| {
                    QueryError::ProtocolError("replication factor could not be parsed as unsigned")
                })?;
            Strategy::SimpleStrategy { replication_factor }
        }
        name if name.ends_with("NetworkTopologyStrategy") => {
            let mut datacenter_repfactors: HashMap<String, usize> =
                HashMap::with_capacity(strategy_map.len());
            for (datacenter, repfactor) in strategy_map.drain() {
                let repfactor: usize = match repfactor.parse() {
                    Ok(repfactor) => repfactor,
                    Err(_) => {
                        return Err(QueryError::ProtocolError(
                            "replication factor could not be parsed as unsigned",
                        ))
                    }
                };
                datacenter_repfactors.insert(datacenter, repfactor);
            }
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        name if name.ends_with("LocalStrategy") => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: strategy_name,
            data: strategy_map,
        },
    };

    Ok(strategy)
}

impl Metadata {
    /// Dummy metadata built from the contact points alone, used when the
    /// initial metadata read fails so the session can still come up.
    pub(crate) fn new_dummy(contact_points: &[SocketAddr]) -> Self {
        let peers = contact_points
            .iter()
            .enumerate()
            .map(|(id, address)| {
                // Given N nodes, divide the ring into N roughly equal parts
                // and assign them to each node.
                let token = ((id as u128) << 64) / contact_points.len() as u128;

                Peer {
                    address: *address,
                    tokens: vec![Token::new(token as i64)],
                    datacenter: None,
                    rack: None,
                    host_id: None,
                    release_version: None,
                }
            })
            .collect();

        Metadata {
            peers,
            keyspaces: HashMap::new(),
            partitioner: PartitionerName::default(),
            cluster_name: None,
        }
    }
}

pub(crate) struct WorkingControlConnection {
    pub(crate) connection: ControlConnection,
    pub(crate) error_receiver: crate::network::connection::ErrorReceiver,
}

pub(crate) enum ControlConnectionState {
    Working(WorkingControlConnection),
    Broken,
}

/// Owns the control connection and reads metadata through it, re-homing
/// the connection onto another peer when the current one fails.
pub(crate) struct MetadataReader {
    control_connection_config: ConnectionConfig,

    control_connection_endpoint: SocketAddr,
    control_connection_state: ControlConnectionState,

    // When the control connection fails, the reader connects to one of
    // these, in shuffled order.
    known_peers: Vec<SocketAddr>,
    // When no known peer is reachable, the initial contact points are the
    // fallback of last resort.
    initial_contact_points: Vec<SocketAddr>,

    keyspaces_to_fetch: Vec<String>,
    fetch_schema: bool,
    address_translator: Option<Arc<dyn AddressTranslator>>,
}

impl MetadataReader {
    /// Creates a new reader and opens the initial control connection.
    pub(crate) async fn new(
        contact_points: Vec<SocketAddr>,
        mut connection_config: ConnectionConfig,
        server_event_sender: mpsc::Sender<Event>,
        keyspaces_to_fetch: Vec<String>,
        fetch_schema: bool,
        address_translator: Option<Arc<dyn AddressTranslator>>,
    ) -> Result<Self, NewSessionError> {
        if contact_points.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let control_connection_endpoint = *contact_points
            .choose(&mut thread_rng())
            .expect("nonempty by the check above");

        // An event sender in the connection config makes the connection
        // REGISTER for server events and forward them into the channel.
        connection_config.event_sender = Some(server_event_sender);

        let control_connection_state = match Self::make_control_connection(
            control_connection_endpoint,
            &connection_config,
        )
        .await
        {
            Ok(working) => ControlConnectionState::Working(working),
            Err(err) => {
                warn!(
                    "Failed to open initial control connection to {}: {}",
                    control_connection_endpoint, err
                );
                ControlConnectionState::Broken
            }
        };

        Ok(MetadataReader {
            control_connection_config: connection_config,
            control_connection_endpoint,
            control_connection_state,
            known_peers: contact_points.clone(),
            initial_contact_points: contact_points,
            keyspaces_to_fetch,
            fetch_schema,
            address_translator,
        })
    }

    /// Resolves when the current control connection breaks; pending when
    /// it is already broken (the next `read_metadata` will re-home it).
    pub(crate) async fn wait_until_control_connection_breaks(&mut self) {
        match &mut self.control_connection_state {
            ControlConnectionState::Working(working) => {
                let _ = (&mut working.error_receiver).await;
                debug!(
                    "Control connection to {} broke",
                    self.control_connection_endpoint
                );
                self.control_connection_state = ControlConnectionState::Broken;
            }
            ControlConnectionState::Broken => std::future::pending().await,
        }
    }

    /// Fetches current metadata, re-homing the control connection through
    /// known peers (and ultimately the initial contact points) on failure.
    pub(crate) async fn read_metadata(&mut self, initial: bool) -> Result<Metadata, QueryError> {
        let prev_err = match self.fetch_metadata(initial).await {
            Ok(metadata) => {
                debug!("Fetched new metadata");
                self.update_known_peers(&metadata);
                return Ok(metadata);
            }
            Err(err) => err,
        };

        // The current control connection failed to deliver. Try the other
        // known peers, in random order.
        self.known_peers.shuffle(&mut thread_rng());
        let candidates: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .copied()
            .filter(|peer| *peer != self.control_connection_endpoint)
            .collect();
        let mut result = self
            .retry_fetch_metadata_on_nodes(initial, candidates, prev_err)
            .await;

        if let Err(prev_err) = result {
            if !initial {
                // No known peer was reachable; fall back to the initial
                // contact points in hope that they resolve to fresh nodes.
                warn!(
                    "Failed to fetch metadata from all known peers. \
                    Falling back to initial contact points."
                );
                result = self
                    .retry_fetch_metadata_on_nodes(
                        initial,
                        self.initial_contact_points.clone(),
                        prev_err,
                    )
                    .await;
            } else {
                result = Err(prev_err);
            }
        }

        match &result {
            Ok(metadata) => {
                self.update_known_peers(metadata);
                debug!("Fetched new metadata");
            }
            Err(err) => error!(
                error = %err,
                control_connection = %self.control_connection_endpoint,
                "Could not fetch metadata"
            ),
        }

        result
    }

    async fn retry_fetch_metadata_on_nodes(
        &mut self,
        initial: bool,
        candidates: Vec<SocketAddr>,
        prev_err: QueryError,
    ) -> Result<Metadata, QueryError> {
        let mut result = Err(prev_err);
        for peer in candidates {
            let err = match result {
                Ok(_) => break,
                Err(err) => err,
            };

            warn!(
                control_connection = %self.control_connection_endpoint,
                error = %err,
                "Failed to fetch metadata using current control connection"
            );
            result = Err(err);

            self.control_connection_endpoint = peer;
            debug!(
                "Retrying to establish the control connection on {}",
                self.control_connection_endpoint
            );
            self.control_connection_state = match Self::make_control_connection(
                self.control_connection_endpoint,
                &self.control_connection_config,
            )
            .await
            {
                Ok(working) => ControlConnectionState::Working(working),
                Err(err) => {
                    debug!(
                        "Could not connect control connection to {}: {}",
                        self.control_connection_endpoint, err
                    );
                    ControlConnectionState::Broken
                }
            };

            if matches!(
                self.control_connection_state,
                ControlConnectionState::Working(_)
            ) {
                result = self.fetch_metadata(initial).await;
            }
        }
        result
    }

    async fn fetch_metadata(&self, initial: bool) -> Result<Metadata, QueryError> {
        let connection = match &self.control_connection_state {
            ControlConnectionState::Working(working) => &working.connection,
            ControlConnectionState::Broken => {
                return Err(QueryError::ProtocolError("control connection is broken"))
            }
        };

        let res = connection
            .query_metadata(
                self.control_connection_endpoint,
                &self.keyspaces_to_fetch,
                self.fetch_schema,
                self.address_translator.as_deref(),
            )
            .await;

        if initial {
            if let Err(err) = res {
                warn!(
                    error = ?err,
                    "Initial metadata read failed, proceeding with metadata \
                    consisting only of the initial peer list and dummy tokens. \
                    This might result in suboptimal performance and schema \
                    information not being available."
                );
                return Ok(Metadata::new_dummy(&self.known_peers));
            }
        }

        res
    }

    fn update_known_peers(&mut self, metadata: &Metadata) {
        if !metadata.peers.is_empty() {
            self.known_peers = metadata.peers.iter().map(|peer| peer.address).collect();
        }
    }

    async fn make_control_connection(
        endpoint: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<WorkingControlConnection, crate::errors::ConnectionError> {
        let (connection, error_receiver) = open_connection(endpoint, config).await?;
        Ok(WorkingControlConnection {
            connection: ControlConnection::new(Arc::new(connection)),
            error_receiver,
        })
    }
}

/// Parses one `system.local`/`system.peers` row worth of peer data.
///
/// An rpc_address of 0.0.0.0 is a known server misconfiguration and is
/// replaced with the address the control connection actually uses.
pub(crate) async fn create_peer_from_row(
    is_local: bool,
    connect_address: SocketAddr,
    columns: PeerRowColumns,
    address_translator: Option<&dyn AddressTranslator>,
) -> Option<Peer> {
    let PeerRowColumns {
        host_id,
        ip: untranslated_ip,
        datacenter,
        rack,
        tokens,
        release_version,
    } = columns;

    let untranslated_address = SocketAddr::new(untranslated_ip, connect_address.port());

    let address = if is_local {
        // The local row describes the node the control connection is
        // attached to; its rpc_address is the bind address, which may not
        // be reachable from here. Use the address we actually connected to.
        connect_address
    } else if untranslated_address.ip().is_unspecified() {
        // Known server misconfiguration; there is no better address to
        // substitute for a peer, so keep it and let connects fail loudly.
        warn!(
            "Node {:?} broadcasts the unspecified address 0.0.0.0 as its rpc_address",
            host_id
        );
        untranslated_address
    } else {
        match address_translator {
            None => untranslated_address,
            Some(translator) => match translator.translate_address(untranslated_address).await {
                Ok(translated) => translated,
                Err(err) => {
                    warn!(
                        "Could not translate address {}: {:?}; node skipped",
                        untranslated_address, err
                    );
                    return None;
                }
            },
        }
    };

    // Tokens arrive as text; unparsable ones degrade to a random token so
    // the node still participates in the ring.
    let tokens: Vec<Token> = match tokens
        .iter()
        .map(|s| s.parse::<Token>())
        .collect::<Result<Vec<Token>, _>>()
    {
        Ok(parsed) => parsed,
        Err(err) => {
            trace!(
                "Couldn't parse tokens as 64-bit integers: {}, proceeding with a dummy token",
                err
            );
            vec![Token::new(thread_rng().gen::<i64>())]
        }
    };

    Some(Peer {
        host_id,
        address,
        tokens,
        datacenter,
        rack,
        release_version,
    })
}

/// The raw columns of one peer row, before address fixups.
pub(crate) struct PeerRowColumns {
    pub(crate) host_id: Option<Uuid>,
    pub(crate) ip: IpAddr,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
    pub(crate) tokens: Vec<String>,
    pub(crate) release_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_simple_strategy() {
        let strategy = strategy_from_string_map(string_map(&[
            ("class", "org.apache.cassandra.locator.SimpleStrategy"),
            ("replication_factor", "3"),
        ]))
        .unwrap();
        assert_eq!(
            strategy,
            Strategy::SimpleStrategy {
                replication_factor: 3
            }
        );
    }

    #[test]
    fn parse_network_topology_strategy() {
        let strategy = strategy_from_string_map(string_map(&[
            ("class", "NetworkTopologyStrategy"),
            ("dc1", "3"),
            ("dc2", "2"),
        ]))
        .unwrap();
        assert_eq!(
            strategy,
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("dc1".to_string(), 3), ("dc2".to_string(), 2)]
                    .into_iter()
                    .collect(),
            }
        );
    }

    #[test]
    fn parse_local_and_unknown_strategies() {
        let strategy = strategy_from_string_map(string_map(&[(
            "class",
            "org.apache.cassandra.locator.LocalStrategy",
        )]))
        .unwrap();
        assert_eq!(strategy, Strategy::LocalStrategy);

        let strategy = strategy_from_string_map(string_map(&[
            ("class", "com.example.WeirdStrategy"),
            ("foo", "bar"),
        ]))
        .unwrap();
        assert_eq!(
            strategy,
            Strategy::Other {
                name: "com.example.WeirdStrategy".to_string(),
                data: string_map(&[("foo", "bar")]),
            }
        );
    }

    #[test]
    fn parse_strategy_requires_class() {
        assert!(strategy_from_string_map(string_map(&[("foo", "bar")])).is_err());
        assert!(strategy_from_string_map(string_map(&[
            ("class", "SimpleStrategy"),
            ("replication_factor", "x"),
        ]))
        .is_err());
    }

    #[test]
    fn dummy_metadata_covers_contact_points() {
        let contact_points = vec![
            "10.0.0.1:9042".parse().unwrap(),
            "10.0.0.2:9042".parse().unwrap(),
        ];
        let metadata = Metadata::new_dummy(&contact_points);
        assert_eq!(metadata.peers.len(), 2);
        assert!(metadata
            .peers
            .iter()
            .all(|peer| peer.tokens.len() == 1 && peer.datacenter.is_none()));
    }

    #[tokio::test]
    async fn peer_row_token_parsing() {
        let columns = PeerRowColumns {
            host_id: Some(Uuid::new_v4()),
            ip: "10.0.0.5".parse().unwrap(),
            datacenter: Some("dc1".to_string()),
            rack: Some("r1".to_string()),
            tokens: vec!["123".to_string(), "-456".to_string()],
            release_version: None,
        };
        let peer = create_peer_from_row(false, "10.0.0.9:9042".parse().unwrap(), columns, None)
            .await
            .unwrap();
        assert_eq!(peer.tokens, vec![Token::new(123), Token::new(-456)]);
        assert_eq!(peer.address, "10.0.0.5:9042".parse().unwrap());

        // The local row gets the control connection's address.
        let columns = PeerRowColumns {
            host_id: None,
            ip: "0.0.0.0".parse().unwrap(),
            datacenter: None,
            rack: None,
            tokens: vec!["not-a-number".to_string()],
            release_version: None,
        };
        let peer = create_peer_from_row(true, "10.0.0.9:9042".parse().unwrap(), columns, None)
            .await
            .unwrap();
        assert_eq!(peer.address, "10.0.0.9:9042".parse().unwrap());
        // Unparsable token degraded to a single dummy token.
        assert_eq!(peer.tokens.len(), 1);
    }
}
