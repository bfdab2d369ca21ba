//! The cluster facade and its background worker, which keeps the cluster
//! state snapshot current: it consumes server events, refreshes metadata
//! (debouncing schema-change bursts), maintains the host registry and
//! re-homes the control connection after failures.

use arc_swap::ArcSwap;
use futures::future::RemoteHandle;
use futures::FutureExt;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::events::ClusterEvents;
use crate::cluster::metadata::{Metadata, MetadataReader};
use crate::cluster::node::Node;
use crate::cluster::registry::HostRegistry;
use crate::cluster::state::ClusterState;
use crate::errors::{NewSessionError, QueryError};
use crate::network::{PoolConfig, VerifiedKeyspaceName};
use crate::policies::address_translator::AddressTranslator;
use basalt_cql::frame::response::event::{Event, SchemaChangeEvent, StatusChangeEvent, TopologyChangeEvent};

/// How often metadata is refreshed when nothing else triggers a refresh.
const DEFAULT_METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait for the control connection to be repaired between
/// refresh attempts once it broke.
const CONTROL_CONNECTION_REPAIR_INTERVAL: Duration = Duration::from_secs(1);

/// Manages the up-to-date view of the cluster. All data is accessed by
/// cloning an `Arc<ClusterState>` snapshot.
pub(crate) struct Cluster {
    state: Arc<ArcSwap<ClusterState>>,

    refresh_channel: mpsc::Sender<RefreshRequest>,
    use_keyspace_channel: mpsc::Sender<UseKeyspaceRequest>,
    events: Arc<ClusterEvents>,

    _worker_handle: Arc<RemoteHandle<()>>,
}

pub(crate) struct ClusterConfig {
    pub(crate) pool_config: PoolConfig,
    pub(crate) keyspaces_to_fetch: Vec<String>,
    pub(crate) fetch_schema_metadata: bool,
    pub(crate) metadata_refresh_interval: Option<Duration>,
    pub(crate) schema_refresh_debounce: Duration,
    pub(crate) address_translator: Option<Arc<dyn AddressTranslator>>,
}

struct RefreshRequest {
    response_chan: oneshot::Sender<Result<(), QueryError>>,
}

struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_chan: oneshot::Sender<Result<(), QueryError>>,
}

impl Cluster {
    pub(crate) async fn new(
        contact_points: Vec<SocketAddr>,
        config: ClusterConfig,
    ) -> Result<Cluster, NewSessionError> {
        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        let (use_keyspace_sender, use_keyspace_receiver) = mpsc::channel(32);
        let (server_events_sender, server_events_receiver) = mpsc::channel(32);

        let events = Arc::new(ClusterEvents::new());
        let registry = HostRegistry::new(
            config.pool_config.reconnection_policy.clone(),
            config.pool_config.connection_config.clone(),
            events.clone(),
        );

        let mut metadata_reader = MetadataReader::new(
            contact_points,
            config.pool_config.connection_config.clone(),
            server_events_sender,
            config.keyspaces_to_fetch.clone(),
            config.fetch_schema_metadata,
            config.address_translator.clone(),
        )
        .await?;

        let metadata = metadata_reader
            .read_metadata(true)
            .await
            .map_err(NewSessionError::MetadataFetchError)?;

        let mut worker = ClusterWorker {
            state: Arc::new(ArcSwap::from_pointee(ClusterState::new_empty())),
            metadata_reader,
            registry,
            pool_config: config.pool_config,
            refresh_channel: refresh_receiver,
            use_keyspace_channel: use_keyspace_receiver,
            server_events_channel: server_events_receiver,
            events: events.clone(),
            used_keyspace: None,
            metadata_refresh_interval: config
                .metadata_refresh_interval
                .unwrap_or(DEFAULT_METADATA_REFRESH_INTERVAL),
            schema_refresh_debounce: config.schema_refresh_debounce,
            pending_schema_events: Vec::new(),
            schema_refresh_deadline: None,
            control_connection_works: true,
        };

        let initial_state = worker.apply_metadata(&metadata);
        initial_state.wait_until_all_pools_are_initialized().await;
        let state = worker.state.clone();

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Ok(Cluster {
            state,
            refresh_channel: refresh_sender,
            use_keyspace_channel: use_keyspace_sender,
            events,
            _worker_handle: Arc::new(worker_handle),
        })
    }

    /// The current cluster snapshot. Never blocks; during control
    /// connection failover this keeps returning the last good snapshot.
    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub(crate) fn events(&self) -> &Arc<ClusterEvents> {
        &self.events
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), QueryError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .expect("the cluster worker is alive as long as the Cluster");

        response_receiver
            .await
            .expect("the cluster worker always responds")
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.use_keyspace_channel
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_chan: response_sender,
            })
            .await
            .expect("the cluster worker is alive as long as the Cluster");

        response_receiver
            .await
            .expect("the cluster worker always responds")
    }
}

/// Works in the background to keep the cluster state updated.
struct ClusterWorker {
    state: Arc<ArcSwap<ClusterState>>,

    metadata_reader: MetadataReader,
    registry: Arc<HostRegistry>,
    pool_config: PoolConfig,

    refresh_channel: mpsc::Receiver<RefreshRequest>,
    use_keyspace_channel: mpsc::Receiver<UseKeyspaceRequest>,
    server_events_channel: mpsc::Receiver<Event>,
    events: Arc<ClusterEvents>,

    /// Keyspace sent in "USE" on every connection as it opens.
    used_keyspace: Option<VerifiedKeyspaceName>,

    metadata_refresh_interval: Duration,

    /// Schema events are coalesced: the refresh happens once per debounce
    /// window, not once per event.
    schema_refresh_debounce: Duration,
    pending_schema_events: Vec<SchemaChangeEvent>,
    schema_refresh_deadline: Option<Instant>,

    control_connection_works: bool,
}

impl ClusterWorker {
    async fn work(mut self) {
        let mut last_refresh_time = Instant::now();

        loop {
            let mut cur_request: Option<RefreshRequest> = None;

            let periodic_deadline = last_refresh_time
                .checked_add(if self.control_connection_works {
                    self.metadata_refresh_interval
                } else {
                    CONTROL_CONNECTION_REPAIR_INTERVAL
                })
                .unwrap_or_else(Instant::now);
            // A pending debounced schema refresh may be due earlier than
            // the periodic one.
            let sleep_until = match self.schema_refresh_deadline {
                Some(deadline) => deadline.min(periodic_deadline),
                None => periodic_deadline,
            };

            let sleep_future = tokio::time::sleep_until(sleep_until);
            tokio::pin!(sleep_future);

            tokio::select! {
                _ = sleep_future => {}
                recv_res = self.refresh_channel.recv() => {
                    match recv_res {
                        Some(request) => cur_request = Some(request),
                        None => return, // The Cluster was dropped.
                    }
                }
                recv_res = self.server_events_channel.recv() => {
                    match recv_res {
                        Some(event) => {
                            debug!("Received server event: {:?}", event);
                            match event {
                                Event::TopologyChange(topology_change) => {
                                    match topology_change {
                                        TopologyChangeEvent::NewNode(addr) => {
                                            debug!("New node {} announced", addr);
                                        }
                                        TopologyChangeEvent::RemovedNode(addr) => {
                                            self.registry.remove(addr);
                                        }
                                    }
                                    // Fall through to an immediate refresh.
                                }
                                Event::StatusChange(status_change) => {
                                    match status_change {
                                        StatusChangeEvent::Up(addr) => self.handle_node_up(addr),
                                        StatusChangeEvent::Down(addr) => {
                                            self.registry.set_down(addr)
                                        }
                                    }
                                    continue; // Registry update only, no refresh.
                                }
                                Event::SchemaChange(schema_change) => {
                                    // Debounce: coalesce a burst of schema
                                    // events into one refresh.
                                    if self.schema_refresh_deadline.is_none() {
                                        self.schema_refresh_deadline = Some(
                                            Instant::now() + self.schema_refresh_debounce,
                                        );
                                    }
                                    self.pending_schema_events.push(schema_change);
                                    continue;
                                }
                            }
                        }
                        None => return, // The MetadataReader was dropped.
                    }
                }
                recv_res = self.use_keyspace_channel.recv() => {
                    match recv_res {
                        Some(request) => {
                            self.used_keyspace = Some(request.keyspace_name.clone());

                            let state = self.state.load_full();
                            tokio::spawn(async move {
                                let result =
                                    Self::send_use_keyspace(state, &request.keyspace_name).await;
                                let _ = request.response_chan.send(result);
                            });
                        }
                        None => return, // The Cluster was dropped.
                    }

                    continue; // Nothing to refresh.
                }
                _ = self.metadata_reader.wait_until_control_connection_breaks() => {
                    // Attempt an immediate refresh below; it re-homes the
                    // control connection. Subsequent failures retry on the
                    // repair interval.
                }
            }

            debug!("Requesting metadata refresh");
            last_refresh_time = Instant::now();
            let refresh_res = self.perform_refresh().await;

            self.control_connection_works = refresh_res.is_ok();

            if refresh_res.is_ok() {
                // Deliver the schema events whose refresh this was.
                self.schema_refresh_deadline = None;
                for event in self.pending_schema_events.drain(..) {
                    self.events.publish_schema_changed(event);
                }
            }

            if let Some(request) = cur_request {
                // Nobody waiting for the response is fine.
                let _ = request.response_chan.send(refresh_res);
            }
        }
    }

    fn handle_node_up(&mut self, addr: SocketAddr) {
        // An UP for an endpoint we have never seen creates the host; its
        // ring position becomes known at the next metadata refresh.
        if self.registry.try_get(addr).is_none() {
            warn!("Status UP for previously unknown node {}", addr);
        }
        let pool_config = self.pool_config.clone();
        let used_keyspace = self.used_keyspace.clone();
        self.registry.add_or_bring_up(addr, || {
            Arc::new(Node::new(
                crate::cluster::metadata::PeerEndpoint {
                    host_id: None,
                    address: addr,
                    datacenter: None,
                    rack: None,
                    release_version: None,
                },
                &pool_config,
                used_keyspace,
            ))
        });
    }

    async fn send_use_keyspace(
        state: Arc<ClusterState>,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let use_keyspace_futures = state
            .known_peers()
            .values()
            .map(|node| node.use_keyspace(keyspace_name.clone()));
        let use_keyspace_results = futures::future::join_all(use_keyspace_futures).await;

        // One success is enough: the keyspace is valid and broken pools
        // will apply it as they reconnect.
        let mut was_ok = false;
        let mut last_error = None;
        for result in use_keyspace_results {
            match result {
                Ok(()) => was_ok = true,
                Err(err) => match err {
                    QueryError::BrokenConnection(_) | QueryError::UnableToAllocStreamId => {
                        last_error = Some(err)
                    }
                    _ => return Err(err),
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

    async fn perform_refresh(&mut self) -> Result<(), QueryError> {
        let metadata = self.metadata_reader.read_metadata(false).await?;
        let new_state = self.apply_metadata(&metadata);
        new_state.wait_until_all_pools_are_initialized().await;
        Ok(())
    }

    /// Syncs the registry with the fetched peers and publishes a fresh
    /// state snapshot.
    fn apply_metadata(&mut self, metadata: &Metadata) -> Arc<ClusterState> {
        let fetched: HashSet<SocketAddr> =
            metadata.peers.iter().map(|peer| peer.address).collect();

        // Drop hosts that disappeared from the cluster.
        for (endpoint, _node) in self.registry.snapshot() {
            if !fetched.contains(&endpoint) {
                debug!("Node {} no longer in metadata; removing", endpoint);
                self.registry.remove(endpoint);
            }
        }

        // Add newly discovered hosts with fresh pools. Existing hosts keep
        // their down markers: membership comes from metadata, liveness
        // from status events and reconnection probes.
        for peer in &metadata.peers {
            if self.registry.try_get(peer.address).is_none() {
                let pool_config = self.pool_config.clone();
                let used_keyspace = self.used_keyspace.clone();
                let endpoint = peer.to_peer_endpoint();
                self.registry.add_or_bring_up(peer.address, move || {
                    Arc::new(Node::new(endpoint, &pool_config, used_keyspace))
                });
            }
        }

        let nodes = self.registry.snapshot();
        let new_state = Arc::new(ClusterState::new(metadata, &nodes));
        self.state.store(new_state.clone());
        new_state
    }
}
