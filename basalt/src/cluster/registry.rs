//! The host registry: the authoritative set of known endpoints with their
//! up/down status and reconnection probes.
//!
//! The registry has a single logical writer (the cluster worker plus the
//! reconnection probes it spawns); readers take snapshots. A host that
//! goes down gets a background probe which retries connecting with delays
//! drawn from the reconnection policy; the first success brings the host
//! up again and publishes a HostUp event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::events::ClusterEvents;
use crate::cluster::node::Node;
use crate::network::connection::{open_connection, ConnectionConfig};
use crate::policies::reconnection::ReconnectionPolicy;

pub(crate) struct HostRegistry {
    hosts: RwLock<HashMap<SocketAddr, Arc<Node>>>,
    probes: Mutex<HashMap<SocketAddr, JoinHandle<()>>>,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    probe_connection_config: ConnectionConfig,
    events: Arc<ClusterEvents>,
}

impl HostRegistry {
    pub(crate) fn new(
        reconnection_policy: Arc<dyn ReconnectionPolicy>,
        probe_connection_config: ConnectionConfig,
        events: Arc<ClusterEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts: RwLock::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            reconnection_policy,
            probe_connection_config,
            events,
        })
    }

    /// Adds the host, or brings an existing one up. Returns true when the
    /// host was created or transitioned down -> up.
    pub(crate) fn add_or_bring_up(
        &self,
        endpoint: SocketAddr,
        make_node: impl FnOnce() -> Arc<Node>,
    ) -> bool {
        let transitioned = {
            let mut hosts = self.hosts.write().unwrap();
            match hosts.get(&endpoint) {
                Some(node) => {
                    if node.is_down() {
                        node.change_down_marker(false);
                        true
                    } else {
                        false
                    }
                }
                None => {
                    hosts.insert(endpoint, make_node());
                    true
                }
            }
        };

        if transitioned {
            self.cancel_probe(endpoint);
            self.events.publish_host_up(endpoint);
        }
        transitioned
    }

    /// Marks the host as down and schedules reconnection probes. No-op for
    /// unknown or already-down hosts.
    pub(crate) fn set_down(self: &Arc<Self>, endpoint: SocketAddr) {
        let transitioned = {
            let hosts = self.hosts.read().unwrap();
            match hosts.get(&endpoint) {
                Some(node) if node.is_up() => {
                    node.change_down_marker(true);
                    true
                }
                _ => false,
            }
        };

        if transitioned {
            debug!("Host {} marked down", endpoint);
            self.events.publish_host_down(endpoint);
            self.spawn_probe(endpoint);
        }
    }

    /// Removes the host entirely; its pool is torn down when the last
    /// reference is dropped.
    pub(crate) fn remove(&self, endpoint: SocketAddr) -> Option<Arc<Node>> {
        self.cancel_probe(endpoint);
        self.hosts.write().unwrap().remove(&endpoint)
    }

    pub(crate) fn try_get(&self, endpoint: SocketAddr) -> Option<Arc<Node>> {
        self.hosts.read().unwrap().get(&endpoint).cloned()
    }

    /// A point-in-time copy of the host map.
    pub(crate) fn snapshot(&self) -> HashMap<SocketAddr, Arc<Node>> {
        self.hosts.read().unwrap().clone()
    }

    fn spawn_probe(self: &Arc<Self>, endpoint: SocketAddr) {
        let registry = Arc::downgrade(self);
        let mut schedule = self.reconnection_policy.new_schedule();
        let config = self.probe_connection_config.clone();

        let probe = tokio::spawn(async move {
            loop {
                let delay = schedule.next_delay();
                tokio::time::sleep(delay).await;

                // The registry owns the probe; if it is gone, stop.
                let registry = match registry.upgrade() {
                    Some(registry) => registry,
                    None => return,
                };

                match open_connection(endpoint, &config).await {
                    Ok((_connection, _error_receiver)) => {
                        debug!("Reconnection probe to {} succeeded", endpoint);
                        let brought_up = {
                            let hosts = registry.hosts.read().unwrap();
                            match hosts.get(&endpoint) {
                                Some(node) if node.is_down() => {
                                    node.change_down_marker(false);
                                    true
                                }
                                _ => false,
                            }
                        };
                        if brought_up {
                            registry.events.publish_host_up(endpoint);
                        }
                        registry.probes.lock().unwrap().remove(&endpoint);
                        return;
                    }
                    Err(err) => {
                        warn!(
                            "Reconnection probe to {} failed: {}; next attempt in {:?}",
                            endpoint,
                            err,
                            delay
                        );
                    }
                }
            }
        });

        let mut probes = self.probes.lock().unwrap();
        if let Some(previous) = probes.insert(endpoint, probe) {
            previous.abort();
        }
    }

    fn cancel_probe(&self, endpoint: SocketAddr) {
        if let Some(probe) = self.probes.lock().unwrap().remove(&endpoint) {
            probe.abort();
        }
    }
}

impl Drop for HostRegistry {
    fn drop(&mut self) {
        for (_, probe) in self.probes.lock().unwrap().drain() {
            probe.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::tests::mock_node;
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::utils::test_utils::mock_server::{MockNode, MockNodeOptions};
    use std::time::Duration;

    fn test_registry() -> Arc<HostRegistry> {
        HostRegistry::new(
            Arc::new(ConstantReconnectionPolicy::new(Duration::from_millis(20))),
            ConnectionConfig {
                keepalive_interval: None,
                ..Default::default()
            },
            Arc::new(ClusterEvents::new()),
        )
    }

    #[tokio::test]
    async fn add_or_bring_up_semantics() {
        let registry = test_registry();
        let node = mock_node(1, None, None);
        let endpoint = node.address;

        // First add: created.
        assert!(registry.add_or_bring_up(endpoint, || node.clone()));
        // Second add of an up host: no transition.
        assert!(!registry.add_or_bring_up(endpoint, || panic!("should not be called")));

        // Down, then up again: transition reported.
        registry.set_down(endpoint);
        assert!(registry.try_get(endpoint).unwrap().is_down());
        assert!(registry.add_or_bring_up(endpoint, || panic!("should not be called")));
        assert!(registry.try_get(endpoint).unwrap().is_up());
    }

    #[tokio::test]
    async fn set_down_publishes_event_and_remove_forgets() {
        let registry = test_registry();
        let mut host_down_events = registry.events.subscribe_host_down();

        let node = mock_node(7, None, None);
        let endpoint = node.address;
        registry.add_or_bring_up(endpoint, || node.clone());

        registry.set_down(endpoint);
        assert_eq!(host_down_events.recv().await.unwrap(), endpoint);

        // Unknown host: no-op.
        registry.set_down("10.99.99.99:9042".parse().unwrap());

        assert!(registry.remove(endpoint).is_some());
        assert!(registry.try_get(endpoint).is_none());
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn reconnection_probe_brings_host_up() {
        let server = MockNode::start(MockNodeOptions::default()).await;

        let registry = test_registry();
        let mut host_up_events = registry.events.subscribe_host_up();

        let node = Arc::new(Node::new_for_test(server.address(), None, None));
        registry.add_or_bring_up(server.address(), || node.clone());
        // Drain the Up event of the initial add.
        let _ = host_up_events.recv().await.unwrap();

        registry.set_down(server.address());
        assert!(registry.try_get(server.address()).unwrap().is_down());

        // The probe reconnects (constant 20 ms backoff) and brings the
        // host back up.
        let brought_up = tokio::time::timeout(Duration::from_secs(5), host_up_events.recv())
            .await
            .expect("probe did not bring the host up in time")
            .unwrap();
        assert_eq!(brought_up, server.address());
        assert!(registry.try_get(server.address()).unwrap().is_up());
    }
}
