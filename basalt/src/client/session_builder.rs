//! A builder for [Session]s.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::session::{Session, SessionConfig};
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::cluster::node::KnownNode;
use crate::errors::NewSessionError;
use crate::network::pool::PoolSize;
use crate::policies::address_translator::AddressTranslator;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::retry::RetryPolicy;
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use basalt_cql::frame::{Compression, ProtocolVersion};
use basalt_cql::Consistency;

/// Builds a [Session] from configuration options.
///
/// # Example
///
/// ```rust,no_run
/// # use basalt::client::session_builder::SessionBuilder;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(basalt::Compression::Lz4))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a known node by hostname or "host:port" address.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config
            .known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
        self
    }

    /// Adds a known node by socket address.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.known_nodes.push(KnownNode::Address(node_addr));
        self
    }

    /// Adds a list of known nodes by hostname.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        for hostname in hostnames {
            self = self.known_node(hostname);
        }
        self
    }

    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Heartbeat interval of idle connections; None disables heartbeats.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Newest protocol version offered during connection negotiation.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.preferred_protocol_version = version;
        self
    }

    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = policy;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    pub fn speculative_execution(
        mut self,
        policy: Arc<dyn SpeculativeExecutionPolicy>,
    ) -> Self {
        self.config.speculative_execution_policy = Some(policy);
        self
    }

    pub fn address_translator(mut self, translator: Arc<dyn AddressTranslator>) -> Self {
        self.config.address_translator = Some(translator);
        self
    }

    /// Authenticates with the given username and password.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            password.into(),
        )));
        self
    }

    pub fn authenticator_provider(mut self, provider: Arc<dyn AuthenticatorProvider>) -> Self {
        self.config.authenticator = Some(provider);
        self
    }

    pub fn pool_size(mut self, pool_size: PoolSize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    /// Default per-request timeout; None disables the client-side deadline.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn schema_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_agreement_timeout = timeout;
        self
    }

    pub fn fetch_schema_metadata(mut self, fetch: bool) -> Self {
        self.config.fetch_schema_metadata = fetch;
        self
    }

    /// The keyspace to USE after connecting.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Builds the session, connecting to the cluster.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_known_nodes() {
        let builder = SessionBuilder::new()
            .known_node("db1.example.com:9042")
            .known_node_addr("10.0.0.1:9042".parse().unwrap())
            .known_nodes(["db2.example.com", "db3.example.com"]);

        assert_eq!(builder.config.known_nodes.len(), 4);
        assert!(matches!(
            builder.config.known_nodes[1],
            KnownNode::Address(_)
        ));
    }

    #[test]
    fn builder_overrides_defaults() {
        let builder = SessionBuilder::new()
            .compression(Some(Compression::Snappy))
            .default_consistency(Consistency::Quorum)
            .protocol_version(ProtocolVersion::V3)
            .request_timeout(None);

        assert_eq!(builder.config.compression, Some(Compression::Snappy));
        assert_eq!(builder.config.default_consistency, Consistency::Quorum);
        assert_eq!(
            builder.config.preferred_protocol_version,
            ProtocolVersion::V3
        );
        assert_eq!(builder.config.request_timeout, None);
    }
}
