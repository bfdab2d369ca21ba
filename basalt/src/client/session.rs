//! The session: the public entry point of the driver. Owns the cluster
//! view and executes requests against query plans, applying retry and
//! speculative-execution policies and preparing statements on demand.

use dashmap::DashMap;
use futures::future::join_all;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cluster::metadata::Keyspace;
use crate::cluster::node::{resolve_contact_points, KnownNode, Node};
use crate::cluster::state::ClusterState;
use crate::cluster::{Cluster, ClusterConfig};
use crate::errors::{
    BadQuery, NewSessionError, NoHostAvailableError, QueryError, RequestAttemptError,
};
use crate::network::connection::{Connection, ConnectionConfig, VerifiedKeyspaceName};
use crate::network::pool::{PoolConfig, PoolSize};
use crate::policies::address_translator::AddressTranslator;
use crate::policies::load_balancing::{
    DcAwareRoundRobinPolicy, LoadBalancingPolicy, RoundRobinPolicy, TokenAwarePolicy,
};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
use crate::policies::speculative_execution::{self, SpeculativeExecutionPolicy};
use crate::response::{NonErrorQueryResponse, QueryResult};
use crate::routing::RoutingInfo;
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::{StatementConfig, DEFAULT_PAGE_SIZE};
use crate::authentication::AuthenticatorProvider;
use basalt_cql::frame::request::batch as cql_batch;
use basalt_cql::frame::response::event::SchemaChangeEvent;
use basalt_cql::frame::request::query::{PagingState, PagingStateResponse};
use basalt_cql::frame::value::{SerializedValues, ValueList};
use basalt_cql::frame::{Compression, ProtocolVersion};
use basalt_cql::Consistency;

/// Configuration of a new session; usually built through
/// [SessionBuilder](crate::client::session_builder::SessionBuilder).
#[derive(Clone)]
pub struct SessionConfig {
    /// Nodes used to bootstrap the cluster view.
    pub known_nodes: Vec<KnownNode>,

    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,
    /// Heartbeat interval of idle connections.
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,
    pub preferred_protocol_version: ProtocolVersion,

    pub default_consistency: Consistency,
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    pub address_translator: Option<Arc<dyn AddressTranslator>>,
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    pub pool_size: PoolSize,
    /// Default per-request timeout; per-statement settings override it.
    pub request_timeout: Option<Duration>,

    pub schema_agreement_timeout: Duration,
    pub schema_agreement_interval: Duration,
    /// Debounce window coalescing bursts of schema-change events.
    pub schema_refresh_debounce: Duration,
    pub metadata_refresh_interval: Option<Duration>,

    /// Restrict schema fetching to these keyspaces (empty: all).
    pub keyspaces_to_fetch: Vec<String>,
    pub fetch_schema_metadata: bool,

    pub used_keyspace: Option<String>,
    pub keyspace_case_sensitive: bool,

    pub hostname_resolution_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            preferred_protocol_version: ProtocolVersion::NEWEST,
            default_consistency: Consistency::default(),
            load_balancing_policy: Arc::new(TokenAwarePolicy::new(Box::new(
                RoundRobinPolicy::new(),
            ))),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            speculative_execution_policy: None,
            address_translator: None,
            authenticator: None,
            pool_size: PoolSize::default(),
            request_timeout: Some(Duration::from_secs(30)),
            schema_agreement_timeout: Duration::from_secs(10),
            schema_agreement_interval: Duration::from_millis(200),
            schema_refresh_debounce: Duration::from_secs(1),
            metadata_refresh_interval: None,
            keyspaces_to_fetch: Vec::new(),
            fetch_schema_metadata: true,
            used_keyspace: None,
            keyspace_case_sensitive: false,
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Convenience constructor preferring nodes of the given datacenter.
    pub fn with_local_datacenter(local_dc: impl Into<String>) -> Self {
        let mut config = Self::new();
        config.load_balancing_policy = Arc::new(TokenAwarePolicy::new(Box::new(
            DcAwareRoundRobinPolicy::new(local_dc),
        )));
        config
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The driver's session: a pool of pools, a live cluster view and the
/// request executor on top of them.
pub struct Session {
    cluster: Cluster,

    default_consistency: Consistency,
    load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    request_timeout: Option<Duration>,

    schema_agreement_timeout: Duration,
    schema_agreement_interval: Duration,

    /// Cache of prepared statements, keyed by (keyspace, statement text).
    prepared_statement_cache: DashMap<(Option<String>, String), PreparedStatement>,
    current_keyspace: RwLock<Option<String>>,
}

/// Result of running one request over the plan: either a real response or
/// a write error the retry policy decided to ignore.
enum RunRequestResult<ResT> {
    Completed(ResT),
    IgnoredWriteError,
}

impl Session {
    /// Establishes a new session with the cluster described by the config.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let (contact_points, hostnames) =
            resolve_contact_points(&config.known_nodes, config.hostname_resolution_timeout).await;
        if contact_points.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(hostnames));
        }

        let connection_config = ConnectionConfig {
            compression: config.compression,
            tcp_nodelay: config.tcp_nodelay,
            tcp_keepalive_interval: config.tcp_keepalive_interval,
            connect_timeout: config.connect_timeout,
            event_sender: None,
            default_consistency: config.default_consistency,
            authenticator: config.authenticator.clone(),
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            preferred_version: config.preferred_protocol_version,
            max_frame_size: basalt_cql::frame::DEFAULT_MAX_FRAME_SIZE,
        };

        let pool_config = PoolConfig {
            connection_config,
            pool_size: config.pool_size,
            reconnection_policy: config.reconnection_policy.clone(),
        };

        let cluster = Cluster::new(
            contact_points,
            ClusterConfig {
                pool_config,
                keyspaces_to_fetch: config.keyspaces_to_fetch.clone(),
                fetch_schema_metadata: config.fetch_schema_metadata,
                metadata_refresh_interval: config.metadata_refresh_interval,
                schema_refresh_debounce: config.schema_refresh_debounce,
                address_translator: config.address_translator.clone(),
            },
        )
        .await?;

        let session = Session {
            cluster,
            default_consistency: config.default_consistency,
            load_balancing_policy: config.load_balancing_policy,
            retry_policy: config.retry_policy,
            speculative_execution_policy: config.speculative_execution_policy,
            request_timeout: config.request_timeout,
            schema_agreement_timeout: config.schema_agreement_timeout,
            schema_agreement_interval: config.schema_agreement_interval,
            prepared_statement_cache: DashMap::new(),
            current_keyspace: RwLock::new(None),
        };

        if let Some(keyspace_name) = config.used_keyspace {
            session
                .use_keyspace(keyspace_name, config.keyspace_case_sensitive)
                .await
                .map_err(NewSessionError::MetadataFetchError)?;
        }

        Ok(session)
    }

    /* ---------- cluster view ---------- */

    /// The current cluster snapshot. During control-connection failover
    /// this returns the last good snapshot rather than an error.
    pub fn get_cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.get_state()
    }

    /// The keyspaces of the last metadata snapshot.
    pub fn get_keyspaces(&self) -> HashMap<String, Keyspace> {
        self.cluster.get_state().keyspaces().clone()
    }

    /// Requests an immediate metadata refresh and waits for it.
    pub async fn refresh_metadata(&self) -> Result<(), QueryError> {
        self.cluster.refresh_metadata().await
    }

    pub fn subscribe_host_up_events(&self) -> broadcast::Receiver<SocketAddr> {
        self.cluster.events().subscribe_host_up()
    }

    pub fn subscribe_host_down_events(&self) -> broadcast::Receiver<SocketAddr> {
        self.cluster.events().subscribe_host_down()
    }

    pub fn subscribe_schema_events(&self) -> broadcast::Receiver<SchemaChangeEvent> {
        self.cluster.events().subscribe_schema_changed()
    }

    /* ---------- statement execution ---------- */

    /// Runs an unprepared statement, fetching at most a single page when a
    /// page size is configured.
    pub async fn query(
        &self,
        query: impl Into<Query>,
        values: impl ValueList,
    ) -> Result<QueryResult, QueryError> {
        let query = query.into();
        let (result, _paging_state) = self
            .query_paged(&query, values, PagingState::start())
            .await?;
        Ok(result)
    }

    /// Runs an unprepared statement starting from the given paging state.
    pub async fn query_single_page(
        &self,
        query: impl Into<Query>,
        values: impl ValueList,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), QueryError> {
        let mut query = query.into();
        if query.config.page_size.is_none() {
            query.config.page_size = Some(DEFAULT_PAGE_SIZE);
        }
        self.query_paged(&query, values, paging_state).await
    }

    async fn query_paged(
        &self,
        query: &Query,
        values: impl ValueList,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), QueryError> {
        let serialized_values = values
            .serialized()
            .map_err(BadQuery::SerializeValuesError)?
            .into_owned();

        // Unprepared statements carry no metadata, so no routing key can
        // be computed; the plan is purely policy driven.
        let routing = RoutingInfo::default();

        let response = self
            .run_request(routing, &query.config, |connection, consistency| {
                let paging_state = paging_state.clone();
                let serialized_values = &serialized_values;
                async move {
                    connection
                        .query_with_consistency(
                            query,
                            serialized_values,
                            consistency,
                            query.config.serial_consistency,
                            paging_state,
                            query.config.page_size,
                        )
                        .await?
                        .into_non_error_response()
                }
            })
            .await?;

        let response = match response {
            RunRequestResult::Completed(response) => response,
            RunRequestResult::IgnoredWriteError => {
                return Ok((
                    QueryResult::mock_empty(None, Vec::new()),
                    PagingStateResponse::NoMorePages,
                ))
            }
        };

        self.handle_set_keyspace_response(&response).await?;
        self.handle_auto_await_schema_agreement(&response).await?;

        let result = response.into_query_result().map_err(RequestAttemptError::into_query_error)?;
        let paging_state_response = result.paging_state_response().clone();
        Ok((result, paging_state_response))
    }

    /// Prepares a statement, caching it by (keyspace, statement text).
    /// A second prepare of the same statement is served from the cache.
    pub async fn prepare(&self, query: impl Into<Query>) -> Result<PreparedStatement, QueryError> {
        let query = query.into();
        let cache_key = (
            self.current_keyspace.read().unwrap().clone(),
            query.contents.clone(),
        );

        if let Some(cached) = self.prepared_statement_cache.get(&cache_key) {
            trace!("Prepared statement cache hit for {:?}", cache_key.1);
            return Ok(cached.clone());
        }

        let routing = RoutingInfo::default();
        let response = self
            .run_request(routing, &query.config, |connection, _consistency| {
                let query = &query;
                async move {
                    let prepared = connection.prepare(query).await?;
                    Ok(PreparedResponse(prepared))
                }
            })
            .await?;

        let mut prepared = match response {
            RunRequestResult::Completed(PreparedResponse(prepared)) => prepared,
            RunRequestResult::IgnoredWriteError => {
                return Err(QueryError::ProtocolError(
                    "Retry policy ignored an error of a PREPARE request",
                ))
            }
        };
        prepared.set_partitioner_name(self.cluster.get_state().partitioner().clone());
        self.prepared_statement_cache
            .insert(cache_key, prepared.clone());
        Ok(prepared)
    }

    /// Executes a prepared statement. On an UNPREPARED error the statement
    /// is prepared again on the same connection and resent once, without
    /// consuming a retry attempt.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: impl ValueList,
    ) -> Result<QueryResult, QueryError> {
        let (result, _paging_state) = self
            .execute_paged(prepared, values, PagingState::start(), None)
            .await?;
        Ok(result)
    }

    /// Executes a prepared statement starting from the given paging state.
    pub async fn execute_single_page(
        &self,
        prepared: &PreparedStatement,
        values: impl ValueList,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), QueryError> {
        let page_size = prepared.config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        self.execute_paged(prepared, values, paging_state, Some(page_size))
            .await
    }

    async fn execute_paged(
        &self,
        prepared: &PreparedStatement,
        values: impl ValueList,
        paging_state: PagingState,
        page_size: Option<i32>,
    ) -> Result<(QueryResult, PagingStateResponse), QueryError> {
        let serialized_values = values
            .serialized()
            .map_err(BadQuery::SerializeValuesError)?
            .into_owned();

        let routing = prepared.routing_info(&serialized_values)?;

        let response = self
            .run_request(routing, &prepared.config, |connection, consistency| {
                let paging_state = paging_state.clone();
                let serialized_values = &serialized_values;
                async move {
                    let execute_result = connection
                        .execute_with_consistency(
                            prepared,
                            serialized_values,
                            consistency,
                            prepared.config.serial_consistency,
                            paging_state.clone(),
                            page_size,
                        )
                        .await?
                        .into_non_error_response();

                    match execute_result {
                        Err(RequestAttemptError::DbError(
                            crate::errors::DbError::Unprepared { statement_id },
                            _,
                        )) => {
                            // The server lost the statement: prepare again
                            // on this very connection and resend once.
                            debug!(
                                "Server reports statement {:?} unprepared; repreparing",
                                statement_id
                            );
                            connection.reprepare(prepared).await?;
                            connection
                                .execute_with_consistency(
                                    prepared,
                                    serialized_values,
                                    consistency,
                                    prepared.config.serial_consistency,
                                    paging_state,
                                    page_size,
                                )
                                .await?
                                .into_non_error_response()
                        }
                        other => other,
                    }
                }
            })
            .await?;

        let response = match response {
            RunRequestResult::Completed(response) => response,
            RunRequestResult::IgnoredWriteError => {
                return Ok((
                    QueryResult::mock_empty(None, Vec::new()),
                    PagingStateResponse::NoMorePages,
                ))
            }
        };

        self.handle_set_keyspace_response(&response).await?;
        self.handle_auto_await_schema_agreement(&response).await?;

        let result = response.into_query_result().map_err(RequestAttemptError::into_query_error)?;
        let paging_state_response = result.paging_state_response().clone();
        Ok((result, paging_state_response))
    }

    /// Executes a batch of statements as one unit. `values` must carry one
    /// value list per statement.
    pub async fn batch<V: ValueList>(
        &self,
        batch: &Batch,
        values: &[V],
    ) -> Result<QueryResult, QueryError> {
        if batch.statements.len() != values.len() {
            return Err(QueryError::BadQuery(BadQuery::ValueLenMismatch(
                batch.statements.len(),
                values.len(),
            )));
        }

        let serialized_values: Vec<SerializedValues> = values
            .iter()
            .map(|value_list| {
                value_list
                    .serialized()
                    .map(Cow::into_owned)
                    .map_err(BadQuery::SerializeValuesError)
            })
            .collect::<Result<_, _>>()?;

        // Routing follows the first prepared statement of the batch.
        let routing = batch
            .statements
            .iter()
            .zip(serialized_values.iter())
            .find_map(|(statement, values)| match statement {
                BatchStatement::PreparedStatement(prepared) => {
                    prepared.routing_info(values).ok()
                }
                BatchStatement::Query(_) => None,
            })
            .unwrap_or_default();

        let wire_statements: Vec<cql_batch::BatchStatement<'_>> = batch
            .statements
            .iter()
            .map(|statement| match statement {
                BatchStatement::Query(query) => cql_batch::BatchStatement::Query {
                    text: Cow::Borrowed(query.contents.as_str()),
                },
                BatchStatement::PreparedStatement(prepared) => {
                    cql_batch::BatchStatement::Prepared {
                        id: Cow::Borrowed(prepared.get_id().as_ref()),
                    }
                }
            })
            .collect();

        let response = self
            .run_request(routing, &batch.config, |connection, consistency| {
                let wire_statements = wire_statements.clone();
                let serialized_values = serialized_values.clone();
                async move {
                    connection
                        .batch_with_consistency(
                            batch.get_type(),
                            wire_statements,
                            serialized_values,
                            &batch.config,
                            consistency,
                            batch.config.serial_consistency,
                        )
                        .await?
                        .into_non_error_response()
                }
            })
            .await?;

        match response {
            RunRequestResult::Completed(response) => response
                .into_query_result()
                .map_err(RequestAttemptError::into_query_error),
            RunRequestResult::IgnoredWriteError => Ok(QueryResult::mock_empty(None, Vec::new())),
        }
    }

    /// Sends "USE keyspace" to every pooled connection and remembers the
    /// keyspace for connections opened later.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), QueryError> {
        let keyspace_name = keyspace_name.into();
        let verified = VerifiedKeyspaceName::new(keyspace_name.clone(), case_sensitive)
            .map_err(BadQuery::BadKeyspaceName)?;

        self.cluster.use_keyspace(verified).await?;
        *self.current_keyspace.write().unwrap() = Some(keyspace_name);
        Ok(())
    }

    /* ---------- schema agreement ---------- */

    /// Fetches the schema version of every reachable node; `Some(version)`
    /// when they all agree, `None` otherwise.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, QueryError> {
        let state = self.cluster.get_state();
        let connections: Vec<Arc<Connection>> = state
            .get_nodes_info()
            .iter()
            .filter(|node| node.is_up())
            .filter_map(|node| node.connection_for_request().ok())
            .collect();

        if connections.is_empty() {
            return Err(QueryError::NoHostAvailable(NoHostAvailableError::default()));
        }

        let results = join_all(
            connections
                .iter()
                .map(|connection| connection.fetch_schema_version()),
        )
        .await;

        let mut versions = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(version) => versions.push(version),
                // A node that cannot answer right now does not constitute
                // disagreement.
                Err(err) => debug!("Schema version fetch failed: {}", err),
            }
        }

        let first = match versions.first() {
            Some(first) => *first,
            None => return Ok(None),
        };
        Ok(versions.iter().all(|version| *version == first).then_some(first))
    }

    /// Polls schema versions until all reachable nodes agree or the
    /// schema-agreement timeout elapses.
    pub async fn await_schema_agreement(&self) -> Result<Uuid, QueryError> {
        timeout(self.schema_agreement_timeout, async {
            loop {
                if let Some(agreed_version) = self.check_schema_agreement().await? {
                    return Ok(agreed_version);
                }
                tokio::time::sleep(self.schema_agreement_interval).await;
            }
        })
        .await
        .unwrap_or(Err(QueryError::RequestTimeout(
            self.schema_agreement_timeout,
        )))
    }

    async fn handle_set_keyspace_response(
        &self,
        response: &NonErrorQueryResponse,
    ) -> Result<(), QueryError> {
        if let Some(set_keyspace) = response.as_set_keyspace() {
            debug!(
                "Detected USE KEYSPACE query; setting session keyspace to {}",
                set_keyspace.keyspace_name
            );
            self.use_keyspace(set_keyspace.keyspace_name.clone(), true)
                .await?;
        }
        Ok(())
    }

    /// DDL responses are followed by a schema-agreement wait, so the
    /// caller can rely on subsequent requests seeing the new schema.
    async fn handle_auto_await_schema_agreement(
        &self,
        response: &NonErrorQueryResponse,
    ) -> Result<(), QueryError> {
        if response.as_schema_change().is_some() {
            self.await_schema_agreement().await?;
            // The schema changed; the debounced worker refresh will pick
            // up the new metadata shortly, but an explicit refresh makes
            // the change visible to this caller immediately.
            self.refresh_metadata().await?;
        }
        Ok(())
    }

    /* ---------- the request executor ---------- */

    /// Executes `run_attempt` over the query plan: PLAN_NEXT_HOST ->
    /// ACQUIRE_CONN -> SEND -> AWAIT -> DECIDE, with the retry policy
    /// mapping each failure to retry-same / retry-next / rethrow, the
    /// speculative-execution policy racing fibers for idempotent
    /// statements, and the per-request deadline bounding the whole run.
    async fn run_request<'a, ResT, QueryFut>(
        &'a self,
        routing: RoutingInfo,
        statement_config: &'a StatementConfig,
        run_attempt: impl Fn(Arc<Connection>, Consistency) -> QueryFut + 'a,
    ) -> Result<RunRequestResult<ResT>, QueryError>
    where
        QueryFut: Future<Output = Result<ResT, RequestAttemptError>>,
    {
        let consistency = statement_config
            .consistency
            .unwrap_or(self.default_consistency);
        if consistency.is_serial() {
            // Serial consistencies belong in the serial_consistency field.
            return Err(QueryError::BadQuery(BadQuery::SerialConsistencyForbidden(
                consistency,
            )));
        }

        let retry_policy: &dyn RetryPolicy = statement_config
            .retry_policy
            .as_deref()
            .unwrap_or(self.retry_policy.as_ref());

        let state = self.cluster.get_state();

        let runner = async {
            let plan = self.load_balancing_policy.plan(&routing, &state);

            match &self.speculative_execution_policy {
                Some(speculative_policy) if statement_config.is_idempotent => {
                    // The plan is shared: each fiber consumes hosts from
                    // the same lazy sequence.
                    let shared_plan = SharedPlan {
                        iter: Mutex::new(plan),
                    };

                    let fiber_generator = |is_speculative: bool| {
                        if is_speculative {
                            trace!("Launching speculative fiber");
                        }
                        self.run_request_speculative_fiber(
                            &shared_plan,
                            &run_attempt,
                            consistency,
                            statement_config.is_idempotent,
                            retry_policy.new_session(),
                        )
                    };

                    speculative_execution::execute(speculative_policy.as_ref(), fiber_generator)
                        .await
                }
                _ => self
                    .run_request_speculative_fiber(
                        plan,
                        &run_attempt,
                        consistency,
                        statement_config.is_idempotent,
                        retry_policy.new_session(),
                    )
                    .await
                    .unwrap_or(Err(QueryError::NoHostAvailable(
                        NoHostAvailableError::default(),
                    ))),
            }
        };

        let effective_timeout = statement_config.request_timeout.or(self.request_timeout);
        match effective_timeout {
            Some(request_timeout) => timeout(request_timeout, runner)
                .await
                .unwrap_or(Err(QueryError::RequestTimeout(request_timeout))),
            None => runner.await,
        }
    }

    /// One fiber of request execution: walks the plan, acquiring a
    /// connection per host and consulting the retry session after each
    /// failure. Returns None when the plan yielded no hosts at all.
    async fn run_request_speculative_fiber<'a, ResT, QueryFut>(
        &'a self,
        plan: impl IntoIterator<Item = Arc<Node>>,
        run_attempt: &impl Fn(Arc<Connection>, Consistency) -> QueryFut,
        statement_consistency: Consistency,
        is_idempotent: bool,
        mut retry_session: Box<dyn crate::policies::retry::RetrySession>,
    ) -> Option<Result<RunRequestResult<ResT>, QueryError>>
    where
        QueryFut: Future<Output = Result<ResT, RequestAttemptError>>,
    {
        let mut current_consistency = statement_consistency;
        let mut per_host_errors: HashMap<SocketAddr, String> = HashMap::new();
        let mut any_host_tried = false;

        'nodes_in_plan: for node in plan {
            any_host_tried = true;
            'same_node_retries: loop {
                trace!(node = %node.address, "Attempting request");
                let connection = match node.connection_for_request() {
                    Ok(connection) => connection,
                    Err(err) => {
                        trace!(node = %node.address, error = %err, "Choosing connection failed");
                        per_host_errors.insert(node.address, err.to_string());
                        continue 'nodes_in_plan;
                    }
                };

                let attempt_error: RequestAttemptError =
                    match run_attempt(connection, current_consistency).await {
                        Ok(response) => {
                            trace!(node = %node.address, "Request succeeded");
                            return Some(Ok(RunRequestResult::Completed(response)));
                        }
                        Err(err) => {
                            trace!(node = %node.address, error = %err, "Request failed");
                            err
                        }
                    };

                // A connection-level failure marks the host for the
                // registry's reconnection machinery.
                if matches!(&attempt_error, RequestAttemptError::BrokenConnection(_)) {
                    warn!(node = %node.address, "Connection broke during request");
                }

                let request_info = RequestInfo {
                    error: &attempt_error,
                    is_idempotent,
                    consistency: statement_consistency,
                };
                let retry_decision = retry_session.decide_should_retry(request_info);
                trace!(node = %node.address, retry_decision = ?retry_decision);

                per_host_errors.insert(node.address, attempt_error.to_string());
                let last_error = attempt_error.into_query_error();

                match retry_decision {
                    RetryDecision::RetrySameNode(new_consistency) => {
                        current_consistency = new_consistency.unwrap_or(current_consistency);
                        continue 'same_node_retries;
                    }
                    RetryDecision::RetryNextNode(new_consistency) => {
                        current_consistency = new_consistency.unwrap_or(current_consistency);
                        continue 'nodes_in_plan;
                    }
                    RetryDecision::DontRetry => {
                        return Some(Err(last_error));
                    }
                    RetryDecision::IgnoreWriteError => {
                        return Some(Ok(RunRequestResult::IgnoredWriteError));
                    }
                }
            }
        }

        if !any_host_tried {
            return None;
        }
        Some(Err(QueryError::NoHostAvailable(NoHostAvailableError {
            errors: per_host_errors,
        })))
    }
}

/// Wraps the single prepared statement returned by a PREPARE attempt so it
/// can flow through the generic executor.
struct PreparedResponse(PreparedStatement);

/// A plan iterator shared between speculative fibers.
struct SharedPlan<I>
where
    I: Iterator<Item = Arc<Node>>,
{
    iter: Mutex<I>,
}

impl<I> Iterator for &SharedPlan<I>
where
    I: Iterator<Item = Arc<Node>>,
{
    type Item = Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.lock().unwrap().next()
    }
}
