//! A single connection to a cluster node: one TCP socket multiplexing
//! in-flight requests by stream id.
//!
//! Each connection is driven by a router task joining four sub-futures on
//! one fiber: a reader (dispatches incoming frames to waiters by stream
//! id, server events to the event channel), a writer (serializes request
//! frames onto the socket, parking requests while the stream-id pool is
//! exhausted), an orphan watcher (reclaims stream ids of cancelled
//! requests) and a keepaliver (OPTIONS heartbeat on an idle connection).

use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use socket2::{SockRef, TcpKeepalive};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, ConnectionError, ConnectionSetupError, DbError,
    RequestAttemptError,
};
use crate::response::{NonErrorResponse, QueryResponse};
use crate::statement::prepared::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::StatementConfig;
use basalt_cql::frame::request::batch as cql_batch;
use basalt_cql::frame::request::query::{PagingState, QueryParameters};
use basalt_cql::frame::request::{self, SerializableRequest};
use basalt_cql::frame::response::{result, Response, ResponseOpcode};
use basalt_cql::frame::server_event_type::EventType;
use basalt_cql::frame::value::SerializedValues;
use basalt_cql::frame::{
    self, Compression, FrameParams, ProtocolVersion, SerializedRequest, DEFAULT_MAX_FRAME_SIZE,
};
use basalt_cql::frame::response::event::Event;
use basalt_cql::{Consistency, SerialConsistency};

// Query for schema agreement checks.
const LOCAL_SCHEMA_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

// "Orphaned" stream ids belong to requests whose callers stopped waiting
// (cancellation). An id stays quarantined until the late response arrives;
// a connection accumulating too many old orphans is shut down and replaced
// by the pool.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;
const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

type RequestId = u64;

/// Configuration used for new connections.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    /// Set only on the control connection; makes the connection REGISTER
    /// for server events and forward them into the channel.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) default_consistency: Consistency,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// Heartbeat interval; an idle connection sends OPTIONS this often.
    pub(crate) keepalive_interval: Option<Duration>,
    /// Two consecutive heartbeats unanswered within this timeout close the
    /// connection.
    pub(crate) keepalive_timeout: Option<Duration>,
    /// Newest protocol version offered during negotiation.
    pub(crate) preferred_version: ProtocolVersion,
    pub(crate) max_frame_size: usize,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("compression", &self.compression)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("event_sender", &self.event_sender)
            .field("default_consistency", &self.default_consistency)
            .field("authenticator", &self.authenticator.is_some())
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("preferred_version", &self.preferred_version)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            event_sender: None,
            default_consistency: Consistency::default(),
            authenticator: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            preferred_version: ProtocolVersion::NEWEST,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    version: ProtocolVersion,
    /// Set when the server turned down the configured compression during
    /// STARTUP negotiation; requests are then sent uncompressed.
    compression_rejected: std::sync::atomic::AtomicBool,
    router_handle: Arc<RouterHandle>,
}

#[derive(Debug)]
struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request needs a unique id to correlate late responses of
    // cancelled requests with their orphaned stream ids.
    request_id_generator: AtomicU64,
    // Notifications about `send_request` futures dropped before their
    // response arrived. Unbounded, because only unbounded channels can be
    // pushed to synchronously from a Drop implementation.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,

    // Number of requests currently in flight; the pool picks the least
    // loaded connection.
    in_flight: AtomicUsize,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        serialized_request: SerializedRequest,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        struct InFlightGuard<'a>(&'a AtomicUsize);
        impl Drop for InFlightGuard<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _in_flight_guard = InFlightGuard(&self.in_flight);

        // Dropping the notifier before `disable` tells the router to mark
        // the stream id of this request as orphaned.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError { BrokenConnectionError::ChannelError })?;

        let task_response = receiver
            .await
            .map_err(|_| -> BrokenConnectionError { BrokenConnectionError::ChannelError })?;

        // The response arrived, no need to notify about orphaning.
        notifier.disable();

        task_response
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestAttemptError>>,
    request_id: RequestId,
}

// Notifies the router about a `send_request` future dropped before its
// response arrived.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

#[derive(Debug)]
struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

impl Connection {
    /// Opens the socket and starts the router; no protocol exchange happens
    /// yet.
    async fn new(
        connect_address: SocketAddr,
        version: ProtocolVersion,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector =
            tokio::time::timeout(config.connect_timeout, connect(connect_address)).await;
        let stream = match stream_connector {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        // Unbounded because it allows for synchronous pushes from Drop.
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            in_flight: AtomicUsize::new(0),
        });

        let (task, _worker_handle) = Self::router(
            config.clone(),
            version,
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            router_handle.clone(),
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            config,
            version,
            connect_address,
            compression_rejected: std::sync::atomic::AtomicBool::new(false),
            router_handle,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // "Interval" here is the time until the OS starts probing an idle
        // connection, which socket2 calls "time".
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(target_os = "android", target_os = "linux", target_os = "macos"))]
        {
            tcp_keepalive = tcp_keepalive
                .with_interval(Duration::from_secs(1))
                .with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// Number of requests currently in flight on this connection.
    pub(crate) fn in_flight(&self) -> usize {
        self.router_handle.in_flight()
    }

    /// Upper bound on useful in-flight requests: the stream id pool size.
    pub(crate) fn request_limit(&self) -> usize {
        self.version.stream_id_count()
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let compression = if compress && !self.compression_rejected.load(Ordering::Relaxed) {
            self.config.compression
        } else {
            None
        };
        let serialized_request =
            SerializedRequest::make(request, self.version, compression, tracing)?;

        let task_response = self.router_handle.send_request(serialized_request).await?;

        Self::parse_response(task_response, self.config.compression)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warning in &body_with_ext.warnings {
            warn!("Server warning: {}", warning);
        }

        let response = Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    /* ---------- connection setup exchange ---------- */

    /// Performs the full setup exchange: OPTIONS, STARTUP, the optional
    /// authentication loop and, on control connections, REGISTER.
    async fn initialize(&self) -> Result<(), ConnectionError> {
        let supported = self.get_options().await?;

        let mut options: HashMap<Cow<'_, str>, Cow<'_, str>> = HashMap::new();
        options.insert(
            Cow::Borrowed(request::startup::CQL_VERSION),
            Cow::Borrowed(request::startup::DEFAULT_CQL_VERSION),
        );
        if let Some(compression) = self.config.compression {
            let compression_str = compression.to_string();
            let supported_compression = supported
                .options
                .get("COMPRESSION")
                .map(Vec::as_slice)
                .unwrap_or_default();
            if supported_compression.iter().any(|c| c == &compression_str) {
                options.insert(
                    Cow::Borrowed(request::startup::COMPRESSION),
                    Cow::Owned(compression_str),
                );
            } else {
                warn!(
                    "Compression {} is not supported by the server, proceeding without compression",
                    compression_str
                );
                self.compression_rejected
                    .store(true, Ordering::Relaxed);
            }
        }

        let startup_response = self.startup(options).await?;
        match startup_response {
            StartupResponse::Ready => {}
            StartupResponse::Authenticate(authenticate) => {
                self.perform_authenticate(&authenticate.authenticator_name)
                    .await?;
            }
        }

        if self.config.event_sender.is_some() {
            self.register_for_events().await?;
        }

        Ok(())
    }

    async fn get_options(
        &self,
    ) -> Result<basalt_cql::frame::response::Supported, ConnectionSetupError> {
        let response = self
            .send_request(&request::Options, false, false)
            .await
            .map_err(Self::setup_error_from_attempt)?;
        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(err) => Err(ConnectionSetupError::DbError(err.error, err.reason)),
            other => Err(ConnectionSetupError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<StartupResponse, ConnectionSetupError> {
        // STARTUP itself must never be compressed.
        let response = self
            .send_request(&request::Startup { options }, false, false)
            .await
            .map_err(Self::setup_error_from_attempt)?;
        match response.response {
            Response::Ready => Ok(StartupResponse::Ready),
            Response::Authenticate(authenticate) => {
                Ok(StartupResponse::Authenticate(authenticate))
            }
            Response::Error(err) => Err(ConnectionSetupError::DbError(err.error, err.reason)),
            other => Err(ConnectionSetupError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticator_name: &str,
    ) -> Result<(), ConnectionSetupError> {
        let authenticator_provider = self
            .config
            .authenticator
            .as_ref()
            .ok_or(ConnectionSetupError::MissingAuthentication)?;

        let (mut response, mut auth_session) = authenticator_provider
            .start_authentication_session(authenticator_name)
            .await
            .map_err(ConnectionSetupError::StartAuthSessionError)?;

        loop {
            match self.authenticate_response(response).await? {
                AuthResponseReply::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionSetupError::AuthChallengeEvaluationError)?;
                }
                AuthResponseReply::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionSetupError::AuthFinishError)?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<AuthResponseReply, ConnectionSetupError> {
        let query_response = self
            .send_request(&request::AuthResponse { response }, false, false)
            .await
            .map_err(Self::setup_error_from_attempt)?;
        match query_response.response {
            Response::AuthSuccess(auth_success) => Ok(AuthResponseReply::AuthSuccess(auth_success)),
            Response::AuthChallenge(auth_challenge) => {
                Ok(AuthResponseReply::AuthChallenge(auth_challenge))
            }
            Response::Error(err) => Err(ConnectionSetupError::DbError(err.error, err.reason)),
            other => Err(ConnectionSetupError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    async fn register_for_events(&self) -> Result<(), ConnectionSetupError> {
        let register = request::Register {
            event_types_to_register_for: vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ],
        };
        let response = self
            .send_request(&register, true, false)
            .await
            .map_err(Self::setup_error_from_attempt)?;
        match response.response {
            Response::Ready => Ok(()),
            Response::Error(err) => Err(ConnectionSetupError::DbError(err.error, err.reason)),
            other => Err(ConnectionSetupError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    fn setup_error_from_attempt(err: RequestAttemptError) -> ConnectionSetupError {
        match err {
            RequestAttemptError::DbError(db_error, reason) => {
                ConnectionSetupError::DbError(db_error, reason)
            }
            other => ConnectionSetupError::QueryError(Box::new(other.into_query_error())),
        }
    }

    /* ---------- statement execution ---------- */

    pub(crate) async fn query_with_consistency(
        &self,
        query: &Query,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: PagingState,
        page_size: Option<i32>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query_frame = basalt_cql::frame::request::query::Query {
            contents: Cow::Borrowed(query.contents.as_str()),
            parameters: QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size,
                paging_state,
                skip_metadata: false,
                timestamp: query.config.timestamp,
            },
        };

        self.send_request(&query_frame, true, query.config.tracing)
            .await
    }

    pub(crate) async fn execute_with_consistency(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: PagingState,
        page_size: Option<i32>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute_frame = basalt_cql::frame::request::execute::Execute {
            id: prepared.get_id().clone(),
            parameters: QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size,
                paging_state,
                skip_metadata: false,
                timestamp: prepared.config.timestamp,
            },
        };

        self.send_request(&execute_frame, true, prepared.config.tracing)
            .await
    }

    pub(crate) async fn batch_with_consistency(
        &self,
        batch_type: cql_batch::BatchType,
        statements: Vec<cql_batch::BatchStatement<'_>>,
        values: Vec<SerializedValues>,
        config: &StatementConfig,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let batch_frame = cql_batch::Batch {
            statements: Cow::Owned(statements),
            batch_type,
            consistency,
            serial_consistency,
            timestamp: config.timestamp,
            values,
        };

        self.send_request(&batch_frame, true, config.tracing).await
    }

    /// Prepares a statement on this connection.
    pub(crate) async fn prepare(
        &self,
        query: &Query,
    ) -> Result<PreparedStatement, RequestAttemptError> {
        let query_response = self
            .send_request(
                &request::Prepare {
                    query: &query.contents,
                },
                true,
                query.config.tracing,
            )
            .await?;

        match query_response.response {
            Response::Error(err) => Err(err.into()),
            Response::Result(result::Result::Prepared(p)) => Ok(PreparedStatement::new(
                p.id,
                query.contents.clone(),
                p.prepared_metadata,
                Default::default(),
                query.config.clone(),
            )),
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    /// Prepares the statement again after an UNPREPARED error. The server
    /// derives the id from the statement text, so a changed id indicates a
    /// misbehaving server.
    pub(crate) async fn reprepare(
        &self,
        previous_prepared: &PreparedStatement,
    ) -> Result<(), RequestAttemptError> {
        let reprepare_query = Query::new(previous_prepared.get_statement().to_owned());
        let reprepared = self.prepare(&reprepare_query).await?;

        if reprepared.get_id() != previous_prepared.get_id() {
            Err(RequestAttemptError::RepreparedIdChanged)
        } else {
            Ok(())
        }
    }

    /// Runs a single unprepared statement with default options; used for
    /// internal queries.
    pub(crate) async fn query_unpaged(
        &self,
        query: impl Into<Query>,
    ) -> Result<crate::response::QueryResult, RequestAttemptError> {
        let query = query.into();
        let response = self
            .query_with_consistency(
                &query,
                SerializedValues::EMPTY,
                self.config.default_consistency,
                None,
                PagingState::start(),
                None,
            )
            .await?;
        response.into_non_error_response()?.into_query_result()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), RequestAttemptError> {
        // Keyspace names are case sensitive only when quoted.
        let query: Query = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()).into(),
            false => format!("USE {}", keyspace_name.as_str()).into(),
        };

        let query_response = self
            .query_with_consistency(
                &query,
                SerializedValues::EMPTY,
                self.config.default_consistency,
                None,
                PagingState::start(),
                None,
            )
            .await?;

        let non_error = query_response.into_non_error_response()?;
        match non_error.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if set_keyspace.keyspace_name.to_lowercase()
                    != keyspace_name.as_str().to_lowercase()
                {
                    return Err(RequestAttemptError::UnexpectedResponse(
                        "SET_KEYSPACE with mismatched keyspace name",
                    ));
                }
                Ok(())
            }
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    /// Fetches this node's schema version; used for agreement checks.
    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, RequestAttemptError> {
        let result = self.query_unpaged(LOCAL_SCHEMA_VERSION).await?;
        result
            .first_row_column(0)
            .and_then(|value| value.as_uuid())
            .ok_or(RequestAttemptError::UnexpectedResponse(
                "system.local without schema_version",
            ))
    }

    /* ---------- router ---------- */

    #[allow(clippy::too_many_arguments)]
    async fn router(
        config: ConnectionConfig,
        version: ProtocolVersion,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
    ) {
        let (read_half, write_half) = split(stream);

        // The handler map is shared by the reader and writer futures which
        // run on the same fiber; the mutex is never contended and exists
        // only because RefCell would make the future !Sync. No lock is held
        // across an .await point.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(version.stream_id_count()));
        let stream_freed = Notify::new();

        let k = Self::keepaliver(
            &router_handle,
            version,
            config.keepalive_interval,
            config.keepalive_timeout,
        );
        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            version,
            config.max_frame_size,
            &handler_map,
            &stream_freed,
            config.event_sender,
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            &stream_freed,
            receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);

        let result = futures::try_join!(r, w, o, k);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // The connection was dropped; nothing to do.
            Err(err) => err,
        };

        // Respond to all pending requests with the error, exactly once.
        let response_handlers: HashMap<i16, ResponseHandler> =
            handler_map.into_inner().unwrap().into_handlers();

        for (_, handler) in response_handlers {
            // Ignore sending errors; the waiter may be gone.
            let _ = handler
                .response_sender
                .send(Err(error.clone().into()));
        }

        // If someone is listening for connection errors, notify them.
        let _ = error_sender.send(error.into());
    }

    #[allow(clippy::too_many_arguments)]
    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        version: ProtocolVersion,
        max_frame_size: usize,
        handler_map: &StdMutex<ResponseHandlerMap>,
        stream_freed: &Notify,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) =
                frame::read_response_frame(&mut read_half, version, max_frame_size)
                    .await
                    .map_err(|err| BrokenConnectionError::FrameError(Arc::new(err)))?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                std::cmp::Ordering::Less => {
                    // Negative stream ids are reserved for server events;
                    // only -1 is in use, ignore anything else.
                    continue;
                }
                std::cmp::Ordering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, compression, event_sender).await?;
                    }
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = {
                // Only this fiber touches the map, see `router`.
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.lookup(params.stream)
            };
            // A freed stream id may unpark a writer-side request.
            stream_freed.notify_one();

            use HandlerLookupResult::*;
            match handler_lookup_res {
                Handler(handler) => {
                    // A send error means the waiter gave up; the orphan
                    // path has already reclaimed the stream id.
                    let _ = handler.response_sender.send(Ok(response));
                }
                Missing => {
                    // An unsolicited frame indicates a bug on one side of
                    // the connection; drop it.
                    debug!("Received response with unexpected stream id {}", params.stream);
                    return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
                }
                Orphaned => {
                    // The handler was freed on cancellation; nothing to do.
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        stream_freed: &Notify,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // Tasks that could not get a stream id wait here until the reader
        // frees one; this realizes the bounded-wait semantics of stream id
        // exhaustion.
        let mut parked: VecDeque<Task> = VecDeque::new();
        let mut channel_open = true;

        while channel_open || !parked.is_empty() {
            // Write everything that can get a stream id right now.
            let mut wrote = false;
            while let Some(task) = parked.pop_front() {
                let allocation = {
                    // Uncontended, see `router`.
                    let mut handler_map_guard = handler_map.try_lock().unwrap();
                    handler_map_guard.allocate(task)
                };
                match allocation {
                    Ok((stream_id, mut serialized_request)) => {
                        serialized_request.set_stream(stream_id);
                        write_half
                            .write_all(serialized_request.get_data())
                            .await
                            .map_err(|err| BrokenConnectionError::WriteError(Arc::new(err)))?;
                        wrote = true;
                    }
                    Err(task) => {
                        trace!("Stream ids exhausted; parking request");
                        parked.push_front(task);
                        break;
                    }
                }
            }
            if wrote {
                write_half
                    .flush()
                    .await
                    .map_err(|err| BrokenConnectionError::WriteError(Arc::new(err)))?;
            }

            // Wait for more work: a new task, or a freed stream id for a
            // parked one. When the Connection is dropped the channel
            // closes and the writer finishes cleanly.
            if parked.is_empty() {
                match task_receiver.recv().await {
                    Some(task) => {
                        parked.push_back(task);
                        // Coalesce whatever else is already queued.
                        while let Ok(more) = task_receiver.try_recv() {
                            parked.push_back(more);
                        }
                    }
                    None => channel_open = false,
                }
            } else {
                tokio::select! {
                    maybe_task = task_receiver.recv(), if channel_open => match maybe_task {
                        Some(task) => parked.push_back(task),
                        None => channel_open = false,
                    },
                    _ = stream_freed.notified() => {}
                }
            }
        }

        Ok(())
    }

    // Receives notifications from `OrphanhoodNotifier`s and marks the
    // corresponding stream ids as orphaned. Breaks the connection when too
    // many old orphans accumulate.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Uncontended, see `router`.
                    let handler_map_guard = handler_map.try_lock().unwrap();
                    let old_orphan_count = handler_map_guard.old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionError::TooManyOrphanedStreamIds(old_orphan_count));
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    let mut handler_map_guard = handler_map.try_lock().unwrap(); // Same as above
                    handler_map_guard.orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: &RouterHandle,
        version: ProtocolVersion,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
    ) -> Result<(), BrokenConnectionError> {
        let keepalive_interval = match keepalive_interval {
            Some(interval) => interval,
            None => return Ok(()), // Keepalives disabled.
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Consume the immediate first tick.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut consecutive_timeouts: u32 = 0;

        loop {
            interval.tick().await;

            // OPTIONS has an empty body, so serialization cannot fail.
            let serialized_request =
                match SerializedRequest::make(&request::Options, version, None, false) {
                    Ok(r) => r,
                    Err(_) => return Ok(()),
                };

            let keepalive_request = router_handle.send_request(serialized_request);

            let query_result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive_request).await {
                    Ok(res) => res,
                    Err(_) => {
                        consecutive_timeouts += 1;
                        warn!(
                            "Timed out while waiting for response to keepalive request ({} in a row)",
                            consecutive_timeouts
                        );
                        if consecutive_timeouts >= 2 {
                            return Err(BrokenConnectionError::KeepaliveTimeout);
                        }
                        continue;
                    }
                }
            } else {
                keepalive_request.await
            };

            match query_result {
                Ok(_) => {
                    consecutive_timeouts = 0;
                    trace!("Keepalive request successful");
                }
                Err(err) => {
                    warn!("Failed to execute keepalive request: {}", err);
                    return Err(BrokenConnectionError::KeepaliveError(Arc::new(
                        match err {
                            RequestAttemptError::BrokenConnection(e) => e,
                            _ => BrokenConnectionError::ChannelError,
                        },
                    )));
                }
            }
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let event = match Self::parse_response(task_response, compression) {
            Ok(r) => match r.response {
                Response::Event(event) => event,
                _ => {
                    error!("Expected to receive Event response, got {:?}", r.response);
                    return Err(BrokenConnectionError::EventHandlingError(
                        "unexpected response on the event stream",
                    ));
                }
            },
            Err(e) => {
                error!("Failed to parse event response: {}", e);
                return Err(BrokenConnectionError::EventHandlingError(
                    "failed to parse event frame",
                ));
            }
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| BrokenConnectionError::EventHandlingError("event channel closed"))
    }
}

enum StartupResponse {
    Ready,
    Authenticate(basalt_cql::frame::response::authenticate::Authenticate),
}

enum AuthResponseReply {
    AuthChallenge(basalt_cql::frame::response::authenticate::AuthChallenge),
    AuthSuccess(basalt_cql::frame::response::authenticate::AuthSuccess),
}

async fn connect(addr: SocketAddr) -> Result<TcpStream, std::io::Error> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.connect(addr).await
}

/// Opens a connection and performs the setup exchange, negotiating the
/// protocol version downwards when the server refuses the offered one.
pub(crate) async fn open_connection(
    endpoint: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let mut version = config.preferred_version;

    loop {
        let (connection, error_receiver) =
            Connection::new(endpoint, version, config.clone()).await?;

        match connection.initialize().await {
            Ok(()) => {
                debug!(
                    "Connection to {} established on protocol {}",
                    endpoint, version
                );
                return Ok((connection, error_receiver));
            }
            Err(ConnectionError::SetupError(setup_err))
                if is_protocol_version_rejection(&setup_err) =>
            {
                match version.downgrade() {
                    Some(older) => {
                        debug!(
                            "Server at {} refused protocol {} ({}); retrying with {}",
                            endpoint, version, setup_err, older
                        );
                        version = older;
                    }
                    None => return Err(ConnectionError::NoSupportedProtocolVersion),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Recognizes the two shapes a protocol-version refusal takes: an ERROR
/// ProtocolError response, or a response frame stamped with a version the
/// reader does not expect (servers answer a too-new request in their own
/// newest version).
fn is_protocol_version_rejection(err: &ConnectionSetupError) -> bool {
    match err {
        ConnectionSetupError::DbError(DbError::ProtocolError, _) => true,
        ConnectionSetupError::QueryError(boxed) => matches!(
            &**boxed,
            crate::errors::QueryError::BrokenConnection(BrokenConnectionError::FrameError(
                frame_error
            )) if matches!(
                &**frame_error,
                basalt_cql::frame::frame_errors::FrameError::VersionNotSupported(_)
            )
        ),
        _ => false,
    }
}

/* ---------- response handler bookkeeping ---------- */

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: HashMap<i16, Instant>,
}

#[derive(Debug)]
enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(stream_id_count: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(stream_id_count),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: HashMap::new(),
        }
    }

    /// Allocates a stream id for the task; gives the task back when the
    /// pool is exhausted.
    fn allocate(&mut self, task: Task) -> Result<(i16, SerializedRequest), Task> {
        if let Some(stream_id) = self.stream_set.allocate() {
            self.request_to_stream
                .insert(task.response_handler.request_id, stream_id);
            let prev_handler = self.handlers.insert(stream_id, task.response_handler);
            debug_assert!(prev_handler.is_none());
            Ok((stream_id, task.serialized_request))
        } else {
            Err(task)
        }
    }

    // Quarantines the stream id associated with this request id and frees
    // its handler; the id returns to the pool when the late response
    // arrives or the connection closes.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.get(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(*stream_id, Instant::now());
            self.handlers.remove(stream_id);
            self.request_to_stream.remove(&request_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .values()
            .filter(|instant| instant.elapsed() > OLD_AGE_ORPHAN_THRESHOLD)
            .count()
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        self.stream_set.free(stream_id);

        if self.orphanage_tracker.remove(&stream_id).is_some() {
            // This stream id was orphaned, so its handler is long gone;
            // this is a valid state, unlike a missing handler.
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            // The request_id -> stream_id mapping must go, so a late
            // orphan notification cannot quarantine a reused id.
            self.request_to_stream.remove(&handler.request_id);

            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    // Retrieves all handlers; used after the connection breaks to respond
    // to every pending request with the error.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// The per-connection pool of stream ids, kept as a bitmap. Sized by the
/// negotiated protocol version: 128 ids on v2, 32768 on v3+.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    count: usize,
}

impl StreamIdSet {
    fn new(count: usize) -> Self {
        let bitmap_size = count.div_ceil(64);
        Self {
            used_bitmap: vec![0; bitmap_size].into_boxed_slice(),
            count,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                let stream_id = off as usize + block_id * 64;
                if stream_id >= self.count {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as i16);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// A keyspace name that went through validation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Keyspace names can have up to 48 alphanumeric characters and contain
    // underscores.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::mock_server::{MockNode, MockNodeOptions};
    use assert_matches::assert_matches;

    #[test]
    fn stream_id_set_allocates_unique_ids() {
        let mut set = StreamIdSet::new(128);
        let mut allocated = std::collections::HashSet::new();
        for _ in 0..128 {
            let id = set.allocate().unwrap();
            assert!((0..128).contains(&id));
            assert!(allocated.insert(id), "duplicate stream id {}", id);
        }
        // Exhausted.
        assert_eq!(set.allocate(), None);

        // Freeing one id makes exactly one allocation possible again.
        set.free(64);
        assert_eq!(set.allocate(), Some(64));
        assert_eq!(set.allocate(), None);
    }

    #[test]
    fn stream_id_set_v3_capacity() {
        let mut set = StreamIdSet::new(ProtocolVersion::V4.stream_id_count());
        for _ in 0..32768 {
            assert!(set.allocate().is_some());
        }
        assert_eq!(set.allocate(), None);
    }

    #[test]
    fn handler_map_orphan_then_response() {
        let (response_sender, _receiver) = oneshot::channel();
        let mut map = ResponseHandlerMap::new(128);
        let (stream_id, _req) = map
            .allocate(Task {
                serialized_request: SerializedRequest::make(
                    &request::Options,
                    ProtocolVersion::V4,
                    None,
                    false,
                )
                .unwrap(),
                response_handler: ResponseHandler {
                    response_sender,
                    request_id: 1,
                },
            })
            .map_err(|_| ())
            .unwrap();

        // Cancellation notification arrives first.
        map.orphan(1);
        // The late response frees the id without a handler being present.
        assert_matches!(map.lookup(stream_id), HandlerLookupResult::Orphaned);
        // A second response on the same id has no handler: protocol error.
        assert_matches!(map.lookup(stream_id), HandlerLookupResult::Missing);
    }

    #[test]
    fn keyspace_name_validation() {
        assert_matches!(
            VerifiedKeyspaceName::new("".to_string(), false),
            Err(BadKeyspaceName::Empty)
        );
        assert_matches!(
            VerifiedKeyspaceName::new("a".repeat(49), false),
            Err(BadKeyspaceName::TooLong(_, 49))
        );
        assert_matches!(
            VerifiedKeyspaceName::new("ks;DROP".to_string(), false),
            Err(BadKeyspaceName::IllegalCharacter(_, ';'))
        );
        assert!(VerifiedKeyspaceName::new("valid_ks_1".to_string(), false).is_ok());
    }

    #[tokio::test]
    async fn connection_performs_handshake_and_roundtrip() {
        let node = MockNode::start(MockNodeOptions::default()).await;
        let config = ConnectionConfig {
            keepalive_interval: None,
            ..Default::default()
        };

        let (connection, _error_receiver) = open_connection(node.address(), &config)
            .await
            .unwrap();
        assert_eq!(connection.protocol_version(), ProtocolVersion::V4);

        // OPTIONS round trip on an established connection.
        let response = connection
            .send_request(&request::Options, false, false)
            .await
            .unwrap();
        assert_matches!(response.response, Response::Supported(_));
    }

    #[tokio::test]
    async fn connection_negotiates_down_to_v3() {
        let node = MockNode::start(MockNodeOptions {
            max_supported_version: ProtocolVersion::V3,
            ..Default::default()
        })
        .await;
        let config = ConnectionConfig {
            keepalive_interval: None,
            ..Default::default()
        };

        let (connection, _error_receiver) = open_connection(node.address(), &config)
            .await
            .unwrap();
        assert_eq!(connection.protocol_version(), ProtocolVersion::V3);
    }

    #[tokio::test]
    async fn pending_requests_fail_when_connection_breaks() {
        let node = MockNode::start(MockNodeOptions {
            // The server stops responding after the handshake.
            respond_to_requests: false,
            ..Default::default()
        })
        .await;
        let config = ConnectionConfig {
            keepalive_interval: None,
            ..Default::default()
        };

        let (connection, _error_receiver) =
            open_connection(node.address(), &config).await.unwrap();

        let pending = connection.send_request(&request::Options, false, false);
        node.kill().await;

        let result = pending.await;
        assert_matches!(
            result,
            Err(RequestAttemptError::BrokenConnection(_))
        );
    }

    #[tokio::test]
    async fn stream_id_exhaustion_parks_requests() {
        // A v2 connection has 128 stream ids. The server withholds all
        // responses until it has seen 128 requests, so the 129th request
        // must wait for a freed id, then complete.
        let node = MockNode::start(MockNodeOptions {
            max_supported_version: ProtocolVersion::V2,
            hold_responses_until: Some(128),
            ..Default::default()
        })
        .await;
        let config = ConnectionConfig {
            keepalive_interval: None,
            ..Default::default()
        };

        let (connection, _error_receiver) =
            open_connection(node.address(), &config).await.unwrap();
        let connection = Arc::new(connection);

        let mut handles = Vec::new();
        for _ in 0..129 {
            let connection = connection.clone();
            handles.push(tokio::spawn(async move {
                connection
                    .send_request(&request::Options, false, false)
                    .await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_matches!(response.response, Response::Supported(_));
        }
    }
}
