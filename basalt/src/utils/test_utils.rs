use std::sync::Once;

/// Initializes tracing output for tests; safe to call repeatedly.
pub(crate) fn setup_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub(crate) mod mock_server {
    //! A minimal in-process node speaking just enough of the protocol to
    //! exercise connection setup, request correlation, metadata fetch and
    //! the executor paths in unit tests.

    use bytes::BufMut;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use basalt_cql::frame::types;
    use basalt_cql::frame::ProtocolVersion;

    #[derive(Clone)]
    pub(crate) struct MockNodeOptions {
        /// Versions above this one are refused with ERROR ProtocolError.
        pub(crate) max_supported_version: ProtocolVersion,
        /// When false, requests after the handshake get no response at all.
        pub(crate) respond_to_requests: bool,
        /// Buffer responses after the handshake until this many requests
        /// have been received, then flush them all.
        pub(crate) hold_responses_until: Option<usize>,
        /// Respond to every data QUERY with ERROR Unavailable.
        pub(crate) always_unavailable: bool,
        /// Respond to the first EXECUTE (across all connections) with
        /// ERROR Unprepared; the driver is expected to reprepare and
        /// resend on the same connection.
        pub(crate) fail_first_execute_as_unprepared: bool,
        /// Leave data statements unanswered (metadata queries still work).
        pub(crate) stall_data_queries: bool,
        /// Datacenter reported in system.local.
        pub(crate) datacenter: &'static str,
    }

    impl Default for MockNodeOptions {
        fn default() -> Self {
            Self {
                max_supported_version: ProtocolVersion::V4,
                respond_to_requests: true,
                hold_responses_until: None,
                always_unavailable: false,
                fail_first_execute_as_unprepared: false,
                stall_data_queries: false,
                datacenter: "dc1",
            }
        }
    }

    pub(crate) const MOCK_PREPARED_ID: &[u8] = b"mockprep";

    pub(crate) struct MockNode {
        address: SocketAddr,
        handle: JoinHandle<()>,
        connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
        queries_served: Arc<AtomicUsize>,
    }

    struct RequestFrame {
        version: u8,
        stream: i16,
        opcode: u8,
        body: Vec<u8>,
    }

    async fn read_request_frame(stream: &mut TcpStream) -> std::io::Result<RequestFrame> {
        let version = stream.read_u8().await?;
        let _flags = stream.read_u8().await?;
        let stream_id = if version & 0x7F == 0x02 {
            stream.read_i8().await? as i16
        } else {
            stream.read_i16().await?
        };
        let opcode = stream.read_u8().await?;
        let length = stream.read_u32().await?;
        let mut body = vec![0; length as usize];
        stream.read_exact(&mut body).await?;
        Ok(RequestFrame {
            version,
            stream: stream_id,
            opcode,
            body,
        })
    }

    fn make_response_frame(version: u8, stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.put_u8(version | 0x80);
        frame.put_u8(0); // flags
        if version & 0x7F == 0x02 {
            frame.put_i8(stream as i8);
        } else {
            frame.put_i16(stream);
        }
        frame.put_u8(opcode);
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(body);
        frame
    }

    fn supported_body() -> Vec<u8> {
        // An empty string multimap.
        vec![0, 0]
    }

    fn error_body(code: i32, reason: &str, extra: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_i32(code);
        types::write_string(reason, &mut body).unwrap();
        extra(&mut body);
        body
    }

    fn void_result_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.put_i32(0x0001);
        body
    }

    fn set_keyspace_body(keyspace: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_i32(0x0003);
        types::write_string(keyspace, &mut body).unwrap();
        body
    }

    const TYPE_TEXT: u16 = 0x000D;
    const TYPE_UUID: u16 = 0x000C;
    const TYPE_INET: u16 = 0x0010;
    const TYPE_SET: u16 = 0x0022;
    const TYPE_MAP: u16 = 0x0021;

    fn write_col_spec(body: &mut Vec<u8>, name: &str, type_ids: &[u16]) {
        types::write_string(name, body).unwrap();
        for type_id in type_ids {
            types::write_short(*type_id, body);
        }
    }

    /// Builds a RESULT Rows body with a global table spec.
    fn rows_body(
        keyspace: &str,
        table: &str,
        col_specs: &[(&str, &[u16])],
        rows: &[Vec<Option<Vec<u8>>>],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_i32(0x0002); // kind: Rows
        body.put_i32(0x0001); // flags: global table spec
        body.put_i32(col_specs.len() as i32);
        types::write_string(keyspace, &mut body).unwrap();
        types::write_string(table, &mut body).unwrap();
        for (name, type_ids) in col_specs {
            write_col_spec(&mut body, name, type_ids);
        }
        body.put_i32(rows.len() as i32);
        for row in rows {
            for value in row {
                match value {
                    Some(value) => types::write_bytes(value, &mut body).unwrap(),
                    None => body.put_i32(-1),
                }
            }
        }
        body
    }

    fn text_value(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn uuid_value(uuid: uuid::Uuid) -> Vec<u8> {
        uuid.as_bytes().to_vec()
    }

    fn inet_value(addr: SocketAddr) -> Vec<u8> {
        match addr.ip() {
            std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
            std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    fn set_of_text_value(elems: &[&str]) -> Vec<u8> {
        let mut value = Vec::new();
        value.put_i32(elems.len() as i32);
        for elem in elems {
            types::write_bytes(elem.as_bytes(), &mut value).unwrap();
        }
        value
    }

    fn local_row_body(address: SocketAddr, datacenter: &str) -> Vec<u8> {
        rows_body(
            "system",
            "local",
            &[
                ("host_id", &[TYPE_UUID]),
                ("rpc_address", &[TYPE_INET]),
                ("data_center", &[TYPE_TEXT]),
                ("rack", &[TYPE_TEXT]),
                ("tokens", &[TYPE_SET, TYPE_TEXT]),
                ("release_version", &[TYPE_TEXT]),
                ("partitioner", &[TYPE_TEXT]),
                ("cluster_name", &[TYPE_TEXT]),
            ],
            &[vec![
                Some(uuid_value(uuid::Uuid::new_v4())),
                Some(inet_value(address)),
                Some(text_value(datacenter)),
                Some(text_value("r1")),
                Some(set_of_text_value(&["0"])),
                Some(text_value("4.0.0")),
                Some(text_value("org.apache.cassandra.dht.Murmur3Partitioner")),
                Some(text_value("mock-cluster")),
            ]],
        )
    }

    fn peers_empty_body() -> Vec<u8> {
        rows_body(
            "system",
            "peers",
            &[
                ("host_id", &[TYPE_UUID]),
                ("rpc_address", &[TYPE_INET]),
                ("data_center", &[TYPE_TEXT]),
                ("rack", &[TYPE_TEXT]),
                ("tokens", &[TYPE_SET, TYPE_TEXT]),
                ("release_version", &[TYPE_TEXT]),
            ],
            &[],
        )
    }

    fn keyspaces_empty_body() -> Vec<u8> {
        rows_body(
            "system_schema",
            "keyspaces",
            &[
                ("keyspace_name", &[TYPE_TEXT]),
                ("replication", &[TYPE_MAP, TYPE_TEXT, TYPE_TEXT]),
            ],
            &[],
        )
    }

    fn schema_tables_empty_body(table: &str, col_specs: &[(&str, &[u16])]) -> Vec<u8> {
        rows_body("system_schema", table, col_specs, &[])
    }

    fn schema_version_body() -> Vec<u8> {
        rows_body(
            "system",
            "local",
            &[("schema_version", &[TYPE_UUID])],
            &[vec![Some(uuid_value(uuid::Uuid::from_u128(0x1234)))]],
        )
    }

    fn prepared_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.put_i32(0x0004); // kind: Prepared
        types::write_short_bytes(MOCK_PREPARED_ID, &mut body).unwrap();
        // prepared metadata: no columns, no pk
        body.put_i32(0); // flags
        body.put_i32(0); // col count
        body.put_i32(0); // pk count
        // result metadata: no columns
        body.put_i32(0); // flags
        body.put_i32(0); // col count
        body
    }

    fn query_text(body: &[u8]) -> String {
        let mut buf = body;
        types::read_long_string(&mut buf)
            .map(ToOwned::to_owned)
            .unwrap_or_default()
    }

    struct ConnectionState {
        handshake_done: bool,
        requests_after_handshake: usize,
    }

    fn response_for(
        frame: &RequestFrame,
        options: &MockNodeOptions,
        local_address: SocketAddr,
        queries_served: &AtomicUsize,
        unprepared_fired: &std::sync::atomic::AtomicBool,
    ) -> Option<Vec<u8>> {
        let version = frame.version & 0x7F;
        let response = match frame.opcode {
            0x01 => make_response_frame(version, frame.stream, 0x02, &[]), // STARTUP -> READY
            0x05 => make_response_frame(version, frame.stream, 0x06, &supported_body()),
            0x0B => make_response_frame(version, frame.stream, 0x02, &[]), // REGISTER -> READY
            0x09 => make_response_frame(version, frame.stream, 0x08, &prepared_body()),
            0x07 => {
                // QUERY - dispatch on the statement text.
                let text = query_text(&frame.body);
                let lower = text.to_lowercase();
                let body = if lower.contains("from system.peers") {
                    peers_empty_body()
                } else if lower.contains("schema_version") {
                    schema_version_body()
                } else if lower.contains("from system.local") {
                    local_row_body(local_address, options.datacenter)
                } else if lower.contains("from system_schema.keyspaces") {
                    keyspaces_empty_body()
                } else if lower.contains("from system_schema.tables") {
                    schema_tables_empty_body(
                        "tables",
                        &[
                            ("keyspace_name", &[TYPE_TEXT]),
                            ("table_name", &[TYPE_TEXT]),
                        ],
                    )
                } else if lower.contains("from system_schema.columns") {
                    schema_tables_empty_body(
                        "columns",
                        &[
                            ("keyspace_name", &[TYPE_TEXT]),
                            ("table_name", &[TYPE_TEXT]),
                            ("column_name", &[TYPE_TEXT]),
                            ("kind", &[TYPE_TEXT]),
                            ("position", &[0x0009]),
                            ("type", &[TYPE_TEXT]),
                        ],
                    )
                } else if lower.contains("from system_schema.types") {
                    schema_tables_empty_body(
                        "types",
                        &[
                            ("keyspace_name", &[TYPE_TEXT]),
                            ("type_name", &[TYPE_TEXT]),
                            ("field_names", &[TYPE_SET, TYPE_TEXT]),
                            ("field_types", &[TYPE_SET, TYPE_TEXT]),
                        ],
                    )
                } else if let Some(keyspace) = lower.strip_prefix("use ") {
                    set_keyspace_body(keyspace.trim().trim_matches('"'))
                } else if options.stall_data_queries {
                    return None;
                } else if options.always_unavailable {
                    queries_served.fetch_add(1, Ordering::SeqCst);
                    error_body(0x1000, "not enough replicas", |body| {
                        types::write_short(0x0001, body); // consistency ONE
                        body.put_i32(1);
                        body.put_i32(0);
                    })
                } else {
                    queries_served.fetch_add(1, Ordering::SeqCst);
                    void_result_body()
                };
                make_response_frame(version, frame.stream, 0x08, &body)
            }
            0x0A => {
                // EXECUTE
                if options.fail_first_execute_as_unprepared
                    && !unprepared_fired.swap(true, Ordering::SeqCst)
                {
                    let body = error_body(0x2500, "unprepared", |body| {
                        types::write_short_bytes(MOCK_PREPARED_ID, body).unwrap();
                    });
                    make_response_frame(version, frame.stream, 0x00, &body)
                } else if options.stall_data_queries {
                    return None;
                } else {
                    queries_served.fetch_add(1, Ordering::SeqCst);
                    make_response_frame(version, frame.stream, 0x08, &void_result_body())
                }
            }
            0x0D => {
                // BATCH
                if options.stall_data_queries {
                    return None;
                }
                queries_served.fetch_add(1, Ordering::SeqCst);
                make_response_frame(version, frame.stream, 0x08, &void_result_body())
            }
            _ => {
                let body = error_body(0x0000, "unexpected request", |_| {});
                make_response_frame(version, frame.stream, 0x00, &body)
            }
        };
        Some(response)
    }

    async fn serve_connection(
        mut stream: TcpStream,
        options: MockNodeOptions,
        local_address: SocketAddr,
        queries_served: Arc<AtomicUsize>,
        unprepared_fired: Arc<std::sync::atomic::AtomicBool>,
    ) {
        let mut state = ConnectionState {
            handshake_done: false,
            requests_after_handshake: 0,
        };
        let mut held: Vec<Vec<u8>> = Vec::new();

        loop {
            let frame = match read_request_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(_) => return,
            };

            let client_version = frame.version & 0x7F;
            if client_version > options.max_supported_version.as_byte() {
                let body = error_body(0x000A, "Invalid or unsupported protocol version", |_| {});
                let response = make_response_frame(client_version, frame.stream, 0x00, &body);
                let _ = stream.write_all(&response).await;
                let _ = stream.flush().await;
                continue;
            }

            if !state.handshake_done {
                let response = match response_for(
                    &frame,
                    &options,
                    local_address,
                    &queries_served,
                    &unprepared_fired,
                ) {
                    Some(response) => response,
                    None => continue,
                };
                if stream.write_all(&response).await.is_err() {
                    return;
                }
                let _ = stream.flush().await;
                if frame.opcode == 0x01 {
                    // STARTUP answered: the connection is ready.
                    state.handshake_done = true;
                }
                continue;
            }

            state.requests_after_handshake += 1;

            if !options.respond_to_requests {
                continue;
            }

            let response = match response_for(
                &frame,
                &options,
                local_address,
                &queries_served,
                &unprepared_fired,
            ) {
                Some(response) => response,
                None => continue,
            };
            match options.hold_responses_until {
                Some(threshold) if state.requests_after_handshake <= threshold => {
                    held.push(response);
                    if state.requests_after_handshake == threshold {
                        for response in held.drain(..) {
                            if stream.write_all(&response).await.is_err() {
                                return;
                            }
                        }
                        let _ = stream.flush().await;
                    }
                }
                _ => {
                    if stream.write_all(&response).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                }
            }
        }
    }

    impl MockNode {
        pub(crate) async fn start(options: MockNodeOptions) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = listener.local_addr().unwrap();

            let connections = Arc::new(Mutex::new(Vec::<JoinHandle<()>>::new()));
            let connections_in_loop = connections.clone();
            let queries_served = Arc::new(AtomicUsize::new(0));
            let queries_served_in_loop = queries_served.clone();
            let unprepared_fired = Arc::new(std::sync::atomic::AtomicBool::new(false));

            let handle = tokio::spawn(async move {
                loop {
                    let (stream, _peer) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(_) => return,
                    };
                    let options = options.clone();
                    connections_in_loop.lock().unwrap().push(tokio::spawn(
                        serve_connection(
                            stream,
                            options,
                            address,
                            queries_served_in_loop.clone(),
                            unprepared_fired.clone(),
                        ),
                    ));
                }
            });

            MockNode {
                address,
                handle,
                connections,
                queries_served,
            }
        }

        pub(crate) fn address(&self) -> SocketAddr {
            self.address
        }

        /// Number of data statements (not metadata queries) served.
        pub(crate) fn queries_served(&self) -> usize {
            self.queries_served.load(Ordering::SeqCst)
        }

        /// Closes the listener and all accepted sockets.
        pub(crate) async fn kill(&self) {
            self.handle.abort();
            for connection in self.connections.lock().unwrap().iter() {
                connection.abort();
            }
            // Yield so aborted tasks actually drop their sockets.
            tokio::task::yield_now().await;
        }
    }

    impl Drop for MockNode {
        fn drop(&mut self) {
            self.handle.abort();
            for connection in self.connections.lock().unwrap().iter() {
                connection.abort();
            }
        }
    }
}
