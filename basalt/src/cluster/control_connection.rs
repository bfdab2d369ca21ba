//! The control connection: a single privileged connection used solely for
//! metadata queries and event subscription, never for user requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::warn;

use crate::cluster::metadata::{
    create_peer_from_row, strategy_from_string_map, Column, ColumnKind, Keyspace, Metadata, Peer,
    PeerRowColumns, Strategy, Table, UserDefinedType,
};
use crate::errors::QueryError;
use crate::network::connection::Connection;
use crate::policies::address_translator::AddressTranslator;
use crate::routing::partitioner::PartitionerName;
use basalt_cql::frame::response::result::{CqlValue, Row};

const LOCAL_QUERY: &str = "select host_id, rpc_address, data_center, rack, tokens, \
     release_version, partitioner, cluster_name from system.local";
const PEERS_QUERY: &str = "select host_id, rpc_address, data_center, rack, tokens, \
     release_version from system.peers";
const KEYSPACES_QUERY: &str = "select keyspace_name, replication from system_schema.keyspaces";
const TABLES_QUERY: &str = "select keyspace_name, table_name from system_schema.tables";
const COLUMNS_QUERY: &str = "select keyspace_name, table_name, column_name, kind, position, \
     type from system_schema.columns";
const TYPES_QUERY: &str =
    "select keyspace_name, type_name, field_names, field_types from system_schema.types";

pub(crate) struct ControlConnection {
    connection: Arc<Connection>,
}

impl ControlConnection {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    /// Reads a full metadata snapshot: peers with their tokens, and the
    /// keyspace schemas.
    pub(crate) async fn query_metadata(
        &self,
        connect_address: SocketAddr,
        keyspaces_to_fetch: &[String],
        fetch_schema: bool,
        address_translator: Option<&dyn AddressTranslator>,
    ) -> Result<Metadata, QueryError> {
        let (peers, partitioner, cluster_name) =
            self.query_peers(connect_address, address_translator).await?;
        let keyspaces = self.query_keyspaces(keyspaces_to_fetch, fetch_schema).await?;

        Ok(Metadata {
            peers,
            keyspaces,
            partitioner,
            cluster_name,
        })
    }

    async fn query_peers(
        &self,
        connect_address: SocketAddr,
        address_translator: Option<&dyn AddressTranslator>,
    ) -> Result<(Vec<Peer>, PartitionerName, Option<String>), QueryError> {
        let local_result = self.connection.query_unpaged(LOCAL_QUERY).await;
        let local_rows = local_result
            .map_err(|err| err.into_query_error())?
            .into_rows()
            .ok_or(QueryError::ProtocolError("system.local query returned no rows"))?;

        let mut partitioner = PartitionerName::default();
        let mut cluster_name = None;
        let mut peers = Vec::new();

        for row in local_rows {
            let row_columns = parse_peer_row(&row, 0)?;
            if let Some(partitioner_text) = row_text(&row, 6) {
                match PartitionerName::from_class_name(&partitioner_text) {
                    Some(recognized) => partitioner = recognized,
                    None => warn!(
                        "Unrecognized partitioner {}; token-aware routing will assume Murmur3",
                        partitioner_text
                    ),
                }
            }
            cluster_name = row_text(&row, 7);

            if let Some(peer) =
                create_peer_from_row(true, connect_address, row_columns, address_translator).await
            {
                peers.push(peer);
            }
        }

        let peers_result = self.connection.query_unpaged(PEERS_QUERY).await;
        let peers_rows = peers_result
            .map_err(|err| err.into_query_error())?
            .into_rows()
            .ok_or(QueryError::ProtocolError("system.peers query returned no rows"))?;

        for row in peers_rows {
            let row_columns = parse_peer_row(&row, 0)?;
            if let Some(peer) =
                create_peer_from_row(false, connect_address, row_columns, address_translator).await
            {
                peers.push(peer);
            }
        }

        Ok((peers, partitioner, cluster_name))
    }

    async fn query_keyspaces(
        &self,
        keyspaces_to_fetch: &[String],
        fetch_schema: bool,
    ) -> Result<HashMap<String, Keyspace>, QueryError> {
        let rows = self
            .connection
            .query_unpaged(KEYSPACES_QUERY)
            .await
            .map_err(|err| err.into_query_error())?
            .into_rows()
            .ok_or(QueryError::ProtocolError(
                "system_schema.keyspaces query returned no rows",
            ))?;

        let (mut all_tables, mut all_user_defined_types) = if fetch_schema {
            (self.query_tables().await?, self.query_types().await?)
        } else {
            (HashMap::new(), HashMap::new())
        };

        let mut keyspaces = HashMap::new();
        for row in rows {
            let keyspace_name = row_text(&row, 0).ok_or(QueryError::ProtocolError(
                "system_schema.keyspaces has invalid column type",
            ))?;
            if !keyspaces_to_fetch.is_empty() && !keyspaces_to_fetch.contains(&keyspace_name) {
                continue;
            }

            let strategy_map = match row.columns.get(1).and_then(Option::as_ref) {
                Some(value) => value
                    .clone()
                    .into_string_map()
                    .map(|pairs| pairs.into_iter().collect::<HashMap<_, _>>())
                    .ok_or(QueryError::ProtocolError(
                        "system_schema.keyspaces has invalid column type",
                    ))?,
                None => HashMap::new(),
            };

            let strategy = if strategy_map.is_empty() {
                Strategy::LocalStrategy
            } else {
                strategy_from_string_map(strategy_map)?
            };

            let tables = all_tables.remove(&keyspace_name).unwrap_or_default();
            let user_defined_types = all_user_defined_types
                .remove(&keyspace_name)
                .unwrap_or_default();

            keyspaces.insert(
                keyspace_name,
                Keyspace {
                    strategy,
                    tables,
                    user_defined_types,
                },
            );
        }

        Ok(keyspaces)
    }

    async fn query_tables(&self) -> Result<HashMap<String, HashMap<String, Table>>, QueryError> {
        let rows = self
            .connection
            .query_unpaged(TABLES_QUERY)
            .await
            .map_err(|err| err.into_query_error())?
            .into_rows()
            .ok_or(QueryError::ProtocolError(
                "system_schema.tables query returned no rows",
            ))?;

        let mut tables: HashMap<String, HashMap<String, Table>> = HashMap::new();
        for row in rows {
            let keyspace_name = row_text(&row, 0).ok_or(QueryError::ProtocolError(
                "system_schema.tables has invalid column type",
            ))?;
            let table_name = row_text(&row, 1).ok_or(QueryError::ProtocolError(
                "system_schema.tables has invalid column type",
            ))?;
            tables
                .entry(keyspace_name)
                .or_default()
                .insert(table_name, Table::default());
        }

        self.fill_table_columns(&mut tables).await?;
        Ok(tables)
    }

    async fn fill_table_columns(
        &self,
        tables: &mut HashMap<String, HashMap<String, Table>>,
    ) -> Result<(), QueryError> {
        let rows = self
            .connection
            .query_unpaged(COLUMNS_QUERY)
            .await
            .map_err(|err| err.into_query_error())?
            .into_rows()
            .ok_or(QueryError::ProtocolError(
                "system_schema.columns query returned no rows",
            ))?;

        // Key columns arrive with their position within the key; collect
        // (position, name) pairs first, order later.
        let mut partition_keys: HashMap<(String, String), Vec<(i32, String)>> = HashMap::new();
        let mut clustering_keys: HashMap<(String, String), Vec<(i32, String)>> = HashMap::new();

        for row in rows {
            let keyspace_name = row_text(&row, 0).ok_or(QueryError::ProtocolError(
                "system_schema.columns has invalid column type",
            ))?;
            let table_name = row_text(&row, 1).ok_or(QueryError::ProtocolError(
                "system_schema.columns has invalid column type",
            ))?;
            let column_name = row_text(&row, 2).ok_or(QueryError::ProtocolError(
                "system_schema.columns has invalid column type",
            ))?;
            let kind_text = row_text(&row, 3).ok_or(QueryError::ProtocolError(
                "system_schema.columns has invalid column type",
            ))?;
            let position = row
                .columns
                .get(4)
                .and_then(Option::as_ref)
                .and_then(CqlValue::as_int)
                .unwrap_or(-1);
            let type_text = row_text(&row, 5).unwrap_or_default();

            let kind: ColumnKind = match kind_text.parse() {
                Ok(kind) => kind,
                Err(()) => {
                    warn!(
                        "Unknown column kind {} for {}.{}.{}; assuming regular",
                        kind_text, keyspace_name, table_name, column_name
                    );
                    ColumnKind::Regular
                }
            };

            let table = match tables
                .get_mut(&keyspace_name)
                .and_then(|keyspace_tables| keyspace_tables.get_mut(&table_name))
            {
                Some(table) => table,
                None => continue,
            };

            match kind {
                ColumnKind::PartitionKey => partition_keys
                    .entry((keyspace_name.clone(), table_name.clone()))
                    .or_default()
                    .push((position, column_name.clone())),
                ColumnKind::Clustering => clustering_keys
                    .entry((keyspace_name.clone(), table_name.clone()))
                    .or_default()
                    .push((position, column_name.clone())),
                _ => {}
            }

            table.columns.insert(column_name, Column { type_text, kind });
        }

        for ((keyspace_name, table_name), mut keys) in partition_keys {
            keys.sort_by_key(|(position, _)| *position);
            if let Some(table) = tables
                .get_mut(&keyspace_name)
                .and_then(|keyspace_tables| keyspace_tables.get_mut(&table_name))
            {
                table.partition_key = keys.into_iter().map(|(_, name)| name).collect();
            }
        }
        for ((keyspace_name, table_name), mut keys) in clustering_keys {
            keys.sort_by_key(|(position, _)| *position);
            if let Some(table) = tables
                .get_mut(&keyspace_name)
                .and_then(|keyspace_tables| keyspace_tables.get_mut(&table_name))
            {
                table.clustering_key = keys.into_iter().map(|(_, name)| name).collect();
            }
        }

        Ok(())
    }

    async fn query_types(
        &self,
    ) -> Result<HashMap<String, HashMap<String, UserDefinedType>>, QueryError> {
        let rows = self
            .connection
            .query_unpaged(TYPES_QUERY)
            .await
            .map_err(|err| err.into_query_error())?
            .into_rows()
            .ok_or(QueryError::ProtocolError(
                "system_schema.types query returned no rows",
            ))?;

        let mut types: HashMap<String, HashMap<String, UserDefinedType>> = HashMap::new();
        for row in rows {
            let keyspace_name = row_text(&row, 0).ok_or(QueryError::ProtocolError(
                "system_schema.types has invalid column type",
            ))?;
            let type_name = row_text(&row, 1).ok_or(QueryError::ProtocolError(
                "system_schema.types has invalid column type",
            ))?;
            let field_names = row
                .columns
                .get(2)
                .and_then(Option::as_ref)
                .cloned()
                .and_then(CqlValue::into_string_vec)
                .unwrap_or_default();
            let field_types = row
                .columns
                .get(3)
                .and_then(Option::as_ref)
                .cloned()
                .and_then(CqlValue::into_string_vec)
                .unwrap_or_default();

            types.entry(keyspace_name).or_default().insert(
                type_name.clone(),
                UserDefinedType {
                    name: type_name,
                    field_names,
                    field_types,
                },
            );
        }

        Ok(types)
    }
}

fn row_text(row: &Row, index: usize) -> Option<String> {
    row.columns
        .get(index)
        .and_then(Option::as_ref)
        .and_then(CqlValue::as_text)
        .cloned()
}

/// Parses the shared prefix of `system.local`/`system.peers` rows:
/// host_id, rpc_address, data_center, rack, tokens, release_version.
fn parse_peer_row(row: &Row, offset: usize) -> Result<PeerRowColumns, QueryError> {
    let host_id = row
        .columns
        .get(offset)
        .and_then(Option::as_ref)
        .and_then(CqlValue::as_uuid);
    let ip = row
        .columns
        .get(offset + 1)
        .and_then(Option::as_ref)
        .and_then(CqlValue::as_inet)
        .ok_or(QueryError::ProtocolError(
            "system.peers or system.local has invalid column type",
        ))?;
    let datacenter = row_text(row, offset + 2);
    let rack = row_text(row, offset + 3);
    let tokens = row
        .columns
        .get(offset + 4)
        .and_then(Option::as_ref)
        .cloned()
        .and_then(CqlValue::into_string_vec)
        .unwrap_or_default();
    let release_version = row_text(row, offset + 5);

    Ok(PeerRowColumns {
        host_id,
        ip,
        datacenter,
        rack,
        tokens,
        release_version,
    })
}
