use bytes::Bytes;

use super::StatementConfig;
use crate::errors::{BadQuery, QueryError};
use crate::routing::partitioner::{calculate_token_for_partition_key, PartitionerName};
use crate::routing::{RoutingInfo, Token};
use basalt_cql::frame::response::result::PreparedMetadata;
use basalt_cql::frame::types::{Consistency, SerialConsistency};
use basalt_cql::frame::value::SerializedValues;

/// A statement prepared on the server, identified by the id returned from
/// PREPARE.
///
/// Knows its bind markers and partition key indexes, so executing it with
/// bound values yields a routing token and lets the token-aware policy
/// target replicas directly.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: Bytes,
    statement: String,
    metadata: PreparedMetadata,
    partitioner_name: PartitionerName,
    /// The keyspace the statement operates on, from the prepared metadata.
    keyspace_name: Option<String>,
    pub config: StatementConfig,
}

impl PreparedStatement {
    pub(crate) fn new(
        id: Bytes,
        statement: String,
        metadata: PreparedMetadata,
        partitioner_name: PartitionerName,
        config: StatementConfig,
    ) -> Self {
        let keyspace_name = metadata
            .col_specs
            .first()
            .map(|spec| spec.table_spec.ks_name.clone());
        Self {
            id,
            statement,
            metadata,
            partitioner_name,
            keyspace_name,
            config,
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub(crate) fn set_id(&mut self, id: Bytes) {
        self.id = id;
    }

    /// The partitioner is a cluster-wide property from `system.local`; the
    /// session patches it in after preparing.
    pub(crate) fn set_partitioner_name(&mut self, partitioner_name: PartitionerName) {
        self.partitioner_name = partitioner_name;
    }

    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    pub fn get_keyspace_name(&self) -> Option<&str> {
        self.keyspace_name.as_deref()
    }

    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    pub fn get_partitioner_name(&self) -> &PartitionerName {
        &self.partitioner_name
    }

    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.config.consistency = Some(consistency);
    }

    pub fn set_serial_consistency(&mut self, serial_consistency: Option<SerialConsistency>) {
        self.config.serial_consistency = serial_consistency;
    }

    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn set_page_size(&mut self, page_size: i32) {
        self.config.page_size = Some(page_size);
    }

    pub fn set_tracing(&mut self, tracing: bool) {
        self.config.tracing = tracing;
    }

    /// Extracts the serialized partition key from the bound values, in
    /// partition key order.
    ///
    /// Returns None when the statement has no partition key markers (the
    /// server could not determine the key, e.g. for multi-table or
    /// non-data statements).
    pub(crate) fn extract_partition_key(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Option<SerializedValues>, QueryError> {
        if self.metadata.pk_indexes.is_empty() {
            return Ok(None);
        }

        let values: Vec<_> = bound_values.iter().collect();
        let mut partition_key = SerializedValues::new();
        for pk_index in &self.metadata.pk_indexes {
            let value = values.get(*pk_index as usize).ok_or_else(|| {
                QueryError::BadQuery(BadQuery::ValueLenMismatch(
                    self.metadata.col_count,
                    bound_values.element_count() as usize,
                ))
            })?;
            partition_key
                .add_raw_value(*value)
                .map_err(BadQuery::SerializeValuesError)?;
        }
        Ok(Some(partition_key))
    }

    /// Computes the routing token for the given bound values.
    pub fn calculate_token(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Option<Token>, QueryError> {
        let partition_key = match self.extract_partition_key(bound_values)? {
            Some(partition_key) => partition_key,
            None => return Ok(None),
        };

        calculate_token_for_partition_key(&partition_key, &self.partitioner_name)
            .map(Some)
            .map_err(|err| QueryError::BadQuery(BadQuery::Other(err.to_string())))
    }

    /// Routing information consumed by token-aware load balancing.
    pub(crate) fn routing_info(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<RoutingInfo, QueryError> {
        Ok(RoutingInfo {
            token: self.calculate_token(bound_values)?,
            keyspace: self.keyspace_name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::partitioner::{Murmur3Partitioner, Partitioner};
    use basalt_cql::frame::response::result::{
        ColumnSpec, ColumnType, PreparedMetadata, TableSpec,
    };

    fn metadata_with_pk_indexes(pk_indexes: Vec<u16>, col_count: usize) -> PreparedMetadata {
        let col_specs = (0..col_count)
            .map(|i| ColumnSpec {
                table_spec: TableSpec {
                    ks_name: "ks".to_string(),
                    table_name: "tab".to_string(),
                },
                name: format!("col{}", i),
                typ: ColumnType::Blob,
            })
            .collect();
        PreparedMetadata {
            flags: 0,
            col_count,
            pk_indexes,
            col_specs,
        }
    }

    fn prepared_with(pk_indexes: Vec<u16>, col_count: usize) -> PreparedStatement {
        PreparedStatement::new(
            Bytes::from_static(b"id"),
            "INSERT INTO ks.tab (a, b) VALUES (?, ?)".to_string(),
            metadata_with_pk_indexes(pk_indexes, col_count),
            PartitionerName::Murmur3,
            StatementConfig::default(),
        )
    }

    #[test]
    fn token_of_single_column_key() {
        let prepared = prepared_with(vec![0], 2);

        let mut values = SerializedValues::new();
        values.add_value(&"foo").unwrap();
        values.add_value(&42).unwrap();

        let token = prepared.calculate_token(&values).unwrap().unwrap();
        assert_eq!(token, Murmur3Partitioner.hash_one(b"foo"));
    }

    #[test]
    fn token_follows_pk_index_order() {
        // Partition key is (col1, col0): values must be hashed in that
        // order, not bind-marker order.
        let prepared = prepared_with(vec![1, 0], 2);

        let mut values = SerializedValues::new();
        values.add_value(&"second").unwrap();
        values.add_value(&"first").unwrap();

        let token = prepared.calculate_token(&values).unwrap().unwrap();

        let composite = b"\x00\x05first\x00\x00\x06second\x00";
        assert_eq!(token, Murmur3Partitioner.hash_one(composite));
    }

    #[test]
    fn no_pk_indexes_no_token() {
        let prepared = prepared_with(vec![], 2);
        let values = SerializedValues::new();
        assert!(prepared.calculate_token(&values).unwrap().is_none());
    }

    #[test]
    fn missing_pk_value_is_an_error() {
        let prepared = prepared_with(vec![1], 2);
        let mut values = SerializedValues::new();
        values.add_value(&"only one").unwrap();

        assert!(prepared.calculate_token(&values).is_err());
    }

    #[test]
    fn keyspace_comes_from_metadata() {
        let prepared = prepared_with(vec![0], 1);
        assert_eq!(prepared.get_keyspace_name(), Some("ks"));
    }
}
