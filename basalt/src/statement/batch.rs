use super::prepared::PreparedStatement;
use super::query::Query;
use super::StatementConfig;

pub use basalt_cql::frame::request::batch::BatchType;

/// A batch of statements executed as one unit.
///
/// Only the first statement's routing information is used for token-aware
/// balancing.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub statements: Vec<BatchStatement>,
    batch_type: BatchType,
    pub config: StatementConfig,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..Default::default()
        }
    }

    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }
}

/// A single statement of a batch.
#[derive(Clone, Debug)]
pub enum BatchStatement {
    Query(Query),
    PreparedStatement(PreparedStatement),
}

impl From<&str> for BatchStatement {
    fn from(text: &str) -> BatchStatement {
        BatchStatement::Query(Query::new(text))
    }
}

impl From<Query> for BatchStatement {
    fn from(query: Query) -> BatchStatement {
        BatchStatement::Query(query)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(prepared: PreparedStatement) -> BatchStatement {
        BatchStatement::PreparedStatement(prepared)
    }
}
