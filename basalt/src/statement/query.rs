use super::StatementConfig;
use basalt_cql::frame::types::{Consistency, SerialConsistency};
use std::time::Duration;

/// An unprepared CQL statement: query text plus execution options.
#[derive(Clone, Debug)]
pub struct Query {
    /// The statement text. The driver does not parse nor validate it; the
    /// server owns the grammar.
    pub contents: String,
    pub config: StatementConfig,
}

impl Query {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            config: StatementConfig::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.config.page_size = Some(page_size);
        self
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

    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout;
    }
}

impl From<String> for Query {
    fn from(contents: String) -> Query {
        Query::new(contents)
    }
}

impl From<&str> for Query {
    fn from(contents: &str) -> Query {
        Query::new(contents.to_owned())
    }
}
