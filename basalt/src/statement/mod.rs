//! Statements: unprepared queries, prepared statements and batches,
//! together with their per-statement execution options.

pub mod batch;
pub mod prepared;
pub mod query;

use std::sync::Arc;
use std::time::Duration;

use crate::policies::retry::RetryPolicy;
pub use basalt_cql::frame::types::{Consistency, SerialConsistency};

/// The default page size of paged queries.
pub(crate) const DEFAULT_PAGE_SIZE: i32 = 5000;

/// Options applying to a single statement, overriding session defaults.
#[derive(Clone, Default)]
pub struct StatementConfig {
    /// Consistency to use for this statement; session default if None.
    pub consistency: Option<Consistency>,
    /// Serial consistency of the Paxos phase of conditional statements.
    pub serial_consistency: Option<SerialConsistency>,
    /// Whether the statement can be applied twice with no effect on the
    /// outcome of the first application. Only idempotent statements are
    /// retried after errors that leave the server state unknown, and only
    /// they are executed speculatively.
    pub is_idempotent: bool,
    /// Page size for paged execution.
    pub page_size: Option<i32>,
    /// Client-supplied write timestamp (microseconds).
    pub timestamp: Option<i64>,
    /// Whether to request tracing of this statement.
    pub tracing: bool,
    /// Per-statement timeout overriding the session request timeout.
    pub request_timeout: Option<Duration>,
    /// Per-statement retry policy overriding the session one.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl std::fmt::Debug for StatementConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementConfig")
            .field("consistency", &self.consistency)
            .field("serial_consistency", &self.serial_consistency)
            .field("is_idempotent", &self.is_idempotent)
            .field("page_size", &self.page_size)
            .field("timestamp", &self.timestamp)
            .field("tracing", &self.tracing)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
