//! Async Rust driver for the Basalt wide-column database, speaking the CQL
//! binary protocol (v2 through v4) over TCP.
//!
//! # Driver overview
//!
//! All driver activity revolves around the [Session]: it owns a pool of
//! multiplexed connections per cluster node, keeps a live view of topology
//! and token ownership through a dedicated control connection, and routes
//! every request to a suitable replica under pluggable load-balancing,
//! retry, reconnection and speculative-execution policies.
//!
//! ### Connecting
//!
//! A `Session` is created by specifying a few known nodes and connecting:
//!
//! ```rust,no_run
//! use basalt::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Making requests
//!
//! The session executes unprepared statements, prepared statements and
//! batches; bound values are usually passed as a tuple:
//!
//! ```rust,no_run
//! # use basalt::Session;
//! # use std::error::Error;
//! # async fn example(session: &Session) -> Result<(), Box<dyn Error>> {
//! session
//!     .query("INSERT INTO ks.tab (a, b) VALUES (?, ?)", (2_i32, "text"))
//!     .await?;
//!
//! let prepared = session.prepare("SELECT a, b FROM ks.tab WHERE a = ?").await?;
//! let result = session.execute(&prepared, (2_i32,)).await?;
//! # Ok(())
//! # }
//! ```

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

mod utils;

pub use client::{Session, SessionBuilder, SessionConfig};
pub use errors::{NewSessionError, QueryError};
pub use network::{Compression, PoolSize};
pub use response::QueryResult;
pub use statement::batch::Batch;
pub use statement::prepared::PreparedStatement;
pub use statement::query::Query;

pub use basalt_cql::frame::value::{MaybeUnset, Unset, ValueList};
pub use basalt_cql::frame::ProtocolVersion;
pub use basalt_cql::{Consistency, SerialConsistency};
