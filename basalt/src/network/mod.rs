//! Networking: a single multiplexed connection and the per-host pool.

pub(crate) mod connection;
pub(crate) mod pool;

pub use basalt_cql::frame::Compression;
pub use pool::PoolSize;

pub(crate) use connection::VerifiedKeyspaceName;
pub(crate) use pool::PoolConfig;
