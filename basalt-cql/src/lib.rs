//! CQL binary protocol layer of the basalt driver.
//!
//! This crate implements the wire format only: frame headers for protocol
//! versions 2 through 4, request and response bodies, the server error
//! taxonomy and serialization of bound values. Everything that involves
//! sockets, pools or policies lives in the `basalt` crate.

pub mod errors;
pub mod frame;

pub use crate::errors::DbError;
pub use crate::frame::types::Consistency;
pub use crate::frame::types::SerialConsistency;
pub use crate::frame::ProtocolVersion;
