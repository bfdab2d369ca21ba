//! Requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;

use super::frame_errors::ParseError;
use super::ProtocolVersion;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

/// Opcode of a request frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

/// Requests that can be serialized into a frame body.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError>;

    fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, ParseError> {
        let mut v = Vec::new();
        self.serialize(version, &mut v)?;
        Ok(v.into())
    }
}

/// Requests that can be read back from a frame body.
///
/// The driver never deserializes requests on its own behalf; this exists so
/// tests can assert that serialized frames carry the intended parameters.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError>;
}
