use crate::frame::frame_errors::ParseError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;
use crate::frame::ProtocolVersion;
use bytes::Bytes;

/// EXECUTE - runs a previously prepared statement, identified by the id
/// the server returned from PREPARE.
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Execute<'a> {
    pub id: Bytes,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_short_bytes(&self.id[..], buf)?;
        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let id = types::read_short_bytes(buf)?.to_vec().into();
        let parameters = QueryParameters::deserialize(version, buf)?;

        Ok(Self { id, parameters })
    }
}
