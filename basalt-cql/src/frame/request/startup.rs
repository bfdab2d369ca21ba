use std::borrow::Cow;
use std::collections::HashMap;

use crate::frame::frame_errors::ParseError;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;
use crate::frame::ProtocolVersion;

pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
pub const COMPRESSION: &str = "COMPRESSION";

/// STARTUP - finalises the negotiation phase and establishes the
/// connection. The options map carries the accepted CQL version and,
/// optionally, the compression algorithm.
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)
    }
}

impl DeserializableRequest for Startup<'_> {
    fn deserialize(_version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { options })
    }
}
