use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::ProtocolVersion;

/// OPTIONS - asks the server which STARTUP options it supports. Also used
/// as the connection heartbeat, since its body is empty and it is always
/// allowed.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _version: ProtocolVersion, _buf: &mut Vec<u8>) -> Result<(), ParseError> {
        Ok(())
    }
}
