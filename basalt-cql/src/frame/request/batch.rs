use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, SerialConsistency};
use crate::frame::value::SerializedValues;
use crate::frame::ProtocolVersion;
use bytes::{Buf, BufMut};
use std::borrow::Cow;
use std::convert::TryInto;

// Batch flags (v3+)
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const ALL_FLAGS: u8 = FLAG_WITH_SERIAL_CONSISTENCY | FLAG_WITH_DEFAULT_TIMESTAMP;

/// BATCH - executes a list of unprepared and/or prepared statements as one
/// unit.
pub struct Batch<'b> {
    pub statements: Cow<'b, [BatchStatement<'b>]>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub values: Vec<SerializedValues>,
}

/// The type of a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Cow<'a, [u8]> },
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        match self {
            BatchStatement::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            BatchStatement::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }
        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let kind = buf.get_u8();
        match kind {
            0 => {
                let text = Cow::Owned(types::read_long_string(buf)?.to_owned());
                Ok(BatchStatement::Query { text })
            }
            1 => {
                let id = types::read_short_bytes(buf)?.to_vec().into();
                Ok(BatchStatement::Prepared { id })
            }
            _ => Err(ParseError::BadIncomingData(format!(
                "Unexpected batch statement kind: {}",
                kind
            ))),
        }
    }
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        if self.timestamp.is_some() && !version.supports_default_timestamp() {
            return Err(ParseError::TimestampOnOldProtocol(version));
        }
        for values in self.values.iter() {
            if values.contains_unset() && !version.supports_unset_values() {
                return Err(ParseError::UnsetValueOnOldProtocol(version));
            }
        }
        if self.statements.len() != self.values.len() {
            return Err(ParseError::BadDataToSerialize(format!(
                "Batch has {} statements but {} value lists",
                self.statements.len(),
                self.values.len()
            )));
        }

        buf.put_u8(self.batch_type as u8);

        let statements_count: u16 = self.statements.len().try_into().map_err(|_| {
            ParseError::BadDataToSerialize(format!(
                "Batch has too many statements: {}",
                self.statements.len()
            ))
        })?;
        buf.put_u16(statements_count);

        for (statement, values) in self.statements.iter().zip(self.values.iter()) {
            statement.serialize(buf)?;
            values.write_to_request(buf);
        }

        types::write_consistency(self.consistency, buf);

        // v2 BATCH ends right after the consistency.
        if version == ProtocolVersion::V2 {
            return Ok(());
        }

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl Batch<'_> {
    /// Counterpart of [SerializableRequest::serialize], used in tests.
    pub fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let batch_type = match buf.get_u8() {
            0 => BatchType::Logged,
            1 => BatchType::Unlogged,
            2 => BatchType::Counter,
            other => {
                return Err(ParseError::BadIncomingData(format!(
                    "Bad batch type: {}",
                    other
                )))
            }
        };

        let statements_count: usize = types::read_short(buf)?.into();
        let mut statements = Vec::with_capacity(statements_count);
        let mut values = Vec::with_capacity(statements_count);
        for _ in 0..statements_count {
            statements.push(BatchStatement::deserialize(buf)?);
            values.push(SerializedValues::new_from_frame(buf)?);
        }

        let consistency = types::read_consistency(buf)?;

        if version == ProtocolVersion::V2 {
            return Ok(Self {
                statements: Cow::Owned(statements),
                batch_type,
                consistency,
                serial_consistency: None,
                timestamp: None,
                values,
            });
        }

        let flags = buf.get_u8();
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(ParseError::BadIncomingData(format!(
                "Specified flags are not recognised: {:02x}",
                unknown_flags
            )));
        }
        let serial_consistency_flag = (flags & FLAG_WITH_SERIAL_CONSISTENCY) != 0;
        let default_timestamp_flag = (flags & FLAG_WITH_DEFAULT_TIMESTAMP) != 0;

        let serial_consistency = serial_consistency_flag
            .then(|| types::read_consistency(buf))
            .transpose()?
            .map(|consistency| {
                SerialConsistency::try_from(consistency).map_err(|err| {
                    ParseError::BadIncomingData(format!(
                        "Expected SerialConsistency, got regular Consistency: {err}"
                    ))
                })
            })
            .transpose()?;
        let timestamp = default_timestamp_flag
            .then(|| types::read_long(buf))
            .transpose()?;

        Ok(Self {
            statements: Cow::Owned(statements),
            batch_type,
            consistency,
            serial_consistency,
            timestamp,
            values,
        })
    }
}
