use crate::errors::{DbError, WriteType};
use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use byteorder::ReadBytesExt;
use bytes::Bytes;

/// An ERROR response: the error itself plus the server-provided message.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: buf.read_u8()? != 0,
            },
            0x1300 => DbError::ReadFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                data_present: buf.read_u8()? != 0,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_string(),
                function: types::read_string(buf)?.to_string(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_string(),
                table: types::read_string(buf)?.to_string(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::from(types::read_short_bytes(buf)?.to_owned()),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;
    use bytes::BufMut;

    fn make_error_body(code: i32, reason: &str, extra: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(code, &mut buf);
        types::write_string(reason, &mut buf).unwrap();
        extra(&mut buf);
        buf
    }

    #[test]
    fn deserialize_simple_errors() {
        for (code, expected) in [
            (0x0000, DbError::ServerError),
            (0x000A, DbError::ProtocolError),
            (0x0100, DbError::AuthenticationError),
            (0x1001, DbError::Overloaded),
            (0x1002, DbError::IsBootstrapping),
            (0x1003, DbError::TruncateError),
            (0x2000, DbError::SyntaxError),
            (0x2100, DbError::Unauthorized),
            (0x2200, DbError::Invalid),
            (0x2300, DbError::ConfigError),
            (0x7777, DbError::Other(0x7777)),
        ] {
            let buf = make_error_body(code, "message", |_| {});
            let err = Error::deserialize(&mut &buf[..]).unwrap();
            assert_eq!(err.error, expected);
            assert_eq!(err.reason, "message");
        }
    }

    #[test]
    fn deserialize_unavailable() {
        let buf = make_error_body(0x1000, "unavailable", |buf| {
            types::write_consistency(Consistency::Quorum, buf);
            types::write_int(3, buf);
            types::write_int(2, buf);
        });
        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 3,
                alive: 2,
            }
        );
    }

    #[test]
    fn deserialize_read_timeout() {
        let buf = make_error_body(0x1200, "timed out", |buf| {
            types::write_consistency(Consistency::Two, buf);
            types::write_int(2, buf);
            types::write_int(2, buf);
            buf.put_u8(0);
        });
        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: false,
            }
        );
    }

    #[test]
    fn deserialize_write_timeout() {
        let buf = make_error_body(0x1100, "timed out", |buf| {
            types::write_consistency(Consistency::One, buf);
            types::write_int(0, buf);
            types::write_int(1, buf);
            types::write_string("BATCH_LOG", buf).unwrap();
        });
        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::WriteTimeout {
                consistency: Consistency::One,
                received: 0,
                required: 1,
                write_type: WriteType::BatchLog,
            }
        );
    }

    #[test]
    fn deserialize_unprepared() {
        let buf = make_error_body(0x2500, "unprepared", |buf| {
            types::write_short_bytes(&[1, 2, 3, 4], buf).unwrap();
        });
        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unprepared {
                statement_id: Bytes::from_static(&[1, 2, 3, 4]),
            }
        );
    }

    #[test]
    fn deserialize_already_exists() {
        let buf = make_error_body(0x2400, "already exists", |buf| {
            types::write_string("ks", buf).unwrap();
            types::write_string("tab", buf).unwrap();
        });
        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::AlreadyExists {
                keyspace: "ks".to_string(),
                table: "tab".to_string(),
            }
        );
    }
}
