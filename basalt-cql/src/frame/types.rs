//! Primitive types of the CQL binary protocol.
//!
//! All integers are big-endian. `[string]` is a u16 length followed by UTF-8
//! bytes, `[long string]` uses a u32 length, `[bytes]` uses an i32 length
//! where -1 encodes null and -2 encodes "not set" (v4+).

use super::frame_errors::ParseError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::convert::TryInto;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::str;
use thiserror::Error;
use uuid::Uuid;

/// How many replicas must acknowledge a read or write for it to be
/// considered successful.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    #[default]
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,

    // Valid only as the serial_consistency field of a request; sending them
    // as the top-level consistency is rejected by the driver before the
    // request reaches the wire.
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown consistency value: {0:#06x}")]
pub struct UnknownConsistency(pub u16);

impl TryFrom<u16> for Consistency {
    type Error = UnknownConsistency;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            0x000A => Ok(Consistency::LocalOne),
            other => Err(UnknownConsistency(other)),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Consistency of the Paxos phase of a lightweight transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Expected Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(pub Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

/// A single bound value as it appears on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    #[inline]
    pub fn as_value(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            RawValue::Null | RawValue::Unset => None,
        }
    }
}

fn read_raw_bytes<'a>(count: usize, buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    if buf.len() < count {
        return Err(ParseError::BadIncomingData(format!(
            "Not enough bytes! expected: {}, received: {}",
            count,
            buf.len(),
        )));
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    buf.read_i32::<BigEndian>()
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

fn read_int_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    let v = read_int(buf)?;
    let v: usize = v.try_into().map_err(|_| {
        ParseError::BadIncomingData(format!("Length field has negative value {}", v))
    })?;
    Ok(v)
}

fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let v: i32 = v.try_into().map_err(|_| {
        ParseError::BadDataToSerialize(format!("Length {} does not fit in i32", v))
    })?;
    write_int(v, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    buf.read_i64::<BigEndian>()
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    buf.read_u16::<BigEndian>()
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

fn read_short_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    let v = read_short(buf)?;
    Ok(v.into())
}

fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let v: u16 = v.try_into().map_err(|_| {
        ParseError::BadDataToSerialize(format!("Length {} does not fit in u16", v))
    })?;
    write_short(v, buf);
    Ok(())
}

pub fn read_bytes_opt<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, ParseError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let v = read_raw_bytes(len as usize, buf)?;
    Ok(Some(v))
}

// Same as read_bytes_opt, but assumes the value is not null.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, ParseError> {
    let len = read_int(buf)?;
    match len {
        -2 => Ok(RawValue::Unset),
        -1 => Ok(RawValue::Null),
        len if len >= 0 => Ok(RawValue::Value(read_raw_bytes(len as usize, buf)?)),
        len => Err(ParseError::BadIncomingData(format!(
            "Invalid value length: {}",
            len,
        ))),
    }
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(v: Option<impl AsRef<[u8]>>, buf: &mut impl BufMut) -> Result<(), ParseError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf)?,
        None => write_int(-1, buf),
    }
    Ok(())
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_short_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_int_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_string_map(buf: &mut &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    for v in v.iter() {
        write_string(v, buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

pub fn read_bytes_map(buf: &mut &[u8]) -> Result<HashMap<String, Vec<u8>>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_bytes(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, ParseError> {
    let raw = read_raw_bytes(16, buf)?;

    // The conversion can only fail if the slice length does not match,
    // which read_raw_bytes rules out.
    let raw_array: &[u8; 16] = raw.try_into().unwrap();
    Ok(Uuid::from_bytes(*raw_array))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(&uuid.as_bytes()[..]);
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, ParseError> {
    let raw = read_short(buf)?;
    Consistency::try_from(raw)
        .map_err(|err| ParseError::BadIncomingData(format!("{err}")))
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, ParseError> {
    let len = buf.read_u8()?;
    let ip_addr = match len {
        4 => {
            let ret = IpAddr::from(<[u8; 4]>::try_from(&buf[0..4])?);
            buf.advance(4);
            ret
        }
        16 => {
            let ret = IpAddr::from(<[u8; 16]>::try_from(&buf[0..16])?);
            buf.advance(16);
            ret
        }
        v => {
            return Err(ParseError::BadIncomingData(format!(
                "Invalid inet length: {}",
                v,
            )))
        }
    };
    let port = read_int(buf)?;

    Ok(SocketAddr::new(ip_addr, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }

    write_int(addr.port() as i32, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn type_int() {
        let vals = [i32::MIN, -1, 0, 1, i32::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_int(*val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_long() {
        let vals = [i64::MIN, -1, 0, 1, i64::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_long(*val, &mut buf);
            assert_eq!(read_long(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_short() {
        let vals: [u16; 3] = [0, 1, u16::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_short(*val, &mut buf);
            assert_eq!(read_short(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string() {
        let vals = [String::from(""), String::from("hello, world!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_string(val, &mut buf).unwrap();
            assert_eq!(read_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_long_string() {
        let vals = [String::from(""), String::from("hello, world!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_long_string(val, &mut buf).unwrap();
            assert_eq!(read_long_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string_map() {
        let mut val = HashMap::new();
        val.insert(String::from(""), String::from(""));
        val.insert(String::from("CQL_VERSION"), String::from("3.0.0"));
        val.insert(String::from("COMPRESSION"), String::from("lz4"));
        let mut buf = Vec::new();
        write_string_map(&val, &mut buf).unwrap();
        assert_eq!(read_string_map(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_string_list() {
        let val = vec![
            "".to_owned(),
            "TOPOLOGY_CHANGE".to_owned(),
            "STATUS_CHANGE".to_owned(),
        ];
        let mut buf = Vec::new();
        write_string_list(&val, &mut buf).unwrap();
        assert_eq!(read_string_list(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_string_multimap() {
        let mut val = HashMap::new();
        val.insert(String::from(""), vec![String::from("")]);
        val.insert(
            String::from("CQL_VERSION"),
            vec![String::from("3.0.0"), String::from("4.2.0")],
        );
        val.insert(String::from("empty"), vec![]);
        let mut buf = Vec::new();
        write_string_multimap(&val, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_uuid() {
        let u = Uuid::parse_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap();
        let mut buf = Vec::new();
        write_uuid(&u, &mut buf);
        let u2 = read_uuid(&mut &*buf).unwrap();
        assert_eq!(u, u2);
    }

    #[test]
    fn type_consistency() {
        let c = Consistency::Quorum;
        let mut buf = BytesMut::new();
        write_consistency(c, &mut buf);
        let c2 = read_consistency(&mut &*buf).unwrap();
        assert_eq!(c, c2);

        buf.clear();
        buf.put_i16(0x1234);
        let c_result = read_consistency(&mut &*buf);
        assert!(c_result.is_err());
    }

    #[test]
    fn type_inet() {
        use std::net::{Ipv4Addr, Ipv6Addr};

        let iv4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1234);
        let iv6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)), 2345);
        let mut buf = Vec::new();

        write_inet(iv4, &mut buf);
        let read_iv4 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv4, read_iv4);
        buf.clear();

        write_inet(iv6, &mut buf);
        let read_iv6 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv6, read_iv6);
    }

    #[test]
    fn type_value_null_and_unset() {
        let mut buf = Vec::new();
        write_int(-1, &mut buf);
        assert_eq!(read_value(&mut &buf[..]).unwrap(), RawValue::Null);

        buf.clear();
        write_int(-2, &mut buf);
        assert_eq!(read_value(&mut &buf[..]).unwrap(), RawValue::Unset);

        buf.clear();
        write_bytes(&[1, 2, 3], &mut buf).unwrap();
        assert_eq!(
            read_value(&mut &buf[..]).unwrap(),
            RawValue::Value(&[1, 2, 3])
        );
    }

    #[test]
    fn serial_consistency_from_consistency() {
        assert_eq!(
            SerialConsistency::try_from(Consistency::Serial).unwrap(),
            SerialConsistency::Serial
        );
        assert!(SerialConsistency::try_from(Consistency::Quorum).is_err());
        assert!(Consistency::Serial.is_serial());
        assert!(!Consistency::One.is_serial());
    }
}
