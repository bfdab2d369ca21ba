use crate::frame::frame_errors::ParseError;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::frame::value::{CqlDate, CqlTime, CqlTimestamp, Counter};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, Bytes};
use std::convert::TryFrom;
use std::net::IpAddr;
use std::result::Result as StdResult;
use std::str;
use uuid::Uuid;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

/// CQL type of a single column, as carried in result metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Double,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Uuid,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Tuple(Vec<ColumnType>),
}

/// A single deserialized column value.
///
/// Only the types the session layer itself consumes are covered; exotic
/// types (varint, decimal, duration, UDT values) fail deserialization with
/// `TypeNotImplemented`.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(Counter),
    Date(CqlDate),
    Double(f64),
    Empty,
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    Timestamp(CqlTimestamp),
    Inet(IpAddr),
    SmallInt(i16),
    TinyInt(i8),
    Time(CqlTime),
    Timeuuid(Uuid),
    Uuid(Uuid),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    Tuple(Vec<Option<CqlValue>>),
}

impl CqlValue {
    pub fn as_ascii(&self) -> Option<&String> {
        match self {
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Vec<u8>> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&String> {
        match self {
            Self::Text(s) => Some(s),
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s),
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::List(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(s) => Some(s),
            _ => None,
        }
    }

    /// Collects a list or set of text values into strings.
    pub fn into_string_vec(self) -> Option<Vec<String>> {
        let elems = match self {
            Self::List(elems) | Self::Set(elems) => elems,
            _ => return None,
        };
        elems.into_iter().map(CqlValue::into_string).collect()
    }

    /// Collects a map<text, text> into string pairs.
    pub fn into_string_map(self) -> Option<Vec<(String, String)>> {
        let elems = match self {
            Self::Map(elems) => elems,
            _ => return None,
        };
        elems
            .into_iter()
            .map(|(k, v)| Some((k.into_string()?, v.into_string()?)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Default, Clone)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub no_metadata: bool,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Clone)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// Positions in the bound value list that constitute the partition key,
    /// in partition key order.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

/// RESULT - response to QUERY, PREPARE, EXECUTE and BATCH.
#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf)?.to_string()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0031 => {
            let len: usize = types::read_short(buf)?.into();
            let mut types_ = Vec::with_capacity(len);
            for _ in 0..len {
                types_.push(deser_type(buf)?);
            }
            Tuple(types_)
        }
        id => {
            return Err(ParseError::TypeNotImplemented(id));
        }
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = if let Some(spec) = global_table_spec {
            spec.clone()
        } else {
            deser_table_spec(buf)?
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;
    let has_more_pages = flags & 0x0002 != 0;
    let no_metadata = flags & 0x0004 != 0;

    let col_count: usize = types::read_int(buf)?.try_into()?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            no_metadata: true,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        no_metadata: false,
        col_specs,
    })
}

fn deser_prepared_metadata(buf: &mut &[u8]) -> StdResult<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;

    let col_count: usize = types::read_int(buf)?.try_into()?;
    let pk_count: usize = types::read_int(buf)?.try_into()?;

    let mut pk_indexes = Vec::with_capacity(pk_count);
    for _ in 0..pk_count {
        pk_indexes.push(types::read_short(buf)?);
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> StdResult<CqlValue, ParseError> {
    use ColumnType::*;

    if buf.is_empty() {
        match typ {
            Ascii | Blob | Text => {
                // can't be empty
            }
            _ => return Ok(CqlValue::Empty),
        }
    }

    Ok(match typ {
        Custom(type_str) => {
            return Err(ParseError::BadIncomingData(format!(
                "Support for custom types is not implemented: {}",
                type_str
            )));
        }
        Ascii => {
            if !buf.is_ascii() {
                return Err(ParseError::BadIncomingData(
                    "ASCII value contains non-ASCII bytes".to_string(),
                ));
            }
            CqlValue::Ascii(str::from_utf8(buf)?.to_owned())
        }
        Boolean => {
            if buf.len() != 1 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 1, got {}",
                    buf.len()
                )));
            }
            CqlValue::Boolean(buf[0] != 0x00)
        }
        Blob => CqlValue::Blob(buf.to_vec()),
        Date => {
            if buf.len() != 4 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 4, got {}",
                    buf.len()
                )));
            }
            CqlValue::Date(CqlDate(buf.read_u32::<BigEndian>()?))
        }
        Counter => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 8, got {}",
                    buf.len()
                )));
            }
            CqlValue::Counter(crate::frame::value::Counter(buf.read_i64::<BigEndian>()?))
        }
        Double => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 8, got {}",
                    buf.len()
                )));
            }
            CqlValue::Double(buf.read_f64::<BigEndian>()?)
        }
        Float => {
            if buf.len() != 4 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 4, got {}",
                    buf.len()
                )));
            }
            CqlValue::Float(buf.read_f32::<BigEndian>()?)
        }
        Int => {
            if buf.len() != 4 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 4, got {}",
                    buf.len()
                )));
            }
            CqlValue::Int(buf.read_i32::<BigEndian>()?)
        }
        SmallInt => {
            if buf.len() != 2 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 2, got {}",
                    buf.len()
                )));
            }
            CqlValue::SmallInt(buf.read_i16::<BigEndian>()?)
        }
        TinyInt => {
            if buf.len() != 1 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 1, got {}",
                    buf.len()
                )));
            }
            CqlValue::TinyInt(buf.read_i8()?)
        }
        BigInt => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 8, got {}",
                    buf.len()
                )));
            }
            CqlValue::BigInt(buf.read_i64::<BigEndian>()?)
        }
        Text => CqlValue::Text(str::from_utf8(buf)?.to_owned()),
        Timestamp => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 8, got {}",
                    buf.len()
                )));
            }
            CqlValue::Timestamp(CqlTimestamp(buf.read_i64::<BigEndian>()?))
        }
        Time => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 8, got {}",
                    buf.len()
                )));
            }
            let nanoseconds: i64 = buf.read_i64::<BigEndian>()?;

            // Valid values are in the range 0 to 86399999999999
            if !(0..=86399999999999).contains(&nanoseconds) {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid time value: {}",
                    nanoseconds
                )));
            }
            CqlValue::Time(CqlTime(nanoseconds))
        }
        Timeuuid => {
            if buf.len() != 16 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 16, got {}",
                    buf.len()
                )));
            }
            let raw: &[u8; 16] = buf[0..16].try_into()?;
            CqlValue::Timeuuid(uuid::Uuid::from_bytes(*raw))
        }
        Inet => CqlValue::Inet(match buf.len() {
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
                    "Invalid inet bytes length: {}",
                    v
                )));
            }
        }),
        Uuid => {
            if buf.len() != 16 {
                return Err(ParseError::BadIncomingData(format!(
                    "Expected buffer length 16, got {}",
                    buf.len()
                )));
            }
            let raw: &[u8; 16] = buf[0..16].try_into()?;
            CqlValue::Uuid(uuid::Uuid::from_bytes(*raw))
        }
        List(type_name) => {
            let len: usize = types::read_int(buf)?.try_into()?;
            let mut res = Vec::with_capacity(len);
            for _ in 0..len {
                let mut b = types::read_bytes(buf)?;
                res.push(deser_cql_value(type_name, &mut b)?);
            }
            CqlValue::List(res)
        }
        Map(key_type, value_type) => {
            let len: usize = types::read_int(buf)?.try_into()?;
            let mut res = Vec::with_capacity(len);
            for _ in 0..len {
                let mut b = types::read_bytes(buf)?;
                let key = deser_cql_value(key_type, &mut b)?;
                b = types::read_bytes(buf)?;
                let val = deser_cql_value(value_type, &mut b)?;
                res.push((key, val));
            }
            CqlValue::Map(res)
        }
        Set(type_name) => {
            let len: usize = types::read_int(buf)?.try_into()?;
            let mut res = Vec::with_capacity(len);
            for _ in 0..len {
                let mut b = types::read_bytes(buf)?;
                res.push(deser_cql_value(type_name, &mut b)?);
            }
            CqlValue::Set(res)
        }
        Tuple(type_names) => {
            let mut res = Vec::with_capacity(type_names.len());
            for type_name in type_names {
                match types::read_bytes_opt(buf)? {
                    Some(mut b) => res.push(Some(deser_cql_value(type_name, &mut b)?)),
                    None => res.push(None),
                };
            }
            CqlValue::Tuple(res)
        }
    })
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, ParseError> {
    let metadata = deser_result_metadata(buf)?;

    if metadata.no_metadata {
        return Err(ParseError::BadIncomingData(
            "Cannot parse rows without column metadata".to_string(),
        ));
    }
    if metadata.col_count != metadata.col_specs.len() {
        return Err(ParseError::BadIncomingData(format!(
            "Results metadata declares {} columns but carries {} specs",
            metadata.col_count,
            metadata.col_specs.len()
        )));
    }

    let rows_count: usize = types::read_int(buf)?.try_into()?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for i in 0..metadata.col_count {
            let v = if let Some(mut b) = types::read_bytes_opt(buf)? {
                Some(deser_cql_value(&metadata.col_specs[i].typ, &mut b)?)
            } else {
                None
            };
            columns.push(v);
        }
        rows.push(Row { columns });
    }
    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(buf: &mut &[u8]) -> StdResult<Prepared, ParseError> {
    let id_len = types::read_short(buf)? as usize;
    let id: Bytes = Bytes::copy_from_slice(&buf[0..id_len]);
    buf.advance(id_len);
    let prepared_metadata = deser_prepared_metadata(buf)?;
    let result_metadata = deser_result_metadata(buf)?;
    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(buf)?,
    })
}

pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(buf)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        k => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result kind: {}",
                k
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    // Builds a RESULT Rows body with one (text, int) row.
    fn make_rows_body() -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(0x0002, &mut buf); // kind: Rows

        types::write_int(0x0001, &mut buf); // metadata flags: global table spec
        types::write_int(2, &mut buf); // col count
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tab", &mut buf).unwrap();
        types::write_string("name", &mut buf).unwrap();
        types::write_short(0x000D, &mut buf); // text
        types::write_string("value", &mut buf).unwrap();
        types::write_short(0x0009, &mut buf); // int

        types::write_int(1, &mut buf); // rows count
        types::write_bytes(b"hello", &mut buf).unwrap();
        let mut int_bytes = Vec::new();
        int_bytes.put_i32(42);
        types::write_bytes(&int_bytes, &mut buf).unwrap();

        buf
    }

    #[test]
    fn rows_deserialization() {
        let buf = make_rows_body();
        let result = deserialize(&mut &buf[..]).unwrap();
        let rows = match result {
            Result::Rows(rows) => rows,
            other => panic!("expected Rows, got {:?}", other),
        };

        assert_eq!(rows.rows_count, 1);
        assert_eq!(rows.metadata.col_specs.len(), 2);
        assert_eq!(rows.metadata.col_specs[0].name, "name");
        assert_eq!(rows.metadata.col_specs[0].table_spec.ks_name, "ks");
        assert_eq!(
            rows.rows[0].columns[0],
            Some(CqlValue::Text("hello".to_string()))
        );
        assert_eq!(rows.rows[0].columns[1], Some(CqlValue::Int(42)));
    }

    #[test]
    fn void_deserialization() {
        let mut buf = Vec::new();
        types::write_int(0x0001, &mut buf);
        assert!(matches!(
            deserialize(&mut &buf[..]).unwrap(),
            Result::Void
        ));
    }

    #[test]
    fn set_keyspace_deserialization() {
        let mut buf = Vec::new();
        types::write_int(0x0003, &mut buf);
        types::write_string("ks", &mut buf).unwrap();
        match deserialize(&mut &buf[..]).unwrap() {
            Result::SetKeyspace(set_keyspace) => {
                assert_eq!(set_keyspace.keyspace_name, "ks");
            }
            other => panic!("expected SetKeyspace, got {:?}", other),
        }
    }

    #[test]
    fn prepared_deserialization() {
        let mut buf = Vec::new();
        types::write_int(0x0004, &mut buf); // kind: Prepared
        types::write_short_bytes(&[1, 2, 3], &mut buf).unwrap(); // id

        // prepared metadata
        types::write_int(0x0001, &mut buf); // flags: global table spec
        types::write_int(1, &mut buf); // col count
        types::write_int(1, &mut buf); // pk count
        types::write_short(0, &mut buf); // pk index
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tab", &mut buf).unwrap();
        types::write_string("a", &mut buf).unwrap();
        types::write_short(0x0009, &mut buf); // int

        // result metadata (no rows metadata)
        types::write_int(0, &mut buf); // flags
        types::write_int(0, &mut buf); // col count

        match deserialize(&mut &buf[..]).unwrap() {
            Result::Prepared(prepared) => {
                assert_eq!(prepared.id.as_ref(), &[1, 2, 3]);
                assert_eq!(prepared.prepared_metadata.pk_indexes, vec![0]);
                assert_eq!(prepared.prepared_metadata.col_specs.len(), 1);
            }
            other => panic!("expected Prepared, got {:?}", other),
        }
    }

    #[test]
    fn collection_value_deserialization() {
        // set<text> with two elements
        let mut buf = Vec::new();
        types::write_int(2, &mut buf);
        types::write_bytes(b"a", &mut buf).unwrap();
        types::write_bytes(b"bc", &mut buf).unwrap();

        let parsed = deser_cql_value(
            &ColumnType::Set(Box::new(ColumnType::Text)),
            &mut &buf[..],
        )
        .unwrap();
        assert_eq!(
            parsed.into_string_vec().unwrap(),
            vec!["a".to_string(), "bc".to_string()]
        );

        // map<text, text>
        let mut buf = Vec::new();
        types::write_int(1, &mut buf);
        types::write_bytes(b"class", &mut buf).unwrap();
        types::write_bytes(b"SimpleStrategy", &mut buf).unwrap();

        let parsed = deser_cql_value(
            &ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text)),
            &mut &buf[..],
        )
        .unwrap();
        assert_eq!(
            parsed.into_string_map().unwrap(),
            vec![("class".to_string(), "SimpleStrategy".to_string())]
        );
    }
}
