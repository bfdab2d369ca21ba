//! Serialization of bound statement values.
//!
//! A bound value is three-valued on the wire: a byte blob, `null`
//! (length -1) or `unset` (length -2, protocol v4+). The [Value] trait
//! covers Rust -> wire conversion, [SerializedValues] is the accumulated
//! value list of a single request.

use super::frame_errors::ParseError;
use super::types::{self, RawValue};
use bytes::BufMut;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryInto;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Things that can be serialized into a single CQL value.
pub trait Value {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig>;
}

/// The value is too big to be sent in a request - the length does not fit in i32.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Value is too big to be sent in a request - the length does not fit in i32")]
pub struct ValueTooBig;

/// Represents an `unset` value - makes the server skip the column on write
/// instead of inserting a tombstone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unset;

/// A value of the counter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter(pub i64);

/// Either a value or `unset`; use to selectively skip columns in a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaybeUnset<V> {
    Unset,
    Set(V),
}

/// Milliseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CqlTimestamp(pub i64);

/// Days since -5877641-06-23, i.e. the unix epoch shifted by 2^31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CqlDate(pub u32);

/// Nanoseconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CqlTime(pub i64);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SerializeValuesError {
    #[error("Too many values to add, max 65535 values can be sent in a request")]
    TooManyValues,
    #[error("Mixing named and not named values is not allowed")]
    MixingNamedAndNotNamedValues,
    #[error(transparent)]
    ValueTooBig(#[from] ValueTooBig),
    #[error("Parsing serialized values failed")]
    ParseError,
}

/// A list of already-serialized values of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            element_count: 0,
        }
    }

    /// A borrowed empty value list.
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    pub fn add_value(&mut self, val: &impl Value) -> Result<(), SerializeValuesError> {
        if self.element_count == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }

        let len_before_serialize: usize = self.serialized_values.len();
        if let Err(e) = val.serialize(&mut self.serialized_values) {
            self.serialized_values.resize(len_before_serialize, 0);
            return Err(e.into());
        }

        self.element_count += 1;
        Ok(())
    }

    /// Appends an already-serialized value verbatim.
    pub fn add_raw_value(&mut self, value: RawValue<'_>) -> Result<(), SerializeValuesError> {
        if self.element_count == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }
        match value {
            RawValue::Null => types::write_int(-1, &mut self.serialized_values),
            RawValue::Unset => types::write_int(-2, &mut self.serialized_values),
            RawValue::Value(v) => {
                types::write_bytes(v, &mut self.serialized_values)
                    .map_err(|_| SerializeValuesError::ValueTooBig(ValueTooBig))?;
            }
        }
        self.element_count += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn buffer_size(&self) -> usize {
        self.serialized_values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = RawValue<'_>> {
        SerializedValuesIterator {
            serialized_values: &self.serialized_values,
        }
    }

    /// True if any of the values is `unset`; such a request must not be sent
    /// on protocol versions older than v4.
    pub fn contains_unset(&self) -> bool {
        self.iter().any(|v| matches!(v, RawValue::Unset))
    }

    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized_values);
    }

    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let element_count = types::read_short(buf)?;

        let mut data = Vec::new();
        let mut tmp = *buf;
        for _ in 0..element_count {
            let value = types::read_value(&mut tmp)?;
            match value {
                RawValue::Null => types::write_int(-1, &mut data),
                RawValue::Unset => types::write_int(-2, &mut data),
                RawValue::Value(v) => {
                    types::write_bytes(v, &mut data)?;
                }
            }
        }
        *buf = tmp;

        Ok(SerializedValues {
            serialized_values: data,
            element_count,
        })
    }
}

struct SerializedValuesIterator<'a> {
    serialized_values: &'a [u8],
}

impl<'a> Iterator for SerializedValuesIterator<'a> {
    type Item = RawValue<'a>;

    fn next(&mut self) -> Option<RawValue<'a>> {
        if self.serialized_values.is_empty() {
            return None;
        }
        types::read_value(&mut self.serialized_values).ok()
    }
}

// Helper that serializes a blob with its i32 length prefix.
fn serialize_raw(data: &[u8], buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
    let val_len: i32 = data.len().try_into().map_err(|_| ValueTooBig)?;
    buf.put_i32(val_len);
    buf.put_slice(data);
    Ok(())
}

impl Value for i8 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(1);
        buf.put_i8(*self);
        Ok(())
    }
}

impl Value for i16 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(2);
        buf.put_i16(*self);
        Ok(())
    }
}

impl Value for i32 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(4);
        buf.put_i32(*self);
        Ok(())
    }
}

impl Value for i64 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(8);
        buf.put_i64(*self);
        Ok(())
    }
}

impl Value for f32 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(4);
        buf.put_f32(*self);
        Ok(())
    }
}

impl Value for f64 {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(8);
        buf.put_f64(*self);
        Ok(())
    }
}

impl Value for bool {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(1);
        buf.put_u8(*self as u8);
        Ok(())
    }
}

impl Value for Counter {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.0.serialize(buf)
    }
}

impl Value for CqlTimestamp {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.0.serialize(buf)
    }
}

impl Value for CqlDate {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(4);
        buf.put_u32(self.0);
        Ok(())
    }
}

impl Value for CqlTime {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.0.serialize(buf)
    }
}

impl Value for &str {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_raw(self.as_bytes(), buf)
    }
}

impl Value for String {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        self.as_str().serialize(buf)
    }
}

impl Value for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_raw(self, buf)
    }
}

impl Value for Uuid {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_raw(self.as_bytes(), buf)
    }
}

impl Value for IpAddr {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            IpAddr::V4(addr) => serialize_raw(&addr.octets(), buf),
            IpAddr::V6(addr) => serialize_raw(&addr.octets(), buf),
        }
    }
}

impl Value for Unset {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        buf.put_i32(-2); // Unset value is represented as i32 -2
        Ok(())
    }
}

impl<V: Value> Value for Option<V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            Some(v) => v.serialize(buf),
            None => {
                buf.put_i32(-1); // Null is represented as i32 -1
                Ok(())
            }
        }
    }
}

impl<V: Value> Value for MaybeUnset<V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        match self {
            MaybeUnset::Set(v) => v.serialize(buf),
            MaybeUnset::Unset => Unset.serialize(buf),
        }
    }
}

impl<V: Value + ?Sized> Value for &V {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        (*self).serialize(buf)
    }
}

// Serializes a sequence as a CQL list/set: [i32 count] then each element
// as [bytes]. Used by Vec and map impls below.
fn serialize_sequence<'a, V: 'a + Value>(
    len: usize,
    iter: impl Iterator<Item = &'a V>,
    buf: &mut Vec<u8>,
) -> Result<(), ValueTooBig> {
    let bytes_num_pos: usize = buf.len();
    buf.put_i32(0);

    buf.put_i32(len.try_into().map_err(|_| ValueTooBig)?);

    for elem in iter {
        elem.serialize(buf)?;
    }

    let serialized_len: i32 = (buf.len() - bytes_num_pos - 4)
        .try_into()
        .map_err(|_| ValueTooBig)?;
    buf[bytes_num_pos..bytes_num_pos + 4].copy_from_slice(&serialized_len.to_be_bytes());

    Ok(())
}

fn serialize_map<'a, K: 'a + Value, V: 'a + Value>(
    len: usize,
    iter: impl Iterator<Item = (&'a K, &'a V)>,
    buf: &mut Vec<u8>,
) -> Result<(), ValueTooBig> {
    let bytes_num_pos: usize = buf.len();
    buf.put_i32(0);

    buf.put_i32(len.try_into().map_err(|_| ValueTooBig)?);

    for (key, value) in iter {
        key.serialize(buf)?;
        value.serialize(buf)?;
    }

    let serialized_len: i32 = (buf.len() - bytes_num_pos - 4)
        .try_into()
        .map_err(|_| ValueTooBig)?;
    buf[bytes_num_pos..bytes_num_pos + 4].copy_from_slice(&serialized_len.to_be_bytes());

    Ok(())
}

impl<V: Value> Value for Vec<V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_sequence(self.len(), self.iter(), buf)
    }
}

impl<V: Value> Value for &[V] {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_sequence(self.len(), self.iter(), buf)
    }
}

impl<K: Value, V: Value> Value for HashMap<K, V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_map(self.len(), self.iter(), buf)
    }
}

impl<K: Value, V: Value> Value for BTreeMap<K, V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueTooBig> {
        serialize_map(self.len(), self.iter(), buf)
    }
}

pub type SerializedResult<'a> = Result<Cow<'a, SerializedValues>, SerializeValuesError>;

/// Things that can be serialized into the value list of a request -
/// tuples of [Value]s, slices, or an already-built [SerializedValues].
pub trait ValueList {
    fn serialized(&self) -> SerializedResult<'_>;
}

impl ValueList for () {
    fn serialized(&self) -> SerializedResult<'_> {
        Ok(Cow::Borrowed(SerializedValues::EMPTY))
    }
}

impl<T: Value> ValueList for [T] {
    fn serialized(&self) -> SerializedResult<'_> {
        let mut result = SerializedValues::new();
        for val in self {
            result.add_value(val)?;
        }
        Ok(Cow::Owned(result))
    }
}

impl<T: Value> ValueList for Vec<T> {
    fn serialized(&self) -> SerializedResult<'_> {
        self.as_slice().serialized()
    }
}

impl<T: Value, const N: usize> ValueList for [T; N] {
    fn serialized(&self) -> SerializedResult<'_> {
        self.as_slice().serialized()
    }
}

impl ValueList for SerializedValues {
    fn serialized(&self) -> SerializedResult<'_> {
        Ok(Cow::Borrowed(self))
    }
}

impl<T: ValueList + ?Sized> ValueList for &T {
    fn serialized(&self) -> SerializedResult<'_> {
        (*self).serialized()
    }
}

macro_rules! impl_value_list_for_tuple {
    ( $($Ti:ident),* ; $($FieldI:tt),* ) => {
        impl<$($Ti),*> ValueList for ($($Ti,)*)
        where
            $($Ti: Value),*
        {
            fn serialized(&self) -> SerializedResult<'_> {
                let mut result = SerializedValues::new();
                $(
                    result.add_value(&self.$FieldI)?;
                )*
                Ok(Cow::Owned(result))
            }
        }
    }
}

impl_value_list_for_tuple!(T0; 0);
impl_value_list_for_tuple!(T0, T1; 0, 1);
impl_value_list_for_tuple!(T0, T1, T2; 0, 1, 2);
impl_value_list_for_tuple!(T0, T1, T2, T3; 0, 1, 2, 3);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4; 0, 1, 2, 3, 4);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5; 0, 1, 2, 3, 4, 5);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6; 0, 1, 2, 3, 4, 5, 6);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7; 0, 1, 2, 3, 4, 5, 6, 7);

#[cfg(test)]
mod tests {
    use super::*;

    fn serialized_of(val: &impl Value) -> Vec<u8> {
        let mut buf = Vec::new();
        val.serialize(&mut buf).unwrap();
        buf
    }

    #[test]
    fn basic_value_encodings() {
        assert_eq!(serialized_of(&8_i8), vec![0, 0, 0, 1, 8]);
        assert_eq!(serialized_of(&16_i16), vec![0, 0, 0, 2, 0, 16]);
        assert_eq!(serialized_of(&32_i32), vec![0, 0, 0, 4, 0, 0, 0, 32]);
        assert_eq!(
            serialized_of(&64_i64),
            vec![0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 64]
        );
        assert_eq!(serialized_of(&true), vec![0, 0, 0, 1, 1]);
        assert_eq!(serialized_of(&"abc"), vec![0, 0, 0, 3, 97, 98, 99]);
    }

    #[test]
    fn null_and_unset_encodings() {
        assert_eq!(serialized_of(&Option::<i32>::None), vec![255, 255, 255, 255]);
        assert_eq!(serialized_of(&Unset), vec![255, 255, 255, 254]);
        assert_eq!(
            serialized_of(&MaybeUnset::<i32>::Unset),
            vec![255, 255, 255, 254]
        );
        assert_eq!(
            serialized_of(&MaybeUnset::Set(32_i32)),
            vec![0, 0, 0, 4, 0, 0, 0, 32]
        );
    }

    #[test]
    fn list_encoding() {
        // [bytes len][elem count][elem as bytes]*
        assert_eq!(
            serialized_of(&vec![1_i32, 2]),
            vec![0, 0, 0, 20, 0, 0, 0, 2, 0, 0, 0, 4, 0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 2]
        );
    }

    #[test]
    fn serialized_values_accumulate_and_iterate() {
        let mut values = SerializedValues::new();
        values.add_value(&7_i32).unwrap();
        values.add_value(&Option::<i32>::None).unwrap();
        values.add_value(&Unset).unwrap();
        assert_eq!(values.element_count(), 3);
        assert!(values.contains_unset());

        let collected: Vec<RawValue> = values.iter().collect();
        assert_eq!(
            collected,
            vec![
                RawValue::Value(&[0, 0, 0, 7]),
                RawValue::Null,
                RawValue::Unset
            ]
        );
    }

    #[test]
    fn serialized_values_frame_round_trip() {
        let mut values = SerializedValues::new();
        values.add_value(&7_i32).unwrap();
        values.add_value(&"xyz").unwrap();

        let mut frame = Vec::new();
        values.write_to_request(&mut frame);

        let read_back = SerializedValues::new_from_frame(&mut &frame[..]).unwrap();
        assert_eq!(read_back, values);
    }

    #[test]
    fn value_list_tuples() {
        let serialized = (1_i32, "two").serialized().unwrap().into_owned();
        assert_eq!(serialized.element_count(), 2);

        let empty = ().serialized().unwrap();
        assert!(empty.is_empty());
    }
}
