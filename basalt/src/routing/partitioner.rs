//! Partitioners map a partition key's bytes to a 64-bit token on the ring.
//!
//! Three partitioners are supported:
//! - `Murmur3Partitioner` - the default; the Cassandra-compatible variant of
//!   128-bit Murmur3 (signed-byte tail handling), low 64 bits of the hash.
//! - `RandomPartitioner` - MD5 based; the low 64 bits of the digest.
//! - `OrderedByteArrayPartitioner` - order preserving; the first eight bytes
//!   of the key, big-endian.

use bytes::Buf;
use md5::{Digest, Md5};
use std::num::Wrapping;

use crate::routing::Token;
use basalt_cql::frame::value::SerializedValues;
use thiserror::Error;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[non_exhaustive]
pub enum PartitionerName {
    #[default]
    Murmur3,
    Random,
    OrderedByteArray,
}

impl PartitionerName {
    /// Recognizes the partitioner from the class name in `system.local`.
    pub(crate) fn from_class_name(name: &str) -> Option<Self> {
        if name.ends_with("Murmur3Partitioner") {
            Some(PartitionerName::Murmur3)
        } else if name.ends_with("RandomPartitioner") {
            Some(PartitionerName::Random)
        } else if name.ends_with("ByteOrderedPartitioner")
            || name.ends_with("OrderedByteArrayPartitioner")
        {
            Some(PartitionerName::OrderedByteArray)
        } else {
            None
        }
    }
}

impl Partitioner for PartitionerName {
    type Hasher = PartitionerHasherAny;

    fn build_hasher(&self) -> Self::Hasher {
        match self {
            PartitionerName::Murmur3 => {
                PartitionerHasherAny::Murmur3(Murmur3Partitioner.build_hasher())
            }
            PartitionerName::Random => {
                PartitionerHasherAny::Random(RandomPartitioner.build_hasher())
            }
            PartitionerName::OrderedByteArray => {
                PartitionerHasherAny::OrderedByteArray(OrderedByteArrayPartitioner.build_hasher())
            }
        }
    }
}

pub enum PartitionerHasherAny {
    Murmur3(Murmur3PartitionerHasher),
    Random(RandomPartitionerHasher),
    OrderedByteArray(OrderedByteArrayPartitionerHasher),
}

impl PartitionerHasher for PartitionerHasherAny {
    fn write(&mut self, pk_part: &[u8]) {
        match self {
            PartitionerHasherAny::Murmur3(h) => h.write(pk_part),
            PartitionerHasherAny::Random(h) => h.write(pk_part),
            PartitionerHasherAny::OrderedByteArray(h) => h.write(pk_part),
        }
    }

    fn finish(&self) -> Token {
        match self {
            PartitionerHasherAny::Murmur3(h) => h.finish(),
            PartitionerHasherAny::Random(h) => h.finish(),
            PartitionerHasherAny::OrderedByteArray(h) => h.finish(),
        }
    }
}

/// A factory of [PartitionerHasher]s; the design mirrors std's
/// `BuildHasher` / `Hasher` split so multi-part partition keys can be fed
/// incrementally.
pub trait Partitioner {
    type Hasher: PartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher;

    fn hash_one(&self, data: &[u8]) -> Token {
        let mut hasher = self.build_hasher();
        hasher.write(data);
        hasher.finish()
    }
}

/// A stateful hasher of a stream of partition-key bytes. `finish` may be
/// called at any point and computes the token over everything fed so far.
pub trait PartitionerHasher {
    fn write(&mut self, pk_part: &[u8]);
    fn finish(&self) -> Token;
}

pub struct Murmur3Partitioner;

impl Partitioner for Murmur3Partitioner {
    type Hasher = Murmur3PartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher {
        Self::Hasher {
            total_len: 0,
            buf: Default::default(),
            h1: Wrapping(0),
            h2: Wrapping(0),
        }
    }
}

pub struct Murmur3PartitionerHasher {
    total_len: usize,
    buf: [u8; Self::BUF_CAPACITY],
    h1: Wrapping<i64>,
    h2: Wrapping<i64>,
}

impl Murmur3PartitionerHasher {
    const BUF_CAPACITY: usize = 16;

    const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
    const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

    fn hash_16_bytes(&mut self, mut k1: Wrapping<i64>, mut k2: Wrapping<i64>) {
        k1 *= Self::C1;
        k1 = Self::rotl64(k1, 31);
        k1 *= Self::C2;
        self.h1 ^= k1;

        self.h1 = Self::rotl64(self.h1, 27);
        self.h1 += self.h2;
        self.h1 = self.h1 * Wrapping(5) + Wrapping(0x52dce729);

        k2 *= Self::C2;
        k2 = Self::rotl64(k2, 33);
        k2 *= Self::C1;
        self.h2 ^= k2;

        self.h2 = Self::rotl64(self.h2, 31);
        self.h2 += self.h1;
        self.h2 = self.h2 * Wrapping(5) + Wrapping(0x38495ab5);
    }

    fn fetch_16_bytes_from_buf(buf: &mut &[u8]) -> (Wrapping<i64>, Wrapping<i64>) {
        let k1 = Wrapping(buf.get_i64_le());
        let k2 = Wrapping(buf.get_i64_le());
        (k1, k2)
    }

    #[inline]
    fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
        Wrapping((v.0 << n) | (v.0 as u64 >> (64 - n)) as i64)
    }

    #[inline]
    fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);

        k
    }
}

// The hasher consumes full 16-byte blocks as they become available and
// keeps at most 15 leftover bytes buffered; the tail rounds and final mix
// happen in `finish`, which does not mutate state.
impl PartitionerHasher for Murmur3PartitionerHasher {
    fn write(&mut self, mut pk_part: &[u8]) {
        let mut buf_len = self.total_len % Self::BUF_CAPACITY;
        self.total_len += pk_part.len();

        // If the buffer is nonempty and can be filled completely, fill it
        // and hash its contents.
        if buf_len > 0 && Self::BUF_CAPACITY - buf_len <= pk_part.len() {
            let to_write = Ord::min(Self::BUF_CAPACITY - buf_len, pk_part.len());
            self.buf[buf_len..buf_len + to_write].copy_from_slice(&pk_part[..to_write]);
            pk_part.advance(to_write);
            buf_len += to_write;

            debug_assert_eq!(buf_len, Self::BUF_CAPACITY);
            let mut buf_ptr = &self.buf[..];
            let (k1, k2) = Self::fetch_16_bytes_from_buf(&mut buf_ptr);
            debug_assert!(buf_ptr.is_empty());
            self.hash_16_bytes(k1, k2);
            buf_len = 0;
        }

        if buf_len == 0 {
            // Fast path: hash directly from the input.
            while pk_part.len() >= Self::BUF_CAPACITY {
                let (k1, k2) = Self::fetch_16_bytes_from_buf(&mut pk_part);
                self.hash_16_bytes(k1, k2);
            }
        }

        // Move remaining bytes to the buffer.
        debug_assert!(pk_part.len() < Self::BUF_CAPACITY - buf_len);
        let to_write = pk_part.len();
        self.buf[buf_len..buf_len + to_write].copy_from_slice(&pk_part[..to_write]);
        pk_part.advance(to_write);
        buf_len += to_write;
        debug_assert!(pk_part.is_empty());
        debug_assert!(buf_len < Self::BUF_CAPACITY);
    }

    fn finish(&self) -> Token {
        let mut h1 = self.h1;
        let mut h2 = self.h2;

        let mut k1 = Wrapping(0_i64);
        let mut k2 = Wrapping(0_i64);

        let buf_len = self.total_len % Self::BUF_CAPACITY;

        if buf_len > 8 {
            for i in (8..buf_len).rev() {
                k2 ^= Wrapping(self.buf[i] as i8 as i64) << ((i - 8) * 8);
            }

            k2 *= Self::C2;
            k2 = Self::rotl64(k2, 33);
            k2 *= Self::C1;
            h2 ^= k2;
        }

        if buf_len > 0 {
            for i in (0..std::cmp::min(8, buf_len)).rev() {
                k1 ^= Wrapping(self.buf[i] as i8 as i64) << (i * 8);
            }

            k1 *= Self::C1;
            k1 = Self::rotl64(k1, 31);
            k1 *= Self::C2;
            h1 ^= k1;
        }

        h1 ^= Wrapping(self.total_len as i64);
        h2 ^= Wrapping(self.total_len as i64);

        h1 += h2;
        h2 += h1;

        h1 = Self::fmix(h1);
        h2 = Self::fmix(h2);

        h1 += h2;
        h2 += h1;

        Token::new((((h2.0 as i128) << 64) | h1.0 as i128) as i64)
    }
}

pub struct RandomPartitioner;

pub struct RandomPartitionerHasher {
    digest: Md5,
}

impl Partitioner for RandomPartitioner {
    type Hasher = RandomPartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher {
        Self::Hasher { digest: Md5::new() }
    }
}

impl PartitionerHasher for RandomPartitionerHasher {
    fn write(&mut self, pk_part: &[u8]) {
        self.digest.update(pk_part);
    }

    fn finish(&self) -> Token {
        let out = self.digest.clone().finalize();
        let mut low = &out[8..16];
        Token::new(low.get_i64())
    }
}

pub struct OrderedByteArrayPartitioner;

pub struct OrderedByteArrayPartitionerHasher {
    len: usize,
    buf: [u8; 8],
}

impl Partitioner for OrderedByteArrayPartitioner {
    type Hasher = OrderedByteArrayPartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher {
        Self::Hasher {
            len: 0,
            buf: [0; 8],
        }
    }
}

// Order preserving: the token is the first 8 bytes of the key interpreted
// as a big-endian integer, zero padded on the right for shorter keys.
impl PartitionerHasher for OrderedByteArrayPartitionerHasher {
    fn write(&mut self, pk_part: &[u8]) {
        if self.len < 8 {
            let to_copy = Ord::min(8 - self.len, pk_part.len());
            self.buf[self.len..self.len + to_copy].copy_from_slice(&pk_part[..to_copy]);
            self.len += to_copy;
        }
    }

    fn finish(&self) -> Token {
        Token::new(i64::from_be_bytes(self.buf))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenCalculationError {
    #[error("Value of length {0} is too long to be a partition key component")]
    ValueTooLong(usize),
}

/// Calculates the token of a serialized partition key.
///
/// A single-column key is hashed as its raw bytes; a multi-column key is
/// hashed in the composite form: for each component,
/// `[u16 length][bytes][0x00]`.
pub fn calculate_token_for_partition_key(
    serialized_partition_key_values: &SerializedValues,
    partitioner: &PartitionerName,
) -> Result<Token, TokenCalculationError> {
    let mut partitioner_hasher = partitioner.build_hasher();

    if serialized_partition_key_values.element_count() == 1 {
        let val = serialized_partition_key_values.iter().next().unwrap();
        if let Some(val) = val.as_value() {
            partitioner_hasher.write(val);
        }
    } else {
        for val in serialized_partition_key_values
            .iter()
            .filter_map(|rv| rv.as_value())
        {
            let val_len_u16: u16 = val
                .len()
                .try_into()
                .map_err(|_| TokenCalculationError::ValueTooLong(val.len()))?;
            partitioner_hasher.write(&val_len_u16.to_be_bytes());
            partitioner_hasher.write(val);
            partitioner_hasher.write(&[0u8]);
        }
    }

    Ok(partitioner_hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_correct_murmur3_hash(pk: &'static str, expected_hash: i64) {
        let hash = Murmur3Partitioner.hash_one(pk.as_bytes()).value();
        assert_eq!(hash, expected_hash);
    }

    #[test]
    fn murmur3_partitioner_vectors() {
        for s in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("foo", 0xe271865701f54561_u64 as i64),
            ("kremówki", 4354931215268080151),
        ] {
            assert_correct_murmur3_hash(s.0, s.1);
        }
    }

    #[test]
    fn partitioners_are_chunking_invariant() {
        let inputs: &[&[u8]] = &[
            b"",
            b"0",
            b"short",
            b"exactly-16-bytes",
            b"a longer input that spans multiple 16 byte blocks of the hasher",
        ];

        fn check_for_partitioner<P: Partitioner>(partitioner: P, input: &[u8]) {
            let expected = partitioner.hash_one(input);

            // Feed the same input in every possible two-way split.
            for split in 0..=input.len() {
                let mut hasher = partitioner.build_hasher();
                let (a, b) = input.split_at(split);
                hasher.write(a);
                hasher.write(b);
                assert_eq!(hasher.finish(), expected);
            }

            // And byte by byte.
            let mut hasher = partitioner.build_hasher();
            for byte in input {
                hasher.write(std::slice::from_ref(byte));
            }
            assert_eq!(hasher.finish(), expected);
        }

        for input in inputs {
            check_for_partitioner(Murmur3Partitioner, input);
            check_for_partitioner(RandomPartitioner, input);
            check_for_partitioner(OrderedByteArrayPartitioner, input);
        }
    }

    #[test]
    fn ordered_partitioner_preserves_order() {
        let a = OrderedByteArrayPartitioner.hash_one(b"aaa");
        let b = OrderedByteArrayPartitioner.hash_one(b"bbb");
        let c = OrderedByteArrayPartitioner.hash_one(b"ccc");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn partitioner_name_recognition() {
        assert_eq!(
            PartitionerName::from_class_name("org.apache.cassandra.dht.Murmur3Partitioner"),
            Some(PartitionerName::Murmur3)
        );
        assert_eq!(
            PartitionerName::from_class_name("org.apache.cassandra.dht.RandomPartitioner"),
            Some(PartitionerName::Random)
        );
        assert_eq!(
            PartitionerName::from_class_name("org.apache.cassandra.dht.ByteOrderedPartitioner"),
            Some(PartitionerName::OrderedByteArray)
        );
        assert_eq!(PartitionerName::from_class_name("SomethingElse"), None);
    }

    #[test]
    fn composite_key_token() {
        let mut values = SerializedValues::new();
        values.add_value(&"foo").unwrap();

        // Single column: hashed as raw bytes.
        let token =
            calculate_token_for_partition_key(&values, &PartitionerName::Murmur3).unwrap();
        assert_eq!(token, Murmur3Partitioner.hash_one(b"foo"));

        // Two columns: composite form with length prefixes and terminators.
        values.add_value(&"bar").unwrap();
        let token =
            calculate_token_for_partition_key(&values, &PartitionerName::Murmur3).unwrap();
        let composite = b"\x00\x03foo\x00\x00\x03bar\x00";
        assert_eq!(token, Murmur3Partitioner.hash_one(composite));
    }
}
