//! Pluggable binary encoders for series values and series keys.
//!
//! Fixed-length encoders let the chunk codec lay values out back to back; variable-length
//! encoders are framed with a varint length prefix by the chunk codec.

use crate::error::DbError;
use crate::types::DataPoint;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Write as _;
use std::marker::PhantomData;

/// Encodes and decodes series values.
pub trait ValueSerde<V>: Send + Sync {
    /// Exact encoded size when every value encodes to the same number of bytes.
    fn fixed_length(&self) -> Option<usize> {
        None
    }

    fn encode(&self, value: &V, out: &mut Vec<u8>) -> Result<(), DbError>;

    /// Decodes exactly one value occupying all of `bytes`.
    fn decode(&self, bytes: &[u8]) -> Result<V, DbError>;

    fn to_bytes(&self, value: &V) -> Result<Vec<u8>, DbError> {
        let mut out = Vec::with_capacity(self.fixed_length().unwrap_or(16));
        self.encode(value, &mut out)?;
        Ok(out)
    }
}

/// Encodes and decodes series keys. The encoded bytes name the key's storage namespace.
pub trait KeySerde<K>: Send + Sync {
    fn encode(&self, key: &K) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<K, DbError>;
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], DbError> {
    bytes.try_into().map_err(|_| {
        DbError::Serialization(format!(
            "{} expects {} bytes, got {}",
            what,
            N,
            bytes.len()
        ))
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serde;

impl ValueSerde<u64> for U64Serde {
    fn fixed_length(&self) -> Option<usize> {
        Some(8)
    }
    fn encode(&self, value: &u64, out: &mut Vec<u8>) -> Result<(), DbError> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }
    fn decode(&self, bytes: &[u8]) -> Result<u64, DbError> {
        Ok(u64::from_le_bytes(fixed::<8>(bytes, "u64")?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct I64Serde;

impl ValueSerde<i64> for I64Serde {
    fn fixed_length(&self) -> Option<usize> {
        Some(8)
    }
    fn encode(&self, value: &i64, out: &mut Vec<u8>) -> Result<(), DbError> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }
    fn decode(&self, bytes: &[u8]) -> Result<i64, DbError> {
        Ok(i64::from_le_bytes(fixed::<8>(bytes, "i64")?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct F64Serde;

impl ValueSerde<f64> for F64Serde {
    fn fixed_length(&self) -> Option<usize> {
        Some(8)
    }
    fn encode(&self, value: &f64, out: &mut Vec<u8>) -> Result<(), DbError> {
        out.extend_from_slice(&value.to_bits().to_le_bytes());
        Ok(())
    }
    fn decode(&self, bytes: &[u8]) -> Result<f64, DbError> {
        Ok(f64::from_bits(u64::from_le_bytes(fixed::<8>(bytes, "f64")?)))
    }
}

/// `DataPoint` as 16 bytes: timestamp (u64 LE) + IEEE-754 bits (u64 LE).
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPointSerde;

impl ValueSerde<DataPoint> for DataPointSerde {
    fn fixed_length(&self) -> Option<usize> {
        Some(16)
    }
    fn encode(&self, value: &DataPoint, out: &mut Vec<u8>) -> Result<(), DbError> {
        out.extend_from_slice(&value.timestamp.to_le_bytes());
        out.extend_from_slice(&value.value.to_bits().to_le_bytes());
        Ok(())
    }
    fn decode(&self, bytes: &[u8]) -> Result<DataPoint, DbError> {
        let raw = fixed::<16>(bytes, "DataPoint")?;
        let mut ts = [0u8; 8];
        let mut val = [0u8; 8];
        ts.copy_from_slice(&raw[..8]);
        val.copy_from_slice(&raw[8..]);
        Ok(DataPoint {
            timestamp: u64::from_le_bytes(ts),
            value: f64::from_bits(u64::from_le_bytes(val)),
        })
    }
}

/// UTF-8 strings, variable length.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerde;

impl ValueSerde<String> for StringSerde {
    fn encode(&self, value: &String, out: &mut Vec<u8>) -> Result<(), DbError> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }
    fn decode(&self, bytes: &[u8]) -> Result<String, DbError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DbError::Serialization(format!("Invalid UTF-8: {}", e)))
    }
}

/// Any serde type through bincode, variable length.
#[derive(Debug)]
pub struct BincodeSerde<T>(PhantomData<fn() -> T>);

impl<T> BincodeSerde<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeSerde<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeSerde<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> ValueSerde<T> for BincodeSerde<T> {
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), DbError> {
        bincode::serialize_into(out, value)?;
        Ok(())
    }
    fn decode(&self, bytes: &[u8]) -> Result<T, DbError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StringKeySerde;

impl KeySerde<String> for StringKeySerde {
    fn encode(&self, key: &String) -> Vec<u8> {
        key.as_bytes().to_vec()
    }
    fn decode(&self, bytes: &[u8]) -> Result<String, DbError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DbError::Serialization(format!("Invalid UTF-8 key: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct U64KeySerde;

impl KeySerde<u64> for U64KeySerde {
    fn encode(&self, key: &u64) -> Vec<u8> {
        key.to_be_bytes().to_vec()
    }
    fn decode(&self, bytes: &[u8]) -> Result<u64, DbError> {
        Ok(u64::from_be_bytes(fixed::<8>(bytes, "u64 key")?))
    }
}

/// Lowercase hex of the encoded key; used as the on-disk namespace (directory) name.
pub fn namespace_of(encoded_key: &[u8]) -> String {
    let mut s = String::with_capacity(encoded_key.len() * 2);
    for b in encoded_key {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Inverse of [`namespace_of`]. Returns `None` for names that are not valid hex.
pub fn parse_namespace(name: &str) -> Option<Vec<u8>> {
    if name.len() % 2 != 0 {
        return None;
    }
    (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect()
}
