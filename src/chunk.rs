//! Chunk encoding and compression: value framing (fixed or varint-prefixed), LZ4/Zstd, CRC32.

use crate::error::DbError;
use crate::serde_codec::ValueSerde;

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Per-chunk compression. Serde: internally tagged table (e.g. `type = "zstd", level = 3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkCompression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Default for ChunkCompression {
    fn default() -> Self {
        ChunkCompression::Lz4
    }
}

/// Chunk file magic bytes.
pub const CHUNK_MAGIC: &[u8; 8] = b"SDBCHK01";
const CHUNK_VERSION: u32 = 1;

// magic + version + codec + codec param + count + framing + raw len + crc
pub const CHUNK_HEADER_LEN: usize = 8 + 4 + 1 + 4 + 4 + 1 + 4 + 4;

const COMPRESS_NONE: u8 = 0;
const COMPRESS_LZ4: u8 = 1;
const COMPRESS_ZSTD: u8 = 2;

const FRAMING_FIXED: u8 = 1;
const FRAMING_VARINT: u8 = 2;

/// Parsed chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u32,
    pub compression: ChunkCompression,
    pub value_count: u32,
    pub fixed_length: Option<u32>,
    pub raw_len: u32,
    pub payload_crc32: u32,
}

/// Serializes and compresses a run of values into one immutable chunk.
pub fn encode_chunk<V>(
    values: &[V],
    serde: &dyn ValueSerde<V>,
    compression: ChunkCompression,
) -> Result<Vec<u8>, DbError> {
    if values.is_empty() {
        return Err(DbError::Internal("Refusing to encode an empty chunk".to_string()));
    }
    if values.len() > (u32::MAX as usize) {
        return Err(DbError::Internal("Chunk too large".to_string()));
    }

    let fixed = serde.fixed_length();
    let mut payload: Vec<u8> = Vec::with_capacity(values.len() * fixed.unwrap_or(16));
    let mut scratch: Vec<u8> = Vec::new();
    for v in values {
        match fixed {
            Some(n) => {
                let before = payload.len();
                serde.encode(v, &mut payload)?;
                if payload.len() - before != n {
                    return Err(DbError::Serialization(format!(
                        "Fixed-length serde produced {} bytes, expected {}",
                        payload.len() - before,
                        n
                    )));
                }
            }
            None => {
                scratch.clear();
                serde.encode(v, &mut scratch)?;
                write_var_u64(&mut payload, scratch.len() as u64);
                payload.extend_from_slice(&scratch);
            }
        }
    }
    if payload.len() > (u32::MAX as usize) {
        return Err(DbError::Internal("Chunk payload too large".to_string()));
    }

    let (codec, param, stored) = compress_payload(compression, &payload)?;

    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + stored.len());
    out.extend_from_slice(CHUNK_MAGIC);
    write_u32(&mut out, CHUNK_VERSION);
    out.push(codec);
    write_u32(&mut out, param);
    write_u32(&mut out, values.len() as u32);
    match fixed {
        Some(n) => {
            out.push(FRAMING_FIXED);
            write_u32(&mut out, n as u32);
        }
        None => {
            out.push(FRAMING_VARINT);
            write_u32(&mut out, payload.len() as u32);
        }
    }
    write_u32(&mut out, crc32(&stored));
    out.extend_from_slice(&stored);
    Ok(out)
}

/// Validates header and payload checksum without decoding any value.
pub fn verify_chunk_bytes(bytes: &[u8]) -> Result<ChunkHeader, DbError> {
    let (header, stored) = split_chunk(bytes)?;
    if crc32(stored) != header.payload_crc32 {
        return Err(DbError::corruption("Chunk payload CRC mismatch"));
    }
    Ok(header)
}

/// Decodes a chunk into `out` (cleared first), reusing its allocation.
pub fn decode_chunk_into<V>(
    bytes: &[u8],
    serde: &dyn ValueSerde<V>,
    mut out: Vec<V>,
) -> Result<Vec<V>, DbError> {
    let header = verify_chunk_bytes(bytes)?;
    let stored = &bytes[CHUNK_HEADER_LEN..];
    let expected_raw = match header.fixed_length {
        Some(n) => (n as usize).checked_mul(header.value_count as usize),
        None => Some(header.raw_len as usize),
    }
    .ok_or_else(|| DbError::corruption("Chunk size overflow"))?;
    let payload = decompress_payload(header.compression, stored, expected_raw)?;
    if payload.len() != expected_raw {
        return Err(DbError::corruption(format!(
            "Chunk payload length {} does not match expected {}",
            payload.len(),
            expected_raw
        )));
    }

    out.clear();
    out.reserve(header.value_count as usize);
    match header.fixed_length {
        Some(n) => {
            if n as usize != serde.fixed_length().unwrap_or(0) {
                return Err(DbError::corruption(format!(
                    "Chunk written with {}-byte values, serde expects {:?}",
                    n,
                    serde.fixed_length()
                )));
            }
            for raw in payload.chunks_exact(n as usize) {
                out.push(serde.decode(raw)?);
            }
        }
        None => {
            let mut cur: &[u8] = &payload;
            for _ in 0..header.value_count {
                let len = read_var_u64(&mut cur).map_err(DbError::corruption)? as usize;
                if len > cur.len() {
                    return Err(DbError::corruption("Truncated value in chunk"));
                }
                let (raw, rest) = cur.split_at(len);
                out.push(serde.decode(raw)?);
                cur = rest;
            }
            if !cur.is_empty() {
                return Err(DbError::corruption("Trailing bytes after last value in chunk"));
            }
        }
    }
    if out.len() != header.value_count as usize {
        return Err(DbError::corruption("Chunk value count mismatch"));
    }
    Ok(out)
}

fn split_chunk(bytes: &[u8]) -> Result<(ChunkHeader, &[u8]), DbError> {
    if bytes.len() < CHUNK_HEADER_LEN {
        return Err(DbError::corruption("Truncated chunk header"));
    }
    if &bytes[..8] != CHUNK_MAGIC {
        return Err(DbError::corruption("Bad chunk magic"));
    }
    let mut cur: &[u8] = &bytes[8..CHUNK_HEADER_LEN];
    let version = read_u32(&mut cur)?;
    if version != CHUNK_VERSION {
        return Err(DbError::corruption(format!(
            "Unsupported chunk version {}",
            version
        )));
    }
    let mut codec = [0u8; 1];
    cur.read_exact(&mut codec)?;
    let param = read_u32(&mut cur)?;
    let compression = match codec[0] {
        COMPRESS_NONE => ChunkCompression::None,
        COMPRESS_LZ4 => ChunkCompression::Lz4,
        COMPRESS_ZSTD => ChunkCompression::Zstd {
            level: i32::from_le_bytes(param.to_le_bytes()),
        },
        other => {
            return Err(DbError::corruption(format!(
                "Unknown chunk compression codec {}",
                other
            )))
        }
    };
    let value_count = read_u32(&mut cur)?;
    let mut framing = [0u8; 1];
    cur.read_exact(&mut framing)?;
    let framing_param = read_u32(&mut cur)?;
    let (fixed_length, raw_len) = match framing[0] {
        FRAMING_FIXED => (
            Some(framing_param),
            framing_param.saturating_mul(value_count),
        ),
        FRAMING_VARINT => (None, framing_param),
        other => {
            return Err(DbError::corruption(format!(
                "Unknown chunk value framing {}",
                other
            )))
        }
    };
    let payload_crc32 = read_u32(&mut cur)?;
    Ok((
        ChunkHeader {
            version,
            compression,
            value_count,
            fixed_length,
            raw_len,
            payload_crc32,
        },
        &bytes[CHUNK_HEADER_LEN..],
    ))
}

fn compress_payload(
    compression: ChunkCompression,
    payload: &[u8],
) -> Result<(u8, u32, Vec<u8>), DbError> {
    match compression {
        ChunkCompression::None => Ok((COMPRESS_NONE, 0, payload.to_vec())),
        ChunkCompression::Lz4 => Ok((COMPRESS_LZ4, 0, lz4_flex::compress_prepend_size(payload))),
        ChunkCompression::Zstd { level } => {
            let compressed = zstd::bulk::compress(payload, level)
                .map_err(|e| DbError::Compression(format!("Zstd compress failed: {}", e)))?;
            let param = u32::from_le_bytes(level.to_le_bytes());
            Ok((COMPRESS_ZSTD, param, compressed))
        }
    }
}

fn decompress_payload(
    compression: ChunkCompression,
    stored: &[u8],
    expected_raw: usize,
) -> Result<Vec<u8>, DbError> {
    match compression {
        ChunkCompression::None => Ok(stored.to_vec()),
        ChunkCompression::Lz4 => lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| DbError::corruption(format!("LZ4 decompress failed: {}", e))),
        ChunkCompression::Zstd { .. } => zstd::bulk::decompress(stored, expected_raw)
            .map_err(|e| DbError::corruption(format!("Zstd decompress failed: {}", e))),
    }
}

// --- binary helpers ---

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, DbError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, DbError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_var_u64<R: Read>(r: &mut R) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serde_codec::{BincodeSerde, DataPointSerde};
    use crate::types::{DataPoint, TimedRecord};

    fn points(n: u64) -> Vec<DataPoint> {
        (0..n).map(|i| DataPoint::new(1_000 + i * 10, i as f64 * 0.5)).collect()
    }

    #[test]
    fn fixed_chunk_all_codecs() {
        let values = points(500);
        for compression in [
            ChunkCompression::None,
            ChunkCompression::Lz4,
            ChunkCompression::Zstd { level: 3 },
        ] {
            let bytes = encode_chunk(&values, &DataPointSerde, compression).unwrap();
            let header = verify_chunk_bytes(&bytes).unwrap();
            assert_eq!(header.compression, compression);
            assert_eq!(header.value_count, 500);
            assert_eq!(header.fixed_length, Some(16));
            let decoded = decode_chunk_into(&bytes, &DataPointSerde, Vec::new()).unwrap();
            assert_eq!(decoded, values);
        }
    }

    #[test]
    fn variable_length_chunk() {
        let serde = BincodeSerde::<TimedRecord<String>>::new();
        let values: Vec<_> = (0..50u64)
            .map(|i| TimedRecord::new(i, i + 1, "x".repeat(i as usize)))
            .collect();
        let bytes = encode_chunk(&values, &serde, ChunkCompression::Lz4).unwrap();
        let decoded = decode_chunk_into(&bytes, &serde, Vec::with_capacity(4)).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn decode_reuses_and_clears_buffer() {
        let values = points(3);
        let bytes = encode_chunk(&values, &DataPointSerde, ChunkCompression::None).unwrap();
        let stale = vec![DataPoint::new(9, 9.0); 10];
        let decoded = decode_chunk_into(&bytes, &DataPointSerde, stale).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let bytes = encode_chunk(&points(20), &DataPointSerde, ChunkCompression::Lz4).unwrap();
        let mut bad = bytes.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let err = decode_chunk_into(&bad, &DataPointSerde, Vec::new()).unwrap_err();
        assert!(err.is_corruption());

        let mut bad_magic = bytes;
        bad_magic[0] = b'X';
        assert!(verify_chunk_bytes(&bad_magic).unwrap_err().is_corruption());
    }

    #[test]
    fn empty_chunk_is_rejected() {
        let empty: Vec<DataPoint> = Vec::new();
        assert!(encode_chunk(&empty, &DataPointSerde, ChunkCompression::None).is_err());
    }
}
