//! Binary encoding of chunks for the swap store.
//!
//! The on-disk format is internal and not required to be portable across
//! implementations, but it must round-trip a chunk's full content and
//! encoding tag exactly:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "TCHK"
//! 4       1     format version (currently 1)
//! 5       1     encoding tag: 0 = uniform, 1 = dense
//! 6       4     height in cells (u32 LE)
//! 10      4     width in cells (u32 LE)
//! 14      ...   payload: one f64 LE (uniform) or height*width f64 LE (dense)
//! ```

use crate::chunk::Chunk;
use crate::types::CacheError;
use std::io;

const MAGIC: &[u8; 4] = b"TCHK";
const VERSION: u8 = 1;
const TAG_UNIFORM: u8 = 0;
const TAG_DENSE: u8 = 1;
const HEADER_LEN: usize = 14;

/// Serialize a chunk into its swap file representation.
pub fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    let payload_len = match chunk.cells() {
        Some(cells) => cells.len() * 8,
        None => 8,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);

    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    match chunk.cells() {
        None => {
            buf.push(TAG_UNIFORM);
            push_extent(&mut buf, chunk);
            let value = chunk
                .uniform_value()
                .expect("chunk without a dense buffer is uniform");
            buf.extend_from_slice(&value.to_le_bytes());
        }
        Some(cells) => {
            buf.push(TAG_DENSE);
            push_extent(&mut buf, chunk);
            for cell in cells {
                buf.extend_from_slice(&cell.to_le_bytes());
            }
        }
    }
    buf
}

/// Deserialize a chunk from its swap file representation.
///
/// Corruption is surfaced as a `SwapIo` error wrapping
/// `io::ErrorKind::InvalidData`; a chunk whose persisted copy cannot be
/// decoded is unrecoverable data loss.
pub fn decode_chunk(bytes: &[u8]) -> Result<Chunk, CacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    if bytes[4] != VERSION {
        return Err(corrupt("unsupported format version"));
    }
    let tag = bytes[5];
    let height = read_u32(&bytes[6..10]) as usize;
    let width = read_u32(&bytes[10..14]) as usize;
    if height == 0 || width == 0 {
        return Err(corrupt("empty chunk extent"));
    }

    let payload = &bytes[HEADER_LEN..];
    match tag {
        TAG_UNIFORM => {
            if payload.len() != 8 {
                return Err(corrupt("uniform payload length mismatch"));
            }
            let value = read_f64(payload);
            Ok(Chunk::uniform(height, width, value))
        }
        TAG_DENSE => {
            let expected = height
                .checked_mul(width)
                .and_then(|cells| cells.checked_mul(8))
                .ok_or_else(|| corrupt("chunk extent overflow"))?;
            if payload.len() != expected {
                return Err(corrupt("dense payload length mismatch"));
            }
            let cells: Vec<f64> = payload.chunks_exact(8).map(read_f64).collect();
            Chunk::from_dense(height, width, cells)
        }
        _ => Err(corrupt("unknown encoding tag")),
    }
}

fn push_extent(buf: &mut Vec<u8>, chunk: &Chunk) {
    buf.extend_from_slice(&(chunk.height() as u32).to_le_bytes());
    buf.extend_from_slice(&(chunk.width() as u32).to_le_bytes());
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().expect("caller supplies 4 bytes"))
}

fn read_f64(bytes: &[u8]) -> f64 {
    f64::from_le_bytes(bytes.try_into().expect("caller supplies 8 bytes"))
}

fn corrupt(reason: &str) -> CacheError {
    CacheError::SwapIo(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("corrupt swap entry: {reason}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_round_trip() {
        let chunk = Chunk::uniform(64, 32, -9999.0);
        let decoded = decode_chunk(&encode_chunk(&chunk)).unwrap();
        assert_eq!(decoded, chunk);
        assert!(decoded.is_uniform());
    }

    #[test]
    fn test_dense_round_trip() {
        let mut chunk = Chunk::uniform(3, 5, 0.0);
        chunk.set(0, 0, 1.5).unwrap();
        chunk.set(2, 4, -2.25).unwrap();
        let decoded = decode_chunk(&encode_chunk(&chunk)).unwrap();
        assert_eq!(decoded, chunk);
        assert!(!decoded.is_uniform());
        assert_eq!(decoded.get(2, 4).unwrap(), -2.25);
    }

    #[test]
    fn test_nan_sentinel_round_trip() {
        let chunk = Chunk::uniform(2, 2, f64::NAN);
        let decoded = decode_chunk(&encode_chunk(&chunk)).unwrap();
        assert!(decoded.uniform_value().unwrap().is_nan());
    }

    #[test]
    fn test_encoding_tag_preserved() {
        // A dense chunk whose cells happen to be equal must stay dense
        // through the round-trip; compaction is the cache's decision, not
        // the codec's.
        let mut chunk = Chunk::uniform(2, 2, 4.0);
        chunk.materialize();
        let decoded = decode_chunk(&encode_chunk(&chunk)).unwrap();
        assert!(!decoded.is_uniform());
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let chunk = Chunk::uniform(2, 2, 1.0);
        let bytes = encode_chunk(&chunk);
        assert!(decode_chunk(&bytes[..5]).is_err());
        assert!(decode_chunk(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let chunk = Chunk::uniform(2, 2, 1.0);
        let mut bytes = encode_chunk(&chunk);
        bytes[0] = b'X';
        assert!(decode_chunk(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let chunk = Chunk::uniform(2, 2, 1.0);
        let mut bytes = encode_chunk(&chunk);
        bytes[5] = 7;
        assert!(decode_chunk(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_empty_extent() {
        let chunk = Chunk::uniform(2, 2, 1.0);
        let mut bytes = encode_chunk(&chunk);
        bytes[6..10].copy_from_slice(&0u32.to_le_bytes());
        assert!(decode_chunk(&bytes).is_err());
    }
}
