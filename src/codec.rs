//! On-disk wire formats.
//!
//! Every integer is big-endian. Every decode path bounds-checks lengths
//! before trusting them and fails with [`CodecError::CorruptFormat`]
//! rather than allocating or indexing on attacker- or corruption-supplied
//! sizes.

use crate::bytesutil::{crc32, MAX_KEY_LEN, MAX_VALUE_LEN};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupt format: {0}")]
    CorruptFormat(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub const RECORD_VERSION: u8 = 1;
pub const MARKER_DATA: u8 = 0x01;
pub const MARKER_TOMBSTONE: u8 = 0x02;

/// A decoded key-value record body, independent of the framing (plain
/// record vs. WAL record) that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueOrTombstone {
    Value(Vec<u8>),
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: ValueOrTombstone,
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, CodecError> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| CodecError::CorruptFormat("truncated u32".into()))?;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, CodecError> {
    let slice = bytes
        .get(at..at + 8)
        .ok_or_else(|| CodecError::CorruptFormat("truncated u64".into()))?;
    Ok(u64::from_be_bytes(slice.try_into().unwrap()))
}

/// Validates a key (non-empty UTF-8, ≤ [`MAX_KEY_LEN`]) and a value
/// (≤ [`MAX_VALUE_LEN`], non-empty for a data record).
pub fn validate_key(key: &[u8]) -> Result<(), CodecError> {
    if key.is_empty() {
        return Err(CodecError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CodecError::InvalidArgument(format!(
            "key length {} exceeds {MAX_KEY_LEN}",
            key.len()
        )));
    }
    std::str::from_utf8(key)
        .map_err(|_| CodecError::InvalidArgument("key must be valid UTF-8".into()))?;
    Ok(())
}

pub fn validate_value(value: &[u8]) -> Result<(), CodecError> {
    if value.is_empty() {
        return Err(CodecError::InvalidArgument("value must not be empty".into()));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(CodecError::InvalidArgument(format!(
            "value length {} exceeds {MAX_VALUE_LEN}",
            value.len()
        )));
    }
    Ok(())
}

/// Encodes a key-value record: `[version][marker][keyLen][key][valLen][value][crc32]`.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + record.key.len());
    buf.push(RECORD_VERSION);
    match &record.value {
        ValueOrTombstone::Value(v) => {
            buf.push(MARKER_DATA);
            push_u32(&mut buf, record.key.len() as u32);
            buf.extend_from_slice(&record.key);
            push_u32(&mut buf, v.len() as u32);
            buf.extend_from_slice(v);
        }
        ValueOrTombstone::Tombstone => {
            buf.push(MARKER_TOMBSTONE);
            push_u32(&mut buf, record.key.len() as u32);
            buf.extend_from_slice(&record.key);
            push_u32(&mut buf, 0);
        }
    }
    let checksum = crc32(&buf);
    push_u32(&mut buf, checksum);
    buf
}

pub fn decode_record(bytes: &[u8]) -> Result<Record, CodecError> {
    if bytes.len() < 10 {
        return Err(CodecError::CorruptFormat("record too short".into()));
    }
    let version = bytes[0];
    if version != RECORD_VERSION {
        return Err(CodecError::CorruptFormat(format!(
            "unsupported record version {version}"
        )));
    }
    let marker = bytes[1];
    let key_len = read_u32(bytes, 2)? as usize;
    if key_len == 0 || key_len > MAX_KEY_LEN {
        return Err(CodecError::CorruptFormat(format!(
            "key length {key_len} out of range"
        )));
    }
    let key_start = 6;
    let key_end = key_start + key_len;
    let key = bytes
        .get(key_start..key_end)
        .ok_or_else(|| CodecError::CorruptFormat("truncated key".into()))?
        .to_vec();

    let value_len = read_u32(bytes, key_end)? as usize;
    if value_len > MAX_VALUE_LEN {
        return Err(CodecError::CorruptFormat(format!(
            "value length {value_len} out of range"
        )));
    }
    let value_start = key_end + 4;
    let value_end = value_start + value_len;
    let value_bytes = bytes
        .get(value_start..value_end)
        .ok_or_else(|| CodecError::CorruptFormat("truncated value".into()))?;

    let crc_at = value_end;
    let stored_crc = read_u32(bytes, crc_at)?;
    if bytes.len() != crc_at + 4 {
        return Err(CodecError::CorruptFormat("trailing bytes after record".into()));
    }
    let computed_crc = crc32(&bytes[..crc_at]);
    if computed_crc != stored_crc {
        return Err(CodecError::CorruptFormat("record checksum mismatch".into()));
    }

    let value = match marker {
        MARKER_DATA => ValueOrTombstone::Value(value_bytes.to_vec()),
        MARKER_TOMBSTONE => ValueOrTombstone::Tombstone,
        other => return Err(CodecError::CorruptFormat(format!("unknown marker {other}"))),
    };

    Ok(Record { key, value })
}

/// A WAL record payload: record body prefixed by `[timestamp][sequence]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub record: Record,
}

/// Encodes the WAL payload (timestamp, sequence, then the same body shape
/// as a plain record) and appends its own CRC32 over the payload. Callers
/// frame this with an outer `[crc32][len]` header (see [`encode_wal_frame`]).
pub fn encode_wal_payload(rec: &WalRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18 + rec.record.key.len());
    buf.push(RECORD_VERSION);
    match &rec.record.value {
        ValueOrTombstone::Value(v) => {
            buf.push(MARKER_DATA);
            push_u64(&mut buf, rec.timestamp);
            push_u64(&mut buf, rec.sequence);
            push_u32(&mut buf, rec.record.key.len() as u32);
            buf.extend_from_slice(&rec.record.key);
            push_u32(&mut buf, v.len() as u32);
            buf.extend_from_slice(v);
        }
        ValueOrTombstone::Tombstone => {
            buf.push(MARKER_TOMBSTONE);
            push_u64(&mut buf, rec.timestamp);
            push_u64(&mut buf, rec.sequence);
            push_u32(&mut buf, rec.record.key.len() as u32);
            buf.extend_from_slice(&rec.record.key);
            push_u32(&mut buf, 0);
        }
    }
    let checksum = crc32(&buf);
    push_u32(&mut buf, checksum);
    buf
}

pub fn decode_wal_payload(bytes: &[u8]) -> Result<WalRecord, CodecError> {
    if bytes.len() < 18 {
        return Err(CodecError::CorruptFormat("wal payload too short".into()));
    }
    let version = bytes[0];
    if version != RECORD_VERSION {
        return Err(CodecError::CorruptFormat(format!(
            "unsupported wal record version {version}"
        )));
    }
    let marker = bytes[1];
    let timestamp = read_u64(bytes, 2)?;
    let sequence = read_u64(bytes, 10)?;
    let key_len = read_u32(bytes, 18)? as usize;
    if key_len == 0 || key_len > MAX_KEY_LEN {
        return Err(CodecError::CorruptFormat(format!(
            "key length {key_len} out of range"
        )));
    }
    let key_start = 22;
    let key_end = key_start + key_len;
    let key = bytes
        .get(key_start..key_end)
        .ok_or_else(|| CodecError::CorruptFormat("truncated wal key".into()))?
        .to_vec();

    let value_len = read_u32(bytes, key_end)? as usize;
    if value_len > MAX_VALUE_LEN {
        return Err(CodecError::CorruptFormat(format!(
            "value length {value_len} out of range"
        )));
    }
    let value_start = key_end + 4;
    let value_end = value_start + value_len;
    let value_bytes = bytes
        .get(value_start..value_end)
        .ok_or_else(|| CodecError::CorruptFormat("truncated wal value".into()))?;

    let crc_at = value_end;
    let stored_crc = read_u32(bytes, crc_at)?;
    if bytes.len() != crc_at + 4 {
        return Err(CodecError::CorruptFormat("trailing bytes after wal payload".into()));
    }
    let computed_crc = crc32(&bytes[..crc_at]);
    if computed_crc != stored_crc {
        return Err(CodecError::CorruptFormat("wal payload checksum mismatch".into()));
    }

    let value = match marker {
        MARKER_DATA => ValueOrTombstone::Value(value_bytes.to_vec()),
        MARKER_TOMBSTONE => ValueOrTombstone::Tombstone,
        other => return Err(CodecError::CorruptFormat(format!("unknown wal marker {other}"))),
    };

    Ok(WalRecord {
        timestamp,
        sequence,
        record: Record { key, value },
    })
}

pub const WAL_FRAME_HEADER_LEN: usize = 8;
pub const WAL_MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

/// Frames a WAL payload as `[outerCrc32][payloadLen][payload]`. The outer
/// CRC32 is computed over the payload only (it duplicates the inner CRC32
/// that already terminates the payload, so a frame can be validated
/// without decoding it first).
pub fn encode_wal_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(WAL_FRAME_HEADER_LEN + payload.len());
    push_u32(&mut frame, crc32(payload));
    push_u32(&mut frame, payload.len() as u32);
    frame.extend_from_slice(payload);
    frame
}

pub struct WalFrameHeader {
    pub crc32: u32,
    pub payload_len: usize,
}

/// Decodes just the 8-byte frame header. Callers use `payload_len` to
/// decide how many more bytes to read before calling
/// [`validate_wal_frame`].
pub fn decode_wal_frame_header(bytes: &[u8]) -> Result<WalFrameHeader, CodecError> {
    if bytes.len() < WAL_FRAME_HEADER_LEN {
        return Err(CodecError::CorruptFormat("truncated wal frame header".into()));
    }
    let crc32 = read_u32(bytes, 0)?;
    let payload_len = read_u32(bytes, 4)? as usize;
    Ok(WalFrameHeader { crc32, payload_len })
}

/// Returns `true` iff the payload's CRC32 matches the frame header's.
pub fn validate_wal_frame(header: &WalFrameHeader, payload: &[u8]) -> bool {
    crc32(payload) == header.crc32
}

/// Bloom filter serialization: `[version][bitSize][k][byteLen][bytes]`.
pub fn encode_bloom(bit_size: u32, k: u32, bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13 + bytes.len());
    buf.push(RECORD_VERSION);
    push_u32(&mut buf, bit_size);
    push_u32(&mut buf, k);
    push_u32(&mut buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
    buf
}

pub struct DecodedBloom {
    pub bit_size: u32,
    pub k: u32,
    pub bytes: Vec<u8>,
}

pub fn decode_bloom(bytes: &[u8]) -> Result<DecodedBloom, CodecError> {
    if bytes.len() < 13 {
        return Err(CodecError::CorruptFormat("bloom filter too short".into()));
    }
    let version = bytes[0];
    if version != RECORD_VERSION {
        return Err(CodecError::CorruptFormat(format!(
            "unsupported bloom filter version {version}"
        )));
    }
    let bit_size = read_u32(bytes, 1)?;
    let k = read_u32(bytes, 5)?;
    let byte_len = read_u32(bytes, 9)? as usize;
    let data = bytes
        .get(13..13 + byte_len)
        .ok_or_else(|| CodecError::CorruptFormat("truncated bloom filter bytes".into()))?;
    if bytes.len() != 13 + byte_len {
        return Err(CodecError::CorruptFormat("trailing bytes after bloom filter".into()));
    }
    Ok(DecodedBloom {
        bit_size,
        k,
        bytes: data.to_vec(),
    })
}

/// One entry of the persisted block index: `[keyLen][key][offset][size]`.
pub struct BlockIndexEntry {
    pub key: Vec<u8>,
    pub offset: u64,
    pub size: u32,
}

/// Block index serialization: `[version][count]([keyLen][key][offset][size])×count`.
/// Not consulted on the read path (blocks are located by a direct
/// binary search over in-memory block ranges); persisted purely as a
/// durable record of block layout.
pub fn encode_block_index(entries: &[BlockIndexEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(RECORD_VERSION);
    push_u32(&mut buf, entries.len() as u32);
    for entry in entries {
        push_u32(&mut buf, entry.key.len() as u32);
        buf.extend_from_slice(&entry.key);
        push_u64(&mut buf, entry.offset);
        push_u32(&mut buf, entry.size);
    }
    buf
}

pub fn decode_block_index(bytes: &[u8]) -> Result<Vec<BlockIndexEntry>, CodecError> {
    if bytes.len() < 5 {
        return Err(CodecError::CorruptFormat("block index too short".into()));
    }
    let version = bytes[0];
    if version != RECORD_VERSION {
        return Err(CodecError::CorruptFormat(format!(
            "unsupported block index version {version}"
        )));
    }
    let count = read_u32(bytes, 1)? as usize;
    let mut offset = 5usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = read_u32(bytes, offset)? as usize;
        offset += 4;
        let key = bytes
            .get(offset..offset + key_len)
            .ok_or_else(|| CodecError::CorruptFormat("truncated block index key".into()))?
            .to_vec();
        offset += key_len;
        let entry_offset = read_u64(bytes, offset)?;
        offset += 8;
        let size = read_u32(bytes, offset)?;
        offset += 4;
        out.push(BlockIndexEntry {
            key,
            offset: entry_offset,
            size,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_value() {
        let record = Record {
            key: b"user:1001".to_vec(),
            value: ValueOrTombstone::Value(b"alice".to_vec()),
        };
        let encoded = encode_record(&record);
        let decoded = decode_record(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_round_trips_tombstone() {
        let record = Record {
            key: b"user:1001".to_vec(),
            value: ValueOrTombstone::Tombstone,
        };
        let encoded = encode_record(&record);
        let decoded = decode_record(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_detects_corruption() {
        let record = Record {
            key: b"k".to_vec(),
            value: ValueOrTombstone::Value(b"v".to_vec()),
        };
        let mut encoded = encode_record(&record);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(
            decode_record(&encoded),
            Err(CodecError::CorruptFormat(_))
        ));
    }

    #[test]
    fn key_exactly_at_limit_is_accepted() {
        let key = vec![b'a'; MAX_KEY_LEN];
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn key_one_byte_over_limit_is_rejected() {
        let key = vec![b'a'; MAX_KEY_LEN + 1];
        assert!(validate_key(&key).is_err());
    }

    #[test]
    fn value_exactly_at_limit_is_accepted() {
        let value = vec![0u8; MAX_VALUE_LEN];
        assert!(validate_value(&value).is_ok());
    }

    #[test]
    fn value_one_byte_over_limit_is_rejected() {
        let value = vec![0u8; MAX_VALUE_LEN + 1];
        assert!(validate_value(&value).is_err());
    }

    #[test]
    fn wal_payload_round_trips() {
        let rec = WalRecord {
            timestamp: 42,
            sequence: 7,
            record: Record {
                key: b"k".to_vec(),
                value: ValueOrTombstone::Value(b"v".to_vec()),
            },
        };
        let encoded = encode_wal_payload(&rec);
        let decoded = decode_wal_payload(&encoded).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn wal_frame_round_trips_and_validates() {
        let payload = encode_wal_payload(&WalRecord {
            timestamp: 1,
            sequence: 1,
            record: Record {
                key: b"k".to_vec(),
                value: ValueOrTombstone::Tombstone,
            },
        });
        let frame = encode_wal_frame(&payload);
        let header = decode_wal_frame_header(&frame[..WAL_FRAME_HEADER_LEN]).unwrap();
        assert_eq!(header.payload_len, payload.len());
        assert!(validate_wal_frame(&header, &frame[WAL_FRAME_HEADER_LEN..]));
    }

    #[test]
    fn wal_frame_bad_crc_is_detected_not_fatal_to_decode() {
        let payload = encode_wal_payload(&WalRecord {
            timestamp: 1,
            sequence: 1,
            record: Record {
                key: b"k".to_vec(),
                value: ValueOrTombstone::Value(b"v".to_vec()),
            },
        });
        let mut frame = encode_wal_frame(&payload);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let header = decode_wal_frame_header(&frame[..WAL_FRAME_HEADER_LEN]).unwrap();
        assert!(!validate_wal_frame(&header, &frame[WAL_FRAME_HEADER_LEN..]));
    }

    #[test]
    fn bloom_round_trips() {
        let bytes = vec![0xAAu8; 16];
        let encoded = encode_bloom(128, 7, &bytes);
        let decoded = decode_bloom(&encoded).unwrap();
        assert_eq!(decoded.bit_size, 128);
        assert_eq!(decoded.k, 7);
        assert_eq!(decoded.bytes, bytes);
    }

    #[test]
    fn block_index_round_trips() {
        let entries = vec![
            BlockIndexEntry {
                key: b"a".to_vec(),
                offset: 0,
                size: 100,
            },
            BlockIndexEntry {
                key: b"m".to_vec(),
                offset: 100,
                size: 200,
            },
        ];
        let encoded = encode_block_index(&entries);
        let decoded = decode_block_index(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].key, b"a");
        assert_eq!(decoded[1].offset, 100);
    }

    #[test]
    fn oversized_length_field_is_corrupt_not_panic() {
        let mut bytes = vec![RECORD_VERSION, MARKER_DATA];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_record(&bytes),
            Err(CodecError::CorruptFormat(_))
        ));
    }
}
