//! SSTable data records and index entries.
//!
//! ```text
//! DataRecord:
//! ┌──────────┬───────────┬───────────┬─────────┬───────────┬───────┬───────┐
//! │ CRC (4B) │ TS (8B)   │ Tomb (1B) │ KeySize │ ValueSize │  Key  │ Value │
//! └──────────┴───────────┴───────────┴─────────┴───────────┴───────┴───────┘
//! ```
//!
//! Sizes are unsigned LEB128 varints; `ValueSize`/`Value` are absent for
//! tombstones. With a compression dictionary `Key` and `Value` become 8-byte
//! big-endian dictionary indices and the sizes are dropped. The CRC always
//! covers the resolved `Key ‖ Value ‖ TS ‖ Tomb` bytes.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, StrataError};
use crate::types::{Entry, Key};

use super::dictionary::Dictionary;

const CRC_SIZE: usize = 4;
const FIXED_HEADER: usize = CRC_SIZE + 8 + 1;
const INDEX_REF_SIZE: usize = 8;

/// Append `value` as an unsigned LEB128 varint.
pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a varint from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends mid-varint.
pub fn get_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(StrataError::Corruption("varint longer than 10 bytes".into()));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

fn record_crc(key: &[u8], value: &[u8], timestamp: i64, tombstone: bool) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(value);
    hasher.update(&timestamp.to_be_bytes());
    hasher.update(&[tombstone as u8]);
    hasher.finalize()
}

/// Serialize `entry` as a DataRecord. When a dictionary is supplied, key
/// and value are interned into it and written as indices.
pub fn encode_record(entry: &Entry, dictionary: Option<&mut Dictionary>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(FIXED_HEADER + 4 + entry.key.len() + entry.value.len());
    buf.put_u32(record_crc(
        &entry.key,
        &entry.value,
        entry.timestamp,
        entry.tombstone,
    ));
    buf.put_i64(entry.timestamp);
    buf.put_u8(entry.tombstone as u8);

    match dictionary {
        Some(dict) => {
            buf.put_u64(dict.intern(&entry.key));
            if !entry.tombstone {
                buf.put_u64(dict.intern(&entry.value));
            }
        }
        None => {
            put_varint(&mut buf, entry.key.len() as u64);
            if !entry.tombstone {
                put_varint(&mut buf, entry.value.len() as u64);
            }
            buf.put_slice(&entry.key);
            if !entry.tombstone {
                buf.put_slice(&entry.value);
            }
        }
    }
    buf.to_vec()
}

/// Decode one DataRecord from the front of `buf`.
///
/// Returns the entry and the number of bytes it occupied, or `Ok(None)` if
/// `buf` holds only part of a record. A CRC mismatch is corruption.
pub fn decode_record(buf: &[u8], dictionary: Option<&Dictionary>) -> Result<Option<(Entry, usize)>> {
    if buf.len() < FIXED_HEADER {
        return Ok(None);
    }
    let stored_crc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&buf[CRC_SIZE..CRC_SIZE + 8]);
    let timestamp = i64::from_be_bytes(ts_bytes);
    let tombstone = match buf[CRC_SIZE + 8] {
        0 => false,
        1 => true,
        other => {
            return Err(StrataError::Corruption(format!(
                "invalid tombstone flag {}",
                other
            )))
        }
    };
    let mut pos = FIXED_HEADER;

    let (key, value) = match dictionary {
        Some(dict) => {
            let refs = if tombstone { 1 } else { 2 };
            if buf.len() < pos + refs * INDEX_REF_SIZE {
                return Ok(None);
            }
            let key = dict.resolve(read_u64(&buf[pos..]))?.to_vec();
            pos += INDEX_REF_SIZE;
            let value = if tombstone {
                Vec::new()
            } else {
                let value = dict.resolve(read_u64(&buf[pos..]))?.to_vec();
                pos += INDEX_REF_SIZE;
                value
            };
            (key, value)
        }
        None => {
            let Some((key_len, n)) = get_varint(&buf[pos..])? else {
                return Ok(None);
            };
            pos += n;
            let value_len = if tombstone {
                0
            } else {
                let Some((value_len, n)) = get_varint(&buf[pos..])? else {
                    return Ok(None);
                };
                pos += n;
                value_len
            };
            let (key_len, value_len) = (key_len as usize, value_len as usize);
            if buf.len() < pos + key_len + value_len {
                return Ok(None);
            }
            let key = buf[pos..pos + key_len].to_vec();
            pos += key_len;
            let value = buf[pos..pos + value_len].to_vec();
            pos += value_len;
            (key, value)
        }
    };

    let computed = record_crc(&key, &value, timestamp, tombstone);
    if computed != stored_crc {
        return Err(StrataError::Corruption(format!(
            "data record CRC mismatch: expected {:#010x}, got {:#010x}",
            stored_crc, computed
        )));
    }
    Ok(Some((
        Entry {
            key,
            value,
            timestamp,
            tombstone,
        },
        pos,
    )))
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(bytes)
}

/// One dense Index entry: where a key's DataRecord lives in the Data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Key,
    pub offset: u64,
    pub len: u32,
}

impl IndexEntry {
    /// `KeySize varint | Key | Offset u64 | Length u32`, big-endian.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        put_varint(buf, self.key.len() as u64);
        buf.put_slice(&self.key);
        buf.put_u64(self.offset);
        buf.put_u32(self.len);
    }

    /// Decode every entry of an index region.
    pub fn decode_all(mut buf: &[u8]) -> Result<Vec<IndexEntry>> {
        let truncated = || StrataError::Corruption("truncated index entry".into());
        let mut entries = Vec::new();
        while !buf.is_empty() {
            let (key_len, n) = get_varint(buf)?.ok_or_else(truncated)?;
            let key_len = key_len as usize;
            buf = &buf[n..];
            if buf.len() < key_len + 12 {
                return Err(truncated());
            }
            let key = buf[..key_len].to_vec();
            let offset = read_u64(&buf[key_len..]);
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&buf[key_len + 8..key_len + 12]);
            entries.push(IndexEntry {
                key,
                offset,
                len: u32::from_be_bytes(len_bytes),
            });
            buf = &buf[key_len + 12..];
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(get_varint(&buf).unwrap(), Some((value, buf.len())));
        }
        let mut small = BytesMut::new();
        put_varint(&mut small, 127);
        assert_eq!(small.len(), 1);
        assert_eq!(get_varint(&[0x80]).unwrap(), None);
    }

    #[test]
    fn test_record_layout() {
        let entry = Entry::put(b"foo".to_vec(), b"bar".to_vec(), 7);
        let encoded = encode_record(&entry, None);
        // crc + ts + tomb + two 1-byte sizes + key + value
        assert_eq!(encoded.len(), 4 + 8 + 1 + 1 + 1 + 3 + 3);
        assert_eq!(&encoded[4..12], &7i64.to_be_bytes());
        assert_eq!(encoded[13], 3);
        let (decoded, used) = decode_record(&encoded, None).unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_tombstone_omits_value() {
        let entry = Entry::delete(b"gone".to_vec(), 9);
        let encoded = encode_record(&entry, None);
        assert_eq!(encoded.len(), 4 + 8 + 1 + 1 + 4);
        let (decoded, _) = decode_record(&encoded, None).unwrap().unwrap();
        assert!(decoded.tombstone);
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn test_partial_record_needs_more() {
        let encoded = encode_record(&Entry::put(vec![1; 200], vec![2; 300], 1), None);
        for cut in [0, 5, 13, 14, 100, encoded.len() - 1] {
            assert!(decode_record(&encoded[..cut], None).unwrap().is_none());
        }
    }

    #[test]
    fn test_crc_mismatch() {
        let mut encoded = encode_record(&Entry::put(b"k".to_vec(), b"v".to_vec(), 1), None);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(
            decode_record(&encoded, None),
            Err(StrataError::Corruption(_))
        ));
    }

    #[test]
    fn test_dictionary_records() {
        let mut dict = Dictionary::default();
        let a = encode_record(&Entry::put(b"user:1".to_vec(), b"red".to_vec(), 1), Some(&mut dict));
        let b = encode_record(&Entry::put(b"user:2".to_vec(), b"red".to_vec(), 2), Some(&mut dict));
        assert_eq!(a.len(), 13 + 16);
        assert_eq!(dict.len(), 3);
        let (decoded, _) = decode_record(&b, Some(&dict)).unwrap().unwrap();
        assert_eq!(decoded.key, b"user:2");
        assert_eq!(decoded.value, b"red");
    }

    #[test]
    fn test_index_entries() {
        let mut buf = BytesMut::new();
        let entries = vec![
            IndexEntry { key: b"a".to_vec(), offset: 0, len: 20 },
            IndexEntry { key: b"bb".to_vec(), offset: 20, len: 31 },
        ];
        for e in &entries {
            e.encode_into(&mut buf);
        }
        assert_eq!(IndexEntry::decode_all(&buf).unwrap(), entries);
        assert!(IndexEntry::decode_all(&buf[..buf.len() - 2]).is_err());
    }
}
