//! STRATA - Write-Ahead Log (WAL)
//! Provides durability by logging all mutations to disk
//! before they are applied to the in-memory memtable.
//!
//! The log is a directory of numbered segments (`wal_0001.log`, ...), each a
//! capped run of blocks written through the block store. Every record starts
//! on a block boundary and is zero-padded to a whole number of blocks.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, StrataError};
use crate::types::Entry;

use super::block::{blocks_for, SharedBlockStore};

/// Size of the fixed record header in bytes.
pub const HEADER_SIZE: usize = 4 + 8 + 1 + 1 + 8 + 8;

/// Fragment type of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A self-contained record.
    Full = 1,
    /// Opens a fragment sequence.
    First = 2,
    /// Continues a fragment sequence.
    Middle = 3,
    /// Closes a fragment sequence.
    Last = 4,
}

impl RecordType {
    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(StrataError::Corruption(format!(
                "invalid WAL record type: {}",
                byte
            ))),
        }
    }
}

/// Decoded fixed-size header of a WAL record.
///
/// ## Binary Format (big-endian)
/// ```text
/// [crc: 4][timestamp: 8][type: 1][tombstone: 1][key_size: 8][value_size: 8][key][value]
/// ```
/// The CRC covers everything after itself. Fragments repeat the header of the
/// complete record (sizes and CRC of its FULL form) and carry a slice of
/// `key ‖ value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub crc: u32,
    pub timestamp: i64,
    pub record_type: RecordType,
    pub tombstone: bool,
    pub key_size: u64,
    pub value_size: u64,
}

impl RecordHeader {
    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StrataError::Corruption("WAL header truncated".into()));
        }
        let crc = buf.get_u32();
        let timestamp = buf.get_i64();
        let record_type = RecordType::from_u8(buf.get_u8())?;
        let tombstone = buf.get_u8() != 0;
        let key_size = buf.get_u64();
        let value_size = buf.get_u64();
        Ok(Self {
            crc,
            timestamp,
            record_type,
            tombstone,
            key_size,
            value_size,
        })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.crc);
        buf.put_i64(self.timestamp);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(self.tombstone as u8);
        buf.put_u64(self.key_size);
        buf.put_u64(self.value_size);
    }

    fn payload_len(&self) -> Result<u64> {
        self.key_size
            .checked_add(self.value_size)
            .ok_or_else(|| StrataError::Corruption("WAL record sizes overflow".into()))
    }

    /// Bytes of the FULL form of this record, header included.
    fn record_len(&self) -> Result<u64> {
        self.payload_len()?
            .checked_add(HEADER_SIZE as u64)
            .ok_or_else(|| StrataError::Corruption("WAL record sizes overflow".into()))
    }

    /// Same logical record as `other`, ignoring the fragment type.
    fn continues(&self, other: &RecordHeader) -> bool {
        self.crc == other.crc
            && self.timestamp == other.timestamp
            && self.tombstone == other.tombstone
            && self.key_size == other.key_size
            && self.value_size == other.value_size
    }
}

/// Serialize `entry` as a FULL record.
pub fn encode_record(entry: &Entry) -> Vec<u8> {
    let value: &[u8] = if entry.tombstone { &[] } else { &entry.value };
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + entry.key.len() + value.len());
    RecordHeader {
        crc: 0,
        timestamp: entry.timestamp,
        record_type: RecordType::Full,
        tombstone: entry.tombstone,
        key_size: entry.key.len() as u64,
        value_size: value.len() as u64,
    }
    .encode_into(&mut buf);
    buf.put_slice(&entry.key);
    buf.put_slice(value);
    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_be_bytes());
    buf.to_vec()
}

/// Deserialize a FULL record, verifying its CRC. Trailing padding is ignored.
pub fn decode_record(data: &[u8]) -> Result<Entry> {
    let header = RecordHeader::decode(data)?;
    if header.record_type != RecordType::Full {
        return Err(StrataError::Corruption(format!(
            "expected FULL record, found {:?}",
            header.record_type
        )));
    }
    let end = header.record_len()?;
    if (data.len() as u64) < end {
        return Err(StrataError::Corruption("WAL record truncated".into()));
    }
    let end = end as usize;
    let computed = crc32fast::hash(&data[4..end]);
    if computed != header.crc {
        return Err(StrataError::Corruption(format!(
            "WAL CRC mismatch: stored {:#010x}, computed {:#010x}",
            header.crc, computed
        )));
    }
    Ok(entry_from_payload(&header, &data[HEADER_SIZE..end]))
}

fn entry_from_payload(header: &RecordHeader, payload: &[u8]) -> Entry {
    let (key, value) = payload.split_at(header.key_size as usize);
    Entry {
        key: key.to_vec(),
        value: value.to_vec(),
        timestamp: header.timestamp,
        tombstone: header.tombstone,
    }
}

/// A fragment sequence being reassembled.
struct PendingRecord {
    header: RecordHeader,
    payload: Vec<u8>,
}

/// Segmented write-ahead log.
pub struct WriteAheadLog {
    /// Directory holding the segments.
    dir: PathBuf,
    store: SharedBlockStore,
    /// Block budget of one segment.
    segment_size: u64,
    /// fsync after each append.
    sync_writes: bool,
    /// Number of the segment receiving appends.
    active: u32,
    /// Blocks already written to the active segment.
    active_blocks: u64,
}

impl WriteAheadLog {
    /// Open the log in `dir`, continuing the newest existing segment.
    pub fn open(
        dir: impl Into<PathBuf>,
        store: SharedBlockStore,
        segment_size: usize,
        sync_writes: bool,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let segments = list_segments(&dir)?;
        let active = segments.last().copied().unwrap_or(1);
        let active_blocks = store.block_count(&segment_path(&dir, active))?;
        log::debug!(
            "WAL opened at {:?}: {} segment(s), active wal_{:04}",
            dir,
            segments.len(),
            active
        );
        Ok(Self {
            dir,
            store,
            segment_size: segment_size as u64,
            sync_writes,
            active,
            active_blocks,
        })
    }

    /// Returns the WAL directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of the segment receiving appends.
    pub fn active_segment(&self) -> u32 {
        self.active
    }

    /// Segment numbers present on disk, oldest first.
    pub fn segments(&self) -> Result<Vec<u32>> {
        list_segments(&self.dir)
    }

    /// Append a mutation and make it durable.
    ///
    /// A record that fits a segment is written whole, rotating first if the
    /// active segment lacks room. A record larger than a segment is split into
    /// FIRST/MIDDLE/LAST fragments across consecutive segments.
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        let encoded = encode_record(entry);
        let block_size = self.store.block_size();
        let needed = blocks_for(encoded.len(), block_size) as u64;

        if needed <= self.segment_size {
            if self.active_blocks + needed > self.segment_size {
                self.rotate()?;
            }
            self.write_active(&encoded)?;
        } else {
            self.append_fragmented(&encoded)?;
        }
        Ok(())
    }

    fn append_fragmented(&mut self, encoded: &[u8]) -> Result<()> {
        let block_size = self.store.block_size() as u64;
        let full = RecordHeader::decode(encoded)?;
        let payload = &encoded[HEADER_SIZE..];
        if self.active_blocks >= self.segment_size {
            self.rotate()?;
        }

        let mut offset = 0usize;
        let mut fragments = 0usize;
        loop {
            let capacity =
                ((self.segment_size - self.active_blocks) * block_size) as usize - HEADER_SIZE;
            let remaining = payload.len() - offset;
            let (record_type, len) = match (fragments, remaining <= capacity) {
                (0, true) => (RecordType::Full, remaining),
                (0, false) => (RecordType::First, capacity),
                (_, true) => (RecordType::Last, remaining),
                (_, false) => (RecordType::Middle, capacity),
            };

            let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
            RecordHeader { record_type, ..full }.encode_into(&mut buf);
            buf.put_slice(&payload[offset..offset + len]);
            self.write_active(&buf)?;

            offset += len;
            fragments += 1;
            if matches!(record_type, RecordType::Full | RecordType::Last) {
                break;
            }
            self.rotate()?;
        }
        log::debug!("WAL record split into {} fragments", fragments);
        Ok(())
    }

    fn write_active(&mut self, data: &[u8]) -> Result<()> {
        let path = segment_path(&self.dir, self.active);
        self.store.append(&path, data)?;
        if self.sync_writes {
            self.store.sync(&path)?;
        }
        self.active_blocks += blocks_for(data.len(), self.store.block_size()) as u64;
        Ok(())
    }

    /// Start a new active segment. A no-op while the active one is empty.
    pub fn rotate(&mut self) -> Result<()> {
        if self.active_blocks == 0 {
            return Ok(());
        }
        self.active += 1;
        self.active_blocks = 0;
        log::debug!("WAL rotated to wal_{:04}", self.active);
        Ok(())
    }

    /// Replay every segment oldest to newest.
    ///
    /// Any CRC mismatch, orphaned fragment or unterminated fragment sequence
    /// is reported as corruption.
    pub fn read_records(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut pending: Option<PendingRecord> = None;
        for segment in self.segments()? {
            self.read_segment(segment, &mut pending, &mut entries)?;
        }
        if pending.is_some() {
            return Err(StrataError::Corruption(
                "WAL ends inside a fragmented record".into(),
            ));
        }
        Ok(entries)
    }

    fn read_segment(
        &self,
        segment: u32,
        pending: &mut Option<PendingRecord>,
        entries: &mut Vec<Entry>,
    ) -> Result<()> {
        let path = segment_path(&self.dir, segment);
        let block_size = self.store.block_size();
        let count = self.store.block_count(&path)?;
        let mut block = 0u64;

        while block < count {
            let first = self.read_blocks(&path, block, 1)?;
            let header = RecordHeader::decode(&first)?;

            match header.record_type {
                RecordType::Full => {
                    if pending.is_some() {
                        return Err(StrataError::Corruption(format!(
                            "FULL record inside a fragment sequence in wal_{:04}",
                            segment
                        )));
                    }
                    let len = header.record_len()?;
                    if len > (count - block) * block_size as u64 {
                        return Err(StrataError::Corruption(format!(
                            "WAL record of {} bytes runs past the end of wal_{:04}",
                            len, segment
                        )));
                    }
                    let span = blocks_for(len as usize, block_size);
                    let data = self.read_blocks(&path, block, span as u64)?;
                    entries.push(decode_record(&data)?);
                    block += span as u64;
                }
                RecordType::First | RecordType::Middle => {
                    // FIRST and MIDDLE fragments always run to the end of the segment.
                    let data = self.read_blocks(&path, block, count - block)?;
                    let chunk = &data[HEADER_SIZE..];
                    match (header.record_type, pending.as_mut()) {
                        (RecordType::First, None) => {
                            *pending = Some(PendingRecord {
                                header,
                                payload: chunk.to_vec(),
                            });
                        }
                        (RecordType::Middle, Some(open)) if open.header.continues(&header) => {
                            open.payload.extend_from_slice(chunk);
                        }
                        _ => {
                            return Err(StrataError::Corruption(format!(
                                "orphaned {:?} fragment in wal_{:04}",
                                header.record_type, segment
                            )));
                        }
                    }
                    if let Some(open) = pending.as_ref() {
                        if open.payload.len() as u64 > open.header.payload_len()? {
                            return Err(StrataError::Corruption(
                                "fragments exceed the recorded record size".into(),
                            ));
                        }
                    }
                    block = count;
                }
                RecordType::Last => {
                    let open = match pending.take() {
                        Some(open) if open.header.continues(&header) => open,
                        _ => {
                            return Err(StrataError::Corruption(format!(
                                "orphaned LAST fragment in wal_{:04}",
                                segment
                            )));
                        }
                    };
                    let remaining = header
                        .payload_len()?
                        .checked_sub(open.payload.len() as u64)
                        .filter(|rest| {
                            rest.checked_add(HEADER_SIZE as u64)
                                .map_or(false, |len| len <= (count - block) * block_size as u64)
                        })
                        .ok_or_else(|| {
                            StrataError::Corruption(format!(
                                "LAST fragment in wal_{:04} does not fit its record size",
                                segment
                            ))
                        })? as usize;
                    let span = blocks_for(HEADER_SIZE + remaining, block_size);
                    let data = self.read_blocks(&path, block, span as u64)?;
                    let mut payload = open.payload;
                    payload.extend_from_slice(&data[HEADER_SIZE..HEADER_SIZE + remaining]);
                    let entry = entry_from_payload(&open.header, &payload);
                    let rebuilt = encode_record(&entry);
                    if rebuilt.len() as u64 != header.record_len()?
                        || RecordHeader::decode(&rebuilt)?.crc != open.header.crc
                    {
                        return Err(StrataError::Corruption(
                            "reassembled WAL record failed CRC/length check".into(),
                        ));
                    }
                    entries.push(entry);
                    block += span as u64;
                }
            }
        }
        Ok(())
    }

    fn read_blocks(&self, path: &Path, start: u64, count: u64) -> Result<Vec<u8>> {
        let available = self.store.block_count(path)?;
        if start + count > available {
            return Err(StrataError::Corruption(format!(
                "WAL record of {} block(s) at block {} runs past the end of {:?}",
                count, start, path
            )));
        }
        let mut data = Vec::with_capacity(count as usize * self.store.block_size());
        for block in start..start + count {
            let bytes = self.store.read_block(path, block)?.ok_or_else(|| {
                StrataError::Corruption(format!("WAL record runs past the end of {:?}", path))
            })?;
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    /// Delete segments numbered `<= mark`, never the active one, then
    /// renumber the survivors contiguously from 1.
    ///
    /// Returns how many segments were removed.
    pub fn remove_segments_up_to(&mut self, mark: u32) -> Result<u32> {
        let mut removed = 0u32;
        for segment in self.segments()? {
            if segment <= mark && segment != self.active {
                self.store.remove_file(&segment_path(&self.dir, segment))?;
                removed += 1;
            }
        }

        let mut next = 1u32;
        for segment in self.segments()? {
            if segment != next {
                self.store.rename(
                    &segment_path(&self.dir, segment),
                    &segment_path(&self.dir, next),
                )?;
            }
            if segment == self.active {
                self.active = next;
            }
            next += 1;
        }
        if self.active > next {
            // active segment not created yet
            self.active = next;
        }
        if removed > 0 {
            log::debug!(
                "WAL truncated: {} segment(s) removed, active wal_{:04}",
                removed,
                self.active
            );
        }
        Ok(removed)
    }
}

/// Path of segment `number` inside `dir`.
pub fn segment_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("wal_{:04}.log", number))
}

fn list_segments(dir: &Path) -> Result<Vec<u32>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(number) = name
            .strip_prefix("wal_")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            segments.push(number);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block::FileBlockManager;
    use std::sync::Arc;

    fn open_wal(dir: &Path, segment_size: usize) -> WriteAheadLog {
        let store: SharedBlockStore = Arc::new(FileBlockManager::new(64));
        WriteAheadLog::open(dir, store, segment_size, false).unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let put = Entry::put(b"key".to_vec(), b"value".to_vec(), 42);
        let encoded = encode_record(&put);
        assert_eq!(encoded.len(), HEADER_SIZE + 8);
        assert_eq!(decode_record(&encoded).unwrap(), put);

        let del = Entry::delete(b"gone".to_vec(), -5);
        assert_eq!(decode_record(&encode_record(&del)).unwrap(), del);
    }

    #[test]
    fn test_record_layout_is_big_endian() {
        let entry = Entry::put(b"k".to_vec(), b"vv".to_vec(), 1);
        let encoded = encode_record(&entry);
        assert_eq!(&encoded[4..12], &1i64.to_be_bytes());
        assert_eq!(encoded[12], RecordType::Full as u8);
        assert_eq!(encoded[13], 0);
        assert_eq!(&encoded[14..22], &1u64.to_be_bytes());
        assert_eq!(&encoded[22..30], &2u64.to_be_bytes());
        assert_eq!(&encoded[30..], b"kvv");
        let crc = u32::from_be_bytes(encoded[..4].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(&encoded[4..]));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut encoded = encode_record(&Entry::put(b"a".to_vec(), b"b".to_vec(), 1));
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            decode_record(&encoded),
            Err(StrataError::Corruption(_))
        ));
    }

    #[test]
    fn test_corrupt_sizes_are_reported_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path(), 16);
        wal.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1)).unwrap();
        let path = segment_path(dir.path(), 1);
        let pristine = std::fs::read(&path).unwrap();

        // key_size + value_size overflows u64
        let mut bytes = pristine.clone();
        bytes[14..30].fill(0xFF);
        std::fs::write(&path, &bytes).unwrap();
        let err = open_wal(dir.path(), 16).read_records().unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));

        // a size far beyond what the segment holds
        let mut bytes = pristine;
        bytes[14..22].copy_from_slice(&(1u64 << 40).to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();
        let err = open_wal(dir.path(), 16).read_records().unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_corrupt_header_is_a_decode_error() {
        let mut encoded = encode_record(&Entry::put(b"k".to_vec(), b"v".to_vec(), 1));
        encoded[14..30].fill(0xFF);
        assert!(matches!(
            decode_record(&encoded),
            Err(StrataError::Corruption(_))
        ));
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path(), 16);
        wal.append(&Entry::put(b"a".to_vec(), b"1".to_vec(), 1)).unwrap();
        wal.append(&Entry::delete(b"a".to_vec(), 2)).unwrap();
        wal.append(&Entry::put(b"b".to_vec(), b"2".to_vec(), 3)).unwrap();

        let reopened = open_wal(dir.path(), 16);
        let entries = reopened.read_records().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[1].tombstone);
        assert_eq!(entries[2].value, b"2");
    }

    #[test]
    fn test_segment_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path(), 2);
        for i in 0..5u8 {
            wal.append(&Entry::put(vec![i], vec![i], i as i64)).unwrap();
        }
        // one block per record, two blocks per segment
        assert_eq!(wal.segments().unwrap(), vec![1, 2, 3]);
        assert_eq!(wal.active_segment(), 3);
        assert_eq!(wal.read_records().unwrap().len(), 5);
    }

    #[test]
    fn test_record_spanning_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path(), 4);
        let entry = Entry::put(b"wide".to_vec(), vec![9u8; 100], 7);
        wal.append(&entry).unwrap();
        wal.append(&Entry::put(b"x".to_vec(), b"y".to_vec(), 8)).unwrap();
        let entries = wal.read_records().unwrap();
        assert_eq!(entries[0], entry);
        assert_eq!(entries[1].key, b"x");
    }

    #[test]
    fn test_fragmented_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path(), 2);
        wal.append(&Entry::put(b"small".to_vec(), b"v".to_vec(), 1)).unwrap();
        // 2 blocks of 64 bytes cannot hold this record: it must be fragmented
        let big = Entry::put(b"big".to_vec(), (0..400).map(|i| i as u8).collect(), 2);
        wal.append(&big).unwrap();
        wal.append(&Entry::put(b"after".to_vec(), b"w".to_vec(), 3)).unwrap();
        assert!(wal.segments().unwrap().len() > 3);

        let entries = open_wal(dir.path(), 2).read_records().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], big);
        assert_eq!(entries[2].key, b"after");
    }

    #[test]
    fn test_orphaned_fragment_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path(), 2);
        let big = Entry::put(b"big".to_vec(), vec![1u8; 300], 2);
        wal.append(&big).unwrap();
        // dropping the segment holding FIRST orphans the rest of the sequence
        std::fs::remove_file(segment_path(dir.path(), 1)).unwrap();
        let err = open_wal(dir.path(), 2).read_records().unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn test_remove_segments_renumbers() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path(), 1);
        for i in 0..4u8 {
            wal.append(&Entry::put(vec![i], vec![i], i as i64)).unwrap();
        }
        // segments 1..=4, every record in its own segment
        assert_eq!(wal.active_segment(), 4);

        let removed = wal.remove_segments_up_to(2).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(wal.segments().unwrap(), vec![1, 2]);
        assert_eq!(wal.active_segment(), 2);
        let keys: Vec<Vec<u8>> = wal.read_records().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![vec![2u8], vec![3u8]]);

        // the active segment survives even when the mark covers it
        wal.remove_segments_up_to(10).unwrap();
        assert_eq!(wal.segments().unwrap(), vec![1]);
        assert_eq!(wal.active_segment(), 1);
        assert_eq!(wal.read_records().unwrap().len(), 1);
    }
}
