//! Fixed-width index records (§6): `id:u64 LE, offset:u64 LE, length:u32 LE`.
//!
//! Grounded on the teacher's `segment.rs` load/store pair, generalized from a
//! single two-field index record to the three-field record the wire format
//! needs for binary search by id.

use std::io::{Read, Write};

pub const RECORD_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub id: u64,
    pub offset: u64,
    pub length: u32,
}

impl IndexRecord {
    pub fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        IndexRecord {
            id: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            length: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }
}

/// Appends one index record to an already-open writable file.
pub fn append_record(file: &mut std::fs::File, record: IndexRecord) -> std::io::Result<()> {
    file.write_all(&record.to_bytes())
}

/// Reads every record from an index file, in on-disk (append) order.
pub fn read_all(path: &std::path::Path) -> std::io::Result<Vec<IndexRecord>> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(parse_records(&buf))
}

fn parse_records(buf: &[u8]) -> Vec<IndexRecord> {
    buf.chunks_exact(RECORD_SIZE)
        .map(|chunk| IndexRecord::from_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Reads the last record of an index file, if any.
pub fn read_last(path: &std::path::Path) -> std::io::Result<Option<IndexRecord>> {
    Ok(read_all(path)?.pop())
}

/// Binary-searches `records` for the first record whose id is `>= start_id`.
pub fn seek(records: &[IndexRecord], start_id: u64) -> Option<usize> {
    match records.binary_search_by_key(&start_id, |record| record.id) {
        Ok(index) => Some(index),
        Err(index) if index < records.len() => Some(index),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let record = IndexRecord {
            id: 7,
            offset: 128,
            length: 42,
        };
        assert_eq!(IndexRecord::from_bytes(&record.to_bytes()), record);
    }

    #[test]
    fn seek_finds_first_ge() {
        let records = vec![
            IndexRecord { id: 1, offset: 0, length: 10 },
            IndexRecord { id: 3, offset: 10, length: 10 },
            IndexRecord { id: 5, offset: 20, length: 10 },
        ];
        assert_eq!(seek(&records, 3), Some(1));
        assert_eq!(seek(&records, 4), Some(2));
        assert_eq!(seek(&records, 6), None);
        assert_eq!(seek(&records, 0), Some(0));
    }
}
