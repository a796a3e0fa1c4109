//! Component-operation log.
//!
//! Every committed mutation appends one record describing the logical
//! operation, so the embedding storage can replay or audit index changes.
//!
//! # Record framing
//!
//! ```text
//! +----------+----------------------------------------+
//! | 0-3      | payload length (4 bytes BE)            |
//! | 4-7      | CRC32 of the payload (4 bytes BE)      |
//! | 8-N      | payload                                |
//! +----------+----------------------------------------+
//! ```
//!
//! # Payload format
//!
//! ```text
//! [record type u8][index_id u32][serializer_id u8]
//! [enc flag u8, if 1: u16 len + name bytes]
//! [key flag u8, if 1: u16 len + key bytes]
//! [rid 10 bytes]
//! ```
//!
//! A missing key marks a null-key operation.

use crate::error::{Result, TreeError};
use crate::types::{Rid, RID_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const TYPE_PUT: u8 = 0x01;
const TYPE_REMOVE_ENTRY: u8 = 0x02;

/// Fields shared by both record types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBody {
    /// Index the operation belongs to
    pub index_id: u32,
    /// Serializer that produced the key bytes
    pub serializer_id: u8,
    /// Encryption provider name, when keys are encrypted
    pub encryption_name: Option<String>,
    /// Stored key field; `None` for the null key
    pub key_bytes: Option<Vec<u8>>,
    /// The rid the operation applied to
    pub rid: Rid,
}

/// One logical index mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentRecord {
    /// A rid was added under a key
    Put(RecordBody),
    /// A rid was removed from under a key
    RemoveEntry(RecordBody),
}

impl ComponentRecord {
    fn body(&self) -> &RecordBody {
        match self {
            ComponentRecord::Put(body) | ComponentRecord::RemoveEntry(body) => body,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            ComponentRecord::Put(_) => TYPE_PUT,
            ComponentRecord::RemoveEntry(_) => TYPE_REMOVE_ENTRY,
        }
    }

    /// Encode the record payload (without framing)
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        let mut buf = Vec::with_capacity(32);
        buf.push(self.type_byte());
        buf.extend_from_slice(&body.index_id.to_be_bytes());
        buf.push(body.serializer_id);

        match &body.encryption_name {
            None => buf.push(0),
            Some(name) => {
                buf.push(1);
                buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
        }

        match &body.key_bytes {
            None => buf.push(0),
            Some(key) => {
                buf.push(1);
                buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
                buf.extend_from_slice(key);
            }
        }

        let mut rid_raw = [0u8; RID_SIZE];
        body.rid.write(&mut rid_raw, 0);
        buf.extend_from_slice(&rid_raw);
        buf
    }

    /// Decode a record payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let err = || TreeError::invalid_file("truncated component record");
        if payload.len() < 7 {
            return Err(err());
        }

        let record_type = payload[0];
        let index_id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let serializer_id = payload[5];
        let mut off = 6;

        let encryption_name = if payload[off] == 1 {
            off += 1;
            if off + 2 > payload.len() {
                return Err(err());
            }
            let len = u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
            off += 2;
            if off + len > payload.len() {
                return Err(err());
            }
            let name = String::from_utf8(payload[off..off + len].to_vec())
                .map_err(|_| TreeError::invalid_file("encryption name is not UTF-8"))?;
            off += len;
            Some(name)
        } else {
            off += 1;
            None
        };

        if off >= payload.len() {
            return Err(err());
        }
        let key_bytes = if payload[off] == 1 {
            off += 1;
            if off + 2 > payload.len() {
                return Err(err());
            }
            let len = u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
            off += 2;
            if off + len > payload.len() {
                return Err(err());
            }
            let key = payload[off..off + len].to_vec();
            off += len;
            Some(key)
        } else {
            off += 1;
            None
        };

        if off + RID_SIZE > payload.len() {
            return Err(err());
        }
        let rid = Rid::read(payload, off);

        let body = RecordBody {
            index_id,
            serializer_id,
            encryption_name,
            key_bytes,
            rid,
        };
        match record_type {
            TYPE_PUT => Ok(ComponentRecord::Put(body)),
            TYPE_REMOVE_ENTRY => Ok(ComponentRecord::RemoveEntry(body)),
            other => Err(TreeError::invalid_file(format!(
                "unknown component record type 0x{other:02x}"
            ))),
        }
    }
}

/// Appends framed component records to the log file
pub struct WalWriter {
    file: Mutex<File>,
    sync_on_append: bool,
}

impl WalWriter {
    /// Open (or create) the log at `path`. With `sync_on_append` the log
    /// reaches stable storage on every commit; without it the write is
    /// left to the OS, which is the faster default.
    pub fn open(path: &Path, sync_on_append: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            sync_on_append,
        })
    }

    /// Append records, syncing when configured to
    pub fn append(&self, records: &[ComponentRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        for record in records {
            let payload = record.encode();
            file.write_all(&(payload.len() as u32).to_be_bytes())?;
            file.write_all(&crc32fast::hash(&payload).to_be_bytes())?;
            file.write_all(&payload)?;
        }
        if self.sync_on_append {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Force the log to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

/// Read every record of a log file, verifying the frame checksums
pub fn read_log(path: impl Into<PathBuf>) -> Result<Vec<ComponentRecord>> {
    let mut bytes = Vec::new();
    File::open(path.into())?.read_to_end(&mut bytes)?;

    let mut records = Vec::new();
    let mut off = 0usize;
    while off < bytes.len() {
        if off + 8 > bytes.len() {
            return Err(TreeError::invalid_file("truncated log frame header"));
        }
        let len = u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
            as usize;
        let crc = u32::from_be_bytes([
            bytes[off + 4],
            bytes[off + 5],
            bytes[off + 6],
            bytes[off + 7],
        ]);
        off += 8;
        if off + len > bytes.len() {
            return Err(TreeError::invalid_file("truncated log frame payload"));
        }
        let payload = &bytes[off..off + len];
        if crc32fast::hash(payload) != crc {
            return Err(TreeError::invalid_file("log frame checksum mismatch"));
        }
        records.push(ComponentRecord::decode(payload)?);
        off += len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_put() -> ComponentRecord {
        ComponentRecord::Put(RecordBody {
            index_id: 12,
            serializer_id: 1,
            encryption_name: None,
            key_bytes: Some(vec![1, 2, 3]),
            rid: Rid::new(1, 100),
        })
    }

    #[test]
    fn test_record_roundtrip() {
        let records = [
            sample_put(),
            ComponentRecord::RemoveEntry(RecordBody {
                index_id: 12,
                serializer_id: 1,
                encryption_name: Some("test-xor".into()),
                key_bytes: None,
                rid: Rid::new(-1, -9),
            }),
        ];
        for record in records {
            let payload = record.encode();
            assert_eq!(ComponentRecord::decode(&payload).unwrap(), record);
        }
    }

    #[test]
    fn test_writer_and_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.wal");

        let writer = WalWriter::open(&path, true).unwrap();
        writer.append(&[sample_put()]).unwrap();
        writer.append(&[sample_put(), sample_put()]).unwrap();

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], sample_put());
    }

    #[test]
    fn test_corrupt_frame_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.wal");

        let writer = WalWriter::open(&path, true).unwrap();
        writer.append(&[sample_put()]).unwrap();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(read_log(&path).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ComponentRecord::decode(&[]).is_err());
        assert!(ComponentRecord::decode(&[0x09, 0, 0, 0, 0, 1, 0]).is_err());
    }
}
