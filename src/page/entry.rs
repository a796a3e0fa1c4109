//! Record encodings for bucket entries.
//!
//! Leaf record:
//!
//! ```text
//! [key_len u16][key bytes][m_id u64][entries_count u32]
//! [inline_count u8][rid x inline_count]
//! ```
//!
//! Internal record:
//!
//! ```text
//! [left_child u32][right_child u32][key_len u16][key bytes]
//! ```
//!
//! `entries_count`, `inline_count` and the rid list sit at fixed offsets
//! past the key, so duplicate-count updates and inline removals happen in
//! place without moving the record.

use crate::error::{Result, TreeError};
use crate::keys::{CompositeKey, KeyCodec};
use crate::types::{PageId, Rid, RID_SIZE};

/// Decoded view of one leaf entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// The entry's key
    pub key: CompositeKey,
    /// Identifier joining the entry to its overflow rows
    pub m_id: u64,
    /// Rids stored inline on the page
    pub inline: Vec<Rid>,
    /// Total rid count, inline plus overflow
    pub entries_count: u32,
}

impl LeafEntry {
    /// Whether some of the entry's rids live in the overflow container
    pub fn has_overflow(&self) -> bool {
        self.entries_count as usize > self.inline.len()
    }
}

/// Zero-copy accessor over an encoded leaf record
pub struct LeafRecord<'a> {
    bytes: &'a [u8],
}

impl<'a> LeafRecord<'a> {
    /// Wrap record bytes starting at the record's first byte
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn key_len(&self) -> usize {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]]) as usize
    }

    /// The stored key field
    pub fn key_bytes(&self) -> &'a [u8] {
        &self.bytes[2..2 + self.key_len()]
    }

    /// The entry's m-id
    pub fn m_id(&self) -> u64 {
        let off = 2 + self.key_len();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[off..off + 8]);
        u64::from_be_bytes(raw)
    }

    /// Total rid count (inline + overflow)
    pub fn entries_count(&self) -> u32 {
        let off = self.entries_count_offset();
        u32::from_be_bytes([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
        ])
    }

    /// Number of rids stored inline
    pub fn inline_count(&self) -> usize {
        self.bytes[self.inline_count_offset()] as usize
    }

    /// Read the `j`-th inline rid
    pub fn rid(&self, j: usize) -> Rid {
        Rid::read(self.bytes, self.rids_offset() + j * RID_SIZE)
    }

    /// All inline rids
    pub fn inline_rids(&self) -> Vec<Rid> {
        (0..self.inline_count()).map(|j| self.rid(j)).collect()
    }

    /// Encoded size of this record
    pub fn size(&self) -> usize {
        leaf_record_size(self.key_len(), self.inline_count())
    }

    /// Offset of the `entries_count` field relative to the record start
    pub fn entries_count_offset(&self) -> usize {
        2 + self.key_len() + 8
    }

    /// Offset of the `inline_count` byte relative to the record start
    pub fn inline_count_offset(&self) -> usize {
        self.entries_count_offset() + 4
    }

    /// Offset of the inline rid list relative to the record start
    pub fn rids_offset(&self) -> usize {
        self.inline_count_offset() + 1
    }

    /// Decode the full entry through the key codec
    pub fn decode(&self, codec: &KeyCodec) -> Result<LeafEntry> {
        Ok(LeafEntry {
            key: codec.decode(self.key_bytes())?,
            m_id: self.m_id(),
            inline: self.inline_rids(),
            entries_count: self.entries_count(),
        })
    }
}

/// Size of a leaf record with the given key length and inline rid count
pub fn leaf_record_size(key_len: usize, inline_count: usize) -> usize {
    2 + key_len + 8 + 4 + 1 + inline_count * RID_SIZE
}

/// Encode a leaf record
pub fn encode_leaf_record(
    key_bytes: &[u8],
    m_id: u64,
    entries_count: u32,
    inline: &[Rid],
) -> Result<Vec<u8>> {
    if key_bytes.len() > u16::MAX as usize {
        return Err(TreeError::invalid_key("key field longer than a page slot"));
    }
    let mut buf = vec![0u8; leaf_record_size(key_bytes.len(), inline.len())];
    buf[0..2].copy_from_slice(&(key_bytes.len() as u16).to_be_bytes());
    buf[2..2 + key_bytes.len()].copy_from_slice(key_bytes);
    let mut off = 2 + key_bytes.len();
    buf[off..off + 8].copy_from_slice(&m_id.to_be_bytes());
    off += 8;
    buf[off..off + 4].copy_from_slice(&entries_count.to_be_bytes());
    off += 4;
    buf[off] = inline.len() as u8;
    off += 1;
    for rid in inline {
        rid.write(&mut buf, off);
        off += RID_SIZE;
    }
    Ok(buf)
}

/// Zero-copy accessor over an encoded internal record
pub struct InternalRecord<'a> {
    bytes: &'a [u8],
}

impl<'a> InternalRecord<'a> {
    /// Wrap record bytes starting at the record's first byte
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Child holding keys below the separator
    pub fn left(&self) -> PageId {
        PageId::new(u32::from_be_bytes([
            self.bytes[0],
            self.bytes[1],
            self.bytes[2],
            self.bytes[3],
        ]))
    }

    /// Child holding keys at or above the separator
    pub fn right(&self) -> PageId {
        PageId::new(u32::from_be_bytes([
            self.bytes[4],
            self.bytes[5],
            self.bytes[6],
            self.bytes[7],
        ]))
    }

    fn key_len(&self) -> usize {
        u16::from_be_bytes([self.bytes[8], self.bytes[9]]) as usize
    }

    /// The separator key field
    pub fn key_bytes(&self) -> &'a [u8] {
        &self.bytes[10..10 + self.key_len()]
    }

    /// Encoded size of this record
    pub fn size(&self) -> usize {
        10 + self.key_len()
    }
}

/// Encode an internal record
pub fn encode_internal_record(key_bytes: &[u8], left: PageId, right: PageId) -> Result<Vec<u8>> {
    if key_bytes.len() > u16::MAX as usize {
        return Err(TreeError::invalid_key("key field longer than a page slot"));
    }
    let mut buf = vec![0u8; 10 + key_bytes.len()];
    buf[0..4].copy_from_slice(&left.index().to_be_bytes());
    buf[4..8].copy_from_slice(&right.index().to_be_bytes());
    buf[8..10].copy_from_slice(&(key_bytes.len() as u16).to_be_bytes());
    buf[10..].copy_from_slice(key_bytes);
    Ok(buf)
}
