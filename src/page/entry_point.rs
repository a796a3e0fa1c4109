//! Entry-point page.
//!
//! Page 0 of the main index file holds the tree-wide counters:
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic string "MVTreeStorageV1\0"
//! 16      8     Total rid count (tree size)
//! 24      4     Highest page index in use
//! 28      8     Persisted m-id high-water mark
//! 36      4     CRC32 of bytes 0..36
//! ```
//!
//! `pages_size` tracks allocation independently of the file length because
//! a split may claim two pages before the file grows to cover them.

use crate::error::{Result, TreeError};

/// Magic bytes identifying a valid main index file
pub const MAGIC: &[u8; 16] = b"MVTreeStorageV1\0";

const CHECKSUM_OFFSET: usize = 36;

/// Decoded entry-point page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointPage {
    /// Total number of rids in the tree, null bucket included
    pub tree_size: i64,
    /// Highest page index currently used in the main file
    pub pages_size: u32,
    /// Persisted upper bound of every m-id handed out so far
    pub entry_id: i64,
}

impl EntryPointPage {
    /// Entry point of a freshly created tree: the root bucket at page 1 is
    /// the only allocated bucket
    pub fn new() -> Self {
        Self {
            tree_size: 0,
            pages_size: 1,
            entry_id: 0,
        }
    }

    /// Parse and validate an entry-point page
    pub fn read(tree_name: &str, bytes: &[u8]) -> Result<Self> {
        if &bytes[0..16] != MAGIC {
            return Err(TreeError::invalid_file(format!(
                "'{tree_name}': bad entry-point magic"
            )));
        }

        let stored = u32::from_be_bytes([
            bytes[CHECKSUM_OFFSET],
            bytes[CHECKSUM_OFFSET + 1],
            bytes[CHECKSUM_OFFSET + 2],
            bytes[CHECKSUM_OFFSET + 3],
        ]);
        let computed = crc32fast::hash(&bytes[0..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(TreeError::corruption(
                tree_name,
                "entry-point checksum mismatch",
            ));
        }

        let mut raw8 = [0u8; 8];
        raw8.copy_from_slice(&bytes[16..24]);
        let tree_size = i64::from_be_bytes(raw8);
        let pages_size = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        raw8.copy_from_slice(&bytes[28..36]);
        let entry_id = i64::from_be_bytes(raw8);

        if tree_size < 0 || pages_size == 0 || entry_id < 0 {
            return Err(TreeError::corruption(
                tree_name,
                format!(
                    "entry-point counters out of range: size={tree_size} pages={pages_size} entryId={entry_id}"
                ),
            ));
        }

        Ok(Self {
            tree_size,
            pages_size,
            entry_id,
        })
    }

    /// Serialize onto a page, refreshing the checksum
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..16].copy_from_slice(MAGIC);
        bytes[16..24].copy_from_slice(&self.tree_size.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.pages_size.to_be_bytes());
        bytes[28..36].copy_from_slice(&self.entry_id.to_be_bytes());

        let checksum = crc32fast::hash(&bytes[0..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());
    }
}

impl Default for EntryPointPage {
    fn default() -> Self {
        Self::new()
    }
}
