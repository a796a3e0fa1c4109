//! Common types and tuning constants used throughout the index engine.

mod page_id;
mod rid;

pub use page_id::{FileId, PageId};
pub use rid::{Rid, RID_SIZE};

use crate::keys::KeyType;
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Default maximum serialized key size (to ensure several entries fit per page)
pub const DEFAULT_MAX_KEY_SIZE: usize = PAGE_SIZE / 4;

/// Maximum number of rids kept inline in a leaf entry before spilling to the
/// overflow container
pub const MAX_INLINE_RIDS: usize = 4;

/// Maximum number of rids one leaf entry owns (inline plus overflow).
/// Further rids for the same key go into fresh same-key entries, which is
/// how equal keys come to span several leaves.
pub const MAX_ENTRY_RIDS: u32 = 16;

/// m-id high-water mark is persisted in batches of this size to limit
/// entry-point writes
pub const M_ID_BATCH_SIZE: i64 = 131_072;

/// A descent deeper than this declares the tree corrupt
pub const MAX_PATH_LENGTH: usize = 64;

/// Upper clamp for a cursor's prefetch size
pub const MAX_CURSOR_PREFETCH: usize = 16_384;

/// Configuration of one multi-value tree.
///
/// Captured at `create` time and required again (identical) at `load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeConfig {
    /// Identifier of the index within the embedding storage; stamped into
    /// every component-operation record
    pub index_id: u32,
    /// Number of sub-items in a full key
    pub key_size: usize,
    /// Declared item type for each key position
    pub key_types: Vec<KeyType>,
    /// Maximum serialized key size in bytes
    pub max_key_size: usize,
}

impl TreeConfig {
    /// Create a configuration for a tree with the given key arity and types
    pub fn new(index_id: u32, key_types: Vec<KeyType>) -> Self {
        Self {
            index_id,
            key_size: key_types.len(),
            key_types,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
        }
    }

    /// Override the maximum serialized key size
    pub fn max_key_size(mut self, max: usize) -> Self {
        self.max_key_size = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TreeConfig::new(7, vec![KeyType::Str, KeyType::Int]);
        assert_eq!(config.index_id, 7);
        assert_eq!(config.key_size, 2);
        assert_eq!(config.max_key_size, DEFAULT_MAX_KEY_SIZE);

        let config = config.max_key_size(512);
        assert_eq!(config.max_key_size, 512);
    }

    #[test]
    fn test_config_serde() {
        let config = TreeConfig::new(1, vec![KeyType::Int]);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"indexId\":1"));
        assert!(json.contains("\"keySize\":1"));

        let back: TreeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key_size, 1);
        assert_eq!(back.key_types, vec![KeyType::Int]);
    }
}
