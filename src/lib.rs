//! # Multi-value B+-tree index engine
//!
//! A paged, durable B+-tree index that maps composite keys to bags of
//! record identifiers (rids). Multiple rids share one key; lookups, range
//! scans in both directions, and removals all account for equal keys
//! spanning several leaves.
//!
//! ## Architecture
//!
//! The engine is composed of layered, swappable components:
//!
//! - **Page layer** (`page`): slotted bucket format, entry-point page,
//!   null bucket
//! - **Storage layer** (`storage`): page-granular file I/O behind a trait
//! - **Page cache** (`buffer`): pinned frames with write-back eviction,
//!   aware of atomic operations
//! - **Atomic operations** (`atomic`): before-image rollback and the
//!   component-operation log
//! - **Key layer** (`keys`): composite keys, serializer trait, optional
//!   encryption
//! - **Tree layer** (`tree`): the multi-value engine, its overflow
//!   container, cursors and the one-value facade
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mvtree_storage::{IndexStorage, StorageConfig, TreeConfig};
//! use mvtree_storage::keys::{CompositeKey, KeyType};
//! use mvtree_storage::types::Rid;
//!
//! let storage = IndexStorage::open(StorageConfig::new("/data/indexes"))?;
//! let tree = storage.create_index("users.name", TreeConfig::new(1, vec![KeyType::Str]))?;
//!
//! tree.put(Some(&CompositeKey::str("ada")), Rid::new(1, 100))?;
//! tree.put(Some(&CompositeKey::str("ada")), Rid::new(1, 101))?;
//! assert_eq!(tree.get(Some(&CompositeKey::str("ada")))?.len(), 2);
//! ```

pub mod atomic;
pub mod buffer;
pub mod error;
pub mod keys;
pub mod page;
pub mod storage;
pub mod tree;
pub mod types;

pub use error::{Result, TreeError};
pub use tree::{MultiValueTree, TreeCursor, TreeNode, UniqueIndex};
pub use types::{Rid, TreeConfig, PAGE_SIZE};

use crate::atomic::AtomicOperationManager;
use crate::buffer::PageCache;
use crate::keys::{CompositeKeySerializer, Encryption, KeySerializer};
use crate::storage::FileDiskManager;
use std::path::PathBuf;
use std::sync::Arc;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding every index file
    pub dir: PathBuf,
    /// Page cache capacity in frames (default: 1024)
    pub cache_size: usize,
    /// Component-operation log file name (default: "component.wal")
    pub log_name: String,
    /// Whether every commit forces the log to stable storage
    /// (default: false for performance)
    pub sync_on_commit: bool,
}

impl StorageConfig {
    /// Create a configuration with default settings
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            cache_size: 1024,
            log_name: "component.wal".to_string(),
            sync_on_commit: false,
        }
    }

    /// Set the page cache capacity
    pub fn cache_size(mut self, frames: usize) -> Self {
        self.cache_size = frames;
        self
    }

    /// Force the log to stable storage on every commit
    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }
}

/// Handle over one storage directory: the shared cache, the atomic
/// operation manager and the trees living in it.
pub struct IndexStorage {
    cache: Arc<PageCache>,
    atomic: Arc<AtomicOperationManager>,
    config: StorageConfig,
}

impl IndexStorage {
    /// Open a storage directory (created if missing)
    pub fn open(config: StorageConfig) -> Result<Self> {
        let disk = Arc::new(FileDiskManager::new(&config.dir)?);
        let cache = Arc::new(PageCache::new(disk, config.cache_size));
        let atomic = Arc::new(AtomicOperationManager::new(
            cache.clone(),
            &config.dir.join(&config.log_name),
            config.sync_on_commit,
        )?);
        Ok(Self {
            cache,
            atomic,
            config,
        })
    }

    /// The storage configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create a multi-value index with the stock key serializer
    pub fn create_index(&self, name: &str, config: TreeConfig) -> Result<MultiValueTree> {
        self.create_index_with(name, config, Arc::new(CompositeKeySerializer), None)
    }

    /// Create a multi-value index with an explicit serializer and optional
    /// encryption
    pub fn create_index_with(
        &self,
        name: &str,
        config: TreeConfig,
        serializer: Arc<dyn KeySerializer>,
        encryption: Option<Arc<dyn Encryption>>,
    ) -> Result<MultiValueTree> {
        MultiValueTree::create(
            self.cache.clone(),
            self.atomic.clone(),
            name,
            config,
            serializer,
            encryption,
        )
    }

    /// Load an existing multi-value index with the stock key serializer
    pub fn open_index(&self, name: &str, config: TreeConfig) -> Result<MultiValueTree> {
        self.open_index_with(name, config, Arc::new(CompositeKeySerializer), None)
    }

    /// Load an existing multi-value index with an explicit serializer and
    /// optional encryption
    pub fn open_index_with(
        &self,
        name: &str,
        config: TreeConfig,
        serializer: Arc<dyn KeySerializer>,
        encryption: Option<Arc<dyn Encryption>>,
    ) -> Result<MultiValueTree> {
        MultiValueTree::load(
            self.cache.clone(),
            self.atomic.clone(),
            name,
            config,
            serializer,
            encryption,
        )
    }

    /// Create a unique (one-value) index over a fresh tree
    pub fn create_unique_index(&self, name: &str, config: TreeConfig) -> Result<UniqueIndex> {
        Ok(UniqueIndex::new(self.create_index(name, config)?))
    }

    /// Load an existing tree as a unique (one-value) index
    pub fn open_unique_index(&self, name: &str, config: TreeConfig) -> Result<UniqueIndex> {
        Ok(UniqueIndex::new(self.open_index(name, config)?))
    }

    /// Storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            cache_capacity: self.cache.capacity(),
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Page cache capacity in frames
    pub cache_capacity: usize,
}
