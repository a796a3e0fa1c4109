//! One-value facade.
//!
//! Presents the multi-value tree as a unique index: at most one rid per
//! key. Uniqueness is enforced on the write path, so reads can trust the
//! single-rid contract.

use crate::error::{Result, TreeError};
use crate::keys::CompositeKey;
use crate::tree::MultiValueTree;
use crate::types::Rid;

/// Unique-key view over a [`MultiValueTree`]
pub struct UniqueIndex {
    tree: MultiValueTree,
}

impl UniqueIndex {
    /// Wrap a tree. The tree is expected to be used exclusively through
    /// this facade from now on.
    pub fn new(tree: MultiValueTree) -> Self {
        Self { tree }
    }

    /// The underlying tree
    pub fn tree(&self) -> &MultiValueTree {
        &self.tree
    }

    /// Associate a key with a rid.
    ///
    /// Re-putting the same `(key, rid)` pair is a no-op; a different rid
    /// under an existing key is rejected.
    pub fn put(&self, key: Option<&CompositeKey>, rid: Rid) -> Result<()> {
        let existing = self.tree.get(key)?;
        match existing.first() {
            None => self.tree.put(key, rid),
            Some(&present) if present == rid => Ok(()),
            Some(&present) => Err(TreeError::invalid_operation(format!(
                "duplicate key in unique index '{}': already maps to {present}",
                self.tree.name()
            ))),
        }
    }

    /// The rid stored under a key, if any
    pub fn get(&self, key: Option<&CompositeKey>) -> Result<Option<Rid>> {
        Ok(self.tree.get(key)?.into_iter().next())
    }

    /// Whether a key is present
    pub fn contains(&self, key: Option<&CompositeKey>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove a key; false when it was absent
    pub fn remove(&self, key: Option<&CompositeKey>) -> Result<bool> {
        match self.get(key)? {
            None => Ok(false),
            Some(rid) => self.tree.remove(key, rid),
        }
    }

    /// Number of keys in the index
    pub fn size(&self) -> Result<i64> {
        self.tree.size()
    }

    /// Flush the underlying tree
    pub fn close(&self) -> Result<()> {
        self.tree.close()
    }

    /// Delete the underlying tree (refuses when non-empty)
    pub fn delete(&self) -> Result<()> {
        self.tree.delete()
    }
}
