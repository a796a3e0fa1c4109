//! Composite keys and their total order.
//!
//! A key is a short vector of typed items. Each position of a tree's key
//! has one declared [`KeyType`]; the two sentinel items sort below and
//! above every real item and exist only to complete partial query keys at
//! range boundaries. Sentinels are never stored.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of one key position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    /// 64-bit signed integer
    Int,
    /// UTF-8 string
    Str,
    /// Raw byte string
    Bytes,
}

/// One item of a composite key.
///
/// The derived ordering compares the variant rank first, which places
/// `AlwaysLess` below and `AlwaysGreater` above every real item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyItem {
    /// Sorts below everything; used to complete a lowest-boundary key
    AlwaysLess,
    /// Integer item
    Int(i64),
    /// String item
    Str(String),
    /// Byte-string item
    Bytes(Vec<u8>),
    /// Sorts above everything; used to complete a highest-boundary key
    AlwaysGreater,
}

impl KeyItem {
    /// Whether this item is one of the two boundary sentinels
    pub fn is_sentinel(&self) -> bool {
        matches!(self, KeyItem::AlwaysLess | KeyItem::AlwaysGreater)
    }

    /// Whether this item conforms to the declared type of its position
    pub fn matches(&self, key_type: KeyType) -> bool {
        match (self, key_type) {
            (KeyItem::Int(_), KeyType::Int) => true,
            (KeyItem::Str(_), KeyType::Str) => true,
            (KeyItem::Bytes(_), KeyType::Bytes) => true,
            _ => self.is_sentinel(),
        }
    }
}

impl fmt::Display for KeyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyItem::AlwaysLess => write!(f, "<min>"),
            KeyItem::Int(v) => write!(f, "{v}"),
            KeyItem::Str(s) => write!(f, "{s:?}"),
            KeyItem::Bytes(b) => write!(f, "0x{}", hex(b)),
            KeyItem::AlwaysGreater => write!(f, "<max>"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Which end of a scan a partial key is completed toward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Pad with [`KeyItem::AlwaysLess`]
    Lowest,
    /// Pad with [`KeyItem::AlwaysGreater`]
    Highest,
}

/// A composite key: an ordered vector of items.
///
/// Keys compare lexicographically item by item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompositeKey {
    items: Vec<KeyItem>,
}

impl CompositeKey {
    /// Create a key from items
    pub fn new(items: Vec<KeyItem>) -> Self {
        Self { items }
    }

    /// Single-item integer key
    pub fn int(value: i64) -> Self {
        Self::new(vec![KeyItem::Int(value)])
    }

    /// Single-item string key
    pub fn str(value: impl Into<String>) -> Self {
        Self::new(vec![KeyItem::Str(value.into())])
    }

    /// The key's items
    pub fn items(&self) -> &[KeyItem] {
        &self.items
    }

    /// Number of items in the key
    pub fn arity(&self) -> usize {
        self.items.len()
    }

    /// Whether any item is a boundary sentinel
    pub fn has_sentinels(&self) -> bool {
        self.items.iter().any(KeyItem::is_sentinel)
    }

    /// Complete a partial key to `key_size` items by appending the sentinel
    /// for the given boundary. A full-arity key is returned unchanged.
    pub fn completed(&self, key_size: usize, boundary: Boundary) -> CompositeKey {
        if self.items.len() >= key_size {
            return self.clone();
        }
        let pad = match boundary {
            Boundary::Lowest => KeyItem::AlwaysLess,
            Boundary::Highest => KeyItem::AlwaysGreater,
        };
        let mut items = self.items.clone();
        items.resize(key_size, pad);
        CompositeKey::new(items)
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{item}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<KeyItem>> for CompositeKey {
    fn from(items: Vec<KeyItem>) -> Self {
        Self::new(items)
    }
}
