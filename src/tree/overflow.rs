//! Overflow container.
//!
//! An independent ordered map in its own file, used as a set: presence of
//! `(m_id, cluster_id, cluster_pos)` means the rid belongs to the bag with
//! that m-id. Rids that no longer fit inline in a leaf entry (or in the
//! null bucket) spill here; a range scan over one m-id enumerates them.
//!
//! The container is a small B+-tree over fixed 18-byte keys. Page 0 of the
//! file is a checksummed header, the root is pinned at page 1, leaves are
//! sorted key arrays linked into a sibling chain. Pages are never freed;
//! emptied leaves stay in the chain and are refilled by later splits.

use crate::atomic::AtomicOperation;
use crate::buffer::PageCache;
use crate::error::{Result, TreeError};
use crate::page::{PageBuf, PageKind};
use crate::types::{FileId, PageId, Rid, PAGE_SIZE, RID_SIZE};

/// Encoded key size: m-id (8) + rid (10)
const KEY_SIZE: usize = 8 + RID_SIZE;

/// Leaf layout: kind (1) + count (2) + left (4) + right (4) + pad (1)
const LEAF_KEYS_OFFSET: usize = 12;

/// Keys per leaf
const LEAF_CAPACITY: usize = (PAGE_SIZE - LEAF_KEYS_OFFSET) / KEY_SIZE;

/// Internal layout: kind (1) + count (2) + pad (1), then the child array,
/// then the separator array at a fixed offset
const CHILDREN_OFFSET: usize = 4;

/// Separators per internal node
const INTERNAL_CAPACITY: usize = 185;

const SEPS_OFFSET: usize = CHILDREN_OFFSET + 4 * (INTERNAL_CAPACITY + 1);

/// Magic bytes identifying a container file
pub const CONTAINER_MAGIC: &[u8; 16] = b"MVTreeOverflowV1";

/// Key of one overflow row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OverflowKey {
    /// Owning bag
    pub m_id: u64,
    /// Member rid
    pub rid: Rid,
}

impl OverflowKey {
    /// Smallest key of a bag
    pub fn lowest(m_id: u64) -> Self {
        Self {
            m_id,
            rid: Rid::new(i16::MIN, i64::MIN),
        }
    }

    fn write(&self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 8].copy_from_slice(&self.m_id.to_be_bytes());
        self.rid.write(buf, offset + 8);
    }

    fn read(buf: &[u8], offset: usize) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[offset..offset + 8]);
        Self {
            m_id: u64::from_be_bytes(raw),
            rid: Rid::read(buf, offset + 8),
        }
    }
}

/// In-memory copy of one container node
struct Node {
    data: PageBuf,
}

impl Node {
    fn new_leaf() -> Self {
        let mut data = PageBuf::zeroed();
        data[0] = PageKind::Leaf as u8;
        Self { data }
    }

    fn new_internal() -> Self {
        let mut data = PageBuf::zeroed();
        data[0] = PageKind::Internal as u8;
        Self { data }
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if PageKind::from_byte(bytes[0]).is_none() {
            return Err(TreeError::invalid_page("unrecognized container node kind"));
        }
        Ok(Self {
            data: PageBuf::copy_from(bytes),
        })
    }

    fn is_leaf(&self) -> bool {
        self.data[0] == PageKind::Leaf as u8
    }

    fn count(&self) -> usize {
        u16::from_be_bytes([self.data[1], self.data[2]]) as usize
    }

    fn set_count(&mut self, count: usize) {
        self.data[1..3].copy_from_slice(&(count as u16).to_be_bytes());
    }

    // ---- leaf accessors ----

    fn left_sibling(&self) -> PageId {
        PageId::new(u32::from_be_bytes([
            self.data[3],
            self.data[4],
            self.data[5],
            self.data[6],
        ]))
    }

    fn set_left_sibling(&mut self, page: PageId) {
        self.data[3..7].copy_from_slice(&page.index().to_be_bytes());
    }

    fn right_sibling(&self) -> PageId {
        PageId::new(u32::from_be_bytes([
            self.data[7],
            self.data[8],
            self.data[9],
            self.data[10],
        ]))
    }

    fn set_right_sibling(&mut self, page: PageId) {
        self.data[7..11].copy_from_slice(&page.index().to_be_bytes());
    }

    fn key_at(&self, i: usize) -> OverflowKey {
        OverflowKey::read(&self.data, LEAF_KEYS_OFFSET + i * KEY_SIZE)
    }

    /// Binary search; `Ok` when present, `Err` carries the insertion point
    fn search(&self, key: &OverflowKey) -> std::result::Result<usize, usize> {
        let mut low = 0usize;
        let mut high = self.count();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key_at(mid).cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    fn insert_key_at(&mut self, i: usize, key: &OverflowKey) {
        let count = self.count();
        let start = LEAF_KEYS_OFFSET + i * KEY_SIZE;
        let end = LEAF_KEYS_OFFSET + count * KEY_SIZE;
        self.data.copy_within(start..end, start + KEY_SIZE);
        key.write(&mut self.data, start);
        self.set_count(count + 1);
    }

    fn remove_key_at(&mut self, i: usize) {
        let count = self.count();
        let start = LEAF_KEYS_OFFSET + (i + 1) * KEY_SIZE;
        let end = LEAF_KEYS_OFFSET + count * KEY_SIZE;
        self.data
            .copy_within(start..end, LEAF_KEYS_OFFSET + i * KEY_SIZE);
        self.set_count(count - 1);
    }

    // ---- internal accessors ----

    fn child(&self, i: usize) -> PageId {
        let off = CHILDREN_OFFSET + i * 4;
        PageId::new(u32::from_be_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]))
    }

    fn set_child(&mut self, i: usize, page: PageId) {
        let off = CHILDREN_OFFSET + i * 4;
        self.data[off..off + 4].copy_from_slice(&page.index().to_be_bytes());
    }

    fn separator(&self, i: usize) -> OverflowKey {
        OverflowKey::read(&self.data, SEPS_OFFSET + i * KEY_SIZE)
    }

    fn set_separator(&mut self, i: usize, key: &OverflowKey) {
        key.write(&mut self.data, SEPS_OFFSET + i * KEY_SIZE);
    }

    /// Index of the child to descend into for `key`
    fn child_index(&self, key: &OverflowKey) -> usize {
        let mut low = 0usize;
        let mut high = self.count();
        while low < high {
            let mid = low + (high - low) / 2;
            if self.separator(mid) <= *key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Insert separator `key` at slot `i` with `right` as its right child
    fn insert_separator_at(&mut self, i: usize, key: &OverflowKey, right: PageId) {
        let count = self.count();
        // Shift separators i.. and children i+1.. one slot right.
        let sep_start = SEPS_OFFSET + i * KEY_SIZE;
        let sep_end = SEPS_OFFSET + count * KEY_SIZE;
        self.data.copy_within(sep_start..sep_end, sep_start + KEY_SIZE);
        let child_start = CHILDREN_OFFSET + (i + 1) * 4;
        let child_end = CHILDREN_OFFSET + (count + 1) * 4;
        self.data.copy_within(child_start..child_end, child_start + 4);

        key.write(&mut self.data, sep_start);
        self.set_child(i + 1, right);
        self.set_count(count + 1);
    }
}

/// The overflow container over one `.ovf` file
pub struct OverflowContainer {
    name: String,
    file_id: FileId,
}

impl OverflowContainer {
    /// Create the container file with an empty root leaf
    pub fn create(cache: &PageCache, op: &AtomicOperation, name: &str, file_name: &str) -> Result<Self> {
        let file_id = cache.add_file(file_name)?;

        let (header_page, header_pin) = cache.add_page(op, file_id)?;
        debug_assert_eq!(header_page, PageId::new(0));
        {
            let mut page = header_pin.write();
            write_header(page.as_bytes_mut());
        }

        let (root_page, root_pin) = cache.add_page(op, file_id)?;
        debug_assert_eq!(root_page, PageId::ROOT);
        {
            let mut page = root_pin.write();
            page.as_bytes_mut().copy_from_slice(Node::new_leaf().data.as_bytes());
        }

        Ok(Self {
            name: name.to_string(),
            file_id,
        })
    }

    /// Open an existing container file
    pub fn open(cache: &PageCache, name: &str, file_name: &str) -> Result<Self> {
        let file_id = cache.open_file(file_name)?;
        let pin = cache.load_for_read(file_id, PageId::new(0))?;
        let page = pin.read();
        check_header(name, page.as_bytes())?;
        Ok(Self {
            name: name.to_string(),
            file_id,
        })
    }

    /// The container's file
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Insert `(m_id, rid)` if absent. Runs `on_insert` after a real
    /// insert, so the caller's entry count moves atomically with the row.
    /// Returns false (and skips the callback) when the row already exists.
    pub fn validated_put(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        m_id: u64,
        rid: Rid,
        on_insert: impl FnOnce() -> Result<()>,
    ) -> Result<bool> {
        let key = OverflowKey { m_id, rid };

        loop {
            let (leaf_id, path) = self.descend(cache, &key)?;
            let pin = cache.load_for_write(op, self.file_id, leaf_id)?;
            let mut node = Node::from_bytes(pin.read().as_bytes())?;

            let slot = match node.search(&key) {
                Ok(_) => return Ok(false),
                Err(slot) => slot,
            };

            if node.count() < LEAF_CAPACITY {
                node.insert_key_at(slot, &key);
                pin.write().as_bytes_mut().copy_from_slice(node.data.as_bytes());
                on_insert()?;
                return Ok(true);
            }

            drop(pin);
            self.split_leaf(cache, op, leaf_id, &path)?;
        }
    }

    /// Remove `(m_id, rid)`; false when the row does not exist
    pub fn remove(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        m_id: u64,
        rid: Rid,
    ) -> Result<bool> {
        let key = OverflowKey { m_id, rid };
        let (leaf_id, _) = self.descend(cache, &key)?;
        let pin = cache.load_for_write(op, self.file_id, leaf_id)?;
        let mut node = Node::from_bytes(pin.read().as_bytes())?;

        match node.search(&key) {
            Ok(slot) => {
                node.remove_key_at(slot);
                pin.write().as_bytes_mut().copy_from_slice(node.data.as_bytes());
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// All rids of the bag with the given m-id, in key order
    pub fn rids_for(&self, cache: &PageCache, m_id: u64) -> Result<Vec<Rid>> {
        let probe = OverflowKey::lowest(m_id);
        let (leaf_id, _) = self.descend(cache, &probe)?;

        let mut rids = Vec::new();
        let mut current = leaf_id;
        let mut start;
        {
            let pin = cache.load_for_read(self.file_id, current)?;
            let node = Node::from_bytes(pin.read().as_bytes())?;
            start = match node.search(&probe) {
                Ok(slot) | Err(slot) => slot,
            };
        }

        loop {
            let pin = cache.load_for_read(self.file_id, current)?;
            let node = Node::from_bytes(pin.read().as_bytes())?;
            for i in start..node.count() {
                let key = node.key_at(i);
                match key.m_id.cmp(&m_id) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => rids.push(key.rid),
                    std::cmp::Ordering::Greater => return Ok(rids),
                }
            }
            let next = node.right_sibling();
            if !next.is_some() {
                return Ok(rids);
            }
            current = next;
            start = 0;
        }
    }

    /// Flush and close the container file
    pub fn close(&self, cache: &PageCache) -> Result<()> {
        cache.close_file(self.file_id)
    }

    /// Remove the container file from disk
    pub fn delete(&self, cache: &PageCache) -> Result<()> {
        cache.delete_file(self.file_id)
    }

    /// Walk from the root to the leaf for `key`, recording the internal
    /// path as `(page, child index)` pairs
    fn descend(&self, cache: &PageCache, key: &OverflowKey) -> Result<(PageId, Vec<(PageId, usize)>)> {
        let mut current = PageId::ROOT;
        let mut path = Vec::new();

        for _ in 0..crate::types::MAX_PATH_LENGTH {
            let pin = cache.load_for_read(self.file_id, current)?;
            let node = Node::from_bytes(pin.read().as_bytes())?;
            if node.is_leaf() {
                return Ok((current, path));
            }
            let idx = node.child_index(key);
            let child = node.child(idx);
            path.push((current, idx));
            current = child;
        }

        Err(TreeError::corruption(
            &self.name,
            "overflow container descent exceeded the depth bound",
        ))
    }

    /// Split the full leaf, pushing the right half onto a fresh page and
    /// the separator into the parent chain
    fn split_leaf(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        leaf_id: PageId,
        path: &[(PageId, usize)],
    ) -> Result<()> {
        let left_pin = cache.load_for_write(op, self.file_id, leaf_id)?;
        let mut left = Node::from_bytes(left_pin.read().as_bytes())?;
        let count = left.count();
        let mid = count / 2;

        let mut right = Node::new_leaf();
        for i in mid..count {
            let key = left.key_at(i);
            right.insert_key_at(i - mid, &key);
        }
        left.set_count(mid);
        let separator = right.key_at(0);

        if leaf_id == PageId::ROOT {
            // Root leaf split: both halves move to fresh pages and the
            // root is reborn as an internal node.
            let (left_id, new_left_pin) = cache.add_page(op, self.file_id)?;
            let (right_id, new_right_pin) = cache.add_page(op, self.file_id)?;

            left.set_right_sibling(right_id);
            right.set_left_sibling(left_id);
            new_left_pin.write().as_bytes_mut().copy_from_slice(left.data.as_bytes());
            new_right_pin.write().as_bytes_mut().copy_from_slice(right.data.as_bytes());

            let mut root = Node::new_internal();
            root.set_child(0, left_id);
            root.insert_separator_at(0, &separator, right_id);
            left_pin.write().as_bytes_mut().copy_from_slice(root.data.as_bytes());
            return Ok(());
        }

        let (right_id, right_pin) = cache.add_page(op, self.file_id)?;
        right.set_right_sibling(left.right_sibling());
        right.set_left_sibling(leaf_id);
        let old_right = left.right_sibling();
        left.set_right_sibling(right_id);

        right_pin.write().as_bytes_mut().copy_from_slice(right.data.as_bytes());
        left_pin.write().as_bytes_mut().copy_from_slice(left.data.as_bytes());
        drop(left_pin);

        if old_right.is_some() {
            let pin = cache.load_for_write(op, self.file_id, old_right)?;
            let mut node = Node::from_bytes(pin.read().as_bytes())?;
            node.set_left_sibling(right_id);
            pin.write().as_bytes_mut().copy_from_slice(node.data.as_bytes());
        }

        self.insert_into_parent(cache, op, path, separator, right_id)
    }

    /// Insert a separator into the parent, splitting internals as needed
    fn insert_into_parent(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        path: &[(PageId, usize)],
        separator: OverflowKey,
        right_child: PageId,
    ) -> Result<()> {
        let Some(&(parent_id, child_idx)) = path.last() else {
            return Err(TreeError::corruption(
                &self.name,
                "leaf split with an empty parent path",
            ));
        };

        let pin = cache.load_for_write(op, self.file_id, parent_id)?;
        let mut node = Node::from_bytes(pin.read().as_bytes())?;

        if node.count() < INTERNAL_CAPACITY {
            node.insert_separator_at(child_idx, &separator, right_child);
            pin.write().as_bytes_mut().copy_from_slice(node.data.as_bytes());
            return Ok(());
        }

        // Split the internal node: the middle separator moves up.
        let count = node.count();
        let mid = count / 2;
        let promoted = node.separator(mid);

        let mut right = Node::new_internal();
        for i in (mid + 1)..count {
            let sep = node.separator(i);
            right.set_separator(i - mid - 1, &sep);
        }
        for i in (mid + 1)..=count {
            right.set_child(i - mid - 1, node.child(i));
        }
        right.set_count(count - mid - 1);
        node.set_count(mid);

        // Place the pending separator into the proper half.
        let (into_right, idx) = if child_idx > mid {
            (true, child_idx - mid - 1)
        } else {
            (false, child_idx)
        };

        if parent_id == PageId::ROOT {
            let (left_id, left_pin) = cache.add_page(op, self.file_id)?;
            let (right_id, right_pin) = cache.add_page(op, self.file_id)?;

            if into_right {
                right.insert_separator_at(idx, &separator, right_child);
            } else {
                node.insert_separator_at(idx, &separator, right_child);
            }

            left_pin.write().as_bytes_mut().copy_from_slice(node.data.as_bytes());
            right_pin.write().as_bytes_mut().copy_from_slice(right.data.as_bytes());

            let mut root = Node::new_internal();
            root.set_child(0, left_id);
            root.insert_separator_at(0, &promoted, right_id);
            pin.write().as_bytes_mut().copy_from_slice(root.data.as_bytes());
            return Ok(());
        }

        let (right_id, right_pin) = cache.add_page(op, self.file_id)?;
        if into_right {
            right.insert_separator_at(idx, &separator, right_child);
        } else {
            node.insert_separator_at(idx, &separator, right_child);
        }
        right_pin.write().as_bytes_mut().copy_from_slice(right.data.as_bytes());
        pin.write().as_bytes_mut().copy_from_slice(node.data.as_bytes());
        drop(pin);

        self.insert_into_parent(cache, op, &path[..path.len() - 1], promoted, right_id)
    }
}

fn write_header(bytes: &mut [u8]) {
    bytes[0..16].copy_from_slice(CONTAINER_MAGIC);
    let checksum = crc32fast::hash(&bytes[0..16]);
    bytes[16..20].copy_from_slice(&checksum.to_be_bytes());
}

fn check_header(name: &str, bytes: &[u8]) -> Result<()> {
    if &bytes[0..16] != CONTAINER_MAGIC {
        return Err(TreeError::invalid_file(format!(
            "'{name}': bad overflow container magic"
        )));
    }
    let stored = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    if crc32fast::hash(&bytes[0..16]) != stored {
        return Err(TreeError::corruption(name, "container header checksum mismatch"));
    }
    Ok(())
}
