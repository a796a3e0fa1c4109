//! The tree engine.
//!
//! Wires the buckets, the entry point, the null bucket and the overflow
//! container into one multi-value index. Every public operation runs under
//! the atomic-operation manager's per-tree lock plus the tree's own latch;
//! mutations additionally run inside an atomic operation whose outermost
//! end commits the component records or rolls every touched page back.
//!
//! Equal keys may straddle leaf boundaries after splits, so point reads,
//! removals and cursors walk the sibling chain while the neighbor still
//! holds the probe key.

use crate::atomic::{AtomicOperation, AtomicOperationManager, ComponentRecord, RecordBody};
use crate::buffer::PageCache;
use crate::error::{Result, TreeError};
use crate::keys::{CompositeKey, Encryption, KeyCodec, KeySerializer};
use crate::page::{
    AppendResult, Bucket, EntryPointPage, InsertResult, NullBucket, RemoveResult, SearchResult,
};
use crate::tree::{OverflowContainer, CONTAINER_FILE_EXT, DATA_FILE_EXT, NULL_FILE_EXT};
use crate::types::{FileId, PageId, Rid, TreeConfig, MAX_PATH_LENGTH, M_ID_BATCH_SIZE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Mutable tree state guarded by the latch
pub(crate) struct TreeState {
    pub(crate) file_id: FileId,
    pub(crate) null_file_id: FileId,
    pub(crate) container: OverflowContainer,
    /// Next m-id to hand out
    m_id_counter: i64,
    /// Ids below this bound are covered by the persisted high-water mark
    m_id_limit: i64,
}

/// One level of a write descent: the internal page and the slot a
/// promoted separator would take
#[derive(Debug, Clone, Copy)]
struct PathItem {
    page: PageId,
    insertion_index: usize,
}

/// A paged, durable multi-value B+-tree index.
///
/// Maps composite keys (or the null key) to bags of rids. One writer at a
/// time; readers run in parallel with each other.
pub struct MultiValueTree {
    name: String,
    config: TreeConfig,
    codec: KeyCodec,
    cache: Arc<PageCache>,
    atomic: Arc<AtomicOperationManager>,
    component_lock: Arc<RwLock<()>>,
    pub(crate) latch: RwLock<TreeState>,
}

impl MultiValueTree {
    /// Create a new tree: entry point, root leaf, null bucket and overflow
    /// container
    pub fn create(
        cache: Arc<PageCache>,
        atomic: Arc<AtomicOperationManager>,
        name: &str,
        config: TreeConfig,
        serializer: Arc<dyn KeySerializer>,
        encryption: Option<Arc<dyn Encryption>>,
    ) -> Result<Self> {
        let codec = KeyCodec::new(serializer, encryption, config.max_key_size);
        let component_lock = atomic.component_lock(name);
        let _write = component_lock.write();

        let guard = atomic.begin();
        let built = Self::create_inner(&cache, guard.operation(), name);
        match built {
            Ok(state) => {
                guard.end(false)?;
                tracing::debug!(tree = name, "created multi-value tree");
                Ok(Self {
                    name: name.to_string(),
                    config,
                    codec,
                    cache,
                    atomic: atomic.clone(),
                    component_lock: component_lock.clone(),
                    latch: RwLock::new(state),
                })
            }
            Err(e) => {
                let _ = guard.end(true);
                Err(e)
            }
        }
    }

    fn create_inner(cache: &PageCache, op: &AtomicOperation, name: &str) -> Result<TreeState> {
        let file_id = cache.add_file(&format!("{name}{DATA_FILE_EXT}"))?;

        let (entry_page, entry_pin) = cache.add_page(op, file_id)?;
        debug_assert_eq!(entry_page, PageId::ENTRY_POINT);
        {
            let mut page = entry_pin.write();
            EntryPointPage::new().write(page.as_bytes_mut());
        }

        let (root_page, root_pin) = cache.add_page(op, file_id)?;
        debug_assert_eq!(root_page, PageId::ROOT);
        {
            let mut page = root_pin.write();
            page.as_bytes_mut().copy_from_slice(Bucket::new_leaf().as_bytes());
        }

        let mut state = TreeState {
            file_id,
            null_file_id: FileId(0),
            container: OverflowContainer::create(
                cache,
                op,
                name,
                &format!("{name}{CONTAINER_FILE_EXT}"),
            )?,
            m_id_counter: 0,
            m_id_limit: 0,
        };

        // The null bucket claims the first m-id.
        let null_m_id = Self::next_m_id_inner(cache, op, name, &mut state)?;
        let null_file_id = cache.add_file(&format!("{name}{NULL_FILE_EXT}"))?;
        let (null_page, null_pin) = cache.add_page(op, null_file_id)?;
        debug_assert_eq!(null_page, PageId::new(0));
        {
            let mut page = null_pin.write();
            page.as_bytes_mut()
                .copy_from_slice(NullBucket::new(null_m_id).as_bytes());
        }
        state.null_file_id = null_file_id;

        Ok(state)
    }

    /// Load an existing tree
    pub fn load(
        cache: Arc<PageCache>,
        atomic: Arc<AtomicOperationManager>,
        name: &str,
        config: TreeConfig,
        serializer: Arc<dyn KeySerializer>,
        encryption: Option<Arc<dyn Encryption>>,
    ) -> Result<Self> {
        let codec = KeyCodec::new(serializer, encryption, config.max_key_size);
        let component_lock = atomic.component_lock(name);
        let _write = component_lock.write();

        let file_id = cache.open_file(&format!("{name}{DATA_FILE_EXT}"))?;
        let null_file_id = cache.open_file(&format!("{name}{NULL_FILE_EXT}"))?;
        let container =
            OverflowContainer::open(&cache, name, &format!("{name}{CONTAINER_FILE_EXT}"))?;

        let entry = {
            let pin = cache.load_for_read(file_id, PageId::ENTRY_POINT)?;
            let page = pin.read();
            EntryPointPage::read(name, page.as_bytes())?
        };

        tracing::debug!(tree = name, size = entry.tree_size, "loaded multi-value tree");

        Ok(Self {
            name: name.to_string(),
            config,
            codec,
            cache,
            atomic: atomic.clone(),
            component_lock: component_lock.clone(),
            latch: RwLock::new(TreeState {
                file_id,
                null_file_id,
                container,
                // The persisted bound is an upper limit of every id handed
                // out before; resuming there keeps m-ids unique.
                m_id_counter: entry.entry_id,
                m_id_limit: entry.entry_id,
            }),
        })
    }

    /// The tree's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tree's configuration
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub(crate) fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub(crate) fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub(crate) fn read_lock(&self) -> Arc<RwLock<()>> {
        self.component_lock.clone()
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Total number of rids in the tree, null bag included
    pub fn size(&self) -> Result<i64> {
        let _read = self.component_lock.read();
        let state = self.latch.read();
        Ok(self.read_entry_point(&state)?.tree_size)
    }

    fn read_entry_point(&self, state: &TreeState) -> Result<EntryPointPage> {
        let pin = self.cache.load_for_read(state.file_id, PageId::ENTRY_POINT)?;
        let page = pin.read();
        EntryPointPage::read(&self.name, page.as_bytes())
    }

    fn update_entry_point(
        &self,
        state: &TreeState,
        op: &AtomicOperation,
        update: impl FnOnce(&mut EntryPointPage),
    ) -> Result<EntryPointPage> {
        let pin = self
            .cache
            .load_for_write(op, state.file_id, PageId::ENTRY_POINT)?;
        let mut entry = EntryPointPage::read(&self.name, pin.read().as_bytes())?;
        update(&mut entry);
        entry.write(pin.write().as_bytes_mut());
        Ok(entry)
    }

    fn next_m_id(&self, op: &AtomicOperation, state: &mut TreeState) -> Result<u64> {
        Self::next_m_id_inner(&self.cache, op, &self.name, state)
    }

    fn next_m_id_inner(
        cache: &PageCache,
        op: &AtomicOperation,
        name: &str,
        state: &mut TreeState,
    ) -> Result<u64> {
        if state.m_id_counter >= state.m_id_limit {
            let new_limit = state.m_id_counter + M_ID_BATCH_SIZE;
            let pin = cache.load_for_write(op, state.file_id, PageId::ENTRY_POINT)?;
            let mut entry = EntryPointPage::read(name, pin.read().as_bytes())?;
            entry.entry_id = new_limit;
            entry.write(pin.write().as_bytes_mut());
            state.m_id_limit = new_limit;
        }
        let id = state.m_id_counter;
        state.m_id_counter += 1;
        Ok(id as u64)
    }

    /// Claim the next bucket page index through the entry point. The file
    /// only grows when it has not already been extended past the index by
    /// an earlier, rolled-back allocation.
    fn allocate_bucket_page(&self, state: &TreeState, op: &AtomicOperation) -> Result<PageId> {
        let entry = self.update_entry_point(state, op, |entry| entry.pages_size += 1)?;
        let new_page = PageId::new(entry.pages_size);

        if self.cache.filled_up_to(state.file_id)? <= new_page.index() {
            let (allocated, _pin) = self.cache.add_page(op, state.file_id)?;
            if allocated != new_page {
                return Err(TreeError::corruption(
                    &self.name,
                    format!("allocated page {allocated}, entry point expected {new_page}"),
                ));
            }
        }
        Ok(new_page)
    }

    // ------------------------------------------------------------------
    // Bucket I/O helpers
    // ------------------------------------------------------------------

    pub(crate) fn read_bucket(&self, state: &TreeState, page: PageId) -> Result<Bucket> {
        let pin = self.cache.load_for_read(state.file_id, page)?;
        let bucket = Bucket::from_bytes(pin.read().as_bytes())?;
        Ok(bucket)
    }

    fn write_bucket(
        &self,
        state: &TreeState,
        op: &AtomicOperation,
        page: PageId,
        bucket: &Bucket,
    ) -> Result<()> {
        let pin = self.cache.load_for_write(op, state.file_id, page)?;
        pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
        Ok(())
    }

    /// Descend to the leaf whose range covers `probe`, without a path
    pub(crate) fn find_leaf(&self, state: &TreeState, probe: &CompositeKey) -> Result<PageId> {
        let mut current = PageId::ROOT;
        for _ in 0..MAX_PATH_LENGTH {
            let bucket = self.read_bucket(state, current)?;
            if bucket.is_leaf() {
                return Ok(current);
            }
            current = self.child_for(&bucket, probe)?;
        }
        Err(self.depth_corruption())
    }

    /// Descend recording, per internal level, where a promoted separator
    /// would insert
    fn find_leaf_with_path(
        &self,
        state: &TreeState,
        probe: &CompositeKey,
    ) -> Result<(PageId, Vec<PathItem>)> {
        let mut current = PageId::ROOT;
        let mut path = Vec::new();
        for _ in 0..MAX_PATH_LENGTH {
            let bucket = self.read_bucket(state, current)?;
            if bucket.is_leaf() {
                return Ok((current, path));
            }
            let (child, insertion_index) = match bucket.find(probe, &self.codec)? {
                SearchResult::Found(i) => (bucket.right_child(i), i + 1),
                SearchResult::NotFound(i) => {
                    let child = if i < bucket.entry_count() {
                        bucket.left_child(i)
                    } else {
                        bucket.right_child(bucket.entry_count() - 1)
                    };
                    (child, i)
                }
            };
            path.push(PathItem {
                page: current,
                insertion_index,
            });
            current = child;
        }
        Err(self.depth_corruption())
    }

    fn child_for(&self, bucket: &Bucket, probe: &CompositeKey) -> Result<PageId> {
        Ok(match bucket.find(probe, &self.codec)? {
            SearchResult::Found(i) => bucket.right_child(i),
            SearchResult::NotFound(i) => {
                if i < bucket.entry_count() {
                    bucket.left_child(i)
                } else {
                    bucket.right_child(bucket.entry_count() - 1)
                }
            }
        })
    }

    fn depth_corruption(&self) -> TreeError {
        tracing::warn!(tree = %self.name, "descent exceeded the depth bound");
        TreeError::corruption(&self.name, "descent exceeded the depth bound")
    }

    // ------------------------------------------------------------------
    // put
    // ------------------------------------------------------------------

    /// Add a rid under a key (or the null key). A `(key, rid)` pair that is
    /// already present leaves the tree unchanged.
    pub fn put(&self, key: Option<&CompositeKey>, rid: Rid) -> Result<()> {
        let _write = self.component_lock.write();
        let mut state = self.latch.write();
        let guard = self.atomic.begin();
        let result = self.put_inner(&mut state, guard.operation(), key, rid);
        match result {
            Ok(()) => guard.end(false),
            Err(e) => {
                let _ = guard.end(true);
                Err(e)
            }
        }
    }

    fn put_inner(
        &self,
        state: &mut TreeState,
        op: &AtomicOperation,
        key: Option<&CompositeKey>,
        rid: Rid,
    ) -> Result<()> {
        match key {
            None => self.put_null(state, op, rid),
            Some(key) => self.put_key(state, op, key, rid),
        }
    }

    fn put_null(&self, state: &mut TreeState, op: &AtomicOperation, rid: Rid) -> Result<()> {
        let pin = self
            .cache
            .load_for_write(op, state.null_file_id, PageId::new(0))?;
        let mut bucket = NullBucket::from_bytes(pin.read().as_bytes());

        let grew = match bucket.append(rid) {
            AppendResult::Appended => {
                pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
                true
            }
            AppendResult::Duplicate => false,
            AppendResult::NeedsOverflow(m_id) => {
                state
                    .container
                    .validated_put(&self.cache, op, m_id, rid, || {
                        let mut page = pin.write();
                        let mut bucket = NullBucket::from_bytes(page.as_bytes());
                        bucket.increment_size();
                        page.as_bytes_mut().copy_from_slice(bucket.as_bytes());
                        Ok(())
                    })?
            }
            // NullBucket::append never returns Saturated; only leaf entries
            // under non-null keys enforce MAX_ENTRY_RIDS.
            AppendResult::Saturated => unreachable!("NullBucket::append never saturates"),
        };

        if grew {
            self.update_entry_point(state, op, |entry| entry.tree_size += 1)?;
        }
        // TODO: decide whether a duplicate insert should skip the log
        // record; for now every put is logged.
        self.log_put(op, None, rid);
        Ok(())
    }

    fn put_key(
        &self,
        state: &mut TreeState,
        op: &AtomicOperation,
        key: &CompositeKey,
        rid: Rid,
    ) -> Result<()> {
        let key = self.codec.serializer().preprocess(key, &self.config)?;
        if key.arity() != self.config.key_size {
            return Err(TreeError::invalid_key(format!(
                "stored keys need {} items, got {}",
                self.config.key_size,
                key.arity()
            )));
        }
        let key_bytes = self.codec.encode(&key)?;

        // After a split the insertion retries directly at the page the
        // placement rule chose; losing the descent path there falls back
        // to a fresh descent.
        let mut retry_at: Option<PageId> = None;
        let grew = loop {
            let (leaf_id, path) = match retry_at.take() {
                Some(page) => (page, None),
                None => {
                    let (leaf, path) = self.find_leaf_with_path(state, &key)?;
                    (leaf, Some(path))
                }
            };

            let pin = self.cache.load_for_write(op, state.file_id, leaf_id)?;
            let mut bucket = Bucket::from_bytes(pin.read().as_bytes())?;

            // Where a fresh entry would go, and how it is placed: either at
            // the insertion slot of a missing key, or right after the
            // within-leaf run of a key whose entries are all saturated.
            let (insertion, run) = match bucket.find(&key, &self.codec)? {
                SearchResult::Found(i) => {
                    let (lo, hi) = self.equal_run(&bucket, i, &key)?;
                    (hi + 1, Some((lo, hi)))
                }
                SearchResult::NotFound(insertion) => (insertion, None),
            };

            if let Some((lo, hi)) = run {
                let mut outcome = None;
                for slot in lo..=hi {
                    match bucket.append_rid(slot, rid)? {
                        AppendResult::Appended => {
                            pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
                            outcome = Some(true);
                            break;
                        }
                        AppendResult::Duplicate => {
                            outcome = Some(false);
                            break;
                        }
                        AppendResult::NeedsOverflow(m_id) => {
                            let inserted =
                                state
                                    .container
                                    .validated_put(&self.cache, op, m_id, rid, || {
                                        let mut page = pin.write();
                                        let mut bucket = Bucket::from_bytes(page.as_bytes())?;
                                        bucket.increment_entries_count(slot);
                                        page.as_bytes_mut().copy_from_slice(bucket.as_bytes());
                                        Ok(())
                                    })?;
                            outcome = Some(inserted);
                            break;
                        }
                        AppendResult::Saturated => continue,
                    }
                }
                if let Some(grew) = outcome {
                    break grew;
                }
            }

            // Open a new entry: first rid under a missing key, or another
            // entry under a fully saturated one.
            let m_id = self.next_m_id(op, state)?;
            match bucket.create_leaf_entry(insertion, &key_bytes, rid, m_id)? {
                InsertResult::Created => {
                    pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
                    break true;
                }
                InsertResult::SplitNeeded => {
                    drop(bucket);
                    drop(pin);
                    match path {
                        Some(path) => {
                            retry_at = Some(
                                self.split_bucket(state, op, leaf_id, &path, insertion, &key)?,
                            );
                        }
                        None => retry_at = None,
                    }
                }
            }
        };

        if grew {
            self.update_entry_point(state, op, |entry| entry.tree_size += 1)?;
        }
        // TODO: decide whether a duplicate insert should skip the log
        // record; for now every put is logged.
        self.log_put(op, Some(key_bytes), rid);
        Ok(())
    }

    fn log_put(&self, op: &AtomicOperation, key_bytes: Option<Vec<u8>>, rid: Rid) {
        op.add_component_record(ComponentRecord::Put(self.record_body(key_bytes, rid)));
    }

    fn log_remove(&self, op: &AtomicOperation, key_bytes: Option<Vec<u8>>, rid: Rid) {
        op.add_component_record(ComponentRecord::RemoveEntry(self.record_body(key_bytes, rid)));
    }

    fn record_body(&self, key_bytes: Option<Vec<u8>>, rid: Rid) -> RecordBody {
        RecordBody {
            index_id: self.config.index_id,
            serializer_id: self.codec.serializer_id(),
            encryption_name: self.codec.encryption_name().map(str::to_string),
            key_bytes,
            rid,
        }
    }

    // ------------------------------------------------------------------
    // Split
    // ------------------------------------------------------------------

    /// Split the refusing leaf and return the page where the pending
    /// insert should retry: left of the separator when its slot was below
    /// the midpoint, right above it, and right at the midpoint only when
    /// the inbound key equals the separator.
    fn split_bucket(
        &self,
        state: &TreeState,
        op: &AtomicOperation,
        leaf_id: PageId,
        path: &[PathItem],
        key_index: usize,
        inbound: &CompositeKey,
    ) -> Result<PageId> {
        let pin = self.cache.load_for_write(op, state.file_id, leaf_id)?;
        let mut left = Bucket::from_bytes(pin.read().as_bytes())?;
        let count = left.entry_count();
        debug_assert!(count > 1, "splitting a bucket with {count} entries");

        let mid = count >> 1;
        let separator = left.key_bytes_at(mid).to_vec();
        let separator_key = self.codec.decode(&separator)?;

        let mut right = Bucket::new_leaf();
        left.move_tail_to(&mut right, mid);

        let (left_target, right_target);
        if leaf_id == PageId::ROOT {
            // Root split: both halves land on fresh pages and the root is
            // reborn as an internal node. Its page index never changes.
            let new_left_id = self.allocate_bucket_page(state, op)?;
            let new_right_id = self.allocate_bucket_page(state, op)?;

            left.shrink(mid);
            let mut new_left = Bucket::new_leaf();
            left.move_tail_to(&mut new_left, 0);
            let mut new_right = right;
            new_left.set_right_sibling(new_right_id);
            new_right.set_left_sibling(new_left_id);

            self.write_bucket(state, op, new_left_id, &new_left)?;
            self.write_bucket(state, op, new_right_id, &new_right)?;

            let mut root = Bucket::new_internal();
            root.insert_internal_entry(0, &separator, new_left_id, new_right_id)?;
            pin.write().as_bytes_mut().copy_from_slice(root.as_bytes());

            left_target = new_left_id;
            right_target = new_right_id;
        } else {
            let right_id = self.allocate_bucket_page(state, op)?;
            left.shrink(mid);

            let old_right = left.right_sibling();
            right.set_right_sibling(old_right);
            right.set_left_sibling(leaf_id);
            left.set_right_sibling(right_id);

            self.write_bucket(state, op, right_id, &right)?;
            pin.write().as_bytes_mut().copy_from_slice(left.as_bytes());
            drop(pin);

            if old_right.is_some() {
                let neighbor_pin = self.cache.load_for_write(op, state.file_id, old_right)?;
                let mut neighbor = Bucket::from_bytes(neighbor_pin.read().as_bytes())?;
                neighbor.set_left_sibling(right_id);
                neighbor_pin
                    .write()
                    .as_bytes_mut()
                    .copy_from_slice(neighbor.as_bytes());
            }

            self.insert_into_parents(state, op, path, &separator, leaf_id, right_id)?;

            left_target = leaf_id;
            right_target = right_id;
        }

        tracing::debug!(
            tree = %self.name,
            page = %leaf_id,
            entries = count,
            "split leaf bucket"
        );

        Ok(match key_index.cmp(&mid) {
            Ordering::Less => left_target,
            Ordering::Greater => right_target,
            Ordering::Equal => {
                if inbound.cmp(&separator_key) == Ordering::Equal {
                    right_target
                } else {
                    left_target
                }
            }
        })
    }

    /// Insert a separator with children `(left, right)` into an internal
    /// bucket, repairing the neighbor child pointers
    fn place_separator(
        bucket: &mut Bucket,
        idx: usize,
        separator: &[u8],
        left: PageId,
        right: PageId,
    ) -> Result<bool> {
        if !bucket.insert_internal_entry(idx, separator, left, right)? {
            return Ok(false);
        }
        if idx > 0 {
            bucket.set_right_child(idx - 1, left);
        }
        if idx + 1 < bucket.entry_count() {
            bucket.set_left_child(idx + 1, right);
        }
        Ok(true)
    }

    /// Push a separator up the recorded path, splitting refusing parents
    fn insert_into_parents(
        &self,
        state: &TreeState,
        op: &AtomicOperation,
        path: &[PathItem],
        separator: &[u8],
        left_child: PageId,
        right_child: PageId,
    ) -> Result<()> {
        let Some(&PathItem {
            page: parent_id,
            insertion_index: idx,
        }) = path.last()
        else {
            return Err(TreeError::corruption(
                &self.name,
                "non-root split with an empty parent path",
            ));
        };

        let pin = self.cache.load_for_write(op, state.file_id, parent_id)?;
        let mut parent = Bucket::from_bytes(pin.read().as_bytes())?;

        if Self::place_separator(&mut parent, idx, separator, left_child, right_child)? {
            pin.write().as_bytes_mut().copy_from_slice(parent.as_bytes());
            return Ok(());
        }

        // Internal split: the midpoint separator moves up and leaves both
        // halves.
        let count = parent.entry_count();
        debug_assert!(count > 1, "splitting an internal bucket with {count} entries");
        let mid = count >> 1;
        let promoted = parent.key_bytes_at(mid).to_vec();

        let mut right_half = Bucket::new_internal();
        parent.move_tail_to(&mut right_half, mid + 1);
        parent.shrink(mid);

        // Route the pending separator into the proper half.
        let pending_into_right = idx > mid;
        let pending_idx = if pending_into_right { idx - mid - 1 } else { idx };

        if parent_id == PageId::ROOT {
            let new_left_id = self.allocate_bucket_page(state, op)?;
            let new_right_id = self.allocate_bucket_page(state, op)?;

            {
                let half = if pending_into_right {
                    &mut right_half
                } else {
                    &mut parent
                };
                if !Self::place_separator(half, pending_idx, separator, left_child, right_child)? {
                    return Err(TreeError::corruption(
                        &self.name,
                        "split half refused the pending separator",
                    ));
                }
            }

            self.write_bucket(state, op, new_left_id, &parent)?;
            self.write_bucket(state, op, new_right_id, &right_half)?;

            let mut root = Bucket::new_internal();
            root.insert_internal_entry(0, &promoted, new_left_id, new_right_id)?;
            pin.write().as_bytes_mut().copy_from_slice(root.as_bytes());

            tracing::debug!(tree = %self.name, "split internal root");
            return Ok(());
        }

        let right_id = self.allocate_bucket_page(state, op)?;
        {
            let half = if pending_into_right {
                &mut right_half
            } else {
                &mut parent
            };
            if !Self::place_separator(half, pending_idx, separator, left_child, right_child)? {
                return Err(TreeError::corruption(
                    &self.name,
                    "split half refused the pending separator",
                ));
            }
        }
        self.write_bucket(state, op, right_id, &right_half)?;
        pin.write().as_bytes_mut().copy_from_slice(parent.as_bytes());
        drop(pin);

        tracing::debug!(tree = %self.name, page = %parent_id, "split internal bucket");

        self.insert_into_parents(
            state,
            op,
            &path[..path.len() - 1],
            &promoted,
            parent_id,
            right_id,
        )
    }

    // ------------------------------------------------------------------
    // get
    // ------------------------------------------------------------------

    /// All rids stored under a key (or the null key), unordered
    pub fn get(&self, key: Option<&CompositeKey>) -> Result<Vec<Rid>> {
        let _read = self.component_lock.read();
        let state = self.latch.read();
        match key {
            None => self.get_null(&state),
            Some(key) => self.get_key(&state, key),
        }
    }

    fn get_null(&self, state: &TreeState) -> Result<Vec<Rid>> {
        let pin = self.cache.load_for_read(state.null_file_id, PageId::new(0))?;
        let bucket = NullBucket::from_bytes(pin.read().as_bytes());
        drop(pin);

        let mut rids = bucket.inline_rids();
        if bucket.has_overflow() {
            rids.extend(state.container.rids_for(&self.cache, bucket.m_id())?);
        }
        Ok(rids)
    }

    fn get_key(&self, state: &TreeState, key: &CompositeKey) -> Result<Vec<Rid>> {
        let probe = self.codec.serializer().preprocess(key, &self.config)?;
        let leaf_id = self.find_leaf(state, &probe)?;
        let bucket = self.read_bucket(state, leaf_id)?;

        let hit = match bucket.find(&probe, &self.codec)? {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(_) => return Ok(Vec::new()),
        };

        // A key may own several entries; gather the whole within-leaf run.
        let (lo, hi) = self.equal_run(&bucket, hit, &probe)?;
        let mut rids = Vec::new();
        for slot in lo..=hi {
            rids.extend(self.entry_rids(state, &bucket, slot)?);
        }

        // Equal keys straddle leaves after splits: a run touching the first
        // or last slot may continue in the neighbors.
        if lo == 0 {
            self.walk_left_collecting(state, bucket.left_sibling(), &probe, &mut rids)?;
        }
        if hi + 1 == bucket.entry_count() {
            self.walk_right_collecting(state, bucket.right_sibling(), &probe, &mut rids)?;
        }

        Ok(rids)
    }

    /// Bounds (inclusive) of the within-leaf slot run whose keys equal the
    /// probe, around a known hit
    pub(crate) fn equal_run(
        &self,
        bucket: &Bucket,
        hit: usize,
        probe: &CompositeKey,
    ) -> Result<(usize, usize)> {
        let mut lo = hit;
        while lo > 0 && self.codec.compare(bucket.key_bytes_at(lo - 1), probe)? == Ordering::Equal
        {
            lo -= 1;
        }
        let mut hi = hit;
        while hi + 1 < bucket.entry_count()
            && self.codec.compare(bucket.key_bytes_at(hi + 1), probe)? == Ordering::Equal
        {
            hi += 1;
        }
        Ok((lo, hi))
    }

    /// All rids of one leaf entry: the inline list plus the overflow rows
    pub(crate) fn entry_rids(
        &self,
        state: &TreeState,
        bucket: &Bucket,
        slot: usize,
    ) -> Result<Vec<Rid>> {
        let entry = bucket.leaf_entry(slot, &self.codec)?;
        let mut rids = entry.inline;
        if (entry.entries_count as usize) > rids.len() {
            rids.extend(state.container.rids_for(&self.cache, entry.m_id)?);
        }
        Ok(rids)
    }

    /// Collect rids from left siblings while their trailing keys equal the
    /// probe; empty leaves are skipped
    pub(crate) fn walk_left_collecting(
        &self,
        state: &TreeState,
        mut page: PageId,
        probe: &CompositeKey,
        out: &mut Vec<Rid>,
    ) -> Result<()> {
        while page.is_some() {
            let bucket = self.read_bucket(state, page)?;
            let count = bucket.entry_count();
            let mut consumed_all = true;
            for offset in 0..count {
                let slot = count - 1 - offset;
                if self.codec.compare(bucket.key_bytes_at(slot), probe)? == Ordering::Equal {
                    out.extend(self.entry_rids(state, &bucket, slot)?);
                } else {
                    consumed_all = false;
                    break;
                }
            }
            if !consumed_all {
                return Ok(());
            }
            page = bucket.left_sibling();
        }
        Ok(())
    }

    /// Mirror of [`Self::walk_left_collecting`] over right siblings
    pub(crate) fn walk_right_collecting(
        &self,
        state: &TreeState,
        mut page: PageId,
        probe: &CompositeKey,
        out: &mut Vec<Rid>,
    ) -> Result<()> {
        while page.is_some() {
            let bucket = self.read_bucket(state, page)?;
            let count = bucket.entry_count();
            let mut consumed_all = true;
            for slot in 0..count {
                if self.codec.compare(bucket.key_bytes_at(slot), probe)? == Ordering::Equal {
                    out.extend(self.entry_rids(state, &bucket, slot)?);
                } else {
                    consumed_all = false;
                    break;
                }
            }
            if !consumed_all {
                return Ok(());
            }
            page = bucket.right_sibling();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // remove
    // ------------------------------------------------------------------

    /// Remove one `(key, rid)` pair; false when it was not present
    pub fn remove(&self, key: Option<&CompositeKey>, rid: Rid) -> Result<bool> {
        let _write = self.component_lock.write();
        let mut state = self.latch.write();
        let guard = self.atomic.begin();
        let result = self.remove_inner(&mut state, guard.operation(), key, rid);
        match result {
            Ok(removed) => {
                guard.end(false)?;
                Ok(removed)
            }
            Err(e) => {
                let _ = guard.end(true);
                Err(e)
            }
        }
    }

    fn remove_inner(
        &self,
        state: &mut TreeState,
        op: &AtomicOperation,
        key: Option<&CompositeKey>,
        rid: Rid,
    ) -> Result<bool> {
        match key {
            None => self.remove_null(state, op, rid),
            Some(key) => self.remove_key(state, op, key, rid),
        }
    }

    fn remove_null(&self, state: &mut TreeState, op: &AtomicOperation, rid: Rid) -> Result<bool> {
        let pin = self
            .cache
            .load_for_write(op, state.null_file_id, PageId::new(0))?;
        let mut bucket = NullBucket::from_bytes(pin.read().as_bytes());

        let removed = match bucket.remove(rid) {
            RemoveResult::Removed(_) => {
                pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
                true
            }
            RemoveResult::NotInline(m_id) => {
                if state.container.remove(&self.cache, op, m_id, rid)? {
                    bucket.decrement_size();
                    pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
                    true
                } else {
                    false
                }
            }
            RemoveResult::Missing => false,
        };

        if removed {
            self.update_entry_point(state, op, |entry| entry.tree_size -= 1)?;
            self.log_remove(op, None, rid);
        }
        Ok(removed)
    }

    fn remove_key(
        &self,
        state: &mut TreeState,
        op: &AtomicOperation,
        key: &CompositeKey,
        rid: Rid,
    ) -> Result<bool> {
        let probe = self.codec.serializer().preprocess(key, &self.config)?;
        let key_bytes = self.codec.encode(&probe)?;
        let leaf_id = self.find_leaf(state, &probe)?;

        let (run, count, left_sibling, right_sibling) = {
            let bucket = self.read_bucket(state, leaf_id)?;
            match bucket.find(&probe, &self.codec)? {
                SearchResult::Found(i) => (
                    self.equal_run(&bucket, i, &probe)?,
                    bucket.entry_count(),
                    bucket.left_sibling(),
                    bucket.right_sibling(),
                ),
                SearchResult::NotFound(_) => return Ok(false),
            }
        };

        // Try every same-key entry of this leaf, then the sibling chain
        // when the run touches a boundary. The walk stops at the first
        // success.
        let (lo, hi) = run;
        let mut removed = false;
        for slot in lo..=hi {
            if self.try_remove_from_entry(state, op, leaf_id, slot, rid)? {
                removed = true;
                break;
            }
        }
        if !removed && lo == 0 {
            removed = self.walk_removing(state, op, left_sibling, &probe, rid, true)?;
        }
        if !removed && hi + 1 == count {
            removed = self.walk_removing(state, op, right_sibling, &probe, rid, false)?;
        }

        if removed {
            self.update_entry_point(state, op, |entry| entry.tree_size -= 1)?;
            self.log_remove(op, Some(key_bytes), rid);
        }
        Ok(removed)
    }

    /// Try to remove `rid` from the entry at `slot`, dropping the entry
    /// when its bag empties
    fn try_remove_from_entry(
        &self,
        state: &TreeState,
        op: &AtomicOperation,
        page: PageId,
        slot: usize,
        rid: Rid,
    ) -> Result<bool> {
        let pin = self.cache.load_for_write(op, state.file_id, page)?;
        let mut bucket = Bucket::from_bytes(pin.read().as_bytes())?;

        match bucket.remove_rid(slot, rid) {
            RemoveResult::Removed(remaining) => {
                if remaining == 0 {
                    bucket.drop_entry(slot);
                }
                pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
                Ok(true)
            }
            RemoveResult::NotInline(m_id) => {
                if state.container.remove(&self.cache, op, m_id, rid)? {
                    let remaining = bucket.decrement_entries_count(slot);
                    if remaining == 0 {
                        bucket.drop_entry(slot);
                    }
                    pin.write().as_bytes_mut().copy_from_slice(bucket.as_bytes());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            RemoveResult::Missing => Ok(false),
        }
    }

    /// Walk siblings attempting the removal on every equal-key entry
    fn walk_removing(
        &self,
        state: &TreeState,
        op: &AtomicOperation,
        mut page: PageId,
        probe: &CompositeKey,
        rid: Rid,
        leftward: bool,
    ) -> Result<bool> {
        while page.is_some() {
            let bucket = self.read_bucket(state, page)?;
            let count = bucket.entry_count();
            let mut consumed_all = true;
            for offset in 0..count {
                let slot = if leftward { count - 1 - offset } else { offset };
                if self.codec.compare(bucket.key_bytes_at(slot), probe)? != Ordering::Equal {
                    consumed_all = false;
                    break;
                }
                if self.try_remove_from_entry(state, op, page, slot, rid)? {
                    return Ok(true);
                }
            }
            if !consumed_all {
                return Ok(false);
            }
            page = if leftward {
                bucket.left_sibling()
            } else {
                bucket.right_sibling()
            };
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Boundary keys
    // ------------------------------------------------------------------

    /// Smallest key in the tree, if any
    pub fn first_key(&self) -> Result<Option<CompositeKey>> {
        let _read = self.component_lock.read();
        let state = self.latch.read();
        let Some((page, slot)) = self.first_entry(&state)? else {
            return Ok(None);
        };
        let bucket = self.read_bucket(&state, page)?;
        Ok(Some(bucket.key_at(slot, &self.codec)?))
    }

    /// Largest key in the tree, if any
    pub fn last_key(&self) -> Result<Option<CompositeKey>> {
        let _read = self.component_lock.read();
        let state = self.latch.read();
        let Some((page, slot)) = self.last_entry(&state)? else {
            return Ok(None);
        };
        let bucket = self.read_bucket(&state, page)?;
        Ok(Some(bucket.key_at(slot, &self.codec)?))
    }

    /// Leftmost non-empty leaf entry
    pub(crate) fn first_entry(&self, state: &TreeState) -> Result<Option<(PageId, usize)>> {
        let mut current = PageId::ROOT;
        for _ in 0..MAX_PATH_LENGTH {
            let bucket = self.read_bucket(state, current)?;
            if !bucket.is_leaf() {
                current = bucket.left_child(0);
                continue;
            }
            // Skip empty leaves through the chain.
            let mut page = current;
            loop {
                let bucket = self.read_bucket(state, page)?;
                if bucket.entry_count() > 0 {
                    return Ok(Some((page, 0)));
                }
                let next = bucket.right_sibling();
                if !next.is_some() {
                    return Ok(None);
                }
                page = next;
            }
        }
        Err(self.depth_corruption())
    }

    /// Rightmost non-empty leaf entry
    pub(crate) fn last_entry(&self, state: &TreeState) -> Result<Option<(PageId, usize)>> {
        let mut current = PageId::ROOT;
        for _ in 0..MAX_PATH_LENGTH {
            let bucket = self.read_bucket(state, current)?;
            if !bucket.is_leaf() {
                current = bucket.right_child(bucket.entry_count() - 1);
                continue;
            }
            let mut page = current;
            loop {
                let bucket = self.read_bucket(state, page)?;
                if bucket.entry_count() > 0 {
                    return Ok(Some((page, bucket.entry_count() - 1)));
                }
                let prev = bucket.left_sibling();
                if !prev.is_some() {
                    return Ok(None);
                }
                page = prev;
            }
        }
        Err(self.depth_corruption())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Flush every file of the tree
    pub fn close(&self) -> Result<()> {
        let _write = self.component_lock.write();
        let state = self.latch.write();
        self.cache.close_file(state.file_id)?;
        self.cache.close_file(state.null_file_id)?;
        state.container.close(&self.cache)?;
        tracing::debug!(tree = %self.name, "closed multi-value tree");
        Ok(())
    }

    /// Remove the tree's files. Refuses when the tree still holds entries.
    pub fn delete(&self) -> Result<()> {
        let _write = self.component_lock.write();
        let state = self.latch.write();

        let size = self.read_entry_point(&state)?.tree_size;
        if size > 0 {
            return Err(TreeError::TreeNotEmpty {
                name: self.name.clone(),
                size,
            });
        }

        self.cache.delete_file(state.file_id)?;
        self.cache.delete_file(state.null_file_id)?;
        state.container.delete(&self.cache)?;
        tracing::debug!(tree = %self.name, "deleted multi-value tree");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Structure export
    // ------------------------------------------------------------------

    /// Export the bucket graph for debugging and visualization
    pub fn export_tree(&self) -> Result<TreeNode> {
        let _read = self.component_lock.read();
        let state = self.latch.read();
        self.export_node(&state, PageId::ROOT)
    }

    fn export_node(&self, state: &TreeState, page: PageId) -> Result<TreeNode> {
        let bucket = self.read_bucket(state, page)?;

        if bucket.is_leaf() {
            let mut keys = Vec::with_capacity(bucket.entry_count());
            let mut entry_counts = Vec::with_capacity(bucket.entry_count());
            for i in 0..bucket.entry_count() {
                keys.push(bucket.key_at(i, &self.codec)?.to_string());
                entry_counts.push(bucket.entries_count_at(i));
            }
            return Ok(TreeNode {
                page_id: page.index(),
                is_leaf: true,
                keys,
                entry_counts,
                children: Vec::new(),
            });
        }

        let mut keys = Vec::with_capacity(bucket.entry_count());
        let mut child_ids = Vec::new();
        for i in 0..bucket.entry_count() {
            keys.push(bucket.key_at(i, &self.codec)?.to_string());
            if i == 0 {
                child_ids.push(bucket.left_child(0));
            }
            child_ids.push(bucket.right_child(i));
        }

        let mut children = Vec::with_capacity(child_ids.len());
        for child in child_ids {
            children.push(self.export_node(state, child)?);
        }

        Ok(TreeNode {
            page_id: page.index(),
            is_leaf: false,
            keys,
            entry_counts: Vec::new(),
            children,
        })
    }
}

/// Bucket graph node for visualization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// Page index of the bucket
    pub page_id: u32,
    /// Whether this bucket is a leaf
    pub is_leaf: bool,
    /// Rendered keys in slot order
    pub keys: Vec<String>,
    /// Per-entry rid totals (leaves only)
    pub entry_counts: Vec<u32>,
    /// Child nodes (internal buckets only)
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Number of leaf buckets under this node (itself included when leaf)
    pub fn leaf_count(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            self.children.iter().map(TreeNode::leaf_count).sum()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::read_log;
    use crate::keys::{CompositeKeySerializer, KeyItem, KeyType, XorEncryption};
    use crate::storage::FileDiskManager;
    use crate::types::{MAX_ENTRY_RIDS, MAX_INLINE_RIDS};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::Path;
    use tempfile::tempdir;

    fn setup(dir: &Path) -> (Arc<PageCache>, Arc<AtomicOperationManager>) {
        let disk = Arc::new(FileDiskManager::new(dir).unwrap());
        let cache = Arc::new(PageCache::new(disk, 512));
        let atomic =
            Arc::new(AtomicOperationManager::new(cache.clone(), &dir.join("component.wal"), false).unwrap());
        (cache, atomic)
    }

    fn int_tree(cache: &Arc<PageCache>, atomic: &Arc<AtomicOperationManager>) -> MultiValueTree {
        MultiValueTree::create(
            cache.clone(),
            atomic.clone(),
            "idx",
            TreeConfig::new(1, vec![KeyType::Int]),
            Arc::new(CompositeKeySerializer),
            None,
        )
        .unwrap()
    }

    fn str_tree(cache: &Arc<PageCache>, atomic: &Arc<AtomicOperationManager>) -> MultiValueTree {
        MultiValueTree::create(
            cache.clone(),
            atomic.clone(),
            "idx",
            TreeConfig::new(1, vec![KeyType::Str]),
            Arc::new(CompositeKeySerializer),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        assert_eq!(tree.size().unwrap(), 0);
        assert!(tree.get(Some(&CompositeKey::int(7))).unwrap().is_empty());
        assert!(tree.get(None).unwrap().is_empty());
        assert_eq!(tree.first_key().unwrap(), None);
        assert_eq!(tree.last_key().unwrap(), None);
        tree.delete().unwrap();
    }

    #[test]
    fn test_duplicate_put_is_deduplicated() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = str_tree(&cache, &atomic);
        let x = CompositeKey::str("x");

        tree.put(Some(&x), Rid::new(1, 100)).unwrap();
        tree.put(Some(&x), Rid::new(1, 101)).unwrap();
        tree.put(Some(&x), Rid::new(1, 100)).unwrap();

        let rids: BTreeSet<Rid> = tree.get(Some(&x)).unwrap().into_iter().collect();
        assert_eq!(
            rids,
            BTreeSet::from([Rid::new(1, 100), Rid::new(1, 101)])
        );
        assert_eq!(tree.size().unwrap(), 2);
    }

    #[test]
    fn test_overflow_spill_and_dedup() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);
        let key = CompositeKey::int(1);

        // Fill past the inline cap so the container holds the tail.
        let spill = MAX_INLINE_RIDS as i64 + 3;
        for pos in 0..spill {
            tree.put(Some(&key), Rid::new(0, pos)).unwrap();
        }
        assert_eq!(tree.size().unwrap(), spill);

        // Every rid, inline or spilled, is a duplicate now.
        for pos in 0..spill {
            tree.put(Some(&key), Rid::new(0, pos)).unwrap();
        }
        assert_eq!(tree.size().unwrap(), spill);

        let rids: BTreeSet<Rid> = tree.get(Some(&key)).unwrap().into_iter().collect();
        assert_eq!(rids.len(), spill as usize);
    }

    #[test]
    fn test_bulk_ascending_inserts() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        for i in 0..10_000i64 {
            tree.put(Some(&CompositeKey::int(i)), Rid::new(1, i)).unwrap();
        }

        assert_eq!(tree.size().unwrap(), 10_000);
        assert_eq!(tree.first_key().unwrap(), Some(CompositeKey::int(0)));
        assert_eq!(tree.last_key().unwrap(), Some(CompositeKey::int(9_999)));

        for probe in [0i64, 1, 4_999, 9_998, 9_999] {
            assert_eq!(
                tree.get(Some(&CompositeKey::int(probe))).unwrap(),
                vec![Rid::new(1, probe)],
                "lookup of {probe}"
            );
        }

        // The root page index never moves even though the tree grew tall.
        let node = tree.export_tree().unwrap();
        assert_eq!(node.page_id, PageId::ROOT.index());
        assert!(!node.is_leaf);
        assert!(node.leaf_count() > 10);

        // Scenario: removing one key's rid drops exactly one pair.
        assert!(tree.remove(Some(&CompositeKey::int(5_000)), Rid::new(1, 5_000)).unwrap());
        assert_eq!(tree.size().unwrap(), 9_999);
        assert!(tree.get(Some(&CompositeKey::int(5_000))).unwrap().is_empty());
        assert_eq!(tree.get(Some(&CompositeKey::int(5_001))).unwrap(), vec![Rid::new(1, 5_001)]);
    }

    #[test]
    fn test_null_key_bag() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        for pos in 0..1_000i64 {
            tree.put(None, Rid::new(2, pos)).unwrap();
        }
        assert_eq!(tree.get(None).unwrap().len(), 1_000);
        assert_eq!(tree.size().unwrap(), 1_000);

        // Null and non-null entries are independent.
        tree.put(Some(&CompositeKey::int(1)), Rid::new(1, 1)).unwrap();
        assert_eq!(tree.get(None).unwrap().len(), 1_000);
        assert_eq!(tree.get(Some(&CompositeKey::int(1))).unwrap().len(), 1);
        assert_eq!(tree.size().unwrap(), 1_001);

        // Duplicate null rids are ignored, inline and spilled alike.
        tree.put(None, Rid::new(2, 0)).unwrap();
        tree.put(None, Rid::new(2, 999)).unwrap();
        assert_eq!(tree.get(None).unwrap().len(), 1_000);

        assert!(tree.remove(None, Rid::new(2, 500)).unwrap());
        assert!(!tree.remove(None, Rid::new(2, 500)).unwrap());
        assert_eq!(tree.get(None).unwrap().len(), 999);
        assert_eq!(tree.size().unwrap(), 1_000);
    }

    #[test]
    fn test_same_key_spans_leaves() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = str_tree(&cache, &atomic);
        let key = CompositeKey::str("K");

        for pos in 0..5_000i64 {
            tree.put(Some(&key), Rid::new(3, pos)).unwrap();
        }

        assert_eq!(tree.size().unwrap(), 5_000);
        let rids: BTreeSet<Rid> = tree.get(Some(&key)).unwrap().into_iter().collect();
        assert_eq!(rids.len(), 5_000);
        assert!(rids.contains(&Rid::new(3, 0)));
        assert!(rids.contains(&Rid::new(3, 4_999)));

        // The equal key fills several leaves; both sibling walks traverse
        // them.
        let node = tree.export_tree().unwrap();
        assert!(node.leaf_count() > 1, "expected the key to span leaves");
        assert_eq!(tree.first_key().unwrap(), Some(key.clone()));
        assert_eq!(tree.last_key().unwrap(), Some(key.clone()));

        // Removing one rid removes exactly one.
        assert!(tree.remove(Some(&key), Rid::new(3, 2_500)).unwrap());
        assert_eq!(tree.size().unwrap(), 4_999);
        assert_eq!(tree.get(Some(&key)).unwrap().len(), 4_999);
        assert!(!tree.remove(Some(&key), Rid::new(3, 2_500)).unwrap());
    }

    #[test]
    fn test_put_remove_restores_state() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        tree.put(Some(&CompositeKey::int(1)), Rid::new(0, 1)).unwrap();
        let size_before = tree.size().unwrap();
        let rids_before = tree.get(Some(&CompositeKey::int(1))).unwrap();

        tree.put(Some(&CompositeKey::int(1)), Rid::new(0, 2)).unwrap();
        assert!(tree.remove(Some(&CompositeKey::int(1)), Rid::new(0, 2)).unwrap());

        assert_eq!(tree.size().unwrap(), size_before);
        assert_eq!(tree.get(Some(&CompositeKey::int(1))).unwrap(), rids_before);

        // Removing an absent pair is a no-op that reports false.
        assert!(!tree.remove(Some(&CompositeKey::int(1)), Rid::new(0, 9)).unwrap());
        assert!(!tree.remove(Some(&CompositeKey::int(42)), Rid::new(0, 1)).unwrap());
        assert_eq!(tree.size().unwrap(), size_before);
    }

    #[test]
    fn test_random_put_remove_mix() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut model: BTreeMap<i64, BTreeSet<Rid>> = BTreeMap::new();
        let mut next_pos = 0i64;

        for _ in 0..3_000 {
            let key = rng.gen_range(0..200i64);
            if rng.gen_bool(0.7) {
                let rid = Rid::new(0, next_pos);
                next_pos += 1;
                tree.put(Some(&CompositeKey::int(key)), rid).unwrap();
                model.entry(key).or_default().insert(rid);
            } else if let Some(rids) = model.get_mut(&key) {
                let first = rids.iter().next().copied();
                if let Some(rid) = first {
                    assert!(tree.remove(Some(&CompositeKey::int(key)), rid).unwrap());
                    rids.remove(&rid);
                }
            }
        }

        let expected_size: usize = model.values().map(BTreeSet::len).sum();
        assert_eq!(tree.size().unwrap(), expected_size as i64);

        for (key, expected) in &model {
            let got: BTreeSet<Rid> = tree
                .get(Some(&CompositeKey::int(*key)))
                .unwrap()
                .into_iter()
                .collect();
            assert_eq!(&got, expected, "bag mismatch for key {key}");
        }
    }

    #[test]
    fn test_oversize_key_rejected() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = MultiValueTree::create(
            cache,
            atomic,
            "idx",
            TreeConfig::new(1, vec![KeyType::Str]).max_key_size(16),
            Arc::new(CompositeKeySerializer),
            None,
        )
        .unwrap();

        let long = CompositeKey::str("definitely longer than sixteen bytes");
        match tree.put(Some(&long), Rid::new(0, 1)) {
            Err(TreeError::KeyTooLarge { max: 16, .. }) => {}
            other => panic!("expected KeyTooLarge, got {other:?}"),
        }
        assert_eq!(tree.size().unwrap(), 0);
    }

    #[test]
    fn test_key_type_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        assert!(tree.put(Some(&CompositeKey::str("nope")), Rid::new(0, 1)).is_err());
        assert!(tree
            .put(
                Some(&CompositeKey::new(vec![KeyItem::Int(1), KeyItem::Int(2)])),
                Rid::new(0, 1)
            )
            .is_err());
    }

    #[test]
    fn test_encrypted_tree_roundtrip() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let encryption = Arc::new(XorEncryption { key: 0x3C });
        let tree = MultiValueTree::create(
            cache.clone(),
            atomic.clone(),
            "idx",
            TreeConfig::new(1, vec![KeyType::Str]),
            Arc::new(CompositeKeySerializer),
            Some(encryption.clone()),
        )
        .unwrap();

        for i in 0..200i64 {
            let key = CompositeKey::str(format!("user-{i:04}"));
            tree.put(Some(&key), Rid::new(1, i)).unwrap();
        }
        assert_eq!(
            tree.get(Some(&CompositeKey::str("user-0042"))).unwrap(),
            vec![Rid::new(1, 42)]
        );
        tree.close().unwrap();

        let tree = MultiValueTree::load(
            cache,
            atomic,
            "idx",
            TreeConfig::new(1, vec![KeyType::Str]),
            Arc::new(CompositeKeySerializer),
            Some(encryption),
        )
        .unwrap();
        assert_eq!(tree.size().unwrap(), 200);
        assert_eq!(
            tree.get(Some(&CompositeKey::str("user-0199"))).unwrap(),
            vec![Rid::new(1, 199)]
        );
    }

    #[test]
    fn test_component_records_logged() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        tree.put(Some(&CompositeKey::int(1)), Rid::new(0, 1)).unwrap();
        tree.put(None, Rid::new(0, 2)).unwrap();
        tree.remove(Some(&CompositeKey::int(1)), Rid::new(0, 1)).unwrap();

        let records = read_log(dir.path().join("component.wal")).unwrap();
        assert_eq!(records.len(), 3);

        match &records[0] {
            ComponentRecord::Put(body) => {
                assert_eq!(body.index_id, 1);
                assert!(body.key_bytes.is_some());
                assert_eq!(body.rid, Rid::new(0, 1));
            }
            other => panic!("expected a put record, got {other:?}"),
        }
        match &records[1] {
            ComponentRecord::Put(body) => assert!(body.key_bytes.is_none()),
            other => panic!("expected a null-key put record, got {other:?}"),
        }
        assert!(matches!(records[2], ComponentRecord::RemoveEntry(_)));
    }

    #[test]
    fn test_delete_refuses_when_not_empty() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = int_tree(&cache, &atomic);

        tree.put(Some(&CompositeKey::int(1)), Rid::new(0, 1)).unwrap();
        match tree.delete() {
            Err(TreeError::TreeNotEmpty { size: 1, .. }) => {}
            other => panic!("expected TreeNotEmpty, got {other:?}"),
        }

        tree.remove(Some(&CompositeKey::int(1)), Rid::new(0, 1)).unwrap();
        tree.delete().unwrap();
    }

    #[test]
    fn test_reload_keeps_m_ids_unique() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        {
            let tree = int_tree(&cache, &atomic);
            for i in 0..50i64 {
                tree.put(Some(&CompositeKey::int(i)), Rid::new(0, i)).unwrap();
            }
            tree.close().unwrap();
        }

        let tree = MultiValueTree::load(
            cache.clone(),
            atomic.clone(),
            "idx",
            TreeConfig::new(1, vec![KeyType::Int]),
            Arc::new(CompositeKeySerializer),
            None,
        )
        .unwrap();

        // New entries allocate m-ids above the persisted bound; spilling a
        // fresh key past its inline cap must not collide with old bags in
        // the container.
        let fresh = CompositeKey::int(10_000);
        let extra = MAX_ENTRY_RIDS as i64;
        for pos in 0..extra {
            tree.put(Some(&fresh), Rid::new(9, pos)).unwrap();
        }
        assert_eq!(tree.get(Some(&fresh)).unwrap().len(), extra as usize);
        for i in 0..50i64 {
            assert_eq!(
                tree.get(Some(&CompositeKey::int(i))).unwrap(),
                vec![Rid::new(0, i)]
            );
        }
    }

    #[test]
    fn test_failed_put_rolls_back() {
        let dir = tempdir().unwrap();
        let (cache, atomic) = setup(dir.path());
        let tree = MultiValueTree::create(
            cache,
            atomic,
            "idx",
            TreeConfig::new(1, vec![KeyType::Str]).max_key_size(32),
            Arc::new(CompositeKeySerializer),
            None,
        )
        .unwrap();

        tree.put(Some(&CompositeKey::str("ok")), Rid::new(0, 1)).unwrap();
        let oversize = CompositeKey::str("way past the thirty-two byte key budget");
        assert!(tree.put(Some(&oversize), Rid::new(0, 2)).is_err());

        assert_eq!(tree.size().unwrap(), 1);
        assert_eq!(tree.get(Some(&CompositeKey::str("ok"))).unwrap(), vec![Rid::new(0, 1)]);
    }
}
