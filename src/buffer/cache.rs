//! The page cache implementation.

use crate::atomic::AtomicOperation;
use crate::buffer::{CacheKey, EvictionQueue};
use crate::error::{Result, TreeError};
use crate::page::PageBuf;
use crate::storage::DiskManager;
use crate::types::{FileId, PageId};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// A frame holding one cached page
struct Frame {
    page: PageBuf,
    dirty: bool,
    pin_count: u32,
}

/// Cache of page frames with pin counting and write-back eviction
pub struct PageCache {
    disk: Arc<dyn DiskManager>,
    frames: RwLock<HashMap<CacheKey, Arc<RwLock<Frame>>>>,
    eviction: Mutex<EvictionQueue>,
    capacity: usize,
}

impl PageCache {
    /// Create a cache holding at most `capacity` frames
    pub fn new(disk: Arc<dyn DiskManager>, capacity: usize) -> Self {
        Self {
            disk,
            frames: RwLock::new(HashMap::with_capacity(capacity)),
            eviction: Mutex::new(EvictionQueue::new()),
            capacity,
        }
    }

    /// Register a new file
    pub fn add_file(&self, name: &str) -> Result<FileId> {
        self.disk.add_file(name)
    }

    /// Open an existing file
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        self.disk.open_file(name)
    }

    /// Number of pages the file holds on disk
    pub fn filled_up_to(&self, file: FileId) -> Result<u32> {
        self.disk.page_count(file)
    }

    /// Frame capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pin a page for reading
    pub fn load_for_read(&self, file: FileId, page: PageId) -> Result<PageGuard<'_>> {
        let key = (file, page);
        let frame = self.get_frame(key)?;
        frame.write().pin_count += 1;
        Ok(PageGuard {
            key,
            frame,
            cache: self,
        })
    }

    /// Pin a page for writing inside an atomic operation
    pub fn load_for_write(
        &self,
        op: &AtomicOperation,
        file: FileId,
        page: PageId,
    ) -> Result<PageGuardMut<'_>> {
        let key = (file, page);
        let frame = self.get_frame(key)?;
        {
            let mut f = frame.write();
            f.pin_count += 1;
            op.capture_before_image(key, &f.page);
        }
        Ok(PageGuardMut {
            key,
            frame,
            cache: self,
        })
    }

    /// Grow the file by one page and pin it for writing
    pub fn add_page(
        &self,
        op: &AtomicOperation,
        file: FileId,
    ) -> Result<(PageId, PageGuardMut<'_>)> {
        let page = self.disk.allocate_page(file)?;
        let key = (file, page);

        self.make_room()?;
        let frame = Arc::new(RwLock::new(Frame {
            page: PageBuf::zeroed(),
            dirty: true,
            pin_count: 1,
        }));
        self.frames.write().insert(key, frame.clone());
        self.eviction.lock().touch(key);
        op.capture_before_image(key, &PageBuf::zeroed());

        Ok((
            page,
            PageGuardMut {
                key,
                frame,
                cache: self,
            },
        ))
    }

    /// Overwrite a page with a rollback image
    pub fn restore_page(&self, key: CacheKey, image: &PageBuf) -> Result<()> {
        if let Some(frame) = self.frames.read().get(&key) {
            let mut f = frame.write();
            f.page = image.clone();
            f.dirty = true;
            return Ok(());
        }

        self.make_room()?;
        let frame = Arc::new(RwLock::new(Frame {
            page: image.clone(),
            dirty: true,
            pin_count: 0,
        }));
        self.frames.write().insert(key, frame);
        self.eviction.lock().touch(key);
        Ok(())
    }

    /// Write back every dirty frame of `file` and sync it
    pub fn flush_file(&self, file: FileId) -> Result<()> {
        let frames = self.frames.read();
        for (&key, frame) in frames.iter() {
            if key.0 != file {
                continue;
            }
            let mut f = frame.write();
            if f.dirty {
                self.disk.write_page(key.0, key.1, f.page.as_bytes())?;
                f.dirty = false;
            }
        }
        drop(frames);
        self.disk.sync_file(file)
    }

    /// Flush the file and drop it from the cache and the disk manager
    pub fn close_file(&self, file: FileId) -> Result<()> {
        self.flush_file(file)?;
        self.forget_file(file);
        self.disk.close_file(file)
    }

    /// Drop the file from the cache and remove it from disk
    pub fn delete_file(&self, file: FileId) -> Result<()> {
        self.forget_file(file);
        self.disk.delete_file(file)
    }

    fn forget_file(&self, file: FileId) {
        let mut frames = self.frames.write();
        let mut eviction = self.eviction.lock();
        frames.retain(|&key, _| {
            if key.0 == file {
                eviction.remove(key);
                false
            } else {
                true
            }
        });
    }

    fn get_frame(&self, key: CacheKey) -> Result<Arc<RwLock<Frame>>> {
        {
            let frames = self.frames.read();
            if let Some(frame) = frames.get(&key) {
                self.eviction.lock().touch(key);
                return Ok(frame.clone());
            }
        }

        self.make_room()?;
        let page = self.disk.read_page(key.0, key.1)?;
        let loaded = Arc::new(RwLock::new(Frame {
            page,
            dirty: false,
            pin_count: 0,
        }));
        // Another reader may have loaded the page meanwhile; keep theirs.
        let frame = self
            .frames
            .write()
            .entry(key)
            .or_insert_with(|| loaded)
            .clone();
        self.eviction.lock().touch(key);
        Ok(frame)
    }

    /// Evict cold unpinned frames until a new one fits
    fn make_room(&self) -> Result<()> {
        let mut frames = self.frames.write();
        if frames.len() < self.capacity {
            return Ok(());
        }

        let mut eviction = self.eviction.lock();
        for key in eviction.coldest_first() {
            let Some(frame) = frames.get(&key) else {
                eviction.remove(key);
                continue;
            };
            let f = frame.read();
            if f.pin_count > 0 {
                continue;
            }
            if f.dirty {
                self.disk.write_page(key.0, key.1, f.page.as_bytes())?;
            }
            drop(f);
            frames.remove(&key);
            eviction.remove(key);
            return Ok(());
        }

        Err(TreeError::CacheExhausted)
    }

    fn unpin(&self, key: CacheKey, frame: &Arc<RwLock<Frame>>) {
        let mut f = frame.write();
        f.pin_count = f.pin_count.saturating_sub(1);
        drop(f);
        self.eviction.lock().touch(key);
    }
}

/// RAII read pin on a page
pub struct PageGuard<'a> {
    key: CacheKey,
    frame: Arc<RwLock<Frame>>,
    cache: &'a PageCache,
}

impl<'a> PageGuard<'a> {
    /// The pinned page's index
    pub fn page_id(&self) -> PageId {
        self.key.1
    }

    /// Borrow the page content
    pub fn read(&self) -> PageRef<'_> {
        PageRef {
            guard: self.frame.read(),
        }
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.cache.unpin(self.key, &self.frame);
    }
}

/// Shared view of a pinned page
pub struct PageRef<'a> {
    guard: RwLockReadGuard<'a, Frame>,
}

impl<'a> std::ops::Deref for PageRef<'a> {
    type Target = PageBuf;

    fn deref(&self) -> &Self::Target {
        &self.guard.page
    }
}

/// RAII write pin on a page
pub struct PageGuardMut<'a> {
    key: CacheKey,
    frame: Arc<RwLock<Frame>>,
    cache: &'a PageCache,
}

impl<'a> PageGuardMut<'a> {
    /// The pinned page's index
    pub fn page_id(&self) -> PageId {
        self.key.1
    }

    /// Borrow the page content
    pub fn read(&self) -> PageRef<'_> {
        PageRef {
            guard: self.frame.read(),
        }
    }

    /// Borrow the page content mutably, marking the frame dirty
    pub fn write(&self) -> PageRefMut<'_> {
        let mut guard = self.frame.write();
        guard.dirty = true;
        PageRefMut { guard }
    }
}

impl<'a> Drop for PageGuardMut<'a> {
    fn drop(&mut self) {
        self.cache.unpin(self.key, &self.frame);
    }
}

/// Exclusive view of a pinned page
pub struct PageRefMut<'a> {
    guard: RwLockWriteGuard<'a, Frame>,
}

impl<'a> std::ops::Deref for PageRefMut<'a> {
    type Target = PageBuf;

    fn deref(&self) -> &Self::Target {
        &self.guard.page
    }
}

impl<'a> std::ops::DerefMut for PageRefMut<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicOperationManager;
    use crate::storage::FileDiskManager;
    use tempfile::tempdir;

    fn setup(capacity: usize) -> (tempfile::TempDir, Arc<PageCache>, AtomicOperationManager) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(FileDiskManager::new(dir.path()).unwrap());
        let cache = Arc::new(PageCache::new(disk, capacity));
        let manager =
            AtomicOperationManager::new(cache.clone(), &dir.path().join("t.wal"), false).unwrap();
        (dir, cache, manager)
    }

    #[test]
    fn test_add_page_and_reload() {
        let (_dir, cache, manager) = setup(16);
        let file = cache.add_file("a.mvb").unwrap();

        let guard = manager.begin();
        let page = {
            let (page, pin) = cache.add_page(guard.operation(), file).unwrap();
            pin.write().as_bytes_mut()[0] = 0xAB;
            page
        };
        guard.end(false).unwrap();

        let pin = cache.load_for_read(file, page).unwrap();
        assert_eq!(pin.read().as_bytes()[0], 0xAB);
        assert_eq!(cache.filled_up_to(file).unwrap(), 1);
    }

    #[test]
    fn test_flush_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let disk = Arc::new(FileDiskManager::new(dir.path()).unwrap());
            let cache = Arc::new(PageCache::new(disk, 16));
            let manager =
                AtomicOperationManager::new(cache.clone(), &dir.path().join("t.wal"), false).unwrap();
            let file = cache.add_file("a.mvb").unwrap();

            let guard = manager.begin();
            {
                let (_, pin) = cache.add_page(guard.operation(), file).unwrap();
                pin.write().as_bytes_mut()[0..4].copy_from_slice(b"keep");
            }
            guard.end(false).unwrap();
            cache.close_file(file).unwrap();
        }

        let disk = Arc::new(FileDiskManager::new(dir.path()).unwrap());
        let cache = PageCache::new(disk, 16);
        let file = cache.open_file("a.mvb").unwrap();
        let pin = cache.load_for_read(file, PageId::new(0)).unwrap();
        assert_eq!(&pin.read().as_bytes()[0..4], b"keep");
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let (_dir, cache, manager) = setup(2);
        let file = cache.add_file("a.mvb").unwrap();

        let guard = manager.begin();
        for i in 0..4u8 {
            let (_, pin) = cache.add_page(guard.operation(), file).unwrap();
            pin.write().as_bytes_mut()[0] = i;
        }
        guard.end(false).unwrap();

        // Every page is readable even though only two frames exist.
        for i in 0..4u8 {
            let pin = cache.load_for_read(file, PageId::new(i as u32)).unwrap();
            assert_eq!(pin.read().as_bytes()[0], i);
        }
    }

    #[test]
    fn test_all_pinned_exhausts_cache() {
        let (_dir, cache, manager) = setup(2);
        let file = cache.add_file("a.mvb").unwrap();

        let guard = manager.begin();
        let (_p0, _pin0) = cache.add_page(guard.operation(), file).unwrap();
        let (_p1, _pin1) = cache.add_page(guard.operation(), file).unwrap();
        assert!(matches!(
            cache.add_page(guard.operation(), file),
            Err(TreeError::CacheExhausted)
        ));
    }
}
