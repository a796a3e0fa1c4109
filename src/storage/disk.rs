//! Disk manager.
//!
//! Owns the index files of a storage directory and reads/writes whole
//! pages. The trait keeps the rest of the engine testable against mock
//! backends; the stock implementation maps each registered name to one
//! file on disk.

use crate::error::{Result, TreeError};
use crate::page::PageBuf;
use crate::types::{FileId, PageId, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Trait for page-granular file I/O
pub trait DiskManager: Send + Sync {
    /// Create a new file under the given name
    fn add_file(&self, name: &str) -> Result<FileId>;

    /// Open an existing file
    fn open_file(&self, name: &str) -> Result<FileId>;

    /// Read one page
    fn read_page(&self, file: FileId, page: PageId) -> Result<PageBuf>;

    /// Write one page
    fn write_page(&self, file: FileId, page: PageId, data: &[u8]) -> Result<()>;

    /// Extend the file by one zeroed page, returning its index
    fn allocate_page(&self, file: FileId) -> Result<PageId>;

    /// Number of pages the file holds on disk
    fn page_count(&self, file: FileId) -> Result<u32>;

    /// Flush the file's data to stable storage
    fn sync_file(&self, file: FileId) -> Result<()>;

    /// Flush and forget the file
    fn close_file(&self, file: FileId) -> Result<()>;

    /// Remove the file from disk
    fn delete_file(&self, file: FileId) -> Result<()>;
}

struct FileState {
    file: File,
    path: PathBuf,
    name: String,
    page_count: u32,
}

/// File-backed disk manager over one storage directory
pub struct FileDiskManager {
    dir: PathBuf,
    files: RwLock<HashMap<FileId, Arc<Mutex<FileState>>>>,
    by_name: RwLock<HashMap<String, FileId>>,
    next_id: Mutex<u32>,
}

impl FileDiskManager {
    /// Create a disk manager rooted at `dir` (created if missing)
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            next_id: Mutex::new(0),
        })
    }

    /// The storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn register(&self, name: &str, file: File, page_count: u32) -> FileId {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            FileId(*next)
        };
        let state = FileState {
            file,
            path: self.dir.join(name),
            name: name.to_string(),
            page_count,
        };
        self.files.write().insert(id, Arc::new(Mutex::new(state)));
        self.by_name.write().insert(name.to_string(), id);
        id
    }

    fn state(&self, file: FileId) -> Result<Arc<Mutex<FileState>>> {
        self.files
            .read()
            .get(&file)
            .cloned()
            .ok_or_else(|| TreeError::invalid_operation(format!("file {file} is not registered")))
    }

    fn unregister(&self, file: FileId) -> Result<Arc<Mutex<FileState>>> {
        let state = self
            .files
            .write()
            .remove(&file)
            .ok_or_else(|| TreeError::invalid_operation(format!("file {file} is not registered")))?;
        let name = state.lock().name.clone();
        self.by_name.write().remove(&name);
        Ok(state)
    }
}

impl DiskManager for FileDiskManager {
    fn add_file(&self, name: &str) -> Result<FileId> {
        if self.by_name.read().contains_key(name) {
            return Err(TreeError::invalid_operation(format!(
                "file '{name}' is already registered"
            )));
        }
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(self.register(name, file, 0))
    }

    fn open_file(&self, name: &str) -> Result<FileId> {
        if let Some(&id) = self.by_name.read().get(name) {
            return Ok(id);
        }
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(TreeError::invalid_file(format!(
                "file '{name}' does not exist in {}",
                self.dir.display()
            )));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(TreeError::invalid_file(format!(
                "file '{name}' length {len} is not page-aligned"
            )));
        }
        Ok(self.register(name, file, (len / PAGE_SIZE as u64) as u32))
    }

    fn read_page(&self, file: FileId, page: PageId) -> Result<PageBuf> {
        let state = self.state(file)?;
        let mut state = state.lock();
        if page.index() >= state.page_count {
            return Err(TreeError::PageNotFound(page));
        }
        let mut buf = PageBuf::zeroed();
        state.file.seek(SeekFrom::Start(page.file_offset(PAGE_SIZE)))?;
        state.file.read_exact(buf.as_bytes_mut())?;
        Ok(buf)
    }

    fn write_page(&self, file: FileId, page: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(TreeError::invalid_operation(format!(
                "page data must be {PAGE_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let state = self.state(file)?;
        let mut state = state.lock();
        if page.index() >= state.page_count {
            return Err(TreeError::PageNotFound(page));
        }
        state.file.seek(SeekFrom::Start(page.file_offset(PAGE_SIZE)))?;
        state.file.write_all(data)?;
        Ok(())
    }

    fn allocate_page(&self, file: FileId) -> Result<PageId> {
        let state = self.state(file)?;
        let mut state = state.lock();
        let page = PageId::new(state.page_count);
        state.file.seek(SeekFrom::Start(page.file_offset(PAGE_SIZE)))?;
        state.file.write_all(&[0u8; PAGE_SIZE])?;
        state.page_count += 1;
        Ok(page)
    }

    fn page_count(&self, file: FileId) -> Result<u32> {
        Ok(self.state(file)?.lock().page_count)
    }

    fn sync_file(&self, file: FileId) -> Result<()> {
        self.state(file)?.lock().file.sync_data()?;
        Ok(())
    }

    fn close_file(&self, file: FileId) -> Result<()> {
        let state = self.unregister(file)?;
        state.lock().file.sync_all()?;
        Ok(())
    }

    fn delete_file(&self, file: FileId) -> Result<()> {
        let state = self.unregister(file)?;
        let path = state.lock().path.clone();
        drop(state);
        std::fs::remove_file(path)?;
        Ok(())
    }
}
