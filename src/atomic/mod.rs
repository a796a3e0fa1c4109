//! Atomic operations.
//!
//! Every mutation of a tree runs inside an atomic operation: page writes
//! capture before-images on first touch, logical mutations buffer
//! component records, and the outermost `end` either commits (records hit
//! the log) or rolls back (before-images are restored into the cache).
//!
//! Operations nest: a public operation that calls into another component
//! joins the already-running operation of its thread, and only the
//! outermost end decides the outcome.

mod wal;

pub use wal::{read_log, ComponentRecord, RecordBody, WalWriter};

use crate::buffer::{CacheKey, PageCache};
use crate::error::Result;
use crate::page::PageBuf;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// State of one in-flight atomic operation
pub struct AtomicOperation {
    undo: Mutex<HashMap<CacheKey, PageBuf>>,
    records: Mutex<Vec<ComponentRecord>>,
    rollback: AtomicBool,
}

impl AtomicOperation {
    fn new() -> Self {
        Self {
            undo: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            rollback: AtomicBool::new(false),
        }
    }

    /// Remember the page's pre-operation content. Only the first image per
    /// page is kept.
    pub fn capture_before_image(&self, key: CacheKey, page: &PageBuf) {
        self.undo.lock().entry(key).or_insert_with(|| page.clone());
    }

    /// Buffer a component record for the commit
    pub fn add_component_record(&self, record: ComponentRecord) {
        self.records.lock().push(record);
    }

    /// Request a rollback at the outermost end
    pub fn request_rollback(&self) {
        self.rollback.store(true, Ordering::SeqCst);
    }

    fn rollback_requested(&self) -> bool {
        self.rollback.load(Ordering::SeqCst)
    }
}

struct CurrentOp {
    op: Arc<AtomicOperation>,
    depth: usize,
    owner: ThreadId,
}

/// Coordinates atomic operations, the component log, and per-tree locks
pub struct AtomicOperationManager {
    cache: Arc<PageCache>,
    wal: WalWriter,
    current: Mutex<Option<CurrentOp>>,
    serial: Mutex<()>,
    component_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl AtomicOperationManager {
    /// Create a manager logging to `log_path`. With `sync_on_commit`
    /// every commit forces the log to stable storage.
    pub fn new(cache: Arc<PageCache>, log_path: &Path, sync_on_commit: bool) -> Result<Self> {
        Ok(Self {
            cache,
            wal: WalWriter::open(log_path, sync_on_commit)?,
            current: Mutex::new(None),
            serial: Mutex::new(()),
            component_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The read/write lock serializing operations against one tree
    pub fn component_lock(&self, name: &str) -> Arc<RwLock<()>> {
        self.component_locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Start an atomic operation, joining the thread's running one if any
    pub fn begin(&self) -> OperationGuard<'_> {
        {
            let mut current = self.current.lock();
            if let Some(running) = current.as_mut() {
                if running.owner == thread::current().id() {
                    running.depth += 1;
                    return OperationGuard {
                        manager: self,
                        op: running.op.clone(),
                        _serial: None,
                        finished: false,
                    };
                }
            }
        }

        // Outermost operation of this thread: wait for other writers.
        let serial = self.serial.lock();
        let op = Arc::new(AtomicOperation::new());
        *self.current.lock() = Some(CurrentOp {
            op: op.clone(),
            depth: 1,
            owner: thread::current().id(),
        });
        OperationGuard {
            manager: self,
            op,
            _serial: Some(serial),
            finished: false,
        }
    }

    fn finish(&self, rollback: bool) -> Result<()> {
        let finished = {
            let mut current = self.current.lock();
            let Some(running) = current.as_mut() else {
                return Ok(());
            };
            if rollback {
                running.op.request_rollback();
            }
            running.depth -= 1;
            if running.depth == 0 {
                current.take()
            } else {
                None
            }
        };

        let Some(running) = finished else {
            return Ok(());
        };

        if running.op.rollback_requested() {
            self.rollback(&running.op)
        } else {
            self.commit(&running.op)
        }
    }

    fn commit(&self, op: &AtomicOperation) -> Result<()> {
        let records = std::mem::take(&mut *op.records.lock());
        self.wal.append(&records)
    }

    fn rollback(&self, op: &AtomicOperation) -> Result<()> {
        let undo = std::mem::take(&mut *op.undo.lock());
        op.records.lock().clear();
        for (key, image) in undo {
            self.cache.restore_page(key, &image)?;
        }
        Ok(())
    }
}

/// Handle to a running atomic operation.
///
/// Dropping the guard without calling [`OperationGuard::end`] rolls the
/// operation back.
pub struct OperationGuard<'a> {
    manager: &'a AtomicOperationManager,
    op: Arc<AtomicOperation>,
    _serial: Option<MutexGuard<'a, ()>>,
    finished: bool,
}

impl<'a> OperationGuard<'a> {
    /// The operation's shared state, for page writes and record buffering
    pub fn operation(&self) -> &Arc<AtomicOperation> {
        &self.op
    }

    /// Finish this nesting level. With `rollback` true (or if any level
    /// requested it) the outermost end restores every touched page.
    pub fn end(mut self, rollback: bool) -> Result<()> {
        self.finished = true;
        self.manager.finish(rollback)
    }
}

impl<'a> Drop for OperationGuard<'a> {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned guard: fail safe by rolling back.
            let _ = self.manager.finish(true);
        }
    }
}
