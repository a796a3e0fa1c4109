//! Storage layer: file registry and page I/O.

mod disk;

pub use disk::{DiskManager, FileDiskManager};
