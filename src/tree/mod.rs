//! The multi-value tree and its satellites.

mod cursor;
mod engine;
mod facade;
mod overflow;

pub use cursor::{KeyCursor, TreeCursor};
pub use engine::{MultiValueTree, TreeNode};
pub use facade::UniqueIndex;
pub use overflow::{OverflowContainer, OverflowKey};

/// Extension of the main index file
pub const DATA_FILE_EXT: &str = ".mvb";

/// Extension of the null-bucket file
pub const NULL_FILE_EXT: &str = ".nbt";

/// Extension of the overflow container file
pub const CONTAINER_FILE_EXT: &str = ".ovf";
