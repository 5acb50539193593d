//! Filesystem abstractions for CP/M emulator.
//!
//! - `DriveFS`: whole-file drive interface, implemented by each `DriveLayer`.
//! - `DriveLayer`: the mountable shape behind a drive letter (memory,
//!   package, overlay, or a merge of several).
//! - `MemoryStore`: in-memory `DriveFS` with live-file overrides.
//! - `VirtualFilesystem`: path- and handle-based view exposed by `Workspace`.

mod drive_fs;
mod drive_layer;
mod memory_store;
mod vfs;

pub use drive_fs::{to_8_3, DriveFS};
pub use drive_layer::DriveLayer;
pub use memory_store::{LiveSource, MemoryStore};
pub use vfs::{join_drive_path, normalize_path, split_drive_path, FileStat, OpenMode, VirtualFilesystem};
