//! CP/M 2.2 BDOS Emulator Core
//!
//! This crate provides the core components for emulating CP/M 2.2:
//! - BDOS (Basic Disk Operating System) syscall handling
//! - Virtual filesystem with overlay support
//! - Console I/O abstraction
//!
//! # Architecture
//!
//! The emulator uses a layered design:
//! - `DriveFS` trait: Low-level whole-file drive filesystem (A-P)
//! - `DriveLayer`: Memory/Package/Overlay/Merged compositions of `DriveFS`
//! - `VirtualFilesystem` trait: Higher-level path- and handle-based filesystem
//! - `Workspace`: multi-drive `VirtualFilesystem` shared across sessions
//! - `CpmConsole` trait: Character I/O abstraction
//! - `CpmEmulator`: Integrates Z80 CPU with BDOS handling

pub mod bdos;
pub mod cbios;
pub mod console;
pub mod emulator;
pub mod error;
pub mod fs;
pub mod hexload;
pub mod package;
pub mod script;
pub mod workspace;

pub use cbios::CbiosFunction;
pub use console::{CpmConsole, HeadlessConsole, ScriptedConsole, WaitPattern};
pub use emulator::CpmEmulator;
pub use error::{CpmError, CpmResult};
pub use fs::{
    join_drive_path, normalize_path, split_drive_path, to_8_3, DriveFS, DriveLayer, FileStat,
    MemoryStore, OpenMode, VirtualFilesystem,
};
pub use package::{
    action_matches_file, expand_submit_template, load_package, load_package_from_path,
    load_packages, FileEntry, InteractiveStep, LoadedPackage, PackageAction, PackageManifest,
    PackageStore,
};
pub use script::{ScriptStep, ScriptedCompiler};
pub use workspace::{workspace_path, DriveConfig, FileChangeEvent, ShellInfo, Workspace, WorkspaceDrive};

/// Reason for program exit.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Warm boot (JP 0 or BDOS function 0)
    WarmBoot,
    /// CPU halted
    Halt,
    /// Error occurred
    Error(String),
}

/// Information about program exit.
#[derive(Debug, Clone)]
pub struct CpmExitInfo {
    pub reason: ExitReason,
    pub t_states: u64,
    pub pc: u16,
}
