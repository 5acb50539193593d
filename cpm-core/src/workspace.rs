//! CP/M Workspace - Shared environment for multiple terminals.
//!
//! A Workspace provides:
//! - Drive mappings (A-P) backed by DriveFS implementations
//! - Shared state across multiple emulator instances
//! - File change notifications
//!
//! Multiple terminals can attach to the same workspace and see changes instantly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{CpmError, CpmResult};
use crate::fs::{
    join_drive_path, split_drive_path, DriveFS, DriveLayer, FileStat, MemoryStore, OpenMode,
    VirtualFilesystem,
};
use crate::package::{LoadedPackage, PackageStore};

/// Drive configuration.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// Drive letter (A-P)
    pub letter: char,
    /// Package names loaded on this drive
    pub packages: Vec<String>,
    /// Whether the drive has a writable overlay layer
    pub writable: bool,
}

/// Shell information found in a workspace.
#[derive(Debug, Clone)]
pub struct ShellInfo {
    /// Shell binary data
    pub binary: Vec<u8>,
    /// Shell filename (e.g., "CCP.COM")
    pub filename: String,
    /// Drive letter where shell was found
    pub drive: char,
    /// Load address (default 0x100 for TPA, or custom like 0xDC00)
    pub load_address: u16,
    /// Package name that provided the shell
    pub package_name: String,
}

/// File change event.
#[derive(Debug, Clone)]
pub enum FileChangeEvent {
    Write { drive: char, filename: String },
    Delete { drive: char, filename: String },
    Rename { drive: char, old_name: String, new_name: String },
}

/// An open handle tracked by the `VirtualFilesystem` implementation.
struct OpenFile {
    drive: usize,
    name: String,
    position: u64,
}

/// Shared workspace state (interior of Arc<RwLock<...>>).
struct WorkspaceInner {
    /// Drive filesystems (A=0, B=1, ..., P=15)
    drives: [Option<DriveLayer>; 16],
    /// Drive configurations
    configs: HashMap<char, DriveConfig>,
    /// Loaded packages cache
    package_cache: HashMap<String, LoadedPackage>,
    /// Open file handles, keyed by handle number.
    open_files: HashMap<u32, OpenFile>,
    /// Next handle number to hand out.
    next_handle: u32,
}

impl Default for WorkspaceInner {
    fn default() -> Self {
        Self {
            drives: Default::default(),
            configs: HashMap::new(),
            package_cache: HashMap::new(),
            open_files: HashMap::new(),
            next_handle: 1,
        }
    }
}

/// CP/M Workspace - shared environment for multiple terminals.
///
/// Workspaces are thread-safe and can be shared across multiple emulator instances.
/// Clone is cheap (just clones the Arc).
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<RwLock<WorkspaceInner>>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    /// Create a new empty workspace.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(WorkspaceInner::default())),
        }
    }

    /// Mount a filesystem to a drive letter (A-P).
    pub fn mount(&self, letter: char, fs: DriveLayer) -> CpmResult<()> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        inner.drives[idx] = Some(fs);
        Ok(())
    }

    /// Unmount a drive, closing any handles open on it.
    pub fn unmount(&self, letter: char) -> CpmResult<()> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        inner.drives[idx] = None;
        inner.configs.remove(&letter.to_ascii_uppercase());
        inner.open_files.retain(|_, f| f.drive != idx);
        Ok(())
    }

    /// Check if a drive is mounted.
    pub fn is_mounted(&self, letter: char) -> bool {
        if let Ok(idx) = drive_index(letter) {
            if let Ok(inner) = self.inner.read() {
                return inner.drives[idx].is_some();
            }
        }
        false
    }

    /// Read a file from a drive.
    pub fn read_file(&self, letter: char, name: &str) -> Option<Vec<u8>> {
        let idx = drive_index(letter).ok()?;
        let inner = self.inner.read().ok()?;
        inner.drives[idx].as_ref()?.read_file(name)
    }

    /// Write a file to a drive.
    pub fn write_file(&self, letter: char, name: &str, data: &[u8]) -> CpmResult<()> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        if let Some(ref mut fs) = inner.drives[idx] {
            fs.write_file(name, data)
        } else {
            Err(CpmError::DriveNotMounted(letter))
        }
    }

    /// Delete a file from a drive.
    pub fn delete_file(&self, letter: char, name: &str) -> CpmResult<bool> {
        let idx = drive_index(letter)?;
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        if let Some(ref mut fs) = inner.drives[idx] {
            Ok(fs.delete_file(name))
        } else {
            Err(CpmError::DriveNotMounted(letter))
        }
    }

    /// List files on a drive.
    pub fn list_files(&self, letter: char) -> CpmResult<Vec<String>> {
        let idx = drive_index(letter)?;
        let inner = self.inner.read().map_err(|_| CpmError::LockPoisoned)?;
        if let Some(ref fs) = inner.drives[idx] {
            Ok(fs.list_files())
        } else {
            Err(CpmError::DriveNotMounted(letter))
        }
    }

    /// Check if a file exists on a drive.
    pub fn file_exists(&self, letter: char, name: &str) -> bool {
        if let Ok(idx) = drive_index(letter) {
            if let Ok(inner) = self.inner.read() {
                if let Some(ref fs) = inner.drives[idx] {
                    return fs.exists(name);
                }
            }
        }
        false
    }

    /// Get list of mounted drives.
    pub fn mounted_drives(&self) -> Vec<char> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return vec![],
        };
        inner
            .drives
            .iter()
            .enumerate()
            .filter_map(|(i, d)| {
                if d.is_some() {
                    Some((b'A' + i as u8) as char)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Configure a drive with packages.
    pub fn configure_drive(&self, config: DriveConfig, packages: Vec<LoadedPackage>) -> CpmResult<()> {
        let letter = config.letter.to_ascii_uppercase();
        let idx = drive_index(letter)?;

        let base_fs = DriveLayer::Package(PackageStore::from_packages(packages));
        let fs = if config.writable {
            DriveLayer::overlay(base_fs)
        } else {
            base_fs
        };

        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        inner.drives[idx] = Some(fs);
        inner.configs.insert(letter, config);
        Ok(())
    }

    /// Get drive configuration.
    pub fn get_drive_config(&self, letter: char) -> Option<DriveConfig> {
        let inner = self.inner.read().ok()?;
        inner.configs.get(&letter.to_ascii_uppercase()).cloned()
    }

    /// Cache a loaded package.
    pub fn cache_package(&self, name: &str, pkg: LoadedPackage) {
        if let Ok(mut inner) = self.inner.write() {
            inner.package_cache.insert(name.to_lowercase(), pkg);
        }
    }

    /// Get a cached package.
    pub fn get_cached_package(&self, name: &str) -> Option<LoadedPackage> {
        let inner = self.inner.read().ok()?;
        inner.package_cache.get(&name.to_lowercase()).cloned()
    }

    /// Find a shell from mounted packages.
    ///
    /// Searches all drives for packages with shell metadata:
    /// - File entry with type: "shell" and optional loadAddress
    pub fn find_shell(&self) -> Option<ShellInfo> {
        let inner = self.inner.read().ok()?;

        for (i, drive_opt) in inner.drives.iter().enumerate() {
            let Some(drive) = drive_opt else { continue };
            let letter = (b'A' + i as u8) as char;

            // Try to get packages from the drive
            // This is a bit awkward since we need to downcast
            // For now, check the drive config for package names
            if let Some(config) = inner.configs.get(&letter) {
                for pkg_name in &config.packages {
                    if let Some(pkg) = inner.package_cache.get(&pkg_name.to_lowercase()) {
                        // Check for shell in manifest
                        for file_entry in &pkg.manifest.files {
                            if file_entry.file_type.as_deref() == Some("shell") {
                                let filename = crate::fs::to_8_3(&file_entry.src);
                                if let Some(data) = pkg.files.get(&filename) {
                                    let load_address = file_entry
                                        .load_address
                                        .as_ref()
                                        .and_then(|s| {
                                            let s = s.trim_start_matches("0x").trim_start_matches("0X");
                                            u16::from_str_radix(s, 16).ok()
                                        })
                                        .unwrap_or(0x0100);

                                    return Some(ShellInfo {
                                        binary: data.clone(),
                                        filename,
                                        drive: letter,
                                        load_address,
                                        package_name: pkg.manifest.name.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }

            // Fallback: look for known shell names
            let shell_names = ["XCCP.COM", "CCP.COM", "ZCCP.COM"];
            for name in shell_names {
                if let Some(data) = drive.read_file(name) {
                    return Some(ShellInfo {
                        binary: data,
                        filename: name.to_string(),
                        drive: letter,
                        load_address: 0x0100,
                        package_name: "unknown".to_string(),
                    });
                }
            }
        }

        None
    }

    /// Create a simple writable drive with an empty MemoryStore.
    pub fn create_memory_drive(&self, letter: char) -> CpmResult<()> {
        let idx = drive_index(letter)?;
        let fs = DriveLayer::Memory(MemoryStore::new());
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        inner.drives[idx] = Some(fs);
        Ok(())
    }

    /// A `DriveFS` view of `letter`, suitable for mounting onto a
    /// `CpmEmulator` (via `CpmEmulator::mount`) while this workspace stays
    /// shared with other terminals.
    pub fn drive_view(&self, letter: char) -> WorkspaceDrive {
        WorkspaceDrive {
            workspace: self.clone(),
            letter: letter.to_ascii_uppercase(),
        }
    }
}

/// A single-drive `DriveFS` view backed by a shared `Workspace`: mounting
/// this onto a `CpmEmulator` lets the emulator see writes made by any other
/// terminal attached to the same workspace, and vice versa.
#[derive(Clone)]
pub struct WorkspaceDrive {
    workspace: Workspace,
    letter: char,
}

impl DriveFS for WorkspaceDrive {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        self.workspace.read_file(self.letter, name)
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> CpmResult<()> {
        self.workspace.write_file(self.letter, name, data)
    }

    fn delete_file(&mut self, name: &str) -> bool {
        self.workspace.delete_file(self.letter, name).unwrap_or(false)
    }

    fn list_files(&self) -> Vec<String> {
        self.workspace.list_files(self.letter).unwrap_or_default()
    }

    fn exists(&self, name: &str) -> bool {
        self.workspace.file_exists(self.letter, name)
    }
}

impl VirtualFilesystem for Workspace {
    fn open(&mut self, path: &str, mode: OpenMode) -> CpmResult<u32> {
        let (drive, name) = split_drive_path(path).ok_or_else(|| CpmError::FileNotFound(path.to_string()))?;
        let letter = (b'A' + drive as u8) as char;
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        let fs = inner.drives[drive]
            .as_mut()
            .ok_or(CpmError::DriveNotMounted(letter))?;

        match mode {
            OpenMode::Read => {
                if !fs.exists(&name) {
                    return Err(CpmError::FileNotFound(name));
                }
            }
            OpenMode::Create => {
                fs.write_file(&name, &[])?;
            }
            OpenMode::ReadWrite => {
                if !fs.exists(&name) {
                    fs.write_file(&name, &[])?;
                }
            }
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.open_files.insert(
            handle,
            OpenFile {
                drive,
                name,
                position: 0,
            },
        );
        Ok(handle)
    }

    fn close(&mut self, handle: u32) {
        if let Ok(mut inner) = self.inner.write() {
            inner.open_files.remove(&handle);
        }
    }

    fn close_all(&mut self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.open_files.clear();
        }
    }

    fn read(&mut self, handle: u32, buf: &mut [u8]) -> CpmResult<usize> {
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        let (drive, name, position) = {
            let file = inner
                .open_files
                .get(&handle)
                .ok_or(CpmError::InvalidHandle(handle))?;
            (file.drive, file.name.clone(), file.position)
        };
        let fs = inner.drives[drive].as_ref().ok_or(CpmError::InvalidHandle(handle))?;
        let data = fs.read_file(&name).ok_or_else(|| CpmError::FileNotFound(name.clone()))?;

        let start = position as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let end = (start + buf.len()).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        if let Some(file) = inner.open_files.get_mut(&handle) {
            file.position += n as u64;
        }
        Ok(n)
    }

    fn write(&mut self, handle: u32, buf: &[u8]) -> CpmResult<()> {
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        let (drive, name, position) = {
            let file = inner
                .open_files
                .get(&handle)
                .ok_or(CpmError::InvalidHandle(handle))?;
            (file.drive, file.name.clone(), file.position)
        };
        let fs = inner.drives[drive].as_mut().ok_or(CpmError::InvalidHandle(handle))?;
        let mut data = fs.read_file(&name).unwrap_or_default();

        let start = position as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        fs.write_file(&name, &data)?;

        if let Some(file) = inner.open_files.get_mut(&handle) {
            file.position += buf.len() as u64;
        }
        Ok(())
    }

    fn stat(&self, handle: u32) -> CpmResult<FileStat> {
        let inner = self.inner.read().map_err(|_| CpmError::LockPoisoned)?;
        let file = inner
            .open_files
            .get(&handle)
            .ok_or(CpmError::InvalidHandle(handle))?;
        let fs = inner.drives[file.drive].as_ref().ok_or(CpmError::InvalidHandle(handle))?;
        let data = fs.read_file(&file.name).ok_or_else(|| CpmError::FileNotFound(file.name.clone()))?;
        Ok(FileStat {
            size: data.len() as u64,
            read_only: fs.is_read_only(),
        })
    }

    fn unlink(&mut self, path: &str) -> CpmResult<()> {
        let (drive, name) = split_drive_path(path).ok_or_else(|| CpmError::FileNotFound(path.to_string()))?;
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        inner.open_files.retain(|_, f| !(f.drive == drive && f.name == name));
        let fs = inner.drives[drive].as_mut().ok_or(CpmError::FileNotFound(path.to_string()))?;
        if fs.delete_file(&name) {
            Ok(())
        } else {
            Err(CpmError::FileNotFound(path.to_string()))
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> CpmResult<()> {
        let (drive, old_name) = split_drive_path(from).ok_or_else(|| CpmError::FileNotFound(from.to_string()))?;
        let (to_drive, new_name) = split_drive_path(to).ok_or_else(|| CpmError::FileNotFound(to.to_string()))?;
        if drive != to_drive {
            return Err(CpmError::InvalidDrive((b'A' + to_drive as u8) as char));
        }
        let mut inner = self.inner.write().map_err(|_| CpmError::LockPoisoned)?;
        let fs = inner.drives[drive].as_mut().ok_or(CpmError::FileNotFound(from.to_string()))?;
        let data = fs.read_file(&old_name).ok_or_else(|| CpmError::FileNotFound(from.to_string()))?;
        fs.write_file(&new_name, &data)?;
        fs.delete_file(&old_name);
        for file in inner.open_files.values_mut() {
            if file.drive == drive && file.name == old_name {
                file.name = new_name.clone();
            }
        }
        Ok(())
    }

    fn readdir(&self, drive_path: &str) -> CpmResult<Vec<String>> {
        let (drive, _) = split_drive_path(drive_path).ok_or_else(|| CpmError::FileNotFound(drive_path.to_string()))?;
        let letter = (b'A' + drive as u8) as char;
        let inner = self.inner.read().map_err(|_| CpmError::LockPoisoned)?;
        let fs = inner.drives[drive].as_ref().ok_or(CpmError::DriveNotMounted(letter))?;
        Ok(fs.list_files())
    }

    fn exists(&self, path: &str) -> bool {
        let Some((drive, name)) = split_drive_path(path) else {
            return false;
        };
        let Ok(inner) = self.inner.read() else {
            return false;
        };
        inner.drives[drive]
            .as_ref()
            .map(|fs| fs.exists(&name))
            .unwrap_or(false)
    }
}

/// Convenience for building a canonical path into a workspace drive.
pub fn workspace_path(drive: usize, name: &str) -> CpmResult<String> {
    join_drive_path(drive, name)
}

/// Convert drive letter to index (A=0, B=1, ..., P=15).
fn drive_index(letter: char) -> CpmResult<usize> {
    let upper = letter.to_ascii_uppercase();
    if upper >= 'A' && upper <= 'P' {
        Ok((upper as u8 - b'A') as usize)
    } else {
        Err(CpmError::InvalidDrive(letter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_mount_unmount() {
        let ws = Workspace::new();

        // Mount A:
        ws.create_memory_drive('A').unwrap();
        assert!(ws.is_mounted('A'));
        assert!(!ws.is_mounted('B'));

        // Write and read
        ws.write_file('A', "TEST.TXT", b"Hello").unwrap();
        let data = ws.read_file('A', "TEST.TXT").unwrap();
        assert_eq!(data, b"Hello");

        // Unmount
        ws.unmount('A').unwrap();
        assert!(!ws.is_mounted('A'));
    }

    #[test]
    fn test_workspace_shared() {
        let ws1 = Workspace::new();
        let ws2 = ws1.clone(); // Cheap clone (Arc)

        ws1.create_memory_drive('A').unwrap();
        ws1.write_file('A', "TEST.TXT", b"Hello from ws1").unwrap();

        // ws2 sees the same data
        let data = ws2.read_file('A', "TEST.TXT").unwrap();
        assert_eq!(data, b"Hello from ws1");

        // ws2 writes, ws1 sees it
        ws2.write_file('A', "TEST.TXT", b"Modified by ws2").unwrap();
        let data = ws1.read_file('A', "TEST.TXT").unwrap();
        assert_eq!(data, b"Modified by ws2");
    }

    #[test]
    fn test_drive_index() {
        assert_eq!(drive_index('A').unwrap(), 0);
        assert_eq!(drive_index('a').unwrap(), 0);
        assert_eq!(drive_index('P').unwrap(), 15);
        assert!(drive_index('Q').is_err());
        assert!(drive_index('Z').is_err());
    }
}
