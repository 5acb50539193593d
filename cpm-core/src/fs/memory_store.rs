//! In-memory filesystem implementation with live-file overrides.

use std::collections::HashMap;
use std::sync::Arc;

use super::drive_fs::{to_8_3, DriveFS};
use crate::error::CpmResult;

/// A callable that returns the current bytes of a live-backed file.
pub type LiveSource = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Simple in-memory filesystem for a drive, with optional live-file sources.
///
/// A live source is consulted ahead of static content on read. Writing
/// through a live path demotes it to static storage with the new content;
/// `freeze_live_file` takes a one-shot snapshot without supplying new bytes.
#[derive(Default, Clone)]
pub struct MemoryStore {
    files: HashMap<String, Vec<u8>>,
    live: HashMap<String, LiveSource>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with initial files.
    pub fn with_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: AsRef<str>,
    {
        let files = files
            .into_iter()
            .map(|(k, v)| (to_8_3(k.as_ref()), v))
            .collect();
        Self {
            files,
            live: HashMap::new(),
        }
    }

    /// Add a file (convenience method).
    pub fn add_file(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        let key = to_8_3(name);
        self.live.remove(&key);
        self.files.insert(key, data.into());
    }

    /// Add a file from string content.
    pub fn add_file_str(&mut self, name: &str, content: &str) {
        self.add_file(name, content.as_bytes().to_vec());
    }

    /// Register a live source for `name`: reads call `source()` for the
    /// current bytes until the path is written through or frozen.
    pub fn add_live_file(&mut self, name: &str, source: LiveSource) {
        let key = to_8_3(name);
        self.files.remove(&key);
        self.live.insert(key, source);
    }

    /// Snapshot a live file's current bytes and demote it to static storage.
    /// A no-op if `name` has no live source.
    pub fn freeze_live_file(&mut self, name: &str) {
        let key = to_8_3(name);
        if let Some(source) = self.live.remove(&key) {
            self.files.insert(key, source());
        }
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.contains_key(&to_8_3(name))
    }
}

impl DriveFS for MemoryStore {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        let key = to_8_3(name);
        if let Some(source) = self.live.get(&key) {
            return Some(source());
        }
        self.files.get(&key).cloned()
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> CpmResult<()> {
        let key = to_8_3(name);
        self.live.remove(&key);
        self.files.insert(key, data.to_vec());
        Ok(())
    }

    fn delete_file(&mut self, name: &str) -> bool {
        let key = to_8_3(name);
        let existed = self.files.remove(&key).is_some();
        let had_live = self.live.remove(&key).is_some();
        existed || had_live
    }

    fn list_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.keys().cloned().collect();
        for name in self.live.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    fn exists(&self, name: &str) -> bool {
        let key = to_8_3(name);
        self.files.contains_key(&key) || self.live.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_file() {
        let mut fs = MemoryStore::new();
        fs.write_file("TEST.COM", &[0xC9]).unwrap();

        assert!(fs.exists("TEST.COM"));
        assert!(fs.exists("test.com")); // Case insensitive
        assert_eq!(fs.read_file("TEST.COM"), Some(vec![0xC9]));
    }

    #[test]
    fn test_delete_file() {
        let mut fs = MemoryStore::new();
        fs.write_file("TEST.COM", &[0xC9]).unwrap();

        assert!(fs.delete_file("TEST.COM"));
        assert!(!fs.exists("TEST.COM"));
        assert!(!fs.delete_file("NOTEXIST.COM"));
    }

    #[test]
    fn test_list_files() {
        let mut fs = MemoryStore::new();
        fs.add_file("A.COM", vec![1]);
        fs.add_file("B.TXT", vec![2]);

        let files = fs.list_files();
        assert_eq!(files.len(), 2);
        assert!(files.contains(&"A.COM".to_string()));
        assert!(files.contains(&"B.TXT".to_string()));
    }

    #[test]
    fn test_with_files() {
        let fs =
            MemoryStore::with_files([("test.com", vec![0xC9]), ("hello.txt", b"Hello".to_vec())]);

        assert!(fs.exists("TEST.COM"));
        assert!(fs.exists("HELLO.TXT"));
    }

    #[test]
    fn test_live_source_read() {
        let mut fs = MemoryStore::new();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter2 = counter.clone();
        fs.add_live_file(
            "LIVE.TXT",
            Arc::new(move || {
                let n = counter2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                format!("call {n}").into_bytes()
            }),
        );

        assert_eq!(fs.read_file("LIVE.TXT"), Some(b"call 0".to_vec()));
        assert_eq!(fs.read_file("LIVE.TXT"), Some(b"call 1".to_vec()));
    }

    #[test]
    fn test_write_demotes_live_source() {
        let mut fs = MemoryStore::new();
        fs.add_live_file("LIVE.TXT", Arc::new(|| b"live".to_vec()));
        fs.write_file("LIVE.TXT", b"frozen").unwrap();

        assert!(!fs.is_live("LIVE.TXT"));
        assert_eq!(fs.read_file("LIVE.TXT"), Some(b"frozen".to_vec()));
    }

    #[test]
    fn test_freeze_live_file_snapshot() {
        let mut fs = MemoryStore::new();
        let n = Arc::new(std::sync::atomic::AtomicU32::new(10));
        let n2 = n.clone();
        fs.add_live_file(
            "LIVE.TXT",
            Arc::new(move || n2.load(std::sync::atomic::Ordering::SeqCst).to_string().into_bytes()),
        );
        n.store(42, std::sync::atomic::Ordering::SeqCst);
        fs.freeze_live_file("LIVE.TXT");
        n.store(99, std::sync::atomic::Ordering::SeqCst);

        assert!(!fs.is_live("LIVE.TXT"));
        assert_eq!(fs.read_file("LIVE.TXT"), Some(b"42".to_vec()));
    }
}
