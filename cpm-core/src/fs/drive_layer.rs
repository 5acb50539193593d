//! The mountable unit behind a drive letter.
//!
//! A drive is always exactly one of a small, closed set of shapes: plain
//! in-memory storage, a read-only package, a copy-on-write overlay on some
//! other layer, or several layers merged into one search path. Because that
//! set is closed, a sum type is a better fit than a trait object: matching
//! on it is exhaustive, and there's no vtable indirection for the hot
//! read/write path.

use std::collections::{HashMap, HashSet};

use super::drive_fs::{to_8_3, DriveFS};
use super::memory_store::MemoryStore;
use crate::error::CpmResult;
use crate::package::PackageStore;

/// A mounted drive's backing storage.
pub enum DriveLayer {
    Memory(MemoryStore),
    Package(PackageStore),
    /// Copy-on-write: reads check the overlay map first, then `base`;
    /// writes land only in the overlay; deletes are tombstones over `base`.
    Overlay {
        base: Box<DriveLayer>,
        overlay: HashMap<String, Vec<u8>>,
        deleted: HashSet<String>,
    },
    /// Several layers consulted in order for reads (first hit wins); all
    /// writes and deletes go to the first layer.
    Merged(Vec<DriveLayer>),
}

impl DriveLayer {
    pub fn overlay(base: DriveLayer) -> Self {
        DriveLayer::Overlay {
            base: Box::new(base),
            overlay: HashMap::new(),
            deleted: HashSet::new(),
        }
    }

    pub fn merged(layers: Vec<DriveLayer>) -> Self {
        DriveLayer::Merged(layers)
    }

    /// True if this layer (or, for Overlay, its overlay map) rejects writes.
    pub fn is_read_only(&self) -> bool {
        match self {
            DriveLayer::Memory(_) => false,
            DriveLayer::Package(_) => true,
            DriveLayer::Overlay { .. } => false,
            DriveLayer::Merged(layers) => layers.first().is_none_or(DriveLayer::is_read_only),
        }
    }
}

impl DriveFS for DriveLayer {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        match self {
            DriveLayer::Memory(store) => store.read_file(name),
            DriveLayer::Package(store) => store.read_file(name),
            DriveLayer::Overlay {
                base,
                overlay,
                deleted,
            } => {
                let key = to_8_3(name);
                if deleted.contains(&key) {
                    return None;
                }
                overlay.get(&key).cloned().or_else(|| base.read_file(name))
            }
            DriveLayer::Merged(layers) => layers.iter().find_map(|layer| layer.read_file(name)),
        }
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> CpmResult<()> {
        match self {
            DriveLayer::Memory(store) => store.write_file(name, data),
            DriveLayer::Package(store) => store.write_file(name, data),
            DriveLayer::Overlay {
                overlay, deleted, ..
            } => {
                let key = to_8_3(name);
                deleted.remove(&key);
                overlay.insert(key, data.to_vec());
                Ok(())
            }
            DriveLayer::Merged(layers) => match layers.first_mut() {
                Some(layer) => layer.write_file(name, data),
                None => Err(crate::error::CpmError::FileNotFound(name.to_string())),
            },
        }
    }

    fn delete_file(&mut self, name: &str) -> bool {
        match self {
            DriveLayer::Memory(store) => store.delete_file(name),
            DriveLayer::Package(store) => store.delete_file(name),
            DriveLayer::Overlay {
                overlay,
                deleted,
                base,
            } => {
                let key = to_8_3(name);
                let existed = overlay.contains_key(&key) || base.exists(name);
                overlay.remove(&key);
                deleted.insert(key);
                existed
            }
            DriveLayer::Merged(layers) => layers
                .first_mut()
                .map(|layer| layer.delete_file(name))
                .unwrap_or(false),
        }
    }

    fn list_files(&self) -> Vec<String> {
        match self {
            DriveLayer::Memory(store) => store.list_files(),
            DriveLayer::Package(store) => store.list_files(),
            DriveLayer::Overlay {
                base,
                overlay,
                deleted,
            } => {
                let mut names: HashSet<String> = base.list_files().into_iter().collect();
                for name in overlay.keys() {
                    names.insert(name.clone());
                }
                for name in deleted {
                    names.remove(name);
                }
                names.into_iter().collect()
            }
            DriveLayer::Merged(layers) => {
                let mut seen = HashSet::new();
                let mut names = Vec::new();
                for layer in layers {
                    for name in layer.list_files() {
                        if seen.insert(name.clone()) {
                            names.push(name);
                        }
                    }
                }
                names
            }
        }
    }

    fn exists(&self, name: &str) -> bool {
        match self {
            DriveLayer::Memory(store) => store.exists(name),
            DriveLayer::Package(store) => store.exists(name),
            DriveLayer::Overlay {
                base,
                overlay,
                deleted,
            } => {
                let key = to_8_3(name);
                if deleted.contains(&key) {
                    return false;
                }
                overlay.contains_key(&key) || base.exists(name)
            }
            DriveLayer::Merged(layers) => layers.iter().any(|layer| layer.exists(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(files: &[(&str, &[u8])]) -> DriveLayer {
        let mut store = MemoryStore::new();
        for (name, data) in files {
            store.add_file(name, data.to_vec());
        }
        DriveLayer::Memory(store)
    }

    #[test]
    fn test_overlay_reads_fall_through_to_base() {
        let base = memory_with(&[("BASE.TXT", b"base")]);
        let overlay = DriveLayer::overlay(base);

        assert!(overlay.exists("BASE.TXT"));
        assert_eq!(overlay.read_file("BASE.TXT"), Some(b"base".to_vec()));
    }

    #[test]
    fn test_overlay_write_does_not_touch_base() {
        let base = memory_with(&[("FILE.TXT", b"original")]);
        let mut overlay = DriveLayer::overlay(base);
        overlay.write_file("FILE.TXT", b"modified").unwrap();

        assert_eq!(overlay.read_file("FILE.TXT"), Some(b"modified".to_vec()));
        if let DriveLayer::Overlay { base, .. } = &overlay {
            assert_eq!(base.read_file("FILE.TXT"), Some(b"original".to_vec()));
        } else {
            panic!("expected Overlay variant");
        }
    }

    #[test]
    fn test_overlay_delete_is_tombstone_over_base() {
        let base = memory_with(&[("FILE.TXT", b"content")]);
        let mut overlay = DriveLayer::overlay(base);
        assert!(overlay.delete_file("FILE.TXT"));
        assert!(!overlay.exists("FILE.TXT"));

        if let DriveLayer::Overlay { base, .. } = &overlay {
            assert!(base.exists("FILE.TXT"));
        } else {
            panic!("expected Overlay variant");
        }
    }

    #[test]
    fn test_overlay_write_clears_tombstone() {
        let base = memory_with(&[("FILE.TXT", b"original")]);
        let mut overlay = DriveLayer::overlay(base);
        overlay.delete_file("FILE.TXT");
        overlay.write_file("FILE.TXT", b"restored").unwrap();

        assert!(overlay.exists("FILE.TXT"));
        assert_eq!(overlay.read_file("FILE.TXT"), Some(b"restored".to_vec()));
    }

    #[test]
    fn test_merged_reads_first_match() {
        let first = memory_with(&[("A.TXT", b"from first")]);
        let second = memory_with(&[("A.TXT", b"from second"), ("B.TXT", b"only second")]);
        let merged = DriveLayer::merged(vec![first, second]);

        assert_eq!(merged.read_file("A.TXT"), Some(b"from first".to_vec()));
        assert_eq!(merged.read_file("B.TXT"), Some(b"only second".to_vec()));
    }

    #[test]
    fn test_merged_writes_go_to_first_layer() {
        let first = memory_with(&[]);
        let second = memory_with(&[]);
        let mut merged = DriveLayer::merged(vec![first, second]);
        merged.write_file("NEW.TXT", b"data").unwrap();

        if let DriveLayer::Merged(layers) = &merged {
            assert!(layers[0].exists("NEW.TXT"));
            assert!(!layers[1].exists("NEW.TXT"));
        } else {
            panic!("expected Merged variant");
        }
    }

    #[test]
    fn test_merged_list_files_deduplicates() {
        let first = memory_with(&[("A.TXT", b"1")]);
        let second = memory_with(&[("A.TXT", b"2"), ("B.TXT", b"3")]);
        let merged = DriveLayer::merged(vec![first, second]);

        let mut names = merged.list_files();
        names.sort();
        assert_eq!(names, vec!["A.TXT".to_string(), "B.TXT".to_string()]);
    }

    #[test]
    fn test_package_layer_is_read_only() {
        let layer = DriveLayer::Package(PackageStore::new());
        assert!(layer.is_read_only());
        assert!(!DriveLayer::Memory(MemoryStore::new()).is_read_only());
    }
}
