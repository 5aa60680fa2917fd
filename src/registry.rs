//! The authoritative trace identifier → container mapping
//!
//! The registry is the only state shared between the directory watcher and
//! the request router. Its lock guards nothing but the two maps: container
//! starts and stops always happen outside it, so a slow launch never blocks
//! an unrelated lookup.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::RegistryError;
use crate::ident::TraceId;
use crate::runtime::ContainerHandle;

/// One registered trace: identifier, source directory, running container.
///
/// Entries exist only between a successful container start and the
/// processing of the directory's deletion event.
#[derive(Debug)]
pub struct TraceEntry {
    pub id: TraceId,
    pub dir: PathBuf,
    pub container: ContainerHandle,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<TraceId, Arc<TraceEntry>>,
    by_dir: HashMap<PathBuf, TraceId>,
}

/// In-memory registry with atomic operations.
///
/// Concurrent `lookup`s never block each other; a `lookup` racing a
/// mutation observes either the pre- or post-mutation state, never a
/// half-updated entry.
#[derive(Default)]
pub struct TraceRegistry {
    inner: RwLock<Inner>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry. Fails if the identifier or the directory is
    /// already registered; the caller still owns the container it started
    /// and must clean it up on rejection.
    pub fn register(&self, entry: TraceEntry) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&entry.id) {
            return Err(RegistryError::DuplicateId(entry.id));
        }
        if inner.by_dir.contains_key(&entry.dir) {
            return Err(RegistryError::DuplicateDir(entry.dir));
        }
        inner.by_dir.insert(entry.dir.clone(), entry.id.clone());
        inner.by_id.insert(entry.id.clone(), Arc::new(entry));
        Ok(())
    }

    /// Remove and return the entry for a directory.
    ///
    /// `None` is a normal outcome (duplicate deletion events, or a path
    /// that never was a trace).
    pub fn unregister(&self, dir: &Path) -> Option<Arc<TraceEntry>> {
        let mut inner = self.inner.write();
        let id = inner.by_dir.remove(dir)?;
        inner.by_id.remove(&id)
    }

    /// Resolve an identifier to its live entry. `None` maps to 404 at the
    /// router boundary.
    pub fn lookup(&self, id: &TraceId) -> Option<Arc<TraceEntry>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// Remove and return every entry, for the shutdown teardown.
    pub fn drain(&self) -> Vec<Arc<TraceEntry>> {
        let mut inner = self.inner.write();
        inner.by_dir.clear();
        inner.by_id.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id_byte: u8, dir: &str) -> TraceEntry {
        TraceEntry {
            id: TraceId::from_uuid_bytes(&[id_byte; 16]),
            dir: PathBuf::from(dir),
            container: ContainerHandle {
                id: format!("container-{}", id_byte),
                name: format!("tracegate-{}", id_byte),
            },
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TraceRegistry::new();
        let id = TraceId::from_uuid_bytes(&[1; 16]);

        assert!(registry.lookup(&id).is_none());
        registry.register(entry(1, "/traces/a")).unwrap();

        let found = registry.lookup(&id).unwrap();
        assert_eq!(found.dir, PathBuf::from("/traces/a"));
        assert_eq!(found.container.id, "container-1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let registry = TraceRegistry::new();
        registry.register(entry(1, "/traces/a")).unwrap();

        let err = registry.register(entry(1, "/traces/b")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
        // The original entry is untouched
        assert_eq!(registry.len(), 1);
        let found = registry
            .lookup(&TraceId::from_uuid_bytes(&[1; 16]))
            .unwrap();
        assert_eq!(found.dir, PathBuf::from("/traces/a"));
    }

    #[test]
    fn test_register_rejects_duplicate_dir() {
        let registry = TraceRegistry::new();
        registry.register(entry(1, "/traces/a")).unwrap();

        let err = registry.register(entry(2, "/traces/a")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateDir(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_removes_both_indexes() {
        let registry = TraceRegistry::new();
        registry.register(entry(1, "/traces/a")).unwrap();

        let removed = registry.unregister(Path::new("/traces/a")).unwrap();
        assert_eq!(removed.container.id, "container-1");
        assert!(registry.is_empty());
        assert!(registry
            .lookup(&TraceId::from_uuid_bytes(&[1; 16]))
            .is_none());

        // The directory can be registered again afterwards
        registry.register(entry(2, "/traces/a")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_unknown_is_none() {
        let registry = TraceRegistry::new();
        assert!(registry.unregister(Path::new("/traces/nope")).is_none());

        // Duplicate deletion event
        registry.register(entry(1, "/traces/a")).unwrap();
        assert!(registry.unregister(Path::new("/traces/a")).is_some());
        assert!(registry.unregister(Path::new("/traces/a")).is_none());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = TraceRegistry::new();
        registry.register(entry(1, "/traces/a")).unwrap();
        registry.register(entry(2, "/traces/b")).unwrap();

        let mut drained = registry.drain();
        drained.sort_by(|a, b| a.container.id.cmp(&b.container.id));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].container.id, "container-1");
        assert!(registry.is_empty());
        assert!(registry.unregister(Path::new("/traces/a")).is_none());
    }

    #[test]
    fn test_concurrent_register_unregister_single_live_entry() {
        // Interleaved register/unregister for the same directory: lookups
        // must only ever see a fully registered entry, and the directory
        // holds at most one entry at any time.
        let registry = Arc::new(TraceRegistry::new());
        let mut handles = Vec::new();

        for round in 0..8u8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u8 {
                    let byte = round.wrapping_mul(100).wrapping_add(i);
                    let e = entry(byte, "/traces/contended");
                    match registry.register(e) {
                        Ok(()) => {
                            let id = TraceId::from_uuid_bytes(&[byte; 16]);
                            if let Some(found) = registry.lookup(&id) {
                                assert_eq!(found.dir, PathBuf::from("/traces/contended"));
                            }
                            registry.unregister(Path::new("/traces/contended"));
                        }
                        Err(RegistryError::DuplicateDir(_)) => {}
                        Err(RegistryError::DuplicateId(_)) => {}
                    }
                    assert!(registry.len() <= 1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.len() <= 1);
    }
}
