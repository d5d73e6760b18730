//! On-disk object cache and the registry of compiled modules

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use oc_core::config::CacheConfig;
use oc_core::error::JitError;
use oc_core::jit_debug;
use parking_lot::Mutex;

use crate::backend::ObjectCode;

/// Directory of compiled objects keyed by object name
#[derive(Debug, Clone)]
pub struct ObjectCache {
    directory: Option<PathBuf>,
}

impl ObjectCache {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
        }
    }

    /// Cache that never stores anything
    pub fn disabled() -> Self {
        Self { directory: None }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(&config.directory)
        } else {
            Self::disabled()
        }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn path(&self, name: &str) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| dir.join(name))
    }

    /// Read an object, discarding it if it does not pass its integrity check
    pub fn load(&self, name: &str) -> Option<ObjectCode> {
        let path = self.path(name)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(target: "jit", "Failed to read {}: {}", path.display(), err);
                return None;
            }
        };
        match ObjectCode::from_bytes(&bytes) {
            Ok(object) if object.name == name && object.is_intact() => Some(object),
            _ => {
                tracing::warn!(target: "jit", "Discarding corrupt object {}", path.display());
                self.remove(name);
                None
            }
        }
    }

    /// Write an object atomically
    pub fn store(&self, object: &ObjectCode) -> Result<(), JitError> {
        let Some(dir) = &self.directory else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let path = dir.join(&object.name);
        let temp = dir.join(format!("{}.tmp-{:?}", object.name, std::thread::current().id()));
        fs::write(&temp, object.to_bytes()?)?;
        fs::rename(&temp, &path)?;
        jit_debug!("cached {}", object.name);
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        if let Some(path) = self.path(name) {
            let _ = fs::remove_file(path);
        }
    }
}

/// Record of a linked module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedModule {
    pub name: String,
    pub settings: u16,
    /// Load identity from `module_fingerprint`
    pub fingerprint: String,
    /// Object name to the `(function addr, native id)` pairs it provided
    pub objects: HashMap<String, Vec<(u32, u32)>>,
}

impl CachedModule {
    pub fn function_count(&self) -> usize {
        self.objects.values().map(Vec::len).sum()
    }
}

/// Modules currently linked, by name
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Mutex<HashMap<String, CachedModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a module, returning the load it replaces
    pub fn insert(&self, module: CachedModule) -> Option<CachedModule> {
        self.modules.lock().insert(module.name.clone(), module)
    }

    pub fn get(&self, name: &str) -> Option<CachedModule> {
        self.modules.lock().get(name).cloned()
    }

    /// Linked from the same image and placement under exactly these settings
    pub fn contains(&self, name: &str, settings: u16, fingerprint: &str) -> bool {
        self.modules
            .lock()
            .get(name)
            .is_some_and(|module| module.settings == settings && module.fingerprint == fingerprint)
    }

    pub fn remove(&self, name: &str) -> Option<CachedModule> {
        self.modules.lock().remove(name)
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_object(name: &str) -> ObjectCode {
        ObjectCode {
            name: name.to_string(),
            format: crate::hash::FORMAT,
            cpu: "threaded-test".to_string(),
            settings: 0,
            symbols: vec!["__trap".to_string()],
            functions: Vec::new(),
            checksum: String::new(),
        }
        .seal()
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(dir.path());
        let object = create_object("a.obj");

        assert!(cache.load("a.obj").is_none());
        cache.store(&object).unwrap();
        assert_eq!(cache.load("a.obj"), Some(object));
    }

    #[test]
    fn test_corrupt_object_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(dir.path());
        cache.store(&create_object("b.obj")).unwrap();

        let path = cache.path("b.obj").unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes.truncate(len / 2);
        fs::write(&path, bytes).unwrap();

        assert!(cache.load("b.obj").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ObjectCache::disabled();
        cache.store(&create_object("c.obj")).unwrap();
        assert!(cache.load("c.obj").is_none());
        assert!(cache.directory().is_none());
    }

    #[test]
    fn test_registry() {
        let registry = ModuleRegistry::new();
        let record = CachedModule {
            name: "m".to_string(),
            settings: 3,
            fingerprint: "f1".to_string(),
            objects: HashMap::from([("x.obj".to_string(), vec![(0x100, 0), (0x200, 1)])]),
        };
        assert!(registry.insert(record.clone()).is_none());
        assert!(registry.contains("m", 3, "f1"));
        assert!(!registry.contains("m", 4, "f1"));
        assert!(!registry.contains("m", 3, "f2"));

        let replaced = registry.insert(CachedModule { fingerprint: "f2".to_string(), ..record });
        assert_eq!(replaced.unwrap().fingerprint, "f1");
        assert_eq!(registry.get("m").unwrap().function_count(), 2);
        assert!(registry.remove("m").is_some());
        assert!(registry.is_empty());
    }
}
