//! Single-slot process registry
//!
//! Records the pid of the supervised tunnel process so a later invocation
//! (possibly a fresh process after a crash) can find and stop it. A recorded
//! pid is only a claim: callers verify liveness before acting on it.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::error;

use crate::error::RegistryError;

/// Durable record of "the" active supervised process
pub trait Registry: Send + Sync {
    /// Persist `pid`, overwriting any prior value
    fn register(&self, pid: u32) -> Result<(), RegistryError>;

    /// The recorded pid, or `None` if nothing is recorded
    fn current(&self) -> Result<Option<u32>, RegistryError>;

    /// Remove the record; `RegistryError::Missing` if there was none
    fn clear(&self) -> Result<(), RegistryError>;
}

/// Registry backed by a pid file holding decimal text
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Registry for FileRegistry {
    fn register(&self, pid: u32) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, pid.to_string())?;
        Ok(())
    }

    fn current(&self) -> Result<Option<u32>, RegistryError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match content.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                error!("PID in {:?} is not an integer", self.path);
                Err(RegistryError::Corrupt {
                    path: self.path.clone(),
                    content,
                })
            }
        }
    }

    fn clear(&self) -> Result<(), RegistryError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(RegistryError::Missing(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory registry for tests and embedders that do not need durability
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    slot: Mutex<Option<u32>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the slot, e.g. with a stale pid
    pub fn with_pid(pid: u32) -> Self {
        Self {
            slot: Mutex::new(Some(pid)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<u32>> {
        // A poisoned slot still holds a valid Option
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Registry for MemoryRegistry {
    fn register(&self, pid: u32) -> Result<(), RegistryError> {
        *self.slot() = Some(pid);
        Ok(())
    }

    fn current(&self) -> Result<Option<u32>, RegistryError> {
        Ok(*self.slot())
    }

    fn clear(&self) -> Result<(), RegistryError> {
        match self.slot().take() {
            Some(_) => Ok(()),
            None => Err(RegistryError::Missing(PathBuf::from("<memory>"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_registry_lifecycle() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("openvpnclient.pid");
        let registry = FileRegistry::new(&path);

        assert_eq!(registry.current().unwrap(), None);

        registry.register(4242).unwrap();
        assert_eq!(registry.current().unwrap(), Some(4242));
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242");

        registry.register(77).unwrap();
        assert_eq!(registry.current().unwrap(), Some(77));

        registry.clear().unwrap();
        assert_eq!(registry.current().unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_file_registry_clear_when_absent() {
        let temp = TempDir::new().unwrap();
        let registry = FileRegistry::new(temp.path().join("openvpnclient.pid"));
        assert!(matches!(registry.clear(), Err(RegistryError::Missing(_))));
    }

    #[test]
    fn test_file_registry_tolerates_whitespace() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("openvpnclient.pid");
        fs::write(&path, "  1234\n").unwrap();
        assert_eq!(FileRegistry::new(&path).current().unwrap(), Some(1234));
    }

    #[test]
    fn test_file_registry_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("openvpnclient.pid");
        fs::write(&path, "not-a-pid").unwrap();

        match FileRegistry::new(&path).current() {
            Err(RegistryError::Corrupt { content, .. }) => assert_eq!(content, "not-a-pid"),
            other => panic!("Expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_file_registry_survives_new_instance() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("openvpnclient.pid");

        FileRegistry::new(&path).register(99).unwrap();
        assert_eq!(FileRegistry::new(&path).current().unwrap(), Some(99));
    }

    #[test]
    fn test_memory_registry() {
        let registry = MemoryRegistry::new();
        assert_eq!(registry.current().unwrap(), None);
        assert!(matches!(registry.clear(), Err(RegistryError::Missing(_))));

        registry.register(10).unwrap();
        assert_eq!(registry.current().unwrap(), Some(10));
        registry.clear().unwrap();
        assert_eq!(registry.current().unwrap(), None);

        assert_eq!(MemoryRegistry::with_pid(5).current().unwrap(), Some(5));
    }
}
