use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::storage::{StorageApi, StorageKind};

use crate::file::FileStorage;
use crate::memory::MemoryStorage;
use crate::sqlite::SqliteStorage;

/// Shared storage engines, one per url, created on first use.
pub struct StorageRegistry {
    storages: RwLock<HashMap<String, Arc<dyn StorageApi>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            storages: RwLock::new(HashMap::new()),
        }
    }

    /// Register an engine under its own url, replacing any existing one.
    pub fn register(&self, storage: Arc<dyn StorageApi>) -> Result<()> {
        let mut storages = self
            .storages
            .write()
            .map_err(|e| BlockflowError::storage(storage.url(), e))?;
        storages.insert(storage.url().to_string(), storage);
        Ok(())
    }

    /// Engine for `url`, opening it if this is the first request.
    pub fn get(&self, url: &str) -> Result<Arc<dyn StorageApi>> {
        {
            let storages = self
                .storages
                .read()
                .map_err(|e| BlockflowError::storage(url, e))?;
            if let Some(storage) = storages.get(url) {
                return Ok(storage.clone());
            }
        }
        let mut storages = self
            .storages
            .write()
            .map_err(|e| BlockflowError::storage(url, e))?;
        if let Some(storage) = storages.get(url) {
            return Ok(storage.clone());
        }
        let storage = open_storage(url)?;
        storages.insert(url.to_string(), storage.clone());
        Ok(storage)
    }

    pub fn urls(&self) -> Vec<String> {
        self.storages
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the engine a url's scheme selects.
pub fn open_storage(url: &str) -> Result<Arc<dyn StorageApi>> {
    let storage: Arc<dyn StorageApi> = match StorageKind::for_url(url)? {
        StorageKind::Memory => Arc::new(MemoryStorage::new(url)),
        StorageKind::File => Arc::new(FileStorage::from_url(url)?),
        StorageKind::Database if url.starts_with("sqlite://") => {
            Arc::new(SqliteStorage::from_url(url)?)
        }
        StorageKind::Database => return Err(BlockflowError::UnsupportedStorage(url.to_string())),
    };
    debug!(url = %url, kind = %storage.kind(), "Opened storage");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_url_shares_engine() {
        let reg = StorageRegistry::new();
        let a = reg.get("memory://shared").unwrap();
        a.put("x", vec![]).unwrap();
        let b = reg.get("memory://shared").unwrap();
        assert!(b.exists("x").unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.urls(), vec!["memory://shared".to_string()]);
    }

    #[test]
    fn test_scheme_selection() {
        let reg = StorageRegistry::new();
        assert_eq!(reg.get("sqlite://:memory:").unwrap().kind(), StorageKind::Database);
        assert!(matches!(
            reg.get("postgres://db/x").err().unwrap(),
            BlockflowError::UnsupportedStorage(_)
        ));
        assert!(reg.get("ftp://nope").is_err());
    }
}
