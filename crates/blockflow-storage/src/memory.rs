use std::collections::HashMap;
use std::sync::RwLock;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::storage::{DataFormat, StorageApi, StorageKind};
use blockflow_core::types::{Record, Records};

/// Process-local storage of record sets, keyed by object name.
pub struct MemoryStorage {
    url: String,
    objects: RwLock<HashMap<String, Records>>,
}

impl MemoryStorage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn lock_err(&self, e: impl std::fmt::Display) -> BlockflowError {
        BlockflowError::storage(&self.url, format!("lock poisoned: {}", e))
    }

    fn missing(&self, name: &str) -> BlockflowError {
        BlockflowError::storage(&self.url, format!("no object named {}", name))
    }
}

impl StorageApi for MemoryStorage {
    fn url(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn natural_format(&self) -> DataFormat {
        DataFormat::Records
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let objects = self.objects.read().map_err(|e| self.lock_err(e))?;
        Ok(objects.contains_key(name))
    }

    fn put(&self, name: &str, records: Records) -> Result<()> {
        let mut objects = self.objects.write().map_err(|e| self.lock_err(e))?;
        objects.insert(name.to_string(), records);
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Records> {
        let objects = self.objects.read().map_err(|e| self.lock_err(e))?;
        objects.get(name).cloned().ok_or_else(|| self.missing(name))
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(|e| self.lock_err(e))?;
        objects.remove(name);
        Ok(())
    }

    fn bulk_write_rows(&self, name: &str, rows: &[Record]) -> Result<()> {
        let mut objects = self.objects.write().map_err(|e| self.lock_err(e))?;
        objects
            .entry(name.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    fn record_count(&self, name: &str) -> Result<u64> {
        let objects = self.objects.read().map_err(|e| self.lock_err(e))?;
        objects
            .get(name)
            .map(|r| r.len() as u64)
            .ok_or_else(|| self.missing(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: i64) -> Record {
        let mut r = Record::new();
        r.insert("v".into(), json!(v));
        r
    }

    #[test]
    fn test_put_get_append_count() {
        let s = MemoryStorage::new("memory://t");
        assert!(!s.exists("x").unwrap());
        s.put("x", vec![row(1)]).unwrap();
        s.bulk_write_rows("x", &[row(2), row(3)]).unwrap();
        assert_eq!(s.record_count("x").unwrap(), 3);
        assert_eq!(s.get("x").unwrap()[2]["v"], json!(3));

        s.put("x", vec![row(9)]).unwrap();
        assert_eq!(s.record_count("x").unwrap(), 1);

        s.remove("x").unwrap();
        assert!(s.get("x").is_err());
        assert!(s.open("x", blockflow_core::storage::OpenMode::Read).is_err());
    }
}
