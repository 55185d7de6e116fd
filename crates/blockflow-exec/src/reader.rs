use std::sync::{Arc, Mutex};

use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::storage::DataFormat;
use blockflow_core::traits::BlockReader;
use blockflow_core::types::{ManagedBlock, Records, StoredBlock};
use blockflow_storage::ConversionEngine;

/// Reads input blocks as records on the run's local storage, converting
/// them there first when needed.
///
/// Realizations created along the way are kept so the run can persist them,
/// and reused when the same block is read again.
pub struct LocalBlockReader {
    conversions: Arc<ConversionEngine>,
    local_storage: String,
    created: Mutex<Vec<StoredBlock>>,
}

impl LocalBlockReader {
    pub fn new(conversions: Arc<ConversionEngine>, local_storage: impl Into<String>) -> Self {
        Self {
            conversions,
            local_storage: local_storage.into(),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Stored blocks this reader had to create.
    pub fn created(&self) -> Vec<StoredBlock> {
        self.created
            .lock()
            .map(|created| created.clone())
            .unwrap_or_default()
    }
}

impl BlockReader for LocalBlockReader {
    fn read_block(&self, block: &ManagedBlock) -> Result<Records> {
        let mut created = self
            .created
            .lock()
            .map_err(|e| BlockflowError::storage(&self.local_storage, e))?;
        // Blocks re-read after a rewind reuse the copy made the first time.
        let existing = created.iter().find(|s| s.block_id == *block.id()).cloned();
        let stored = match existing {
            Some(stored) => stored,
            None => {
                let (stored, is_new) =
                    self.conversions
                        .ensure_on(block, &self.local_storage, DataFormat::Records)?;
                if is_new {
                    debug!(block_id = %block.id(), storage = %self.local_storage, "Materialized input block locally");
                    created.push(stored.clone());
                }
                stored
            }
        };
        drop(created);
        self.conversions
            .storages()
            .get(&stored.storage_url)?
            .get(&stored.name())
    }
}
