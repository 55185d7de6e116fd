use std::collections::HashSet;

use crate::error::Result;
use crate::schema::Schema;
use crate::types::*;

/// Everything a successful run writes, committed atomically.
#[derive(Debug, Clone)]
pub struct RunCommit {
    /// Completed run log. When `error` is set nothing else is applied.
    pub run_log: RunLog,
    /// Blocks emitted by the run, with their realizations.
    pub output_blocks: Vec<ManagedBlock>,
    /// New realizations of pre-existing blocks (e.g. inputs copied locally).
    pub extra_stored_blocks: Vec<StoredBlock>,
    /// Incremental input blocks consumed, keyed by input port.
    pub consumed: Vec<(String, BlockId)>,
    /// Node state to store. `None` leaves state untouched.
    pub end_state: Option<StateMap>,
    /// Schemas generated while writing outputs.
    pub schemas: Vec<Schema>,
}

impl RunCommit {
    /// Commit that records only a failed run log.
    pub fn failed(run_log: RunLog) -> Self {
        Self {
            run_log,
            output_blocks: Vec::new(),
            extra_stored_blocks: Vec::new(),
            consumed: Vec::new(),
            end_state: None,
            schemas: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.run_log.error.is_some()
    }
}

/// Persistent record of blocks, consumption, node state and run logs.
///
/// Implementations must apply [`MetadataStore::commit_run`] in a single
/// transaction.
pub trait MetadataStore: Send + Sync + 'static {
    /// Blocks `node_key` emitted on `output_name`, oldest first.
    fn blocks_for_output(&self, node_key: &str, output_name: &str) -> Result<Vec<ManagedBlock>>;

    /// Newest block `node_key` emitted on `output_name`.
    fn latest_block(&self, node_key: &str, output_name: &str) -> Result<Option<ManagedBlock>> {
        Ok(self.blocks_for_output(node_key, output_name)?.pop())
    }

    /// Newest block `node_key` emitted on any output.
    fn latest_output(&self, node_key: &str) -> Result<Option<ManagedBlock>>;

    fn block(&self, id: &BlockId) -> Result<Option<ManagedBlock>>;

    /// Ids of blocks `node_key` has logged as consumed inputs.
    fn consumed_block_ids(&self, node_key: &str) -> Result<HashSet<BlockId>>;

    fn node_state(&self, node_key: &str) -> Result<StateMap>;

    /// Record a run as started.
    fn begin_run(&self, run_log: &RunLog) -> Result<()>;

    fn commit_run(&self, commit: &RunCommit) -> Result<()>;

    /// Drop a run log that was begun but never committed.
    fn discard_run(&self, run_id: &str) -> Result<()>;

    /// Run logs for `node_key`, oldest first.
    fn run_logs(&self, node_key: &str) -> Result<Vec<RunLog>>;

    fn consumption_log(&self, node_key: &str) -> Result<Vec<ConsumptionEntry>>;

    fn set_record_count(&self, id: &BlockId, count: u64) -> Result<()>;
}

/// Source of schemas outside the registry (e.g. generated by earlier runs).
pub trait SchemaCatalog: Send + Sync + 'static {
    fn get_schema(&self, key: &str) -> Result<Option<Schema>>;
}

/// Materializes a block's rows for a function.
pub trait BlockReader: Send + Sync {
    fn read_block(&self, block: &ManagedBlock) -> Result<Records>;
}
