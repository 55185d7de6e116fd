use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::DataFormat;

/// One row of data.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// An ordered set of rows.
pub type Records = Vec<Record>;

/// Free-form per-node state carried across runs.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// Name of the output a function writes to when none is given.
pub const DEFAULT_OUTPUT_NAME: &str = "default";

/// Sentinel port name for a node's single default input.
pub const STDIN_PORT: &str = "stdin";

/// Sentinel port name for a node's single default output.
pub const STDOUT_PORT: &str = "stdout";

/// Maximum stored length of a captured function trace.
pub const MAX_TRACE_CHARS: usize = 5_000;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            pub fn from_str(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(BlockId);
string_id!(StoredBlockId);
string_id!(RunId);

/// Logical unit of data produced by one node-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBlock {
    pub id: BlockId,
    pub created_by_node: String,
    /// Output port of the creating node this block was emitted on.
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default)]
    pub nominal_schema_key: Option<String>,
    #[serde(default)]
    pub inferred_schema_key: Option<String>,
    #[serde(default)]
    pub realized_schema_key: Option<String>,
    /// Computed lazily; `None` until counted.
    #[serde(default)]
    pub record_count: Option<u64>,
    pub created_at: DateTime<Utc>,
}

fn default_output_name() -> String {
    DEFAULT_OUTPUT_NAME.to_string()
}

impl DataBlock {
    pub fn new(created_by_node: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            id: BlockId::new(),
            created_by_node: created_by_node.into(),
            output_name: output_name.into(),
            nominal_schema_key: None,
            inferred_schema_key: None,
            realized_schema_key: None,
            record_count: None,
            created_at: Utc::now(),
        }
    }
}

/// One physical realization of a [`DataBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub id: StoredBlockId,
    pub block_id: BlockId,
    pub storage_url: String,
    pub data_format: DataFormat,
    #[serde(default)]
    pub data_is_written: bool,
}

impl StoredBlock {
    pub fn new(block_id: BlockId, storage_url: impl Into<String>, data_format: DataFormat) -> Self {
        Self {
            id: StoredBlockId::new(),
            block_id,
            storage_url: storage_url.into(),
            data_format,
            data_is_written: false,
        }
    }

    /// Object name of this realization inside its storage.
    pub fn name(&self) -> String {
        format!("_block_{}", self.id)
    }
}

/// A block together with every known realization of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedBlock {
    pub block: DataBlock,
    pub stored_blocks: Vec<StoredBlock>,
}

impl ManagedBlock {
    pub fn id(&self) -> &BlockId {
        &self.block.id
    }

    pub fn written_stored_blocks(&self) -> impl Iterator<Item = &StoredBlock> {
        self.stored_blocks.iter().filter(|s| s.data_is_written)
    }

    /// Whether any written realization lives on one of `storages`.
    /// An empty filter admits every storage.
    pub fn is_on_any(&self, storages: &[String]) -> bool {
        self.written_stored_blocks()
            .any(|s| storages.is_empty() || storages.iter().any(|u| *u == s.storage_url))
    }
}

/// Direction of a consumption log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Self::Input),
            "output" => Some(Self::Output),
            _ => None,
        }
    }
}

/// Append-only record of a block crossing a node boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionEntry {
    pub node_key: String,
    pub block_id: BlockId,
    pub direction: Direction,
    /// Input or output port the block crossed.
    #[serde(default)]
    pub port: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Structured capture of a failed function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, trace: &str) -> Self {
        let message = message.into();
        Self {
            kind: kind.into(),
            // An empty message must still read as an error.
            message: if message.is_empty() {
                "unknown error".to_string()
            } else {
                message
            },
            trace: truncate_chars(trace, MAX_TRACE_CHARS),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// One row per node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub id: RunId,
    pub node_key: String,
    pub function_key: String,
    #[serde(default)]
    pub graph_hash: Option<String>,
    pub start_state: StateMap,
    pub end_state: StateMap,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
    #[serde(default)]
    pub timed_out: bool,
}

impl RunLog {
    pub fn start(
        node_key: impl Into<String>,
        function_key: impl Into<String>,
        state: StateMap,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: RunId::new(),
            node_key: node_key.into(),
            function_key: function_key.into(),
            graph_hash: None,
            end_state: state.clone(),
            start_state: state,
            params,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            timed_out: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(BlockId::new(), BlockId::new());
        assert_eq!(BlockId::from_str("abc").as_str(), "abc");
    }

    #[test]
    fn test_stored_block_name() {
        let sdb = StoredBlock::new(BlockId::new(), "memory://local", DataFormat::Records);
        assert!(sdb.name().starts_with("_block_"));
        assert!(!sdb.name().contains('-'));
        assert!(!sdb.data_is_written);
    }

    #[test]
    fn test_storage_filter() {
        let block = DataBlock::new("source", DEFAULT_OUTPUT_NAME);
        let mut sdb = StoredBlock::new(block.id.clone(), "memory://a", DataFormat::Records);
        sdb.data_is_written = true;
        let managed = ManagedBlock {
            block,
            stored_blocks: vec![sdb],
        };
        assert!(managed.is_on_any(&[]));
        assert!(managed.is_on_any(&["memory://a".to_string()]));
        assert!(!managed.is_on_any(&["memory://b".to_string()]));
    }

    #[test]
    fn test_error_record_truncates_trace() {
        let trace = "x".repeat(MAX_TRACE_CHARS * 2);
        let rec = ErrorRecord::new("FunctionError", "", &trace);
        assert_eq!(rec.trace.len(), MAX_TRACE_CHARS);
        assert_eq!(rec.message, "unknown error");
    }

    #[test]
    fn test_run_log_start_copies_state() {
        let mut state = StateMap::new();
        state.insert("cursor".into(), serde_json::json!(4));
        let log = RunLog::start("n", "core.f", state, Default::default());
        assert_eq!(log.start_state, log.end_state);
        assert!(!log.is_complete());
    }

    #[test]
    fn test_direction_roundtrip() {
        assert_eq!(Direction::parse(Direction::Input.as_str()), Some(Direction::Input));
        assert_eq!(Direction::parse("sideways"), None);
    }
}
