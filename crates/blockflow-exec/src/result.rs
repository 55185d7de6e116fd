use std::collections::BTreeMap;

use serde::Serialize;

use blockflow_core::config::RunConfig;
use blockflow_core::schema::Schema;
use blockflow_core::types::{ErrorRecord, ManagedBlock, RunId, StoredBlock};
use blockflow_graph::FlatNode;

/// Descriptor of one node-run, handed to result handlers.
#[derive(Debug, Clone, Serialize)]
pub struct Executable {
    pub node_key: String,
    pub function_key: String,
    /// Parameters after function defaults are applied.
    pub params: serde_json::Map<String, serde_json::Value>,
    pub graph_hash: Option<String>,
    pub target_storage: String,
}

impl Executable {
    pub fn for_node(node: &FlatNode, config: &RunConfig, graph_hash: Option<String>) -> Self {
        Self {
            node_key: node.key.clone(),
            function_key: node.function_key(),
            params: node.function.resolve_params(&node.params),
            graph_hash,
            target_storage: config.target_storage_url().to_string(),
        }
    }
}

/// How a node-run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    SuccessWithOutput,
    /// The function legitimately produced nothing this cycle.
    SuccessNoOutput,
    /// Nothing new to process; the cycle was skipped.
    InputExhausted,
    FunctionError,
    TimedOut,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::SuccessWithOutput | Self::SuccessNoOutput)
    }
}

/// Summary of a finished node-run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub node_key: String,
    /// Unset when the run was skipped before a run log existed.
    pub run_id: Option<RunId>,
    pub status: RunStatus,
    pub bound_inputs: Vec<String>,
    pub non_reference_inputs: Vec<String>,
    /// Incremental blocks consumed, per input.
    pub input_blocks_consumed: BTreeMap<String, usize>,
    /// Blocks emitted, with record counts when computed.
    pub output_blocks: Vec<ManagedBlock>,
    /// Realizations created for pre-existing blocks.
    pub stored_blocks_created: Vec<StoredBlock>,
    pub schemas_generated: Vec<Schema>,
    pub error: Option<ErrorRecord>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn exhausted(node_key: &str) -> Self {
        Self {
            node_key: node_key.to_string(),
            run_id: None,
            status: RunStatus::InputExhausted,
            bound_inputs: Vec::new(),
            non_reference_inputs: Vec::new(),
            input_blocks_consumed: BTreeMap::new(),
            output_blocks: Vec::new(),
            stored_blocks_created: Vec::new(),
            schemas_generated: Vec::new(),
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == RunStatus::InputExhausted
    }

    pub fn timed_out(&self) -> bool {
        self.status == RunStatus::TimedOut
    }

    /// Whether any incremental input block was consumed.
    pub fn made_progress(&self) -> bool {
        self.input_blocks_consumed.values().any(|n| *n > 0)
    }

    /// The block emitted on `output`, if any.
    pub fn output_block(&self, output: &str) -> Option<&ManagedBlock> {
        self.output_blocks
            .iter()
            .find(|b| b.block.output_name == output)
    }

    /// Total rows emitted across outputs whose counts are known.
    pub fn record_count(&self) -> u64 {
        self.output_blocks
            .iter()
            .filter_map(|b| b.block.record_count)
            .sum()
    }
}
