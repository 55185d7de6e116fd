//! Stream resolution: decides which upstream blocks a node-run may read.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::{BlockReader, MetadataStore};
use blockflow_core::types::{BlockId, ManagedBlock};
use blockflow_functions::interface::{InputDef, InputKind};
use blockflow_functions::{BlockStream, BoundInput, ConsumedBlocks, InputBlock};
use blockflow_graph::FlatNode;

/// Inputs bound for one node-run.
#[derive(Debug, Default)]
pub struct BoundInputs {
    /// Values handed to the function. Taken by the executor at invoke time.
    pub inputs: HashMap<String, BoundInput>,
    /// Bound input names with their kinds, in interface order.
    pub bound: Vec<(String, InputKind)>,
    /// Block inputs, consumed as soon as they are bound.
    pub eager: Vec<(String, BlockId)>,
    /// Stream inputs and the handle recording which blocks were yielded.
    pub streams: Vec<(String, ConsumedBlocks)>,
    /// Unprocessed blocks available to each incremental input.
    pub available: BTreeMap<String, usize>,
}

impl BoundInputs {
    pub fn bound_names(&self) -> Vec<String> {
        self.bound.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn non_reference_names(&self) -> Vec<String> {
        self.bound
            .iter()
            .filter(|(_, kind)| !kind.is_reference())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Incremental blocks actually consumed so far, by input.
    pub fn consumed(&self) -> Vec<(String, BlockId)> {
        let mut consumed = self.eager.clone();
        for (name, handle) in &self.streams {
            consumed.extend(handle.ids().into_iter().map(|id| (name.clone(), id)));
        }
        consumed
    }

    /// Number of blocks consumed per input.
    pub fn consumed_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (name, _) in self.consumed() {
            *counts.entry(name).or_insert(0) += 1;
        }
        counts
    }
}

enum Plan {
    Reference(ManagedBlock),
    Block(ManagedBlock),
    Stream(Vec<ManagedBlock>),
}

/// Bind every declared input of `node`.
///
/// Reference inputs get the latest upstream block. Block and Stream inputs
/// get the upstream blocks this node has not yet logged as consumed. Raises
/// [`BlockflowError::InputExhausted`] when a required input has nothing to
/// offer, or when upstream data exists but every incremental input has
/// already processed it.
pub fn bind_inputs(
    node: &FlatNode,
    metadata: &dyn MetadataStore,
    allowed_storages: &[String],
    reader: Arc<dyn BlockReader>,
) -> Result<BoundInputs> {
    let interface = &node.function.interface;
    let consumed = metadata.consumed_block_ids(&node.key)?;

    let mut plans: Vec<(&InputDef, Plan)> = Vec::new();
    let mut has_incremental = false;
    let mut bindable = false;
    let mut progress = false;

    for input in &interface.inputs {
        let Some(edge) = node.input_edge(&input.name) else {
            if input.required && input.kind != InputKind::SelfReference {
                return Err(BlockflowError::MissingInput {
                    node: node.key.clone(),
                    input: input.name.clone(),
                });
            }
            continue;
        };

        let candidates: Vec<ManagedBlock> = metadata
            .blocks_for_output(&edge.from_node, &edge.from_output)?
            .into_iter()
            .filter(|b| b.is_on_any(allowed_storages))
            .collect();
        debug!(
            node = %node.key,
            input = %input.name,
            upstream = %edge.from_node,
            available = candidates.len(),
            "Building input stream"
        );
        bindable |= !candidates.is_empty();

        if input.kind.is_reference() {
            match candidates.into_iter().last() {
                Some(latest) => plans.push((input, Plan::Reference(latest))),
                // A node's own output never exists before its first run.
                None if input.required && input.kind == InputKind::Reference => {
                    return Err(BlockflowError::InputExhausted(format!(
                        "required reference '{}' of '{}' has no block",
                        input.name, node.key
                    )));
                }
                None => {}
            }
            continue;
        }

        has_incremental = true;
        let mut unprocessed: Vec<ManagedBlock> = candidates
            .into_iter()
            .filter(|b| !consumed.contains(b.id()))
            .collect();
        if unprocessed.is_empty() {
            if input.required {
                return Err(BlockflowError::InputExhausted(format!(
                    "required input '{}' of '{}' is empty",
                    input.name, node.key
                )));
            }
            continue;
        }
        progress = true;
        let plan = if input.kind == InputKind::Block {
            Plan::Block(unprocessed.remove(0))
        } else {
            Plan::Stream(unprocessed)
        };
        plans.push((input, plan));
    }

    if has_incremental && bindable && !progress {
        return Err(BlockflowError::InputExhausted(format!(
            "all inputs of '{}' are processed",
            node.key
        )));
    }

    let mut bound = BoundInputs::default();
    for (input, plan) in plans {
        let name = input.name.clone();
        let value = match plan {
            Plan::Reference(block) => {
                let records = reader.read_block(&block)?;
                BoundInput::Reference(Some(InputBlock { block, records }))
            }
            Plan::Block(block) => {
                let records = reader.read_block(&block)?;
                bound.available.insert(name.clone(), 1);
                bound.eager.push((name.clone(), block.id().clone()));
                BoundInput::Block(InputBlock { block, records })
            }
            Plan::Stream(blocks) => {
                bound.available.insert(name.clone(), blocks.len());
                let stream = BlockStream::new(blocks, reader.clone());
                bound.streams.push((name.clone(), stream.consumed()));
                BoundInput::Stream(stream)
            }
        };
        bound.bound.push((name.clone(), input.kind));
        bound.inputs.insert(name, value);
    }
    Ok(bound)
}
