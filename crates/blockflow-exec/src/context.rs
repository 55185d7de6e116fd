use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use blockflow_core::config::RunConfig;
use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::schema::{infer_schema, reconcile, Schema, ANY_SCHEMA_KEY, GENERATED_NAMESPACE};
use blockflow_core::storage::DataFormat;
use blockflow_core::types::*;
use blockflow_functions::interface::FunctionInterface;
use blockflow_functions::{ComponentRegistry, EmitOptions, ExecutionContext};
use blockflow_storage::{ConversionCost, ConversionEngine};

use crate::environment::Environment;

/// An output block being written during a run.
struct OutputBuffer {
    block: DataBlock,
    stored: StoredBlock,
    nominal: Arc<Schema>,
    rows: u64,
}

/// What a run produced, taken from the context once the function returns.
#[derive(Debug)]
pub struct RunOutputs {
    pub blocks: Vec<ManagedBlock>,
    pub state: StateMap,
    pub schemas: Vec<Schema>,
    pub timed_out: bool,
}

/// Execution context of one node-run.
///
/// Emitted records are staged on the local storage and moved into each
/// output's target realization through the conversion engine. The first
/// write to a block infers its schema; later writes reuse it.
pub struct RunContext<'e> {
    node_key: String,
    interface: &'e FunctionInterface,
    registry: &'e ComponentRegistry,
    conversions: &'e ConversionEngine,
    params: serde_json::Map<String, Value>,
    state: StateMap,
    local_storage: String,
    target_storage: String,
    target_format: Option<DataFormat>,
    deadline: Option<Instant>,
    timed_out: Cell<bool>,
    outputs: Vec<OutputBuffer>,
    schemas: Vec<Schema>,
    fatal: Option<BlockflowError>,
}

impl<'e> RunContext<'e> {
    pub fn new(
        node_key: &str,
        interface: &'e FunctionInterface,
        env: &'e Environment,
        config: &RunConfig,
        params: serde_json::Map<String, Value>,
        state: StateMap,
    ) -> Self {
        Self {
            node_key: node_key.to_string(),
            interface,
            registry: env.registry(),
            conversions: env.conversions(),
            params,
            state,
            local_storage: config.local_storage.clone(),
            target_storage: config.target_storage_url().to_string(),
            target_format: config.target_format,
            deadline: config
                .execution_timelimit_seconds
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
            timed_out: Cell::new(false),
            outputs: Vec::new(),
            schemas: Vec::new(),
            fatal: None,
        }
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.get()
    }

    /// A framework error raised during an emit that must fail the run even
    /// if the function swallowed it.
    pub fn take_fatal(&mut self) -> Option<BlockflowError> {
        self.fatal.take()
    }

    pub fn finish(self) -> RunOutputs {
        let blocks = self
            .outputs
            .into_iter()
            .map(|o| {
                debug!(block_id = %o.block.id, output = %o.block.output_name, rows = o.rows, "Output block written");
                ManagedBlock {
                    block: o.block,
                    stored_blocks: vec![o.stored],
                }
            })
            .collect();
        RunOutputs {
            blocks,
            state: self.state,
            schemas: self.schemas,
            timed_out: self.timed_out.get(),
        }
    }

    fn output_name(&self, options: &EmitOptions) -> String {
        options
            .output
            .clone()
            .or_else(|| self.interface.default_output().map(|o| o.name.clone()))
            .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string())
    }

    fn open_output(
        &mut self,
        name: &str,
        declared: Option<Arc<Schema>>,
        options: &EmitOptions,
    ) -> Result<usize> {
        if self.interface.output(name).is_none() && !self.interface.outputs.is_empty() {
            warn!(node = %self.node_key, output = %name, "Emitting to an undeclared output");
        }
        let nominal = match declared {
            Some(schema) => schema,
            None => {
                let key = self
                    .interface
                    .output(name)
                    .map(|o| o.schema_key.as_str())
                    .unwrap_or(ANY_SCHEMA_KEY);
                self.registry.resolve_schema(key)?
            }
        };

        let url = options
            .storage
            .clone()
            .unwrap_or_else(|| self.target_storage.clone());
        let format = match options.format.or(self.target_format) {
            Some(format) => format,
            None => self.conversions.storages().get(&url)?.natural_format(),
        };

        let mut block = DataBlock::new(&self.node_key, name);
        block.nominal_schema_key = Some(nominal.key.clone());
        let stored = StoredBlock::new(block.id.clone(), url, format);
        debug!(
            node = %self.node_key,
            output = %name,
            block_id = %block.id,
            storage = %stored.storage_url,
            format = %format.as_str(),
            "Opened output block"
        );
        self.outputs.push(OutputBuffer {
            block,
            stored,
            nominal,
            rows: 0,
        });
        Ok(self.outputs.len() - 1)
    }

    fn remember_schema(&mut self, schema: Schema) {
        if schema.namespace() == Some(GENERATED_NAMESPACE)
            && !self.schemas.iter().any(|s| s.key == schema.key)
        {
            self.schemas.push(schema);
        }
    }

    fn write(&mut self, records: Records, options: EmitOptions) -> Result<()> {
        let name = self.output_name(&options);
        let declared = match &options.schema {
            Some(key) => Some(self.registry.resolve_schema(key)?),
            None => None,
        };

        let existing = self.outputs.iter().position(|o| o.block.output_name == name);
        if let (Some(idx), Some(schema)) = (existing, &declared) {
            let current = &self.outputs[idx].nominal.key;
            if *current != schema.key {
                return Err(BlockflowError::SchemaConflict {
                    output: name,
                    existing: current.clone(),
                    declared: schema.key.clone(),
                });
            }
        }
        if records.is_empty() {
            debug!(node = %self.node_key, output = %name, "Ignoring empty emit");
            return Ok(());
        }
        let idx = match existing {
            Some(idx) => idx,
            None => self.open_output(&name, declared, &options)?,
        };

        if self.outputs[idx].block.inferred_schema_key.is_none() {
            let inferred = infer_schema(&records);
            let realized = reconcile(Some(self.outputs[idx].nominal.as_ref()), &inferred);
            debug!(
                node = %self.node_key,
                inferred = %inferred.key,
                realized = %realized.key,
                fields = %realized.fields_summary(),
                "Resolved output schema"
            );
            let block = &mut self.outputs[idx].block;
            block.inferred_schema_key = Some(inferred.key.clone());
            block.realized_schema_key = Some(realized.key.clone());
            self.remember_schema(inferred);
            self.remember_schema(realized);
        }

        let count = records.len() as u64;
        let cost = append_rows(
            self.conversions,
            &self.local_storage,
            &self.outputs[idx].stored,
            records,
        )?;
        let output = &mut self.outputs[idx];
        output.stored.data_is_written = true;
        output.rows += count;
        debug!(
            node = %self.node_key,
            output = %name,
            rows = count,
            cost = ?cost,
            "Emitted records"
        );
        Ok(())
    }
}

/// Append `records` to `target`. Targets that are plain records on the
/// local storage are written in place; anything else is staged locally and
/// moved by the conversion engine.
fn append_rows(
    conversions: &ConversionEngine,
    local_storage: &str,
    target: &StoredBlock,
    records: Records,
) -> Result<ConversionCost> {
    let local = conversions.storages().get(local_storage)?;
    if target.storage_url == local_storage && target.data_format == DataFormat::Records {
        local.bulk_write_rows(&target.name(), &records)?;
        return Ok(ConversionCost::NoOp);
    }
    let staging = StoredBlock::new(target.block_id.clone(), local_storage, DataFormat::Records);
    local.put(&staging.name(), records)?;
    let moved = conversions.write_into(&staging, target);
    local.remove(&staging.name())?;
    moved
}

/// Errors that fail the run regardless of what the function does with them.
fn fatal_copy(e: &BlockflowError) -> Option<BlockflowError> {
    match e {
        BlockflowError::SchemaConflict {
            output,
            existing,
            declared,
        } => Some(BlockflowError::SchemaConflict {
            output: output.clone(),
            existing: existing.clone(),
            declared: declared.clone(),
        }),
        BlockflowError::ConversionNotSupported { from, to } => {
            Some(BlockflowError::ConversionNotSupported {
                from: from.clone(),
                to: to.clone(),
            })
        }
        _ => None,
    }
}

impl ExecutionContext for RunContext<'_> {
    fn node_key(&self) -> &str {
        &self.node_key
    }

    fn get_param(&self, name: &str, default: Value) -> Value {
        self.params
            .get(name)
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or(default)
    }

    fn get_state_value(&self, key: &str, default: Value) -> Value {
        self.state.get(key).cloned().unwrap_or(default)
    }

    fn emit_state_value(&mut self, key: &str, value: Value) {
        self.state.insert(key.to_string(), value);
    }

    fn emit(&mut self, records: Records, options: EmitOptions) -> Result<()> {
        let result = self.write(records, options);
        if let Some(fatal) = result.as_ref().err().and_then(fatal_copy) {
            self.fatal.get_or_insert(fatal);
        }
        result
    }

    fn should_continue(&self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                if !self.timed_out.replace(true) {
                    warn!(node = %self.node_key, "Execution time limit reached");
                }
                false
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::schema::{Field, FieldType};
    use blockflow_functions::function::{FunctionDef, Output};
    use blockflow_functions::interface::Signature;
    use serde_json::json;

    fn env() -> Environment {
        let mut reg = ComponentRegistry::with_builtins().unwrap();
        reg.register_schema(Schema::new("shop.Order", vec![Field::new("id", FieldType::Integer)]));
        reg.register_schema(Schema::new("shop.Refund", vec![Field::new("id", FieldType::Integer)]));
        Environment::in_memory(reg).unwrap()
    }

    fn def() -> FunctionDef {
        FunctionDef::new("t", "f", Signature::new().unannotated("ctx"), |_| Ok(Output::None)).unwrap()
    }

    fn rows(n: usize) -> Records {
        (0..n)
            .map(|i| json!({ "id": i, "name": format!("n{}", i) }).as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_repeated_emits_extend_one_block() {
        let env = env();
        let def = def();
        let config = RunConfig::default();
        let mut ctx = RunContext::new("n", &def.interface, &env, &config, Default::default(), StateMap::new());

        ctx.emit(rows(2), EmitOptions::default()).unwrap();
        ctx.emit(rows(3), EmitOptions::default()).unwrap();
        ctx.emit(Records::new(), EmitOptions::default()).unwrap();
        let out = ctx.finish();

        assert_eq!(out.blocks.len(), 1);
        let block = &out.blocks[0];
        assert_eq!(block.block.output_name, DEFAULT_OUTPUT_NAME);
        assert_eq!(block.block.nominal_schema_key.as_deref(), Some(ANY_SCHEMA_KEY));
        assert!(block.stored_blocks[0].data_is_written);
        assert_eq!(env.read_records(block).unwrap().len(), 5);

        // Any nominal: realized is the inferred schema.
        assert_eq!(block.block.inferred_schema_key, block.block.realized_schema_key);
        assert_eq!(out.schemas.len(), 1);
        assert_eq!(out.schemas[0].fields.len(), 2);
    }

    #[test]
    fn test_conflicting_nominal_schemas() {
        let env = env();
        let def = def();
        let config = RunConfig::default();
        let mut ctx = RunContext::new("n", &def.interface, &env, &config, Default::default(), StateMap::new());

        ctx.emit(rows(1), EmitOptions::default().schema("Order")).unwrap();
        ctx.emit(rows(1), EmitOptions::default().schema("shop.Order")).unwrap();
        let err = ctx.emit(rows(1), EmitOptions::default().schema("shop.Refund")).unwrap_err();
        assert!(matches!(err, BlockflowError::SchemaConflict { .. }));
        assert!(matches!(ctx.take_fatal(), Some(BlockflowError::SchemaConflict { .. })));

        let out = ctx.finish();
        let block = &out.blocks[0].block;
        assert_eq!(block.nominal_schema_key.as_deref(), Some("shop.Order"));
        // "name" is not part of shop.Order, so the realized schema grows.
        assert_ne!(block.realized_schema_key.as_deref(), Some("shop.Order"));
        assert!(out.schemas.iter().any(|s| s.fields.len() == 2 && s.field("id").is_some()));
    }

    #[test]
    fn test_emit_to_database_target() {
        let env = env();
        let def = def();
        let config = RunConfig {
            target_storage: Some("sqlite://:memory:".into()),
            ..RunConfig::default()
        };
        let mut ctx = RunContext::new("n", &def.interface, &env, &config, Default::default(), StateMap::new());
        ctx.emit(rows(4), EmitOptions::default()).unwrap();
        ctx.emit(rows(1), EmitOptions::default().output("extra").storage("memory://_local")).unwrap();
        let out = ctx.finish();

        let stored = &out.blocks[0].stored_blocks[0];
        assert_eq!(stored.storage_url, "sqlite://:memory:");
        assert_eq!(stored.data_format, DataFormat::Table);
        let db = env.storages().get("sqlite://:memory:").unwrap();
        assert_eq!(db.record_count(&stored.name()).unwrap(), 4);

        assert_eq!(out.blocks[1].block.output_name, "extra");
        assert_eq!(out.blocks[1].stored_blocks[0].data_format, DataFormat::Records);
    }

    #[test]
    fn test_state_params_and_deadline() {
        let env = env();
        let def = def();
        let config = RunConfig {
            execution_timelimit_seconds: Some(0),
            ..RunConfig::default()
        };
        let mut params = serde_json::Map::new();
        params.insert("limit".into(), json!(5));
        let mut ctx = RunContext::new("n", &def.interface, &env, &config, params, StateMap::new());

        assert_eq!(ctx.get_param("limit", json!(1)), json!(5));
        assert_eq!(ctx.get_param("missing", json!(1)), json!(1));
        ctx.emit_state_value("cursor", json!("abc"));
        assert_eq!(ctx.get_state_value("cursor", Value::Null), json!("abc"));

        assert!(!ctx.should_continue());
        assert!(ctx.timed_out());
        let out = ctx.finish();
        assert!(out.timed_out);
        assert_eq!(out.state["cursor"], json!("abc"));
    }
}
