use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use blockflow_core::config::RunConfig;
use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::RunCommit;
use blockflow_core::types::{ErrorRecord, Records, RunLog};
use blockflow_functions::{EmitOptions, ExecutionContext, FunctionArgs, Output};
use blockflow_graph::FlatNode;

use crate::binder::bind_inputs;
use crate::context::RunContext;
use crate::environment::Environment;
use crate::handler::ResultHandler;
use crate::reader::LocalBlockReader;
use crate::result::{Executable, ExecutionResult, RunStatus};

/// Phases of a single node-run, in order. `Failed` can follow any phase
/// after `Bound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Prepared,
    Bound,
    Invoked,
    Emitted,
    Persisted,
    Finalized,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Bound => "bound",
            Self::Invoked => "invoked",
            Self::Emitted => "emitted",
            Self::Persisted => "persisted",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }
}

/// Drives one node-run at a time: bind, invoke, emit, persist, finalize.
pub struct Executor {
    env: Arc<Environment>,
    config: RunConfig,
    handler: Arc<dyn ResultHandler>,
    graph_hash: Option<String>,
}

impl Executor {
    pub fn new(env: Arc<Environment>, config: RunConfig, handler: Arc<dyn ResultHandler>) -> Self {
        Self {
            env,
            config,
            handler,
            graph_hash: None,
        }
    }

    /// Fingerprint of the graph, recorded on every run log.
    pub fn with_graph_hash(mut self, hash: impl Into<String>) -> Self {
        self.graph_hash = Some(hash.into());
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn transition(&self, node: &FlatNode, phase: &mut RunPhase, next: RunPhase) {
        debug!(node = %node.key, from = phase.as_str(), to = next.as_str(), "Run phase");
        *phase = next;
    }

    /// Run `node` once.
    ///
    /// Exhausted inputs yield an [`RunStatus::InputExhausted`] result without
    /// invoking the function. A function error is recorded and returned as
    /// a result unless `abort_on_function_error` is set. Schema conflicts
    /// and unsupported conversions always fail the run.
    pub fn execute(&self, node: &FlatNode) -> Result<ExecutionResult> {
        let start = Instant::now();
        let mut phase = RunPhase::Prepared;
        let executable = Executable::for_node(node, &self.config, self.graph_hash.clone());

        let reader = Arc::new(LocalBlockReader::new(
            self.env.conversions().clone(),
            &self.config.local_storage,
        ));
        let mut bound = match bind_inputs(
            node,
            self.env.metadata().as_ref(),
            &self.config.storages,
            reader.clone(),
        ) {
            Ok(bound) => bound,
            Err(e) if e.is_control_flow() => {
                info!(node = %node.key, reason = %e, "Skipping node run");
                let mut result = ExecutionResult::exhausted(&node.key);
                result.elapsed_ms = start.elapsed().as_millis() as u64;
                return Ok(result);
            }
            Err(e) => return Err(e),
        };
        self.transition(node, &mut phase, RunPhase::Bound);

        let state = self.env.metadata().node_state(&node.key)?;
        let mut run_log = RunLog::start(
            &node.key,
            &executable.function_key,
            state.clone(),
            executable.params.clone(),
        );
        run_log.graph_hash = self.graph_hash.clone();
        self.handler.begin(&run_log)?;

        let mut result = ExecutionResult::exhausted(&node.key);
        result.run_id = Some(run_log.id.clone());
        result.bound_inputs = bound.bound_names();
        result.non_reference_inputs = bound.non_reference_names();

        info!(
            node = %node.key,
            function = %executable.function_key,
            run_id = %run_log.id,
            inputs = ?result.bound_inputs,
            "Executing node"
        );

        let mut ctx = RunContext::new(
            &node.key,
            &node.function.interface,
            &self.env,
            &self.config,
            executable.params.clone(),
            state,
        );
        let called = {
            let context: Option<&mut dyn ExecutionContext> = if node.function.interface.uses_context {
                Some(&mut ctx)
            } else {
                None
            };
            let mut args = FunctionArgs::new(
                std::mem::take(&mut bound.inputs),
                executable.params.clone(),
                context,
            );
            node.function.call(&mut args)
        };
        self.transition(node, &mut phase, RunPhase::Invoked);

        let outcome = called.and_then(|output| drain(&mut ctx, output));
        if let Some(fatal) = ctx.take_fatal() {
            self.transition(node, &mut phase, RunPhase::Failed);
            error!(node = %node.key, error = %fatal, "Node run failed");
            let record = ErrorRecord::new(error_kind(&fatal), fatal.to_string(), &format!("{:?}", fatal));
            self.fail(&executable, &mut result, run_log, record, start)?;
            return Err(fatal);
        }
        if let Err(e) = outcome {
            if let Some(signal) = e.downcast_ref::<BlockflowError>().filter(|e| e.is_control_flow()) {
                info!(node = %node.key, reason = %signal, "Function reported exhausted inputs");
                self.handler.abandon(&run_log)?;
                let mut result = ExecutionResult::exhausted(&node.key);
                result.elapsed_ms = start.elapsed().as_millis() as u64;
                return Ok(result);
            }

            self.transition(node, &mut phase, RunPhase::Failed);
            error!(node = %node.key, error = %e, "Function error");
            let message = e.to_string();
            let record = ErrorRecord::new("FunctionError", message.clone(), &format!("{:?}", e));
            self.fail(&executable, &mut result, run_log, record, start)?;
            if self.config.abort_on_function_error {
                return Err(BlockflowError::Function {
                    node: node.key.clone(),
                    message,
                });
            }
            return Ok(result);
        }
        self.transition(node, &mut phase, RunPhase::Emitted);

        let outputs = ctx.finish();
        if outputs.timed_out {
            warn!(node = %node.key, "Run stopped at its time limit");
        }
        run_log.end_state = outputs.state.clone();
        run_log.completed_at = Some(Utc::now());
        run_log.timed_out = outputs.timed_out;

        let created = reader.created();
        let commit = RunCommit {
            run_log,
            output_blocks: outputs.blocks,
            extra_stored_blocks: created.clone(),
            consumed: bound.consumed(),
            end_state: Some(outputs.state),
            schemas: outputs.schemas,
        };

        result.status = if outputs.timed_out {
            RunStatus::TimedOut
        } else if commit.output_blocks.is_empty() {
            RunStatus::SuccessNoOutput
        } else {
            RunStatus::SuccessWithOutput
        };
        result.input_blocks_consumed = bound.consumed_counts();
        result.output_blocks = commit.output_blocks.clone();
        result.stored_blocks_created = created;
        result.schemas_generated = commit.schemas.clone();
        result.elapsed_ms = start.elapsed().as_millis() as u64;

        self.handler.handle(&executable, &result, &commit)?;
        self.transition(node, &mut phase, RunPhase::Persisted);

        if self.config.compute_record_counts {
            for block in &mut result.output_blocks {
                self.env.record_count(block)?;
            }
        }
        result.elapsed_ms = start.elapsed().as_millis() as u64;
        self.transition(node, &mut phase, RunPhase::Finalized);

        info!(
            node = %node.key,
            status = ?result.status,
            blocks = result.output_blocks.len(),
            records = result.record_count(),
            consumed = ?result.input_blocks_consumed,
            elapsed_ms = result.elapsed_ms,
            "Node run complete"
        );
        Ok(result)
    }

    /// Record a failed run. Only the run log is persisted.
    fn fail(
        &self,
        executable: &Executable,
        result: &mut ExecutionResult,
        mut run_log: RunLog,
        record: ErrorRecord,
        start: Instant,
    ) -> Result<()> {
        run_log.completed_at = Some(Utc::now());
        run_log.error = Some(record.clone());
        result.status = RunStatus::FunctionError;
        result.error = Some(record);
        result.elapsed_ms = start.elapsed().as_millis() as u64;
        self.handler
            .handle(executable, result, &RunCommit::failed(run_log))
    }
}

/// Emit whatever the function returned on its default output.
fn drain(ctx: &mut RunContext<'_>, output: Output) -> anyhow::Result<()> {
    match output {
        Output::None => Ok(()),
        Output::Records(records) => emit_returned(ctx, records),
        Output::Iter(batches) => {
            for batch in batches {
                emit_returned(ctx, batch?)?;
                if !ctx.should_continue() {
                    break;
                }
            }
            Ok(())
        }
    }
}

fn emit_returned(ctx: &mut RunContext<'_>, records: Records) -> anyhow::Result<()> {
    ctx.emit(records, EmitOptions::default())?;
    Ok(())
}

fn error_kind(e: &BlockflowError) -> &'static str {
    match e {
        BlockflowError::SchemaConflict { .. } => "SchemaConflict",
        BlockflowError::ConversionNotSupported { .. } => "ConversionNotSupported",
        _ => "EngineError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DebugResultHandler, MetadataResultHandler};
    use blockflow_core::schema::{Field, FieldType, Schema};
    use blockflow_core::types::DEFAULT_OUTPUT_NAME;
    use blockflow_functions::function::FunctionDef;
    use blockflow_functions::interface::Signature;
    use blockflow_functions::ComponentRegistry;
    use blockflow_graph::{FlatGraph, GraphDef, NodeDef};
    use serde_json::json;

    fn registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::with_builtins().unwrap();
        reg.register_function(
            FunctionDef::new("t", "fail", Signature::new().param("input", "Block"), |_| {
                anyhow::bail!("boom")
            })
            .unwrap(),
        );
        reg.register_function(
            FunctionDef::new("t", "two_schemas", Signature::new().unannotated("ctx"), |args| {
                let ctx = args.context()?;
                let row = json!({"id": 1}).as_object().cloned().unwrap();
                ctx.emit(vec![row.clone()], EmitOptions::default().schema("shop.A"))?;
                // Swallowed by the function; the run must still fail.
                let _ = ctx.emit(vec![row], EmitOptions::default().schema("shop.B"));
                Ok(Output::None)
            })
            .unwrap(),
        );
        reg.register_function(
            FunctionDef::new("t", "batches", Signature::new(), |_| {
                let batches = (0..3).map(|i| -> anyhow::Result<Records> {
                    Ok(vec![json!({ "batch": i }).as_object().cloned().unwrap()])
                });
                Ok(Output::Iter(Box::new(batches)))
            })
            .unwrap(),
        );
        reg.register_function(
            FunctionDef::new(
                "t",
                "caught_up",
                Signature::new().unannotated("ctx").param("input", "Stream"),
                |args| {
                    let mut input = args
                        .stream("input")
                        .ok_or_else(|| anyhow::anyhow!("input not bound"))?;
                    input.read_all()?;
                    let ctx = args.context()?;
                    ctx.emit_state_value("seen", json!(true));
                    ctx.emit(vec![json!({"id": 1}).as_object().cloned().unwrap()], EmitOptions::default())?;
                    Err(BlockflowError::InputExhausted("nothing new upstream".into()).into())
                },
            )
            .unwrap(),
        );
        reg.register_schema(Schema::new("shop.A", vec![Field::new("id", FieldType::Integer)]));
        reg.register_schema(Schema::new("shop.B", vec![Field::new("id", FieldType::Integer)]));
        reg
    }

    fn setup(nodes: Vec<NodeDef>) -> (Arc<Environment>, FlatGraph) {
        let env = Arc::new(Environment::in_memory(registry()).unwrap());
        let graph = env.build(&GraphDef::new(nodes).unwrap()).unwrap();
        (env, graph)
    }

    fn executor(env: &Arc<Environment>, config: RunConfig) -> Executor {
        let handler = Arc::new(MetadataResultHandler::new(env.metadata().clone()));
        Executor::new(env.clone(), config, handler)
    }

    fn source(key: &str, n: usize) -> NodeDef {
        let rows: Vec<_> = (0..n).map(|i| json!({ "id": i })).collect();
        NodeDef::new(key, "core.import_records").with_param("records", json!(rows))
    }

    #[test]
    fn test_source_then_exhausted_downstream() {
        let (env, graph) = setup(vec![
            source("src", 3),
            NodeDef::new("copy", "core.passthrough").with_input("input", "src"),
        ]);
        let exec = executor(&env, RunConfig::default()).with_graph_hash(graph.fingerprint());

        let first = exec.execute(graph.node("src").unwrap()).unwrap();
        assert_eq!(first.status, RunStatus::SuccessWithOutput);
        assert_eq!(first.record_count(), 3);
        assert_eq!(first.schemas_generated.len(), 1);

        // Import only emits once; state persisted across runs.
        let again = exec.execute(graph.node("src").unwrap()).unwrap();
        assert_eq!(again.status, RunStatus::SuccessNoOutput);

        let copy = exec.execute(graph.node("copy").unwrap()).unwrap();
        assert_eq!(copy.status, RunStatus::SuccessWithOutput);
        assert_eq!(copy.input_blocks_consumed["input"], 1);
        assert_eq!(copy.non_reference_inputs, vec!["input".to_string()]);

        let skipped = exec.execute(graph.node("copy").unwrap()).unwrap();
        assert!(skipped.is_exhausted());
        assert!(skipped.run_id.is_none());

        let logs = env.metadata().run_logs("src").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].graph_hash.as_deref(), Some(graph.fingerprint().as_str()));
        assert_eq!(env.metadata().node_state("src").unwrap()["imported"], json!(true));
    }

    #[test]
    fn test_function_error_recorded() {
        let (env, graph) = setup(vec![
            source("src", 2),
            NodeDef::new("bad", "t.fail").with_input("input", "src"),
        ]);
        let exec = executor(&env, RunConfig::default());
        exec.execute(graph.node("src").unwrap()).unwrap();

        let result = exec.execute(graph.node("bad").unwrap()).unwrap();
        assert_eq!(result.status, RunStatus::FunctionError);
        assert!(result.error.as_ref().unwrap().message.contains("boom"));

        // Nothing consumed, so the input is offered again.
        assert!(env.metadata().consumed_block_ids("bad").unwrap().is_empty());
        let logs = env.metadata().run_logs("bad").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error.as_ref().unwrap().kind, "FunctionError");

        let strict = executor(
            &env,
            RunConfig {
                abort_on_function_error: true,
                ..RunConfig::default()
            },
        );
        let err = strict.execute(graph.node("bad").unwrap()).unwrap_err();
        assert!(matches!(err, BlockflowError::Function { .. }));
    }

    #[test]
    fn test_function_signalled_exhaustion_commits_nothing() {
        let (env, graph) = setup(vec![
            source("src", 2),
            NodeDef::new("n", "t.caught_up").with_input("input", "src"),
        ]);
        let exec = executor(&env, RunConfig::default());
        exec.execute(graph.node("src").unwrap()).unwrap();

        let result = exec.execute(graph.node("n").unwrap()).unwrap();
        assert!(result.is_exhausted());
        assert!(result.run_id.is_none());
        assert!(result.output_blocks.is_empty());

        assert!(env.latest_output("n").unwrap().is_none());
        assert!(env.metadata().consumed_block_ids("n").unwrap().is_empty());
        assert!(env.metadata().node_state("n").unwrap().is_empty());
        assert!(env.metadata().run_logs("n").unwrap().is_empty());

        // The input was not consumed, so it is offered again.
        let again = exec.execute(graph.node("n").unwrap()).unwrap();
        assert!(again.is_exhausted());
    }

    #[test]
    fn test_swallowed_schema_conflict_fails_run() {
        let (env, graph) = setup(vec![NodeDef::new("n", "t.two_schemas")]);
        let exec = executor(&env, RunConfig::default());
        let err = exec.execute(graph.node("n").unwrap()).unwrap_err();
        assert!(matches!(err, BlockflowError::SchemaConflict { .. }));

        assert!(env.latest_output("n").unwrap().is_none());
        let logs = env.metadata().run_logs("n").unwrap();
        let error = logs[0].error.as_ref().unwrap();
        assert_eq!(error.kind, "SchemaConflict");
        assert!(error.trace.contains("SchemaConflict"));
    }

    #[test]
    fn test_iterator_output_and_debug_handler() {
        let (env, graph) = setup(vec![NodeDef::new("n", "t.batches")]);
        let exec = Executor::new(env.clone(), RunConfig::default(), Arc::new(DebugResultHandler));
        let result = exec.execute(graph.node("n").unwrap()).unwrap();

        assert_eq!(result.status, RunStatus::SuccessWithOutput);
        let block = result.output_block(DEFAULT_OUTPUT_NAME).unwrap();
        assert_eq!(env.read_records(block).unwrap().len(), 3);
        assert_eq!(block.block.record_count, Some(3));
        // The debug handler persists nothing.
        assert!(env.metadata().run_logs("n").unwrap().is_empty());
    }

    #[test]
    fn test_time_limit_keeps_progress() {
        let (env, graph) = setup(vec![NodeDef::new("n", "t.batches")]);
        let exec = executor(
            &env,
            RunConfig {
                execution_timelimit_seconds: Some(0),
                ..RunConfig::default()
            },
        );
        let result = exec.execute(graph.node("n").unwrap()).unwrap();
        assert!(result.timed_out());
        assert_eq!(result.record_count(), 1);

        let logs = env.metadata().run_logs("n").unwrap();
        assert!(logs[0].timed_out);
        assert!(logs[0].error.is_none());
        assert!(env.latest_output("n").unwrap().is_some());
    }
}
