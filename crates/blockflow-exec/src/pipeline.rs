use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use blockflow_core::config::RunConfig;
use blockflow_core::error::{BlockflowError, Result};
use blockflow_graph::{FlatGraph, FlatNode, GraphDef};

use crate::environment::Environment;
use crate::executor::Executor;
use crate::handler::{handler_for, ResultHandler};
use crate::result::{ExecutionResult, RunStatus};

/// Runs the nodes of one flattened graph against an environment.
pub struct Pipeline {
    env: Arc<Environment>,
    graph: Arc<FlatGraph>,
    executor: Executor,
}

impl Pipeline {
    /// Pipeline using the environment's run settings.
    pub fn new(env: Arc<Environment>, graph: FlatGraph) -> Result<Self> {
        let config = env.run_config().clone();
        Self::with_config(env, graph, config)
    }

    /// Build `graph` in `env` and wrap it.
    pub fn from_graph_def(env: Arc<Environment>, graph: &GraphDef) -> Result<Self> {
        let flat = env.build(graph)?;
        Self::new(env, flat)
    }

    pub fn with_config(env: Arc<Environment>, graph: FlatGraph, config: RunConfig) -> Result<Self> {
        let handler = handler_for(&config.result_handler, env.metadata().clone())?;
        Ok(Self::with_handler(env, graph, config, handler))
    }

    pub fn with_handler(
        env: Arc<Environment>,
        graph: FlatGraph,
        config: RunConfig,
        handler: Arc<dyn ResultHandler>,
    ) -> Self {
        let executor =
            Executor::new(env.clone(), config, handler).with_graph_hash(graph.fingerprint());
        Self {
            env,
            graph: Arc::new(graph),
            executor,
        }
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn graph(&self) -> &FlatGraph {
        &self.graph
    }

    pub fn config(&self) -> &RunConfig {
        self.executor.config()
    }

    /// Run one node. With `run_until_inputs_exhausted` the node is run again
    /// for as long as each run succeeds and consumes new input.
    pub fn run_node(&self, key: &str) -> Result<Vec<ExecutionResult>> {
        let node = self.graph.node(key)?;
        self.run_cycles(node)
    }

    fn run_cycles(&self, node: &FlatNode) -> Result<Vec<ExecutionResult>> {
        let mut results = Vec::new();
        loop {
            let result = self.executor.execute(node)?;
            let again = self.config().run_until_inputs_exhausted
                && result.status.is_success()
                && result.made_progress();
            if result.status == RunStatus::FunctionError {
                warn!(node = %node.key, "Node run failed, continuing");
            }
            results.push(result);
            if !again {
                return Ok(results);
            }
        }
    }

    /// Run every upstream dependency of `key` in execution order, then `key`.
    pub fn produce(&self, key: &str) -> Result<Vec<ExecutionResult>> {
        let mut results = Vec::new();
        for node in self.graph.upstream_dependencies(key)? {
            results.extend(self.run_cycles(node)?);
        }
        results.extend(self.run_node(key)?);
        Ok(results)
    }

    /// Run all nodes in topological order.
    pub fn run_graph(&self) -> Result<Vec<ExecutionResult>> {
        let start = Instant::now();
        let mut results = Vec::new();
        for node in self.graph.execution_order() {
            results.extend(self.run_cycles(node)?);
        }
        log_summary(&results, start);
        Ok(results)
    }

    /// Run all nodes, executing the independent nodes of each dependency
    /// level in parallel on the blocking pool.
    pub async fn run_concurrent(self: &Arc<Self>) -> Result<Vec<ExecutionResult>> {
        let start = Instant::now();
        let mut results = Vec::new();
        for level in self.graph.dependency_levels() {
            let keys: Vec<String> = level.iter().map(|n| n.key.clone()).collect();
            let futs = keys.into_iter().map(|key| {
                let this = self.clone();
                async move {
                    let task_key = key.clone();
                    match tokio::task::spawn_blocking(move || this.run_node(&task_key)).await {
                        Ok(result) => result,
                        Err(e) => Err(BlockflowError::Function {
                            node: key,
                            message: e.to_string(),
                        }),
                    }
                }
            });
            let level_results: Vec<Result<Vec<ExecutionResult>>> =
                futures::future::join_all(futs).await;
            for r in level_results {
                results.extend(r?);
            }
        }
        log_summary(&results, start);
        Ok(results)
    }
}

fn log_summary(results: &[ExecutionResult], start: Instant) {
    let failed = results
        .iter()
        .filter(|r| r.status == RunStatus::FunctionError)
        .count();
    let skipped = results.iter().filter(|r| r.is_exhausted()).count();
    info!(
        runs = results.len(),
        failed,
        skipped,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Graph run complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::types::DEFAULT_OUTPUT_NAME;
    use blockflow_functions::function::{FunctionDef, Output};
    use blockflow_functions::interface::Signature;
    use blockflow_functions::ComponentRegistry;
    use blockflow_graph::NodeDef;
    use serde_json::json;

    fn registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::with_builtins().unwrap();
        reg.register_function(
            FunctionDef::new("t", "tick", Signature::new(), |_| {
                Ok(Output::Records(vec![json!({"tick": 1}).as_object().cloned().unwrap()]))
            })
            .unwrap(),
        );
        reg
    }

    fn source(key: &str, n: usize) -> NodeDef {
        let rows: Vec<_> = (0..n).map(|i| json!({ "id": i })).collect();
        NodeDef::new(key, "core.import_records").with_param("records", json!(rows))
    }

    fn pipeline(nodes: Vec<NodeDef>) -> Pipeline {
        let env = Arc::new(Environment::in_memory(registry()).unwrap());
        Pipeline::from_graph_def(env, &GraphDef::new(nodes).unwrap()).unwrap()
    }

    fn rows_of(p: &Pipeline, key: &str) -> usize {
        let block = p.env().latest_output(key).unwrap().unwrap();
        p.env().read_records(&block).unwrap().len()
    }

    #[test]
    fn test_run_graph_in_order() {
        let p = pipeline(vec![
            NodeDef::new("acc", "core.accumulator").with_input("input", "src"),
            source("src", 3),
        ]);
        let results = p.run_graph().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].node_key, "src");
        assert_eq!(results[1].status, RunStatus::SuccessWithOutput);
        assert_eq!(rows_of(&p, "acc"), 3);

        // Second pass: nothing new upstream, so the accumulator is skipped.
        let again = p.run_graph().unwrap();
        assert_eq!(again[0].status, RunStatus::SuccessNoOutput);
        assert!(again[1].is_exhausted());
    }

    #[test]
    fn test_produce_runs_upstream_first() {
        let p = pipeline(vec![
            source("src", 2),
            NodeDef::new("copy", "core.passthrough").with_input("input", "src"),
            NodeDef::new("other", "t.tick"),
        ]);
        let results = p.produce("copy").unwrap();
        let keys: Vec<&str> = results.iter().map(|r| r.node_key.as_str()).collect();
        assert_eq!(keys, vec!["src", "copy"]);
        assert!(p.env().latest_output("other").unwrap().is_none());
        assert!(p.run_node("missing").is_err());
    }

    #[test]
    fn test_run_until_inputs_exhausted() {
        let env = Arc::new(Environment::in_memory(registry()).unwrap());
        let graph = env
            .build(
                &GraphDef::new(vec![
                    NodeDef::new("tick", "t.tick"),
                    NodeDef::new("dedupe", "core.dedupe_keep_latest").with_input("input", "tick"),
                ])
                .unwrap(),
            )
            .unwrap();
        let config = RunConfig {
            run_until_inputs_exhausted: true,
            ..RunConfig::default()
        };
        let p = Pipeline::with_config(env.clone(), graph, config).unwrap();

        // A source makes no progress on inputs, so it runs once per call.
        for _ in 0..3 {
            assert_eq!(p.run_node("tick").unwrap().len(), 1);
        }
        let results = p.run_node("dedupe").unwrap();
        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|r| r.status == RunStatus::SuccessWithOutput));
        assert!(results[3].is_exhausted());
        assert_eq!(env.metadata().blocks_for_output("dedupe", DEFAULT_OUTPUT_NAME).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_run_concurrent_levels() {
        let p = Arc::new(pipeline(vec![
            source("a", 2),
            source("b", 5),
            NodeDef::new("acc", "core.accumulator").with_input("input", "b"),
        ]));
        assert_eq!(p.graph().dependency_levels().len(), 2);

        let results = p.run_concurrent().await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status.is_success()));
        assert_eq!(results[2].node_key, "acc");
        assert_eq!(rows_of(&p, "acc"), 5);
        assert_eq!(rows_of(&p, "a"), 2);
    }
}
