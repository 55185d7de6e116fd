use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blockflow_core::config::RunConfig;
use blockflow_core::schema::Schema;
use blockflow_exec::{Environment, Pipeline};
use blockflow_functions::{ComponentRegistry, FunctionDef};
use blockflow_graph::{GraphDef, NodeDef};
use blockflow_metadata::SqliteMetadataStore;
use blockflow_storage::{ConversionEngine, StorageRegistry};

use crate::converter::CountingConverter;

/// In-memory environment whose converters are counted.
pub struct TestEnv {
    pub env: Arc<Environment>,
    pub conversions: Arc<AtomicUsize>,
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Converter invocations so far.
    pub fn conversion_calls(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }

    /// Pipeline over `nodes` using the environment's run settings.
    pub fn pipeline(&self, nodes: Vec<NodeDef>) -> Pipeline {
        let graph = GraphDef::new(nodes).expect("valid graph");
        Pipeline::from_graph_def(self.env.clone(), &graph).expect("graph builds")
    }
}

pub struct TestEnvBuilder {
    registry: ComponentRegistry,
    run_config: RunConfig,
}

impl TestEnvBuilder {
    /// Builtins registered, default run settings.
    pub fn new() -> Self {
        Self {
            registry: ComponentRegistry::with_builtins().expect("builtins register"),
            run_config: RunConfig::default(),
        }
    }

    pub fn function(mut self, def: FunctionDef) -> Self {
        self.registry.register_function(def);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.registry.register_schema(schema);
        self
    }

    pub fn run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }

    pub fn build(mut self) -> TestEnv {
        let metadata = Arc::new(SqliteMetadataStore::in_memory().expect("in-memory metadata store"));
        self.registry.set_catalog(metadata.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let mut conversions = ConversionEngine::new(Arc::new(StorageRegistry::new()));
        for converter in CountingConverter::builtins(&calls) {
            conversions.register(converter);
        }

        let env = Environment::with_parts(self.registry, metadata, conversions)
            .with_run_config(self.run_config);
        TestEnv {
            env: Arc::new(env),
            conversions: calls,
        }
    }
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}
