use std::sync::Arc;

use tracing::{debug, info};

use blockflow_core::config::{EngineConfig, RunConfig};
use blockflow_core::error::Result;
use blockflow_core::traits::MetadataStore;
use blockflow_core::types::{ManagedBlock, Records};
use blockflow_functions::ComponentRegistry;
use blockflow_graph::{FlatGraph, GraphDef};
use blockflow_metadata::SqliteMetadataStore;
use blockflow_storage::{ConversionEngine, StorageRegistry};

/// Everything a run needs: component lookup, storages, converters and the
/// metadata store. Built once and shared by every node-run.
pub struct Environment {
    registry: Arc<ComponentRegistry>,
    storages: Arc<StorageRegistry>,
    conversions: Arc<ConversionEngine>,
    metadata: Arc<dyn MetadataStore>,
    run_config: RunConfig,
}

impl Environment {
    /// Open the configured metadata store and storages around `registry`.
    pub fn from_config(config: &EngineConfig, mut registry: ComponentRegistry) -> Result<Self> {
        registry.set_namespace_precedence(&config.registry.namespace_precedence);

        let metadata = Arc::new(SqliteMetadataStore::open_url(&config.metadata.url)?);
        if config.registry.use_global_schema_lookup {
            registry.set_catalog(metadata.clone());
        }

        let storages = Arc::new(StorageRegistry::new());
        for url in config.all_storage_urls() {
            storages.get(&url)?;
        }
        let conversions = ConversionEngine::with_builtins(storages);

        info!(
            metadata = %config.metadata.url,
            storages = config.all_storage_urls().len(),
            functions = registry.function_keys().len(),
            "Environment ready"
        );
        Ok(Self::with_parts(registry, metadata, conversions).with_run_config(config.run.clone()))
    }

    /// Default configuration: in-memory metadata and local memory storage.
    pub fn in_memory(registry: ComponentRegistry) -> Result<Self> {
        Self::from_config(&EngineConfig::default(), registry)
    }

    /// Assemble from already-built parts. Storages are taken from
    /// `conversions`.
    pub fn with_parts(
        registry: ComponentRegistry,
        metadata: Arc<dyn MetadataStore>,
        conversions: ConversionEngine,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            storages: conversions.storages().clone(),
            conversions: Arc::new(conversions),
            metadata,
            run_config: RunConfig::default(),
        }
    }

    pub fn with_run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn storages(&self) -> &Arc<StorageRegistry> {
        &self.storages
    }

    pub fn conversions(&self) -> &Arc<ConversionEngine> {
        &self.conversions
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Run settings used when a pipeline is not given its own.
    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    /// Flatten and resolve a graph against this environment's registry.
    pub fn build(&self, graph: &GraphDef) -> Result<FlatGraph> {
        blockflow_graph::build(graph, &self.registry)
    }

    /// Newest block `node_key` emitted on any output.
    pub fn latest_output(&self, node_key: &str) -> Result<Option<ManagedBlock>> {
        self.metadata.latest_output(node_key)
    }

    /// Row count of `block`, counted by the storage holding its first
    /// written realization and cached on the block. `None` when no
    /// realization has been written.
    pub fn record_count(&self, block: &mut ManagedBlock) -> Result<Option<u64>> {
        if let Some(count) = block.block.record_count {
            return Ok(Some(count));
        }
        let Some(stored) = block.written_stored_blocks().next() else {
            return Ok(None);
        };
        let count = self
            .storages
            .get(&stored.storage_url)?
            .record_count(&stored.name())?;
        self.metadata.set_record_count(block.id(), count)?;
        block.block.record_count = Some(count);
        debug!(block_id = %block.id(), count, "Counted records");
        Ok(Some(count))
    }

    /// Rows of `block` from its first written realization.
    pub fn read_records(&self, block: &ManagedBlock) -> Result<Records> {
        match block.written_stored_blocks().next() {
            Some(stored) => self.storages.get(&stored.storage_url)?.get(&stored.name()),
            None => Ok(Records::new()),
        }
    }
}
