use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blockflow_core::error::Result;
use blockflow_core::storage::StorageFormat;
use blockflow_core::types::StoredBlock;
use blockflow_storage::conversion::converters::builtin_converters;
use blockflow_storage::{ConversionCost, Converter, StorageRegistry};

/// Wraps a converter and counts its invocations in a shared counter.
pub struct CountingConverter {
    inner: Arc<dyn Converter>,
    calls: Arc<AtomicUsize>,
}

impl CountingConverter {
    pub fn new(inner: Arc<dyn Converter>, calls: Arc<AtomicUsize>) -> Self {
        Self { inner, calls }
    }

    /// Every built-in converter, wrapped around one counter.
    pub fn builtins(calls: &Arc<AtomicUsize>) -> Vec<Arc<dyn Converter>> {
        builtin_converters()
            .into_iter()
            .map(|c| Arc::new(Self::new(c, calls.clone())) as Arc<dyn Converter>)
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Converter for CountingConverter {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn supported_inputs(&self) -> &[StorageFormat] {
        self.inner.supported_inputs()
    }
    fn supported_outputs(&self) -> &[StorageFormat] {
        self.inner.supported_outputs()
    }
    fn cost_level(&self) -> ConversionCost {
        self.inner.cost_level()
    }
    fn convert(&self, source: &StoredBlock, target: &StoredBlock, storages: &StorageRegistry) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.convert(source, target, storages)
    }
}
