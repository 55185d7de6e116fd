//! Cost-based movement of stored blocks between storages and formats.

pub mod converters;

use std::sync::Arc;

use tracing::{debug, info};

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::storage::{DataFormat, StorageFormat, StorageKind};
use blockflow_core::types::{ManagedBlock, StoredBlock};

use crate::registry::StorageRegistry;

/// Relative cost of a conversion, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversionCost {
    /// Data already where it needs to be.
    NoOp,
    /// Copy within process memory.
    Memory,
    /// Local serialization to or from disk.
    Disk,
    /// Transfer to or from a separate engine.
    OverWire,
}

/// Moves rows from one stored block into another.
pub trait Converter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn supported_inputs(&self) -> &[StorageFormat];

    fn supported_outputs(&self) -> &[StorageFormat];

    fn cost_level(&self) -> ConversionCost;

    /// Append the rows of `source` to `target`, creating it if needed.
    fn convert(
        &self,
        source: &StoredBlock,
        target: &StoredBlock,
        storages: &StorageRegistry,
    ) -> Result<()>;

    fn supports(&self, from: StorageFormat, to: StorageFormat) -> bool {
        self.supported_inputs().contains(&from) && self.supported_outputs().contains(&to)
    }
}

/// Registry of converters plus the storages they move data between.
pub struct ConversionEngine {
    converters: Vec<Arc<dyn Converter>>,
    storages: Arc<StorageRegistry>,
}

impl ConversionEngine {
    pub fn new(storages: Arc<StorageRegistry>) -> Self {
        Self {
            converters: Vec::new(),
            storages,
        }
    }

    /// Engine with the built-in memory, file and database converters.
    pub fn with_builtins(storages: Arc<StorageRegistry>) -> Self {
        let mut engine = Self::new(storages);
        for converter in converters::builtin_converters() {
            engine.register(converter);
        }
        engine
    }

    pub fn register(&mut self, converter: Arc<dyn Converter>) {
        debug!(converter = converter.name(), cost = ?converter.cost_level(), "Registered converter");
        self.converters.push(converter);
    }

    pub fn storages(&self) -> &Arc<StorageRegistry> {
        &self.storages
    }

    /// Cheapest converter from `from` to `to`. Ties go to the earliest
    /// registered.
    pub fn select(&self, from: StorageFormat, to: StorageFormat) -> Result<Arc<dyn Converter>> {
        self.converters
            .iter()
            .filter(|c| c.supports(from, to))
            .min_by_key(|c| c.cost_level())
            .cloned()
            .ok_or_else(|| BlockflowError::ConversionNotSupported {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    /// Storage format of a stored block.
    pub fn format_of(&self, stored: &StoredBlock) -> Result<StorageFormat> {
        Ok(StorageFormat::new(
            StorageKind::for_url(&stored.storage_url)?,
            stored.data_format,
        ))
    }

    /// Append `source`'s rows to `target`. Same storage and format is a
    /// direct copy; anything else goes through the cheapest converter.
    pub fn write_into(&self, source: &StoredBlock, target: &StoredBlock) -> Result<ConversionCost> {
        if is_same_place(source, &target.storage_url, target.data_format) {
            let storage = self.storages.get(&source.storage_url)?;
            if source.id != target.id {
                let rows = storage.get(&source.name())?;
                storage.bulk_write_rows(&target.name(), &rows)?;
            }
            return Ok(ConversionCost::NoOp);
        }
        let from = self.format_of(source)?;
        let to = self.format_of(target)?;
        let converter = self.select(from, to)?;
        info!(
            converter = converter.name(),
            cost = ?converter.cost_level(),
            from = %from,
            to = %to,
            "Converting stored block"
        );
        converter.convert(source, target, &self.storages)?;
        Ok(converter.cost_level())
    }

    /// Materialize `source` on `url` in `format`. Returns `source` itself
    /// when it is already there; otherwise a new written realization.
    pub fn convert(&self, source: &StoredBlock, url: &str, format: DataFormat) -> Result<StoredBlock> {
        if is_same_place(source, url, format) {
            return Ok(source.clone());
        }
        let mut target = StoredBlock::new(source.block_id.clone(), url, format);
        self.write_into(source, &target)?;
        target.data_is_written = true;
        Ok(target)
    }

    /// A written realization of `block` on `url` in `format`, and whether
    /// it was newly created. The cheapest existing realization is used as
    /// the source.
    pub fn ensure_on(
        &self,
        block: &ManagedBlock,
        url: &str,
        format: DataFormat,
    ) -> Result<(StoredBlock, bool)> {
        if let Some(existing) = block
            .written_stored_blocks()
            .find(|s| is_same_place(s, url, format))
        {
            return Ok((existing.clone(), false));
        }

        let to = StorageFormat::new(StorageKind::for_url(url)?, format);
        let mut best: Option<(ConversionCost, &StoredBlock)> = None;
        for stored in block.written_stored_blocks() {
            let Ok(from) = self.format_of(stored) else { continue };
            if let Ok(converter) = self.select(from, to) {
                let cost = converter.cost_level();
                if best.map_or(true, |(c, _)| cost < c) {
                    best = Some((cost, stored));
                }
            }
        }

        match best {
            Some((_, source)) => Ok((self.convert(source, url, format)?, true)),
            None => match block.written_stored_blocks().next() {
                Some(any) => Err(BlockflowError::ConversionNotSupported {
                    from: self.format_of(any)?.to_string(),
                    to: to.to_string(),
                }),
                None => Err(BlockflowError::storage(
                    url,
                    format!("block {} has no written realization", block.id()),
                )),
            },
        }
    }
}

fn is_same_place(stored: &StoredBlock, url: &str, format: DataFormat) -> bool {
    stored.storage_url == url && stored.data_format == format
}
