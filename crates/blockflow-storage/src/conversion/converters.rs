use std::io::Write;
use std::sync::Arc;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::storage::{ByteStream, DataFormat, OpenMode, StorageFormat, StorageKind};
use blockflow_core::types::StoredBlock;

use super::{ConversionCost, Converter};
use crate::file::read_json_lines;
use crate::registry::StorageRegistry;

const MEMORY_RECORDS: StorageFormat = StorageFormat::new(StorageKind::Memory, DataFormat::Records);
const FILE_JSON_LINES: StorageFormat = StorageFormat::new(StorageKind::File, DataFormat::JsonLines);
const DATABASE_TABLE: StorageFormat = StorageFormat::new(StorageKind::Database, DataFormat::Table);

pub fn builtin_converters() -> Vec<Arc<dyn Converter>> {
    vec![
        Arc::new(MemoryToMemory),
        Arc::new(MemoryToFile),
        Arc::new(FileToMemory),
        Arc::new(MemoryToDatabase),
        Arc::new(DatabaseToMemory),
    ]
}

/// Copy via `get` + `bulk_write_rows`.
fn copy_rows(source: &StoredBlock, target: &StoredBlock, storages: &StorageRegistry) -> Result<()> {
    let rows = storages.get(&source.storage_url)?.get(&source.name())?;
    storages
        .get(&target.storage_url)?
        .bulk_write_rows(&target.name(), &rows)
}

// ── MemoryToMemory ──────────────────────────────────────────────

/// Between two in-process storages.
pub struct MemoryToMemory;

impl Converter for MemoryToMemory {
    fn name(&self) -> &str {
        "memory_to_memory"
    }
    fn supported_inputs(&self) -> &[StorageFormat] {
        &[MEMORY_RECORDS]
    }
    fn supported_outputs(&self) -> &[StorageFormat] {
        &[MEMORY_RECORDS]
    }
    fn cost_level(&self) -> ConversionCost {
        ConversionCost::Memory
    }
    fn convert(&self, source: &StoredBlock, target: &StoredBlock, storages: &StorageRegistry) -> Result<()> {
        copy_rows(source, target, storages)
    }
}

// ── MemoryToFile ────────────────────────────────────────────────

/// Streams records out as JSON lines.
pub struct MemoryToFile;

impl Converter for MemoryToFile {
    fn name(&self) -> &str {
        "memory_to_file"
    }
    fn supported_inputs(&self) -> &[StorageFormat] {
        &[MEMORY_RECORDS]
    }
    fn supported_outputs(&self) -> &[StorageFormat] {
        &[FILE_JSON_LINES]
    }
    fn cost_level(&self) -> ConversionCost {
        ConversionCost::Disk
    }
    fn convert(&self, source: &StoredBlock, target: &StoredBlock, storages: &StorageRegistry) -> Result<()> {
        let rows = storages.get(&source.storage_url)?.get(&source.name())?;
        let target_storage = storages.get(&target.storage_url)?;
        match target_storage.open(&target.name(), OpenMode::Append)? {
            ByteStream::Writer(mut w) => {
                for row in &rows {
                    serde_json::to_writer(&mut w, row)?;
                    w.write_all(b"\n")?;
                }
                w.flush()?;
                Ok(())
            }
            ByteStream::Reader(_) => Err(BlockflowError::storage(
                &target.storage_url,
                "append opened a reader",
            )),
        }
    }
}

// ── FileToMemory ────────────────────────────────────────────────

/// Parses JSON lines into records.
pub struct FileToMemory;

impl Converter for FileToMemory {
    fn name(&self) -> &str {
        "file_to_memory"
    }
    fn supported_inputs(&self) -> &[StorageFormat] {
        &[FILE_JSON_LINES]
    }
    fn supported_outputs(&self) -> &[StorageFormat] {
        &[MEMORY_RECORDS]
    }
    fn cost_level(&self) -> ConversionCost {
        ConversionCost::Disk
    }
    fn convert(&self, source: &StoredBlock, target: &StoredBlock, storages: &StorageRegistry) -> Result<()> {
        let source_storage = storages.get(&source.storage_url)?;
        let rows = match source_storage.open(&source.name(), OpenMode::Read)? {
            ByteStream::Reader(r) => read_json_lines(r)?,
            ByteStream::Writer(_) => {
                return Err(BlockflowError::storage(
                    &source.storage_url,
                    "read opened a writer",
                ))
            }
        };
        storages
            .get(&target.storage_url)?
            .bulk_write_rows(&target.name(), &rows)
    }
}

// ── MemoryToDatabase ────────────────────────────────────────────

/// Batched insert into a database table.
pub struct MemoryToDatabase;

impl Converter for MemoryToDatabase {
    fn name(&self) -> &str {
        "memory_to_database"
    }
    fn supported_inputs(&self) -> &[StorageFormat] {
        &[MEMORY_RECORDS]
    }
    fn supported_outputs(&self) -> &[StorageFormat] {
        &[DATABASE_TABLE]
    }
    fn cost_level(&self) -> ConversionCost {
        ConversionCost::OverWire
    }
    fn convert(&self, source: &StoredBlock, target: &StoredBlock, storages: &StorageRegistry) -> Result<()> {
        copy_rows(source, target, storages)
    }
}

// ── DatabaseToMemory ────────────────────────────────────────────

pub struct DatabaseToMemory;

impl Converter for DatabaseToMemory {
    fn name(&self) -> &str {
        "database_to_memory"
    }
    fn supported_inputs(&self) -> &[StorageFormat] {
        &[DATABASE_TABLE]
    }
    fn supported_outputs(&self) -> &[StorageFormat] {
        &[MEMORY_RECORDS]
    }
    fn cost_level(&self) -> ConversionCost {
        ConversionCost::OverWire
    }
    fn convert(&self, source: &StoredBlock, target: &StoredBlock, storages: &StorageRegistry) -> Result<()> {
        copy_rows(source, target, storages)
    }
}
