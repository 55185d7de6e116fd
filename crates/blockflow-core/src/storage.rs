use std::fmt;
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BlockflowError, Result};
use crate::types::{Record, Records};

/// Storage engine family, selected by url scheme.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Memory,
    File,
    Database,
}

impl StorageKind {
    pub fn for_url(url: &str) -> Result<Self> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| BlockflowError::UnsupportedStorage(url.to_string()))?;
        match scheme {
            "memory" | "python" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "sqlite" | "postgres" | "postgresql" | "mysql" => Ok(Self::Database),
            _ => Err(BlockflowError::UnsupportedStorage(url.to_string())),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Database => "database",
        };
        f.write_str(s)
    }
}

/// Physical layout of stored data.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// In-process list of rows.
    Records,
    /// Newline-delimited JSON objects.
    JsonLines,
    /// Database table.
    Table,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Records => "records",
            Self::JsonLines => "json_lines",
            Self::Table => "table",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "records" => Ok(Self::Records),
            "json_lines" | "jsonl" => Ok(Self::JsonLines),
            "table" | "database_table" => Ok(Self::Table),
            other => Err(BlockflowError::Config(format!("Unknown data format: {}", other))),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (storage kind, format) pair a converter can read or write.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFormat {
    pub kind: StorageKind,
    pub format: DataFormat,
}

impl StorageFormat {
    pub const fn new(kind: StorageKind, format: DataFormat) -> Self {
        Self { kind, format }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

/// Byte-level handle returned by [`StorageApi::open`].
pub enum ByteStream {
    Reader(Box<dyn BufRead + Send>),
    Writer(Box<dyn Write + Send>),
}

/// Storage engine. One instance per storage url.
pub trait StorageApi: Send + Sync + 'static {
    fn url(&self) -> &str;

    fn kind(&self) -> StorageKind;

    /// Format data takes when written without an explicit request.
    fn natural_format(&self) -> DataFormat;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Replace `name` with `records`.
    fn put(&self, name: &str, records: Records) -> Result<()>;

    fn get(&self, name: &str) -> Result<Records>;

    /// Open a byte stream onto `name`. Only file-like engines support this.
    fn open(&self, name: &str, mode: OpenMode) -> Result<ByteStream> {
        let _ = (name, mode);
        Err(BlockflowError::storage(
            self.url(),
            "byte streams are not supported by this storage",
        ))
    }

    fn remove(&self, name: &str) -> Result<()>;

    /// Append rows to `name`, creating it if missing.
    fn bulk_write_rows(&self, name: &str, rows: &[Record]) -> Result<()>;

    fn record_count(&self, name: &str) -> Result<u64>;

    fn storage_format(&self) -> StorageFormat {
        StorageFormat::new(self.kind(), self.natural_format())
    }
}
