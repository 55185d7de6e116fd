use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::storage::{ByteStream, DataFormat, OpenMode, StorageApi, StorageKind};
use blockflow_core::types::{Record, Records};

/// Directory of JSON-lines files, one per object.
pub struct FileStorage {
    url: String,
    root: PathBuf,
}

impl FileStorage {
    /// `file:///abs/dir` or `file://relative/dir`.
    pub fn from_url(url: &str) -> Result<Self> {
        let path = url
            .strip_prefix("file://")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BlockflowError::UnsupportedStorage(url.to_string()))?;
        Ok(Self::new(url, Path::new(path)))
    }

    pub fn new(url: impl Into<String>, root: &Path) -> Self {
        Self {
            url: url.into(),
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", name))
    }

    fn err(&self, e: impl std::fmt::Display) -> BlockflowError {
        BlockflowError::storage(&self.url, e)
    }

    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| self.err(e))
    }

    fn write_rows(&self, writer: &mut impl Write, rows: &[Record]) -> Result<()> {
        for row in rows {
            serde_json::to_writer(&mut *writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl StorageApi for FileStorage {
    fn url(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> StorageKind {
        StorageKind::File
    }

    fn natural_format(&self) -> DataFormat {
        DataFormat::JsonLines
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name).is_file())
    }

    fn put(&self, name: &str, records: Records) -> Result<()> {
        self.ensure_root()?;
        let file = File::create(self.path(name)).map_err(|e| self.err(e))?;
        self.write_rows(&mut BufWriter::new(file), &records)
    }

    fn get(&self, name: &str) -> Result<Records> {
        let file = File::open(self.path(name)).map_err(|e| self.err(format!("{}: {}", name, e)))?;
        read_json_lines(BufReader::new(file))
    }

    fn open(&self, name: &str, mode: OpenMode) -> Result<ByteStream> {
        let path = self.path(name);
        match mode {
            OpenMode::Read => {
                let file = File::open(&path).map_err(|e| self.err(e))?;
                Ok(ByteStream::Reader(Box::new(BufReader::new(file))))
            }
            OpenMode::Write => {
                self.ensure_root()?;
                let file = File::create(&path).map_err(|e| self.err(e))?;
                Ok(ByteStream::Writer(Box::new(BufWriter::new(file))))
            }
            OpenMode::Append => {
                self.ensure_root()?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| self.err(e))?;
                Ok(ByteStream::Writer(Box::new(BufWriter::new(file))))
            }
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.err(e)),
        }
    }

    fn bulk_write_rows(&self, name: &str, rows: &[Record]) -> Result<()> {
        match self.open(name, OpenMode::Append)? {
            ByteStream::Writer(mut w) => self.write_rows(&mut w, rows),
            ByteStream::Reader(_) => Err(self.err("append opened a reader")),
        }
    }

    fn record_count(&self, name: &str) -> Result<u64> {
        let file = File::open(self.path(name)).map_err(|e| self.err(e))?;
        let mut count = 0;
        for line in BufReader::new(file).lines() {
            if !line?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Parse newline-delimited JSON objects, skipping blank lines.
pub fn read_json_lines(reader: impl BufRead) -> Result<Records> {
    let mut records = Records::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
