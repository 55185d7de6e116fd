use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::schema::Schema;
use blockflow_core::storage::DataFormat;
use blockflow_core::traits::{MetadataStore, RunCommit, SchemaCatalog};
use blockflow_core::types::*;

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS data_blocks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        created_by_node TEXT NOT NULL,
        output_name TEXT NOT NULL,
        nominal_schema_key TEXT,
        inferred_schema_key TEXT,
        realized_schema_key TEXT,
        record_count INTEGER,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_data_blocks_output
        ON data_blocks(created_by_node, output_name, seq);

    CREATE TABLE IF NOT EXISTS stored_blocks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        block_id TEXT NOT NULL REFERENCES data_blocks(id),
        storage_url TEXT NOT NULL,
        data_format TEXT NOT NULL,
        data_is_written INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_stored_blocks_block ON stored_blocks(block_id);

    CREATE TABLE IF NOT EXISTS block_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_key TEXT NOT NULL,
        block_id TEXT NOT NULL,
        direction TEXT NOT NULL,
        port TEXT,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_block_log_node ON block_log(node_key, direction);

    CREATE TABLE IF NOT EXISTS node_state (
        node_key TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS run_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        node_key TEXT NOT NULL,
        function_key TEXT NOT NULL,
        graph_hash TEXT,
        start_state TEXT NOT NULL,
        end_state TEXT NOT NULL,
        params TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        error TEXT,
        timed_out INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_run_log_node ON run_log(node_key, seq);

    CREATE TABLE IF NOT EXISTS schemas (
        key TEXT PRIMARY KEY,
        definition TEXT NOT NULL
    );";

const BLOCK_COLUMNS: &str = "id, created_by_node, output_name, nominal_schema_key, \
     inferred_schema_key, realized_schema_key, record_count, created_at";

const RUN_LOG_COLUMNS: &str = "id, node_key, function_key, graph_hash, start_state, end_state, \
     params, started_at, completed_at, error, timed_out";

fn db(e: impl std::fmt::Display) -> BlockflowError {
    BlockflowError::Database(e.to_string())
}

/// SQLite-backed metadata store: blocks and their realizations, the
/// consumption log, node state, run logs and generated schemas.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open or create a metadata database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| db(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db)?;

        debug!(path = %path.display(), "Metadata store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `sqlite://:memory:` or `sqlite://<path>`.
    pub fn open_url(url: &str) -> Result<Self> {
        match url.strip_prefix("sqlite://") {
            Some("") | Some(":memory:") => Self::in_memory(),
            Some(path) => Self::open(Path::new(path)),
            None => Err(BlockflowError::UnsupportedStorage(url.to_string())),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db)
    }

    /// Keys of every persisted schema.
    pub fn schema_keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM schemas ORDER BY key")
            .map_err(db)?;
        let keys = stmt
            .query_map([], |row| row.get(0))
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db)?;
        Ok(keys)
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_map(s: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    Ok(serde_json::from_str(s)?)
}

fn block_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataBlock> {
    let created_at: String = row.get(7)?;
    Ok(DataBlock {
        id: BlockId(row.get(0)?),
        created_by_node: row.get(1)?,
        output_name: row.get(2)?,
        nominal_schema_key: row.get(3)?,
        inferred_schema_key: row.get(4)?,
        realized_schema_key: row.get(5)?,
        record_count: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
        created_at: parse_time(&created_at),
    })
}

fn load_stored_blocks(conn: &Connection, block_id: &BlockId) -> Result<Vec<StoredBlock>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT id, storage_url, data_format, data_is_written FROM stored_blocks
             WHERE block_id = ?1 ORDER BY seq",
        )
        .map_err(db)?;
    let rows = stmt
        .query_map(params![block_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })
        .map_err(db)?;

    let mut stored = Vec::new();
    for row in rows {
        let (id, storage_url, format, data_is_written) = row.map_err(db)?;
        stored.push(StoredBlock {
            id: StoredBlockId(id),
            block_id: block_id.clone(),
            storage_url,
            data_format: DataFormat::parse(&format)?,
            data_is_written,
        });
    }
    Ok(stored)
}

fn managed(conn: &Connection, blocks: Vec<DataBlock>) -> Result<Vec<ManagedBlock>> {
    blocks
        .into_iter()
        .map(|block| {
            let stored_blocks = load_stored_blocks(conn, &block.id)?;
            Ok(ManagedBlock {
                block,
                stored_blocks,
            })
        })
        .collect()
}

fn insert_block(conn: &Connection, block: &DataBlock) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO data_blocks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            BLOCK_COLUMNS
        ),
        params![
            block.id.as_str(),
            block.created_by_node,
            block.output_name,
            block.nominal_schema_key,
            block.inferred_schema_key,
            block.realized_schema_key,
            block.record_count.map(|n| n as i64),
            block.created_at.to_rfc3339(),
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn insert_stored_block(conn: &Connection, stored: &StoredBlock) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO stored_blocks (id, block_id, storage_url, data_format, data_is_written)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            stored.id.as_str(),
            stored.block_id.as_str(),
            stored.storage_url,
            stored.data_format.as_str(),
            stored.data_is_written,
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn log_block(
    conn: &Connection,
    node_key: &str,
    block_id: &BlockId,
    direction: Direction,
    port: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO block_log (node_key, block_id, direction, port, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            node_key,
            block_id.as_str(),
            direction.as_str(),
            port,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn upsert_run_log(conn: &Connection, log: &RunLog) -> Result<()> {
    let error = log.error.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO run_log ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 graph_hash = excluded.graph_hash,
                 end_state = excluded.end_state,
                 completed_at = excluded.completed_at,
                 error = excluded.error,
                 timed_out = excluded.timed_out",
            RUN_LOG_COLUMNS
        ),
        params![
            log.id.as_str(),
            log.node_key,
            log.function_key,
            log.graph_hash,
            serde_json::to_string(&log.start_state)?,
            serde_json::to_string(&log.end_state)?,
            serde_json::to_string(&log.params)?,
            log.started_at.to_rfc3339(),
            log.completed_at.map(|t| t.to_rfc3339()),
            error,
            log.timed_out,
        ],
    )
    .map_err(db)?;
    Ok(())
}

struct RunLogRow {
    id: String,
    node_key: String,
    function_key: String,
    graph_hash: Option<String>,
    start_state: String,
    end_state: String,
    params: String,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
    timed_out: bool,
}

impl RunLogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            node_key: row.get(1)?,
            function_key: row.get(2)?,
            graph_hash: row.get(3)?,
            start_state: row.get(4)?,
            end_state: row.get(5)?,
            params: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            error: row.get(9)?,
            timed_out: row.get(10)?,
        })
    }

    fn into_run_log(self) -> Result<RunLog> {
        Ok(RunLog {
            id: RunId(self.id),
            node_key: self.node_key,
            function_key: self.function_key,
            graph_hash: self.graph_hash,
            start_state: parse_map(&self.start_state)?,
            end_state: parse_map(&self.end_state)?,
            params: parse_map(&self.params)?,
            started_at: parse_time(&self.started_at),
            completed_at: self.completed_at.as_deref().map(parse_time),
            error: self
                .error
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            timed_out: self.timed_out,
        })
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn blocks_for_output(&self, node_key: &str, output_name: &str) -> Result<Vec<ManagedBlock>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM data_blocks
                 WHERE created_by_node = ?1 AND output_name = ?2
                 ORDER BY seq",
                BLOCK_COLUMNS
            ))
            .map_err(db)?;
        let blocks = stmt
            .query_map(params![node_key, output_name], block_from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        managed(&conn, blocks)
    }

    fn latest_block(&self, node_key: &str, output_name: &str) -> Result<Option<ManagedBlock>> {
        let conn = self.conn()?;
        let block = conn
            .query_row(
                &format!(
                    "SELECT {} FROM data_blocks
                     WHERE created_by_node = ?1 AND output_name = ?2
                     ORDER BY seq DESC LIMIT 1",
                    BLOCK_COLUMNS
                ),
                params![node_key, output_name],
                block_from_row,
            )
            .optional()
            .map_err(db)?;
        Ok(managed(&conn, block.into_iter().collect())?.pop())
    }

    fn latest_output(&self, node_key: &str) -> Result<Option<ManagedBlock>> {
        let conn = self.conn()?;
        let block = conn
            .query_row(
                &format!(
                    "SELECT {} FROM data_blocks WHERE created_by_node = ?1
                     ORDER BY seq DESC LIMIT 1",
                    BLOCK_COLUMNS
                ),
                params![node_key],
                block_from_row,
            )
            .optional()
            .map_err(db)?;
        Ok(managed(&conn, block.into_iter().collect())?.pop())
    }

    fn block(&self, id: &BlockId) -> Result<Option<ManagedBlock>> {
        let conn = self.conn()?;
        let block = conn
            .query_row(
                &format!("SELECT {} FROM data_blocks WHERE id = ?1", BLOCK_COLUMNS),
                params![id.as_str()],
                block_from_row,
            )
            .optional()
            .map_err(db)?;
        Ok(managed(&conn, block.into_iter().collect())?.pop())
    }

    fn consumed_block_ids(&self, node_key: &str) -> Result<HashSet<BlockId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT block_id FROM block_log WHERE node_key = ?1 AND direction = 'input'",
            )
            .map_err(db)?;
        let ids = stmt
            .query_map(params![node_key], |row| row.get::<_, String>(0))
            .map_err(db)?
            .map(|id| id.map(BlockId))
            .collect::<rusqlite::Result<HashSet<_>>>()
            .map_err(db)?;
        Ok(ids)
    }

    fn node_state(&self, node_key: &str) -> Result<StateMap> {
        let conn = self.conn()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM node_state WHERE node_key = ?1",
                params![node_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        match state {
            Some(json) => parse_map(&json),
            None => Ok(StateMap::new()),
        }
    }

    fn begin_run(&self, run_log: &RunLog) -> Result<()> {
        let conn = self.conn()?;
        upsert_run_log(&conn, run_log)?;
        debug!(node = %run_log.node_key, run_id = %run_log.id, "Run started");
        Ok(())
    }

    fn commit_run(&self, commit: &RunCommit) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;
        let node_key = commit.run_log.node_key.as_str();

        upsert_run_log(&tx, &commit.run_log)?;

        if !commit.is_failure() {
            for output in &commit.output_blocks {
                insert_block(&tx, &output.block)?;
                for stored in &output.stored_blocks {
                    insert_stored_block(&tx, stored)?;
                }
                log_block(
                    &tx,
                    node_key,
                    output.id(),
                    Direction::Output,
                    &output.block.output_name,
                )?;
            }
            for stored in &commit.extra_stored_blocks {
                insert_stored_block(&tx, stored)?;
            }
            for (port, block_id) in &commit.consumed {
                log_block(&tx, node_key, block_id, Direction::Input, port)?;
            }
            if let Some(state) = &commit.end_state {
                tx.execute(
                    "INSERT INTO node_state (node_key, state, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(node_key) DO UPDATE SET
                         state = excluded.state,
                         updated_at = excluded.updated_at",
                    params![node_key, serde_json::to_string(state)?, Utc::now().to_rfc3339()],
                )
                .map_err(db)?;
            }
            for schema in &commit.schemas {
                tx.execute(
                    "INSERT OR REPLACE INTO schemas (key, definition) VALUES (?1, ?2)",
                    params![schema.key, serde_json::to_string(schema)?],
                )
                .map_err(db)?;
            }
        }

        tx.commit().map_err(db)?;
        debug!(
            node = %node_key,
            run_id = %commit.run_log.id,
            outputs = commit.output_blocks.len(),
            consumed = commit.consumed.len(),
            failed = commit.is_failure(),
            "Run committed"
        );
        Ok(())
    }

    fn discard_run(&self, run_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM run_log WHERE id = ?1 AND completed_at IS NULL",
                params![run_id],
            )
            .map_err(db)?;
        debug!(run_id = %run_id, removed, "Run discarded");
        Ok(())
    }

    fn run_logs(&self, node_key: &str) -> Result<Vec<RunLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM run_log WHERE node_key = ?1 ORDER BY seq",
                RUN_LOG_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![node_key], RunLogRow::from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        rows.into_iter().map(RunLogRow::into_run_log).collect()
    }

    fn consumption_log(&self, node_key: &str) -> Result<Vec<ConsumptionEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT block_id, direction, port, recorded_at FROM block_log
                 WHERE node_key = ?1 ORDER BY id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![node_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db)?;

        let mut entries = Vec::new();
        for row in rows {
            let (block_id, direction, port, recorded_at) = row.map_err(db)?;
            let direction = Direction::parse(&direction)
                .ok_or_else(|| db(format!("unknown log direction '{}'", direction)))?;
            entries.push(ConsumptionEntry {
                node_key: node_key.to_string(),
                block_id: BlockId(block_id),
                direction,
                port,
                recorded_at: parse_time(&recorded_at),
            });
        }
        Ok(entries)
    }

    fn set_record_count(&self, id: &BlockId, count: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE data_blocks SET record_count = ?1 WHERE id = ?2",
            params![count as i64, id.as_str()],
        )
        .map_err(db)?;
        Ok(())
    }
}

impl SchemaCatalog for SqliteMetadataStore {
    fn get_schema(&self, key: &str) -> Result<Option<Schema>> {
        let conn = self.conn()?;
        let definition: Option<String> = conn
            .query_row(
                "SELECT definition FROM schemas WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        Ok(definition
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::schema::{Field, FieldType};
    use serde_json::json;

    fn output_block(node: &str, url: &str) -> ManagedBlock {
        let block = DataBlock::new(node, DEFAULT_OUTPUT_NAME);
        let mut stored = StoredBlock::new(block.id.clone(), url, DataFormat::Records);
        stored.data_is_written = true;
        ManagedBlock {
            block,
            stored_blocks: vec![stored],
        }
    }

    fn commit(node: &str, outputs: Vec<ManagedBlock>, consumed: Vec<BlockId>) -> RunCommit {
        let mut state = StateMap::new();
        state.insert("runs".into(), json!(1));
        let mut run_log = RunLog::start(node, "core.passthrough", StateMap::new(), Default::default());
        run_log.end_state = state.clone();
        run_log.completed_at = Some(Utc::now());
        RunCommit {
            run_log,
            output_blocks: outputs,
            extra_stored_blocks: vec![],
            consumed: consumed.into_iter().map(|id| ("input".to_string(), id)).collect(),
            end_state: Some(state),
            schemas: vec![],
        }
    }

    #[test]
    fn test_commit_and_query_blocks() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let first = output_block("src", "memory://a");
        let second = output_block("src", "memory://a");
        store.commit_run(&commit("src", vec![first.clone()], vec![])).unwrap();
        store.commit_run(&commit("src", vec![second.clone()], vec![])).unwrap();

        let blocks = store.blocks_for_output("src", DEFAULT_OUTPUT_NAME).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id(), first.id());
        assert_eq!(blocks[0].stored_blocks, first.stored_blocks);

        assert_eq!(store.latest_block("src", DEFAULT_OUTPUT_NAME).unwrap().unwrap().id(), second.id());
        assert_eq!(store.latest_output("src").unwrap().unwrap().id(), second.id());
        assert!(store.latest_output("other").unwrap().is_none());
        assert!(store.block(first.id()).unwrap().is_some());
        assert!(store.blocks_for_output("src", "errors").unwrap().is_empty());
    }

    #[test]
    fn test_consumption_and_state() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let up = output_block("src", "memory://a");
        store.commit_run(&commit("src", vec![up.clone()], vec![])).unwrap();
        assert!(store.consumed_block_ids("sink").unwrap().is_empty());
        assert!(store.node_state("sink").unwrap().is_empty());

        store.commit_run(&commit("sink", vec![], vec![up.id().clone()])).unwrap();
        let consumed = store.consumed_block_ids("sink").unwrap();
        assert!(consumed.contains(up.id()));
        assert_eq!(store.node_state("sink").unwrap()["runs"], json!(1));

        let log = store.consumption_log("sink").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].direction, Direction::Input);
        assert_eq!(log[0].port.as_deref(), Some("input"));

        let src_log = store.consumption_log("src").unwrap();
        assert_eq!(src_log[0].direction, Direction::Output);
    }

    #[test]
    fn test_failed_run_writes_only_run_log() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let up = output_block("src", "memory://a");
        let mut failed = commit("sink", vec![output_block("sink", "memory://a")], vec![up.id().clone()]);
        failed.run_log.error = Some(ErrorRecord::new("FunctionError", "boom", "trace"));
        store.begin_run(&failed.run_log).unwrap();
        store.commit_run(&failed).unwrap();

        assert!(store.consumed_block_ids("sink").unwrap().is_empty());
        assert!(store.node_state("sink").unwrap().is_empty());
        assert!(store.latest_output("sink").unwrap().is_none());

        let logs = store.run_logs("sink").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error.as_ref().unwrap().message, "boom");
        assert!(logs[0].is_complete());
    }

    #[test]
    fn test_commit_rolls_back_on_partial_failure() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let up = output_block("src", "memory://a");
        store.commit_run(&commit("src", vec![up.clone()], vec![])).unwrap();
        store.commit_run(&commit("sink", vec![], vec![up.id().clone()])).unwrap();

        // The second output reuses an existing block id, so its insert fails
        // after the run log and the first output were written.
        let later = output_block("src", "memory://a");
        store.commit_run(&commit("src", vec![later.clone()], vec![])).unwrap();
        let mut bad = commit("sink", vec![output_block("sink", "memory://a"), up.clone()], vec![later.id().clone()]);
        bad.end_state.as_mut().unwrap().insert("runs".into(), json!(2));
        assert!(store.commit_run(&bad).is_err());

        let consumed = store.consumed_block_ids("sink").unwrap();
        assert_eq!(consumed.len(), 1);
        assert!(consumed.contains(up.id()));
        assert_eq!(store.consumption_log("sink").unwrap().len(), 1);
        assert_eq!(store.node_state("sink").unwrap()["runs"], json!(1));
        assert!(store.latest_output("sink").unwrap().is_none());
        assert_eq!(store.run_logs("sink").unwrap().len(), 1);
    }

    #[test]
    fn test_discard_unfinished_run() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let mut c = commit("n", vec![], vec![]);
        c.run_log.completed_at = None;
        store.begin_run(&c.run_log).unwrap();
        store.discard_run(c.run_log.id.as_str()).unwrap();
        assert!(store.run_logs("n").unwrap().is_empty());

        // Completed runs are kept.
        c.run_log.completed_at = Some(Utc::now());
        store.commit_run(&c).unwrap();
        store.discard_run(c.run_log.id.as_str()).unwrap();
        assert_eq!(store.run_logs("n").unwrap().len(), 1);
    }

    #[test]
    fn test_begin_then_complete_run() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let mut c = commit("n", vec![], vec![]);
        c.run_log.completed_at = None;
        store.begin_run(&c.run_log).unwrap();
        assert!(!store.run_logs("n").unwrap()[0].is_complete());

        c.run_log.completed_at = Some(Utc::now());
        c.run_log.timed_out = true;
        store.commit_run(&c).unwrap();
        let logs = store.run_logs("n").unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].timed_out);
        assert_eq!(logs[0].end_state["runs"], json!(1));
    }

    #[test]
    fn test_record_count_and_schemas() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let block = output_block("src", "memory://a");
        let mut c = commit("src", vec![block.clone()], vec![]);
        c.schemas.push(Schema::new(
            "_generated.Inferred0001",
            vec![Field::new("id", FieldType::Integer)],
        ));
        store.commit_run(&c).unwrap();

        store.set_record_count(block.id(), 42).unwrap();
        assert_eq!(store.block(block.id()).unwrap().unwrap().block.record_count, Some(42));

        let schema = store.get_schema("_generated.Inferred0001").unwrap().unwrap();
        assert_eq!(schema.fields.len(), 1);
        assert!(store.get_schema("_generated.Missing").unwrap().is_none());
        assert_eq!(store.schema_keys().unwrap(), vec!["_generated.Inferred0001".to_string()]);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta").join("blockflow.db");
        let block = output_block("src", "memory://a");
        {
            let store = SqliteMetadataStore::open(&path).unwrap();
            store.commit_run(&commit("src", vec![block.clone()], vec![])).unwrap();
        }
        let url = format!("sqlite://{}", path.display());
        let store = SqliteMetadataStore::open_url(&url).unwrap();
        assert_eq!(store.latest_output("src").unwrap().unwrap().id(), block.id());
        assert!(SqliteMetadataStore::open_url("postgres://x").is_err());
    }
}
