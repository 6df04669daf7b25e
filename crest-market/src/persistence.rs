//! Persistence: buffered row operations committed as transactions.
//!
//! Operations accumulate in an [`OperationBuffer`] on the orchestrating thread
//! and are handed to a [`PersistenceSink`] as one unit. A sink applies a
//! commit entirely or not at all.
//!
//! [`JsonlStore`] keeps an append-only commit log, one JSON object per line.
//! A commit is a single line, so a torn write leaves a malformed trailing line
//! that is skipped on replay and the commit is simply absent.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::history::{HistoryProvider, WeeklyAverages};

/// A stored row: key columns merged with value columns.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("malformed {table} row: {reason}")]
    MalformedRow { table: String, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A row-level write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistenceOperation {
    /// Insert the row, or merge `values` into the existing one.
    Upsert {
        table: String,
        key: BTreeMap<String, Value>,
        values: BTreeMap<String, Value>,
    },
    /// Merge `values` into an existing row; no-op when the row is absent.
    Update {
        table: String,
        key: BTreeMap<String, Value>,
        values: BTreeMap<String, Value>,
    },
}

impl PersistenceOperation {
    pub fn table(&self) -> &str {
        match self {
            Self::Upsert { table, .. } | Self::Update { table, .. } => table,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        let (table, key) = match self {
            Self::Upsert { table, key, .. } | Self::Update { table, key, .. } => (table, key),
        };
        if table.is_empty() {
            return Err(StoreError::InvalidOperation("empty table name".into()));
        }
        if key.is_empty() {
            return Err(StoreError::InvalidOperation(format!("empty key for table {table}")));
        }
        Ok(())
    }
}

/// Build a key map from `(column, value)` pairs.
pub fn key_of<const N: usize>(columns: [(&str, Value); N]) -> BTreeMap<String, Value> {
    columns
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// In-memory materialized tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    tables: BTreeMap<String, BTreeMap<String, Row>>,
}

impl Tables {
    pub fn apply(&mut self, op: &PersistenceOperation) {
        match op {
            PersistenceOperation::Upsert { table, key, values } => {
                let row = self
                    .tables
                    .entry(table.clone())
                    .or_default()
                    .entry(row_id(key))
                    .or_insert_with(|| key.clone());
                row.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            PersistenceOperation::Update { table, key, values } => {
                if let Some(row) = self
                    .tables
                    .get_mut(table)
                    .and_then(|rows| rows.get_mut(&row_id(key)))
                {
                    row.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
    }

    pub fn get(&self, table: &str, key: &BTreeMap<String, Value>) -> Option<&Row> {
        self.tables.get(table)?.get(&row_id(key))
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }
}

/// Decode a required column.
pub(crate) fn column<T: DeserializeOwned>(row: &Row, table: &str, name: &str) -> Result<T, StoreError> {
    let value = row.get(name).ok_or_else(|| StoreError::MalformedRow {
        table: table.to_string(),
        reason: format!("missing column {name}"),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| StoreError::MalformedRow {
        table: table.to_string(),
        reason: format!("column {name}: {e}"),
    })
}

/// Decode a column that may be absent.
pub(crate) fn optional_column<T: DeserializeOwned>(
    row: &Row,
    table: &str,
    name: &str,
) -> Result<Option<T>, StoreError> {
    match row.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => column(row, table, name).map(Some),
    }
}

fn row_id(key: &BTreeMap<String, Value>) -> String {
    key.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Transactional destination for buffered operations.
pub trait PersistenceSink: Send + Sync {
    /// Apply every operation or none of them.
    fn commit(&self, ops: &[PersistenceOperation]) -> Result<(), StoreError>;

    fn rows(&self, table: &str) -> Result<Vec<Row>, StoreError>;
}

/// Operations queued between flushes.
#[derive(Debug)]
pub struct OperationBuffer {
    pending: Vec<PersistenceOperation>,
    interval: Duration,
    last_flush: Instant,
    commits: usize,
    committed_ops: usize,
}

impl OperationBuffer {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            interval,
            last_flush: Instant::now(),
            commits: 0,
            committed_ops: 0,
        }
    }

    pub fn push(&mut self, op: PersistenceOperation) {
        self.pending.push(op);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_due(&self) -> bool {
        self.last_flush.elapsed() >= self.interval
    }

    /// Flush when the interval has elapsed since the last flush.
    pub fn flush_if_due(&mut self, sink: &dyn PersistenceSink) -> Result<usize, StoreError> {
        if self.is_due() {
            self.flush(sink)
        } else {
            Ok(0)
        }
    }

    /// Commit everything pending as one transaction.
    ///
    /// On failure the operations stay queued for the next attempt.
    pub fn flush(&mut self, sink: &dyn PersistenceSink) -> Result<usize, StoreError> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return Ok(0);
        }
        sink.commit(&self.pending)?;
        let n = self.pending.len();
        self.pending.clear();
        self.commits += 1;
        self.committed_ops += n;
        tracing::debug!(operations = n, "flushed persistence buffer");
        Ok(n)
    }

    /// Transactions committed so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn committed_ops(&self) -> usize {
        self.committed_ops
    }
}

fn validate_all(ops: &[PersistenceOperation]) -> Result<(), StoreError> {
    ops.iter().try_for_each(PersistenceOperation::validate)
}

fn averages_from(tables: &Tables, item_id: u64, region_id: u64) -> Result<Option<WeeklyAverages>, StoreError> {
    let key = WeeklyAverages::key(item_id, region_id);
    tables
        .get(crate::history::AVERAGES_TABLE, &key)
        .map(WeeklyAverages::from_row)
        .transpose()
}

/// Volatile sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Tables {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PersistenceSink for MemoryStore {
    fn commit(&self, ops: &[PersistenceOperation]) -> Result<(), StoreError> {
        validate_all(ops)?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        for op in ops {
            tables.apply(op);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        Ok(self.tables.read().unwrap_or_else(PoisonError::into_inner).rows(table))
    }
}

impl HistoryProvider for MemoryStore {
    fn weekly_averages(&self, item_id: u64, region_id: u64) -> Result<Option<WeeklyAverages>, StoreError> {
        averages_from(&self.tables.read().unwrap_or_else(PoisonError::into_inner), item_id, region_id)
    }
}

/// One committed transaction in the log.
#[derive(Debug, Serialize, Deserialize)]
struct CommitRecord {
    txn: u64,
    committed_at: DateTime<Utc>,
    ops: Vec<PersistenceOperation>,
}

/// Append-only JSONL commit log with an in-memory materialized view.
pub struct JsonlStore {
    path: PathBuf,
    tables: RwLock<Tables>,
    next_txn: AtomicU64,
    /// The log ends mid-line; the next commit starts on a fresh line.
    torn_tail: AtomicBool,
}

impl JsonlStore {
    /// Open (or create) the log and replay committed transactions.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let mut tables = Tables::default();
        let mut last_txn = 0;
        let mut skipped = 0;
        let mut torn_tail = false;
        match fs::read_to_string(&path) {
            Ok(content) => {
                torn_tail = !content.is_empty() && !content.ends_with('\n');
                for line in content.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CommitRecord>(line) {
                        Ok(record) => {
                            for op in &record.ops {
                                tables.apply(op);
                            }
                            last_txn = last_txn.max(record.txn);
                        }
                        Err(_) => skipped += 1,
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
        if skipped > 0 {
            tracing::warn!(path = %path.display(), skipped, "skipped malformed commit lines");
        }
        tracing::debug!(path = %path.display(), transactions = last_txn, "opened store");

        Ok(Self {
            path,
            tables: RwLock::new(tables),
            next_txn: AtomicU64::new(last_txn + 1),
            torn_tail: AtomicBool::new(torn_tail),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut a failed append back to `start`. The next commit also starts on a
    /// fresh line in case the cut does not land.
    fn abandon_append(&self, file: &File, start: u64) {
        self.torn_tail.store(true, Ordering::SeqCst);
        if let Err(e) = file.set_len(start) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not truncate failed append");
        }
    }

    /// Size of the commit log in bytes.
    pub fn file_size_bytes(&self) -> Result<u64, StoreError> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    pub fn snapshot(&self) -> Tables {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PersistenceSink for JsonlStore {
    fn commit(&self, ops: &[PersistenceOperation]) -> Result<(), StoreError> {
        validate_all(ops)?;
        if ops.is_empty() {
            return Ok(());
        }
        // Held across the append so the log and the view advance together.
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let record = CommitRecord {
            txn: self.next_txn.load(Ordering::SeqCst),
            committed_at: Utc::now(),
            ops: ops.to_vec(),
        };
        let mut line = String::new();
        if self.torn_tail.load(Ordering::SeqCst) {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&record)?);
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        let start = file.metadata().map_err(|e| StoreError::io(&self.path, e))?.len();
        if let Err(e) = file
            .write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data())
        {
            self.abandon_append(&file, start);
            return Err(StoreError::io(&self.path, e));
        }

        for op in ops {
            tables.apply(op);
        }
        self.torn_tail.store(false, Ordering::SeqCst);
        self.next_txn.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        Ok(self.tables.read().unwrap_or_else(PoisonError::into_inner).rows(table))
    }
}

impl HistoryProvider for JsonlStore {
    fn weekly_averages(&self, item_id: u64, region_id: u64) -> Result<Option<WeeklyAverages>, StoreError> {
        averages_from(&self.tables.read().unwrap_or_else(PoisonError::into_inner), item_id, region_id)
    }
}
