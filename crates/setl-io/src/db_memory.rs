//! In-memory database for tests and local runs.
//!
//! Stores inserted rows per table and supports scripted failure injection so
//! the sink's retry and poison-pill paths can be exercised without a real
//! warehouse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use setl_core::capability::{Database, DbError};

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<HashMap<String, StoredTable>>>,
    transient_failures: Arc<AtomicU32>,
    fatal: Arc<AtomicBool>,
}

#[derive(Default, Clone)]
struct StoredTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` inserts with a transient error.
    pub fn fail_transient(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Fail every insert with a fatal error until cleared.
    pub fn fail_fatal(&self, enabled: bool) {
        self.fatal.store(enabled, Ordering::SeqCst);
    }

    /// Rows of `table` as column-name → value maps, in insert order.
    pub async fn rows(&self, table: &str) -> Vec<HashMap<String, Value>> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .map(|row| {
                        t.columns
                            .iter()
                            .cloned()
                            .zip(row.iter().cloned())
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn insert_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<(), DbError> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(DbError::Fatal("table schema mismatch".to_string()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DbError::Transient("connection reset".to_string()));
        }

        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table.to_string()).or_default();
        if stored.columns.is_empty() {
            stored.columns = columns.to_vec();
        } else if stored.columns != columns {
            return Err(DbError::Fatal(format!(
                "insert columns {:?} do not match table columns {:?}",
                columns, stored.columns
            )));
        }
        stored.rows.extend(rows);
        Ok(())
    }
}
