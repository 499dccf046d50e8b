//! In-memory store implementations.
//!
//! Suitable for tests and for embedders that do not need durability; the
//! sqlite-backed equivalents live in `tablesync-storage-sqlite`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::entity::epoch;
use crate::errors::{Error, Result};
use crate::operations::{OperationState, QueuedOperation};
use crate::stores::{DeltaTokenStore, LocalStore, OperationsQueueStore};

fn lock_err() -> Error {
    Error::Storage("in-memory store mutex poisoned".into())
}

/// In-memory [`LocalStore`] keyed by `(table, id)`.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one table, in id order. Test helper.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .map(|tables| {
                tables
                    .get(table)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let tables = self.tables.lock().map_err(|_| lock_err())?;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    fn upsert(&self, table: &str, id: &str, item: Value) -> Result<()> {
        let mut tables = self.tables.lock().map_err(|_| lock_err())?;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), item);
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        let mut tables = self.tables.lock().map_err(|_| lock_err())?;
        if let Some(rows) = tables.get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`OperationsQueueStore`].
#[derive(Debug, Default)]
pub struct MemoryOperationsQueue {
    operations: Mutex<Vec<QueuedOperation>>,
}

impl MemoryOperationsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total queued operations, completed included. Test helper.
    pub fn len(&self) -> usize {
        self.operations.lock().map(|ops| ops.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OperationsQueueStore for MemoryOperationsQueue {
    fn find(&self, table: &str, item_id: &str) -> Result<Option<QueuedOperation>> {
        let operations = self.operations.lock().map_err(|_| lock_err())?;
        Ok(operations
            .iter()
            .find(|op| {
                op.table_name == table
                    && op.item_id == item_id
                    && op.state != OperationState::Completed
            })
            .cloned())
    }

    fn upsert(&self, operation: &QueuedOperation) -> Result<()> {
        let mut operations = self.operations.lock().map_err(|_| lock_err())?;
        match operations.iter_mut().find(|op| op.id == operation.id) {
            Some(existing) => *existing = operation.clone(),
            None => operations.push(operation.clone()),
        }
        Ok(())
    }

    fn remove(&self, operation_id: &str) -> Result<()> {
        let mut operations = self.operations.lock().map_err(|_| lock_err())?;
        operations.retain(|op| op.id != operation_id);
        Ok(())
    }

    fn list(&self, tables: &[String]) -> Result<Vec<QueuedOperation>> {
        let operations = self.operations.lock().map_err(|_| lock_err())?;
        let mut selected: Vec<QueuedOperation> = operations
            .iter()
            .filter(|op| op.state != OperationState::Completed)
            .filter(|op| tables.is_empty() || tables.contains(&op.table_name))
            .cloned()
            .collect();
        selected.sort_by_key(|op| op.sequence);
        Ok(selected)
    }

    fn max_sequence(&self) -> Result<i64> {
        let operations = self.operations.lock().map_err(|_| lock_err())?;
        Ok(operations.iter().map(|op| op.sequence).max().unwrap_or(0))
    }
}

/// In-memory [`DeltaTokenStore`] with set-max semantics.
#[derive(Debug, Default)]
pub struct MemoryDeltaTokenStore {
    tokens: Mutex<HashMap<String, DateTime<FixedOffset>>>,
}

impl MemoryDeltaTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeltaTokenStore for MemoryDeltaTokenStore {
    fn get(&self, query_id: &str) -> Result<DateTime<FixedOffset>> {
        let tokens = self.tokens.lock().map_err(|_| lock_err())?;
        Ok(tokens.get(query_id).copied().unwrap_or_else(epoch))
    }

    fn set(&self, query_id: &str, value: DateTime<FixedOffset>) -> Result<bool> {
        let mut tokens = self.tokens.lock().map_err(|_| lock_err())?;
        let current = tokens.get(query_id).copied().unwrap_or_else(epoch);
        if value > current {
            tokens.insert(query_id.to_string(), value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn reset(&self, query_id: &str) -> Result<()> {
        let mut tokens = self.tokens.lock().map_err(|_| lock_err())?;
        tokens.remove(query_id);
        Ok(())
    }
}
