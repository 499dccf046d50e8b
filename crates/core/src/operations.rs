//! The operations-queue record model and the coalescing rules that keep at
//! most one pending operation per entity.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of mutation a queued operation replays against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Replace,
    Delete,
}

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Attempted,
    Failed,
    Completed,
}

/// A pending local mutation awaiting push.
///
/// `sequence` orders operations across entities and is assigned under the
/// synchronization lock; `version` is an optimistic-concurrency counter
/// bumped every time a later change coalesces into this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub table_name: String,
    pub item_id: String,
    pub kind: OperationKind,
    pub state: OperationState,
    pub entity_version: Option<String>,
    pub item: Option<Value>,
    pub sequence: i64,
    pub version: i64,
    pub last_attempt: Option<DateTime<FixedOffset>>,
    pub http_status_code: Option<u16>,
}

impl QueuedOperation {
    /// Create a fresh pending operation. `sequence` is assigned later, when
    /// the operation is inserted into the queue.
    pub fn new(
        id: impl Into<String>,
        table_name: impl Into<String>,
        item_id: impl Into<String>,
        kind: OperationKind,
        entity_version: Option<String>,
        item: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            table_name: table_name.into(),
            item_id: item_id.into(),
            kind,
            state: OperationState::Pending,
            entity_version,
            item,
            sequence: 0,
            version: 0,
            last_attempt: None,
            http_status_code: None,
        }
    }
}

/// Outcome of collapsing a new operation into an existing queued one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceOutcome {
    /// The existing record must be deleted from the queue.
    Removed,
    /// The existing record was mutated in place and must be rewritten.
    Updated,
}

/// Collapse `incoming` into `existing`, which targets the same
/// `(tableName, itemId)`.
///
/// The collapse table:
///
/// | existing | incoming | result |
/// |----------|----------|--------|
/// | Add      | Delete   | remove existing |
/// | Add      | Replace  | keep Add, take new payload |
/// | Delete   | Add      | becomes Replace with new payload |
/// | Replace  | Delete   | becomes Delete, payload dropped |
/// | Replace  | Replace  | take new payload |
///
/// Any other pairing is a queue-integrity violation. An update bumps
/// `version`, resets the state to `Pending`, and preserves `sequence` so
/// ordering relative to other entities is stable.
pub fn coalesce(
    existing: &mut QueuedOperation,
    incoming: &QueuedOperation,
) -> crate::Result<CoalesceOutcome> {
    use OperationKind::{Add, Delete, Replace};

    let outcome = match (existing.kind, incoming.kind) {
        (Add, Delete) => return Ok(CoalesceOutcome::Removed),
        (Add, Replace) => {
            existing.item = incoming.item.clone();
            CoalesceOutcome::Updated
        }
        (Delete, Add) => {
            existing.kind = Replace;
            existing.item = incoming.item.clone();
            CoalesceOutcome::Updated
        }
        (Replace, Delete) => {
            existing.kind = Delete;
            existing.item = None;
            CoalesceOutcome::Updated
        }
        (Replace, Replace) => {
            existing.item = incoming.item.clone();
            // A later edit may carry a newer concurrency token, e.g. after
            // the caller resolved a conflict against the server entity.
            if incoming.entity_version.is_some() {
                existing.entity_version = incoming.entity_version.clone();
            }
            CoalesceOutcome::Updated
        }
        (lhs, rhs) => {
            return Err(crate::Error::QueueIntegrity(format!(
                "cannot collapse {rhs:?} into queued {lhs:?} for '{}/{}'",
                existing.table_name, existing.item_id
            )))
        }
    };

    existing.version += 1;
    existing.state = OperationState::Pending;
    existing.http_status_code = None;
    Ok(outcome)
}
