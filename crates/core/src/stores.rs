//! Storage traits implemented by the embedding application and the
//! storage crates.
//!
//! The engine owns two durable stores (the operations queue and the
//! delta-token map) and mutates the application's local rows through the
//! [`LocalStore`] facade. All writes happen under the synchronization
//! lock; implementations only need interior mutability, not their own
//! coordination.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::errors::Result;
use crate::operations::QueuedOperation;

/// Facade over the application's local data store.
///
/// `commit` makes buffered writes durable; stores that write through can
/// treat it as a no-op. The pull engine issues an intermediate commit after
/// every delta-token advance because some stores reject an insert followed
/// by an update of the same row inside one transaction.
pub trait LocalStore: Send + Sync {
    fn get(&self, table: &str, id: &str) -> Result<Option<Value>>;
    fn upsert(&self, table: &str, id: &str, item: Value) -> Result<()>;
    fn delete(&self, table: &str, id: &str) -> Result<()>;
    fn commit(&self) -> Result<()>;
}

/// Durable, ordered log of pending local mutations.
///
/// At most one non-completed operation exists per `(table, itemId)`; the
/// queue manager maintains that invariant through coalescing.
pub trait OperationsQueueStore: Send + Sync {
    /// The queued (non-completed) operation for an entity, if any.
    fn find(&self, table: &str, item_id: &str) -> Result<Option<QueuedOperation>>;

    /// Insert or rewrite an operation record keyed by its `id`.
    fn upsert(&self, operation: &QueuedOperation) -> Result<()>;

    /// Remove an operation record by `id`.
    fn remove(&self, operation_id: &str) -> Result<()>;

    /// Non-completed operations whose table is in `tables` (all tables when
    /// empty), ordered by `sequence`.
    fn list(&self, tables: &[String]) -> Result<Vec<QueuedOperation>>;

    /// Highest assigned sequence number, or 0 when the queue has never
    /// held an operation.
    fn max_sequence(&self) -> Result<i64>;
}

/// Persistent `queryId → timestamp` map recording the high-water mark of
/// server-observed `updatedAt` per pulled query.
pub trait DeltaTokenStore: Send + Sync {
    /// The stored token, or the epoch when absent ("pull everything").
    fn get(&self, query_id: &str) -> Result<DateTime<FixedOffset>>;

    /// Store `max(current, value)`; returns true iff the stored value
    /// changed. Monotonicity is the store's contract: a regression would
    /// re-pull overlapping windows, a jump forward would skip records.
    fn set(&self, query_id: &str, value: DateTime<FixedOffset>) -> Result<bool>;

    /// Forget the token for a query.
    fn reset(&self, query_id: &str) -> Result<()>;
}
