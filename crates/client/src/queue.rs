//! Queue manager: sequence assignment and insert-or-coalesce over the
//! durable operations store.
//!
//! Every method here must be called while holding the synchronization
//! lock; the store itself only provides durability.

use std::sync::Arc;

use chrono::Utc;
use tablesync_core::{coalesce, CoalesceOutcome, OperationState, OperationsQueueStore, QueuedOperation};

use crate::errors::Result;

#[derive(Clone)]
pub(crate) struct OperationsQueue {
    store: Arc<dyn OperationsQueueStore>,
}

impl OperationsQueue {
    pub fn new(store: Arc<dyn OperationsQueueStore>) -> Self {
        Self { store }
    }

    /// Insert a fresh operation, or collapse it into the queued operation
    /// for the same entity. Sequence numbers are assigned here, inside the
    /// lock, as `max(sequence) + 1`.
    pub fn insert_or_coalesce(&self, mut operation: QueuedOperation) -> Result<()> {
        match self.store.find(&operation.table_name, &operation.item_id)? {
            Some(mut existing) => match coalesce(&mut existing, &operation)? {
                CoalesceOutcome::Removed => self.store.remove(&existing.id)?,
                CoalesceOutcome::Updated => self.store.upsert(&existing)?,
            },
            None => {
                operation.sequence = self.store.max_sequence()? + 1;
                self.store.upsert(&operation)?;
            }
        }
        Ok(())
    }

    /// Non-completed operations for the scope, in sequence order.
    pub fn list(&self, tables: &[String]) -> Result<Vec<QueuedOperation>> {
        Ok(self.store.list(tables)?)
    }

    /// Record that a replay attempt is starting.
    pub fn mark_attempted(&self, operation: &mut QueuedOperation) -> Result<()> {
        operation.state = OperationState::Attempted;
        operation.last_attempt = Some(Utc::now().fixed_offset());
        self.store.upsert(operation)?;
        Ok(())
    }

    /// Record a failed replay, keeping the operation queued.
    pub fn mark_failed(&self, operation: &mut QueuedOperation, status: Option<u16>) -> Result<()> {
        operation.state = OperationState::Failed;
        operation.http_status_code = status;
        operation.last_attempt = Some(Utc::now().fixed_offset());
        self.store.upsert(operation)?;
        Ok(())
    }

    /// Return an attempted operation to the pending state (cancelled push).
    pub fn mark_pending(&self, operation: &mut QueuedOperation) -> Result<()> {
        operation.state = OperationState::Pending;
        self.store.upsert(operation)?;
        Ok(())
    }

    /// A successful replay removes the operation entirely.
    pub fn complete(&self, operation: &QueuedOperation) -> Result<()> {
        self.store.remove(&operation.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tablesync_core::memory::MemoryOperationsQueue;
    use tablesync_core::OperationKind;

    fn queue() -> (OperationsQueue, Arc<MemoryOperationsQueue>) {
        let store = Arc::new(MemoryOperationsQueue::new());
        (
            OperationsQueue::new(Arc::clone(&store) as Arc<dyn OperationsQueueStore>),
            store,
        )
    }

    fn op(id: &str, item_id: &str, kind: OperationKind) -> QueuedOperation {
        QueuedOperation::new(id, "movies", item_id, kind, None, Some(json!({"id": item_id})))
    }

    #[test]
    fn sequences_are_assigned_monotonically() {
        let (queue, store) = queue();
        queue.insert_or_coalesce(op("a", "m1", OperationKind::Add)).unwrap();
        queue.insert_or_coalesce(op("b", "m2", OperationKind::Add)).unwrap();
        queue.insert_or_coalesce(op("c", "m3", OperationKind::Add)).unwrap();

        let sequences: Vec<i64> = store
            .list(&[])
            .unwrap()
            .into_iter()
            .map(|op| op.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn coalescing_keeps_the_existing_record_id_and_sequence() {
        let (queue, store) = queue();
        queue.insert_or_coalesce(op("a", "m1", OperationKind::Add)).unwrap();
        queue.insert_or_coalesce(op("b", "m2", OperationKind::Add)).unwrap();

        let mut replace = op("c", "m1", OperationKind::Replace);
        replace.item = Some(json!({"id": "m1", "title": "newer"}));
        queue.insert_or_coalesce(replace).unwrap();

        let ops = store.list(&[]).unwrap();
        assert_eq!(ops.len(), 2);
        let kept = ops.iter().find(|op| op.item_id == "m1").unwrap();
        assert_eq!(kept.id, "a");
        assert_eq!(kept.sequence, 1);
        assert_eq!(kept.kind, OperationKind::Add);
        assert_eq!(kept.item, Some(json!({"id": "m1", "title": "newer"})));
        assert_eq!(kept.version, 1);
    }

    #[test]
    fn add_then_delete_leaves_no_queue_entry() {
        let (queue, store) = queue();
        queue.insert_or_coalesce(op("a", "m1", OperationKind::Add)).unwrap();
        queue.insert_or_coalesce(op("b", "m1", OperationKind::Delete)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn failure_bookkeeping_keeps_the_operation() {
        let (queue, store) = queue();
        queue.insert_or_coalesce(op("a", "m1", OperationKind::Add)).unwrap();

        let mut queued = store.find("movies", "m1").unwrap().unwrap();
        queue.mark_failed(&mut queued, Some(409)).unwrap();

        let stored = store.find("movies", "m1").unwrap().unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        assert_eq!(stored.http_status_code, Some(409));
        assert!(stored.last_attempt.is_some());
    }
}
