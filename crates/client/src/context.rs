//! Change capture over the local store's save path.
//!
//! Application mutations are tracked here and committed through the
//! standard save path, which writes the rows and inserts-or-coalesces one
//! queued operation per change. Server-originated writes use the
//! service-initiated save path instead, which updates the local store
//! without queueing, so the server's own update is never re-captured.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use tablesync_core::{
    validate_entity_id, LocalStore, OperationKind, QueuedOperation, SystemProperties, ID_FIELD,
};

use crate::errors::{validation, ClientError, Result};
use crate::queue::OperationsQueue;
use crate::registration::IdGenerator;

/// A tracked-but-uncommitted application mutation.
#[derive(Debug)]
enum TrackedChange {
    Added { table: String, item: Value },
    Modified { table: String, item: Value },
    Deleted { table: String, id: String },
}

/// Captures application mutations and replays them into the local store
/// and operations queue.
pub(crate) struct SyncContext {
    local: Arc<dyn LocalStore>,
    queue: OperationsQueue,
    id_generator: IdGenerator,
    tracked: Mutex<Vec<TrackedChange>>,
}

impl SyncContext {
    pub fn new(
        local: Arc<dyn LocalStore>,
        queue: OperationsQueue,
        id_generator: IdGenerator,
    ) -> Self {
        Self {
            local,
            queue,
            id_generator,
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Track an insert. Assigns an id when the payload has none; returns
    /// the entity id.
    pub fn track_insert(&self, table: &str, mut item: Value) -> Result<String> {
        let object = item
            .as_object_mut()
            .ok_or_else(|| validation("entity payload is not a JSON object"))?;

        let id = match object.get(ID_FIELD) {
            Some(Value::String(existing)) => existing.clone(),
            None | Some(Value::Null) => {
                let id = (self.id_generator)();
                object.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
            Some(_) => return Err(validation("'id' must be a string")),
        };
        validate_entity_id(&id)?;

        self.track(TrackedChange::Added {
            table: table.to_string(),
            item,
        })?;
        Ok(id)
    }

    /// Track a replacement of an existing entity. The payload's `version`
    /// field becomes the optimistic-concurrency token for the push.
    pub fn track_update(&self, table: &str, item: Value) -> Result<()> {
        SystemProperties::from_value(&item)?;
        self.track(TrackedChange::Modified {
            table: table.to_string(),
            item,
        })
    }

    /// Track a deletion by id.
    pub fn track_remove(&self, table: &str, id: &str) -> Result<()> {
        validate_entity_id(id)?;
        self.track(TrackedChange::Deleted {
            table: table.to_string(),
            id: id.to_string(),
        })
    }

    fn track(&self, change: TrackedChange) -> Result<()> {
        let mut tracked = self
            .tracked
            .lock()
            .map_err(|_| ClientError::config("change tracker mutex poisoned"))?;
        tracked.push(change);
        Ok(())
    }

    /// Standard save path: write tracked changes to the local store and
    /// insert-or-coalesce one queued operation per change. Must be called
    /// under the synchronization lock.
    pub fn save_tracked(&self) -> Result<usize> {
        let changes: Vec<TrackedChange> = {
            let mut tracked = self
                .tracked
                .lock()
                .map_err(|_| ClientError::config("change tracker mutex poisoned"))?;
            tracked.drain(..).collect()
        };
        if changes.is_empty() {
            return Ok(0);
        }

        let count = changes.len();
        for change in changes {
            self.apply_tracked(change)?;
        }
        self.local.commit()?;
        Ok(count)
    }

    /// Service-initiated save path: the server's authoritative copy
    /// replaces the local row without re-entering change capture.
    pub fn write_back(&self, table: &str, id: &str, item: Value) -> Result<()> {
        self.local.upsert(table, id, item)?;
        Ok(())
    }

    fn apply_tracked(&self, change: TrackedChange) -> Result<()> {
        match change {
            TrackedChange::Added { table, item } => {
                let SystemProperties { id, .. } = SystemProperties::from_value(&item)?;
                self.local.upsert(&table, &id, item.clone())?;
                self.queue.insert_or_coalesce(QueuedOperation::new(
                    Uuid::new_v4().to_string(),
                    table,
                    id,
                    OperationKind::Add,
                    None,
                    Some(item),
                ))?;
            }
            TrackedChange::Modified { table, item } => {
                let SystemProperties { id, version, .. } = SystemProperties::from_value(&item)?;
                self.local.upsert(&table, &id, item.clone())?;
                self.queue.insert_or_coalesce(QueuedOperation::new(
                    Uuid::new_v4().to_string(),
                    table,
                    id,
                    OperationKind::Replace,
                    version,
                    Some(item),
                ))?;
            }
            TrackedChange::Deleted { table, id } => {
                let version = match self.local.get(&table, &id)? {
                    Some(row) => SystemProperties::from_value(&row)
                        .ok()
                        .and_then(|props| props.version),
                    None => None,
                };
                self.local.delete(&table, &id)?;
                self.queue.insert_or_coalesce(QueuedOperation::new(
                    Uuid::new_v4().to_string(),
                    table,
                    id,
                    OperationKind::Delete,
                    version,
                    None,
                ))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tablesync_core::memory::{MemoryLocalStore, MemoryOperationsQueue};
    use tablesync_core::OperationsQueueStore;

    use crate::registration::default_id_generator;

    fn context_with_stores() -> (SyncContext, Arc<MemoryLocalStore>, Arc<MemoryOperationsQueue>) {
        let local = Arc::new(MemoryLocalStore::new());
        let store = Arc::new(MemoryOperationsQueue::new());
        let queue = OperationsQueue::new(Arc::clone(&store) as Arc<dyn OperationsQueueStore>);
        let context = SyncContext::new(
            Arc::clone(&local) as Arc<dyn LocalStore>,
            queue,
            default_id_generator(),
        );
        (context, local, store)
    }

    #[test]
    fn standard_save_writes_rows_and_queues_operations() {
        let (context, local, store) = context_with_stores();
        let id = context
            .track_insert("movies", json!({"title": "A"}))
            .unwrap();

        assert_eq!(context.save_tracked().unwrap(), 1);
        assert!(local.get("movies", &id).unwrap().is_some());

        let queued = store.list(&[]).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, OperationKind::Add);
    }

    #[test]
    fn service_initiated_writes_never_queue() {
        let (context, local, store) = context_with_stores();
        context
            .write_back("movies", "m1", json!({"id": "m1", "title": "server"}))
            .unwrap();

        assert!(local.get("movies", "m1").unwrap().is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn tracked_ids_are_validated() {
        let (context, _, _) = context_with_stores();
        assert!(context
            .track_insert("movies", json!({"id": "bad id"}))
            .is_err());
        assert!(context
            .track_insert("movies", json!({"id": 7}))
            .is_err());
        assert!(context.track_remove("movies", "-bad").is_err());
        assert!(context.track_update("movies", json!({"title": "no id"})).is_err());
    }

    #[test]
    fn saving_nothing_is_a_no_op() {
        let (context, _, store) = context_with_stores();
        assert_eq!(context.save_tracked().unwrap(), 0);
        assert!(store.is_empty());
    }
}
