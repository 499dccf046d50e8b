//! In-memory versioned table store.
//!
//! Rows carry the four system fields; `updatedAt` and `version` are
//! assigned here on every mutation and never trusted from the client.
//! Tables with soft delete enabled mark rows `deleted` instead of
//! removing them.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use tablesync_core::entity::{format_timestamp, validate_entity_id};
use tablesync_core::{DELETED_FIELD, ID_FIELD, UPDATED_AT_FIELD, VERSION_FIELD};

/// Failures surfaced by the table store; the API layer maps them onto
/// wire statuses.
#[derive(Debug)]
pub enum TableError {
    UnknownTable,
    NotFound,
    /// The row exists but is soft-deleted.
    Gone,
    /// Duplicate id on create; carries the existing entity.
    Conflict(Value),
    /// Version precondition failed; carries the current entity.
    PreconditionFailed(Value),
    InvalidPayload(String),
    Internal(String),
}

struct TableData {
    soft_delete: bool,
    rows: BTreeMap<String, Value>,
}

/// The server-side repository: one `BTreeMap` of rows per defined table.
#[derive(Default)]
pub struct TableStore {
    tables: RwLock<HashMap<String, TableData>>,
}

/// Stamp the server-authoritative system fields on a mutated row.
fn touch(row: &mut Map<String, Value>) {
    row.insert(
        UPDATED_AT_FIELD.to_string(),
        json!(format_timestamp(&Utc::now().fixed_offset())),
    );
    row.insert(
        VERSION_FIELD.to_string(),
        json!(BASE64.encode(Uuid::new_v4().as_bytes())),
    );
}

fn is_deleted(row: &Value) -> bool {
    row.get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn as_object(payload: Value) -> Result<Map<String, Value>, TableError> {
    match payload {
        Value::Object(object) => Ok(object),
        _ => Err(TableError::InvalidPayload(
            "entity must be a JSON object".to_string(),
        )),
    }
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a table before serving it; undefined tables 404.
    pub fn define_table(&self, name: &str, soft_delete: bool) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(
                name.to_string(),
                TableData {
                    soft_delete,
                    rows: BTreeMap::new(),
                },
            );
        }
    }

    fn read_guard(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, TableData>>, TableError> {
        self.tables
            .read()
            .map_err(|_| TableError::Internal("table store lock poisoned".to_string()))
    }

    fn write_guard(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TableData>>, TableError> {
        self.tables
            .write()
            .map_err(|_| TableError::Internal("table store lock poisoned".to_string()))
    }

    /// Create a row. The client may supply the id; everything else
    /// server-owned is stamped here.
    pub fn create(&self, table: &str, payload: Value) -> Result<Value, TableError> {
        let mut tables = self.write_guard()?;
        let data = tables.get_mut(table).ok_or(TableError::UnknownTable)?;
        let mut object = as_object(payload)?;

        let id = match object.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            None | Some(Value::Null) => Uuid::new_v4().to_string(),
            Some(_) => {
                return Err(TableError::InvalidPayload(
                    "'id' must be a string".to_string(),
                ))
            }
        };
        validate_entity_id(&id)
            .map_err(|_| TableError::InvalidPayload(format!("invalid entity id '{id}'")))?;

        if let Some(existing) = data.rows.get(&id) {
            return Err(TableError::Conflict(existing.clone()));
        }

        object.insert(ID_FIELD.to_string(), json!(id));
        if data.soft_delete {
            object.insert(DELETED_FIELD.to_string(), json!(false));
        } else {
            object.remove(DELETED_FIELD);
        }
        touch(&mut object);

        let row = Value::Object(object);
        data.rows.insert(id, row.clone());
        Ok(row)
    }

    /// Fetch a row by id. Soft-deleted rows are `Gone` unless
    /// `include_deleted`.
    pub fn read(&self, table: &str, id: &str, include_deleted: bool) -> Result<Value, TableError> {
        let tables = self.read_guard()?;
        let data = tables.get(table).ok_or(TableError::UnknownTable)?;
        let row = data.rows.get(id).ok_or(TableError::NotFound)?;
        if is_deleted(row) && !include_deleted {
            return Err(TableError::Gone);
        }
        Ok(row.clone())
    }

    /// Replace a row, honouring the version precondition. A soft-deleted
    /// row can only be replaced (resurrected) when `include_deleted` is
    /// set and the payload clears the `deleted` flag.
    pub fn replace(
        &self,
        table: &str,
        id: &str,
        payload: Value,
        expected_version: Option<&str>,
        include_deleted: bool,
    ) -> Result<Value, TableError> {
        let mut tables = self.write_guard()?;
        let data = tables.get_mut(table).ok_or(TableError::UnknownTable)?;
        let current = data.rows.get(id).ok_or(TableError::NotFound)?;

        let object = as_object(payload)?;
        match object.get(ID_FIELD).and_then(Value::as_str) {
            None => {}
            Some(payload_id) if payload_id == id => {}
            Some(other) => {
                return Err(TableError::InvalidPayload(format!(
                    "payload id '{other}' does not match the request path"
                )))
            }
        }

        if is_deleted(current) {
            let clears_flag = object.get(DELETED_FIELD).and_then(Value::as_bool) == Some(false);
            if !(include_deleted && clears_flag) {
                return Err(TableError::Gone);
            }
        }

        if let Some(expected) = expected_version {
            let current_version = current.get(VERSION_FIELD).and_then(Value::as_str);
            if current_version != Some(expected) {
                return Err(TableError::PreconditionFailed(current.clone()));
            }
        }

        let mut object = object;
        object.insert(ID_FIELD.to_string(), json!(id));
        if data.soft_delete {
            object.insert(DELETED_FIELD.to_string(), json!(false));
        } else {
            object.remove(DELETED_FIELD);
        }
        touch(&mut object);

        let row = Value::Object(object);
        data.rows.insert(id.to_string(), row.clone());
        Ok(row)
    }

    /// Delete (or soft-delete) a row, honouring the version precondition.
    pub fn delete(
        &self,
        table: &str,
        id: &str,
        expected_version: Option<&str>,
    ) -> Result<(), TableError> {
        let mut tables = self.write_guard()?;
        let data = tables.get_mut(table).ok_or(TableError::UnknownTable)?;
        let current = data.rows.get(id).ok_or(TableError::NotFound)?;

        if is_deleted(current) {
            return Err(TableError::Gone);
        }
        if let Some(expected) = expected_version {
            let current_version = current.get(VERSION_FIELD).and_then(Value::as_str);
            if current_version != Some(expected) {
                return Err(TableError::PreconditionFailed(current.clone()));
            }
        }

        if data.soft_delete {
            let mut object = as_object(current.clone())?;
            object.insert(DELETED_FIELD.to_string(), json!(true));
            touch(&mut object);
            data.rows.insert(id.to_string(), Value::Object(object));
        } else {
            data.rows.remove(id);
        }
        Ok(())
    }

    /// Every row of a table, soft-deleted included; the query layer
    /// filters.
    pub fn list(&self, table: &str) -> Result<Vec<Value>, TableError> {
        let tables = self.read_guard()?;
        let data = tables.get(table).ok_or(TableError::UnknownTable)?;
        Ok(data.rows.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soft_store() -> TableStore {
        let store = TableStore::new();
        store.define_table("movies", true);
        store
    }

    #[test]
    fn create_stamps_system_fields() {
        let store = soft_store();
        let row = store
            .create("movies", json!({"id": "m1", "title": "A", "version": "ignored"}))
            .unwrap();
        assert_eq!(row["id"], json!("m1"));
        assert_eq!(row["deleted"], json!(false));
        assert_ne!(row["version"], json!("ignored"));
        assert!(row["updatedAt"].as_str().is_some());
    }

    #[test]
    fn duplicate_create_conflicts_with_the_existing_entity() {
        let store = soft_store();
        let first = store.create("movies", json!({"id": "m1", "title": "A"})).unwrap();
        let err = store.create("movies", json!({"id": "m1", "title": "B"})).unwrap_err();
        match err {
            TableError::Conflict(existing) => assert_eq!(existing, first),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn replace_honours_the_version_precondition() {
        let store = soft_store();
        let created = store.create("movies", json!({"id": "m1", "title": "A"})).unwrap();
        let version = created["version"].as_str().unwrap().to_string();

        let err = store
            .replace("movies", "m1", json!({"title": "B"}), Some("stale"), false)
            .unwrap_err();
        assert!(matches!(err, TableError::PreconditionFailed(_)));

        let replaced = store
            .replace("movies", "m1", json!({"title": "B"}), Some(&version), false)
            .unwrap();
        assert_eq!(replaced["title"], json!("B"));
        assert_ne!(replaced["version"], created["version"]);
    }

    #[test]
    fn soft_delete_marks_and_guards_rows() {
        let store = soft_store();
        store.create("movies", json!({"id": "m1", "title": "A"})).unwrap();
        store.delete("movies", "m1", None).unwrap();

        // Row still exists, marked deleted.
        let row = store.read("movies", "m1", true).unwrap();
        assert_eq!(row["deleted"], json!(true));
        assert!(matches!(
            store.read("movies", "m1", false),
            Err(TableError::Gone)
        ));
        assert!(matches!(
            store.delete("movies", "m1", None),
            Err(TableError::Gone)
        ));
        assert!(matches!(
            store.replace("movies", "m1", json!({"title": "B"}), None, false),
            Err(TableError::Gone)
        ));
    }

    #[test]
    fn put_resurrects_only_when_the_payload_clears_the_flag() {
        let store = soft_store();
        store.create("movies", json!({"id": "m1", "title": "A"})).unwrap();
        store.delete("movies", "m1", None).unwrap();

        // include_deleted alone is not enough.
        assert!(matches!(
            store.replace("movies", "m1", json!({"title": "B"}), None, true),
            Err(TableError::Gone)
        ));

        let resurrected = store
            .replace(
                "movies",
                "m1",
                json!({"title": "B", "deleted": false}),
                None,
                true,
            )
            .unwrap();
        assert_eq!(resurrected["deleted"], json!(false));
        assert!(store.read("movies", "m1", false).is_ok());
    }

    #[test]
    fn hard_delete_removes_rows() {
        let store = TableStore::new();
        store.define_table("logs", false);
        let row = store.create("logs", json!({"title": "x"})).unwrap();
        let id = row["id"].as_str().unwrap().to_string();
        store.delete("logs", &id, None).unwrap();
        assert!(matches!(
            store.read("logs", &id, true),
            Err(TableError::NotFound)
        ));
    }

    #[test]
    fn unknown_tables_and_rows_are_distinguished() {
        let store = soft_store();
        assert!(matches!(
            store.read("unknown", "m1", false),
            Err(TableError::UnknownTable)
        ));
        assert!(matches!(
            store.read("movies", "m1", false),
            Err(TableError::NotFound)
        ));
        assert!(matches!(
            store.delete("movies", "m1", None),
            Err(TableError::NotFound)
        ));
    }
}
