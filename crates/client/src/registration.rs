//! Table registration: the per-table descriptor the engine dispatches
//! through instead of runtime reflection.

use std::collections::HashSet;
use std::sync::Arc;

use tablesync_core::{ID_FIELD, UPDATED_AT_FIELD, VERSION_FIELD};
use uuid::Uuid;

use crate::errors::{ClientError, Result};

/// Name under which clients are cached when a registration does not pick
/// its own.
pub const DEFAULT_CLIENT_NAME: &str = "default";

/// Generates entity ids for inserts that do not carry one.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Maps a table name to its endpoint path.
pub type TablePathResolver = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Default id generator: a random 128-bit identifier.
pub fn default_id_generator() -> IdGenerator {
    Arc::new(|| Uuid::new_v4().to_string())
}

/// Default path resolver: `tables/{lower(name)}`.
pub fn default_table_path_resolver() -> TablePathResolver {
    Arc::new(|name| format!("tables/{}", name.to_lowercase()))
}

/// Declares one synchronizable table.
///
/// Registering a table is the opt-in marker; `fields` declares the wire
/// shape and must include the `id`, `updatedAt`, and `version` system
/// fields or engine construction fails.
#[derive(Debug, Clone)]
pub struct TableRegistration {
    pub(crate) name: String,
    pub(crate) fields: HashSet<String>,
    pub(crate) transient_fields: HashSet<String>,
    pub(crate) client_name: String,
    pub(crate) path_override: Option<String>,
}

impl TableRegistration {
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            transient_fields: HashSet::new(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            path_override: None,
        }
    }

    /// Fields that never synchronize: incoming pulls skip them when
    /// copying into an existing local row.
    pub fn with_transient_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transient_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Route this table's requests through a named client.
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Override the endpoint path for this table (relative to the base
    /// endpoint).
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path_override = Some(path.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ClientError::config("table registration has an empty name"));
        }
        for field in [ID_FIELD, UPDATED_AT_FIELD, VERSION_FIELD] {
            if !self.fields.contains(field) {
                return Err(ClientError::config(format!(
                    "synchronizable table '{}' is missing system field '{field}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
