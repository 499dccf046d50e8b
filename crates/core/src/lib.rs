//! Shared data model for the tablesync engine: the synchronizable entity
//! contract, the query description AST with its OData v4 codec and
//! interpreter, the operations-queue record model, and the storage traits
//! implemented by the client and storage crates.

pub mod entity;
pub mod errors;
pub mod memory;
pub mod operations;
pub mod page;
pub mod query;
pub mod stores;

pub use entity::{
    decode_version, encode_version, epoch, format_timestamp, parse_timestamp, validate_entity_id,
    SystemProperties, DELETED_FIELD, ID_FIELD, UPDATED_AT_FIELD, VERSION_FIELD,
};
pub use errors::{Error, Result};
pub use operations::{coalesce, CoalesceOutcome, OperationKind, OperationState, QueuedOperation};
pub use page::Page;
pub use query::{OrderBy, QueryDescription};
pub use stores::{DeltaTokenStore, LocalStore, OperationsQueueStore};
