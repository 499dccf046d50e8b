//! Table service implementing the wire contract the client engine
//! synchronizes against: OData-subset queries, conditional requests with
//! strong ETags, soft delete, and paged list responses.

pub mod api;
pub mod error;
pub mod repository;

pub use api::{router, AppState};
pub use error::{ApiError, ApiResult};
pub use repository::{TableError, TableStore};
