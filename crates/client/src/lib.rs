//! Offline-capable client engine for table synchronization.
//!
//! The engine mirrors a subset of records from a remote table service
//! into a local store and replays queued local mutations back to it:
//! change capture feeds a coalescing operations queue, the push engine
//! drains that queue with bounded parallelism, and the pull engine pages
//! server changes into the local store while advancing per-query delta
//! tokens. A single synchronization lock serializes every local-store
//! mutation.

pub mod conflict;
pub mod engine;
pub mod errors;
pub mod events;
pub mod http;
pub mod lock;
pub mod pull;
pub mod push;
pub mod registration;
pub mod remote;
pub mod response;
pub mod retry;

mod context;
mod queue;

pub use conflict::{
    ClientWinsResolver, ConflictResolution, ConflictResolver, ServerWinsResolver,
};
pub use engine::{SyncEngine, SyncEngineBuilder, SynchronizeOptions, SynchronizeResult};
pub use errors::{ClientError, Result};
pub use events::{SyncEvent, SyncEventBus};
pub use http::{
    validate_endpoint, ClientFactory, ClientOptions, HttpInterceptor, HttpRequest, HttpResponse,
    HttpTransport, Next, Pipeline, PipelinePolicy, ReqwestTransport, TableHttpClient,
};
pub use lock::{SyncLock, SyncLockGuard};
pub use pull::{PullOptions, PullRequest, PullResult};
pub use push::{PushOptions, PushResult, MAX_PARALLEL_OPERATIONS};
pub use registration::{
    default_id_generator, default_table_path_resolver, IdGenerator, TablePathResolver,
    TableRegistration, DEFAULT_CLIENT_NAME,
};
pub use remote::RemoteTable;
pub use response::ServiceResponse;
pub use retry::{backoff_seconds, classify_http_status, RetryClass};
