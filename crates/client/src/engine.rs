//! Engine assembly.
//!
//! One [`SyncEngine`] owns one local store, the operations queue and
//! delta-token stores that ride alongside it, the synchronization lock,
//! and the HTTP client factory. Application mutations go through the
//! change-capture context ([`SyncEngine::insert`] / [`SyncEngine::update`]
//! / [`SyncEngine::remove`], committed by [`SyncEngine::save_changes`]);
//! server-originated writes take the service-initiated path instead,
//! which never queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tablesync_core::memory::{MemoryDeltaTokenStore, MemoryLocalStore, MemoryOperationsQueue};
use tablesync_core::{
    DeltaTokenStore, LocalStore, OperationKind, OperationsQueueStore, QueuedOperation,
    SystemProperties,
};

use crate::conflict::{ConflictResolution, ConflictResolver};
use crate::context::SyncContext;
use crate::errors::{validation, ClientError, Result};
use crate::events::{SyncEvent, SyncEventBus};
use crate::http::{ClientFactory, ClientOptions, PipelinePolicy, TableHttpClient};
use crate::lock::SyncLock;
use crate::pull::{run_pull, PullOptions, PullRequest, PullResult};
use crate::push::{run_push, PushOptions, PushResult};
use crate::queue::OperationsQueue;
use crate::registration::{
    default_id_generator, default_table_path_resolver, IdGenerator, TablePathResolver,
    TableRegistration,
};

/// Options for a combined push + pull.
#[derive(Clone, Default)]
pub struct SynchronizeOptions {
    pub push: PushOptions,
    pub pull: PullOptions,
}

/// Result of a combined push + pull.
#[derive(Debug)]
pub struct SynchronizeResult {
    pub push: PushResult,
    pub pull: PullResult,
}

impl SynchronizeResult {
    pub fn is_successful(&self) -> bool {
        self.push.is_successful() && self.pull.is_successful()
    }
}

pub(crate) struct EngineInner {
    pub(crate) registrations: HashMap<String, TableRegistration>,
    pub(crate) local: Arc<dyn LocalStore>,
    pub(crate) queue: OperationsQueue,
    pub(crate) delta: Arc<dyn DeltaTokenStore>,
    pub(crate) factory: ClientFactory,
    pub(crate) lock: SyncLock,
    pub(crate) events: SyncEventBus,
    pub(crate) path_resolver: TablePathResolver,
    context: SyncContext,
}

impl EngineInner {
    pub(crate) fn registration(&self, table: &str) -> Result<&TableRegistration> {
        self.registrations.get(table).ok_or_else(|| {
            validation(format!("table '{table}' is not registered for synchronization"))
        })
    }

    pub(crate) fn table_url(&self, registration: &TableRegistration) -> String {
        let path = match &registration.path_override {
            Some(path) => path.trim_start_matches('/').to_string(),
            None => (self.path_resolver)(&registration.name),
        };
        format!("{}{path}", self.factory.endpoint())
    }

    pub(crate) fn item_url(&self, registration: &TableRegistration, id: &str) -> String {
        format!(
            "{}/{}",
            self.table_url(registration),
            urlencoding::encode(id)
        )
    }

    pub(crate) fn client_for(
        &self,
        registration: &TableRegistration,
    ) -> Result<Arc<TableHttpClient>> {
        self.factory.create_client(&registration.client_name)
    }

    /// Service-initiated local write: the server's authoritative copy
    /// replaces the local row without re-entering change capture.
    pub(crate) fn write_back(&self, table: &str, id: &str, item: Value) -> Result<()> {
        self.context.write_back(table, id, item)
    }

    /// Commit tracked changes through the standard save path, under the
    /// synchronization lock.
    pub(crate) async fn flush_tracked(&self, cancellation: &CancellationToken) -> Result<usize> {
        let _guard = self.lock.acquire(cancellation).await?;
        self.context.save_tracked()
    }
}

/// The offline synchronization engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder(endpoint: impl Into<String>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(endpoint)
    }

    /// Subscribe to synchronization progress events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Track an insert. Assigns an id when the payload has none; returns
    /// the entity id.
    pub fn insert(&self, table: &str, item: Value) -> Result<String> {
        self.inner.registration(table)?;
        self.inner.context.track_insert(table, item)
    }

    /// Track a replacement of an existing entity. The payload's `version`
    /// field becomes the optimistic-concurrency token for the push.
    pub fn update(&self, table: &str, item: Value) -> Result<()> {
        self.inner.registration(table)?;
        self.inner.context.track_update(table, item)
    }

    /// Track a deletion by id.
    pub fn remove(&self, table: &str, id: &str) -> Result<()> {
        self.inner.registration(table)?;
        self.inner.context.track_remove(table, id)
    }

    /// Commit tracked changes to the local store and operations queue.
    /// Returns the number of changes captured.
    pub async fn save_changes(&self, cancellation: &CancellationToken) -> Result<usize> {
        self.inner.flush_tracked(cancellation).await
    }

    /// Replay queued operations against the service. An empty `scope`
    /// pushes every registered table.
    pub async fn push(
        &self,
        scope: &[&str],
        options: &PushOptions,
        cancellation: &CancellationToken,
    ) -> Result<PushResult> {
        let scope: Vec<String> = scope.iter().map(|table| table.to_string()).collect();
        run_push(&self.inner, &scope, options, cancellation).await
    }

    /// Fetch server changes for the given requests and apply them to the
    /// local store.
    pub async fn pull(
        &self,
        requests: Vec<PullRequest>,
        options: &PullOptions,
        cancellation: &CancellationToken,
    ) -> Result<PullResult> {
        run_pull(&self.inner, requests, options, cancellation).await
    }

    /// Push, then pull every registered table.
    pub async fn synchronize(
        &self,
        options: &SynchronizeOptions,
        cancellation: &CancellationToken,
    ) -> Result<SynchronizeResult> {
        let push = self.push(&[], &options.push, cancellation).await?;

        let mut tables: Vec<String> = self.inner.registrations.keys().cloned().collect();
        tables.sort();
        let requests = tables.into_iter().map(PullRequest::new).collect();
        let pull = self.pull(requests, &options.pull, cancellation).await?;

        Ok(SynchronizeResult { push, pull })
    }

    /// Settle the conflicts a push reported.
    ///
    /// Client-wins re-arms the queued operation with the server's version
    /// token (turning a conflicted create into a replace) so the next
    /// push replays it; server-wins accepts the server entity locally and
    /// drops the operation. Returns the number of conflicts settled.
    pub async fn resolve_conflicts(
        &self,
        result: &PushResult,
        resolver: &dyn ConflictResolver,
        cancellation: &CancellationToken,
    ) -> Result<usize> {
        let _guard = self.inner.lock.acquire(cancellation).await?;
        let mut settled = 0;

        for (item_id, failure) in &result.failed_requests {
            if !failure.is_conflict() {
                continue;
            }
            let Some(server_entity) = failure.server_entity() else {
                continue;
            };
            let Some(mut operation) = self
                .inner
                .queue
                .list(&[])?
                .into_iter()
                .find(|operation| operation.item_id == *item_id)
            else {
                continue;
            };

            match resolver.resolve(operation.item.as_ref(), Some(server_entity)) {
                ConflictResolution::ClientWins => {
                    let server_version = SystemProperties::from_value(server_entity)
                        .ok()
                        .and_then(|props| props.version);
                    if operation.kind == OperationKind::Add {
                        // The id already exists server-side; winning means
                        // replacing that row.
                        operation.kind = OperationKind::Replace;
                    }
                    operation.entity_version = server_version;
                    operation.http_status_code = None;
                    self.inner.queue.mark_pending(&mut operation)?;
                    settled += 1;
                }
                ConflictResolution::ServerWins => {
                    let props = SystemProperties::from_value(server_entity)?;
                    self.inner
                        .write_back(&operation.table_name, &props.id, server_entity.clone())?;
                    self.inner.queue.complete(&operation)?;
                    settled += 1;
                }
                ConflictResolution::Unresolved => {}
            }
        }

        self.inner.local.commit()?;
        Ok(settled)
    }

    /// A direct, online view of one registered table that bypasses the
    /// offline queue.
    pub fn remote_table(&self, table: &str) -> Result<crate::remote::RemoteTable> {
        let registration = self.inner.registration(table)?;
        Ok(crate::remote::RemoteTable::new(
            self.inner.client_for(registration)?,
            self.inner.table_url(registration),
        ))
    }

    /// The non-completed operations currently queued, in sequence order.
    pub fn pending_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.inner.queue.list(&[])
    }

    /// Forget the delta token for a query id, forcing the next pull of
    /// that query to fetch everything.
    pub fn reset_delta_token(&self, query_id: &str) -> Result<()> {
        self.inner.delta.reset(query_id)?;
        Ok(())
    }
}

/// Configures and constructs a [`SyncEngine`].
pub struct SyncEngineBuilder {
    options: ClientOptions,
    registrations: Vec<TableRegistration>,
    local: Option<Arc<dyn LocalStore>>,
    queue: Option<Arc<dyn OperationsQueueStore>>,
    delta: Option<Arc<dyn DeltaTokenStore>>,
    id_generator: IdGenerator,
    path_resolver: TablePathResolver,
}

impl SyncEngineBuilder {
    fn new(endpoint: impl Into<String>) -> Self {
        Self {
            options: ClientOptions::new(endpoint),
            registrations: Vec::new(),
            local: None,
            queue: None,
            delta: None,
            id_generator: default_id_generator(),
            path_resolver: default_table_path_resolver(),
        }
    }

    /// Per-request HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Append a pipeline policy (interceptor, or terminal transport in
    /// last position).
    pub fn policy(mut self, policy: PipelinePolicy) -> Self {
        self.options.policies.push(policy);
        self
    }

    /// A header injected into every request that does not set it itself.
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.options.default_headers.insert(name, value);
        self
    }

    pub fn register(mut self, registration: TableRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local = Some(store);
        self
    }

    pub fn queue_store(mut self, store: Arc<dyn OperationsQueueStore>) -> Self {
        self.queue = Some(store);
        self
    }

    pub fn delta_store(mut self, store: Arc<dyn DeltaTokenStore>) -> Self {
        self.delta = Some(store);
        self
    }

    pub fn id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn table_path_resolver(mut self, resolver: TablePathResolver) -> Self {
        self.path_resolver = resolver;
        self
    }

    /// Validate the configuration and construct the engine.
    ///
    /// Configuration failures (bad endpoint, missing system fields,
    /// duplicate registrations, misplaced pipeline transport) surface
    /// here, synchronously, and are fatal to the engine instance.
    pub fn build(self) -> Result<SyncEngine> {
        let factory = ClientFactory::new(self.options)?;

        let mut registrations = HashMap::new();
        for registration in self.registrations {
            registration.validate()?;
            let name = registration.name.clone();
            if registrations.insert(name.clone(), registration).is_some() {
                return Err(ClientError::config(format!(
                    "table '{name}' is registered twice"
                )));
            }
        }
        if registrations.is_empty() {
            return Err(ClientError::config(
                "engine requires at least one registered table",
            ));
        }

        let queue_store = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryOperationsQueue::new()));
        let queue = OperationsQueue::new(queue_store);
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(MemoryLocalStore::new()));
        let context = SyncContext::new(Arc::clone(&local), queue.clone(), self.id_generator);

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                registrations,
                local,
                queue,
                delta: self
                    .delta
                    .unwrap_or_else(|| Arc::new(MemoryDeltaTokenStore::new())),
                factory,
                lock: SyncLock::new(),
                events: SyncEventBus::new(),
                path_resolver: self.path_resolver,
                context,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tablesync_core::{validate_entity_id, OperationState};

    fn movie_registration() -> TableRegistration {
        TableRegistration::new("movies", ["id", "updatedAt", "version", "deleted", "title"])
    }

    fn engine() -> SyncEngine {
        SyncEngine::builder("https://api.example.com/")
            .register(movie_registration())
            .build()
            .unwrap()
    }

    #[test]
    fn build_rejects_bad_configurations() {
        assert!(SyncEngine::builder("https://api.example.com/")
            .build()
            .is_err());

        assert!(SyncEngine::builder("http://api.example.com/")
            .register(movie_registration())
            .build()
            .is_err());

        assert!(SyncEngine::builder("https://api.example.com/")
            .register(movie_registration())
            .register(movie_registration())
            .build()
            .is_err());

        assert!(SyncEngine::builder("https://api.example.com/")
            .register(TableRegistration::new("movies", ["id", "title"]))
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn insert_assigns_and_validates_ids() {
        let engine = engine();
        let id = engine.insert("movies", json!({"title": "A"})).unwrap();
        assert!(validate_entity_id(&id).is_ok());

        let explicit = engine
            .insert("movies", json!({"id": "m1", "title": "B"}))
            .unwrap();
        assert_eq!(explicit, "m1");

        assert!(engine
            .insert("movies", json!({"id": "bad id", "title": "C"}))
            .is_err());
        assert!(engine.insert("unknown", json!({"title": "D"})).is_err());

        let token = CancellationToken::new();
        let saved = engine.save_changes(&token).await.unwrap();
        assert_eq!(saved, 2);
        let pending = engine.pending_operations().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|op| op.state == OperationState::Pending));
    }

    #[tokio::test]
    async fn insert_then_remove_coalesces_to_nothing() {
        let engine = engine();
        let id = engine.insert("movies", json!({"title": "gone"})).unwrap();
        let token = CancellationToken::new();
        engine.save_changes(&token).await.unwrap();
        engine.remove("movies", &id).unwrap();
        engine.save_changes(&token).await.unwrap();

        assert!(engine.pending_operations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_captures_the_entity_version() {
        let engine = engine();
        engine
            .update(
                "movies",
                json!({"id": "m2", "title": "new", "version": "djE="}),
            )
            .unwrap();
        let token = CancellationToken::new();
        engine.save_changes(&token).await.unwrap();

        let pending = engine.pending_operations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Replace);
        assert_eq!(pending[0].entity_version.as_deref(), Some("djE="));
    }

    #[test]
    fn table_urls_follow_the_path_resolver() {
        let engine = engine();
        let registration = engine.inner.registration("movies").unwrap();
        assert_eq!(
            engine.inner.table_url(registration),
            "https://api.example.com/tables/movies"
        );
        assert_eq!(
            engine.inner.item_url(registration, "m 1"),
            "https://api.example.com/tables/movies/m%201"
        );
    }
}
