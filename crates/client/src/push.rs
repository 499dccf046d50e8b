//! The push engine: bounded-parallel replay of queued operations.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, warn};
use reqwest::header::{HeaderValue, ACCEPT, IF_MATCH};
use reqwest::{Method, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tablesync_core::{OperationKind, OperationState, QueuedOperation, SystemProperties};

use crate::engine::EngineInner;
use crate::errors::{ClientError, Result};
use crate::http::{conditional, HttpRequest, HttpResponse};
use crate::registration::TableRegistration;
use crate::response::ServiceResponse;

/// Upper bound on worker-pool sizes for both push and pull.
pub const MAX_PARALLEL_OPERATIONS: usize = 8;

/// Options controlling a push.
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Concurrent replay workers, clamped to `[1, 8]` by validation.
    pub parallel_operations: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            parallel_operations: 1,
        }
    }
}

/// Aggregate result of a push. Per-operation failures land in
/// `failed_requests` keyed by item id; they are never thrown.
#[derive(Debug, Default)]
pub struct PushResult {
    pub completed_operations: usize,
    pub failed_requests: HashMap<String, ServiceResponse>,
}

impl PushResult {
    pub fn is_successful(&self) -> bool {
        self.failed_requests.is_empty()
    }
}

pub(crate) fn validate_parallelism(value: usize) -> Result<()> {
    if (1..=MAX_PARALLEL_OPERATIONS).contains(&value) {
        Ok(())
    } else {
        Err(ClientError::config(format!(
            "parallelOperations must be within [1, {MAX_PARALLEL_OPERATIONS}], got {value}"
        )))
    }
}

enum DispatchOutcome {
    Response(HttpResponse),
    Failed(ServiceResponse),
    Cancelled,
}

pub(crate) async fn run_push(
    inner: &Arc<EngineInner>,
    scope: &[String],
    options: &PushOptions,
    cancellation: &CancellationToken,
) -> Result<PushResult> {
    validate_parallelism(options.parallel_operations)?;
    for table in scope {
        inner.registration(table)?;
    }

    // Flush change capture, then take the lock for the drain.
    inner.flush_tracked(cancellation).await?;
    let guard = inner.lock.acquire(cancellation).await?;

    let mut operations = inner.queue.list(scope)?;
    debug!("pushing {} queued operation(s)", operations.len());
    for operation in &mut operations {
        inner.queue.mark_attempted(operation)?;
    }

    let mut result = PushResult::default();
    let mut dispatches = stream::iter(operations.into_iter().map(|operation| {
        let inner = Arc::clone(inner);
        let cancellation = cancellation.clone();
        async move {
            let outcome = dispatch(&inner, &operation, &cancellation).await;
            (operation, outcome)
        }
    }))
    .buffer_unordered(options.parallel_operations);

    // The consuming loop is the single writer: queue bookkeeping and local
    // write-backs happen here, under the lock held above.
    let mut cancelled = false;
    while let Some((operation, outcome)) = dispatches.next().await {
        match outcome {
            DispatchOutcome::Response(response) => {
                reconcile(inner, operation, &response, &mut result)?;
            }
            DispatchOutcome::Failed(failure) => {
                let mut operation = operation;
                inner.queue.mark_failed(&mut operation, failure.status)?;
                warn!(
                    "push of '{}/{}' failed: {:?}",
                    operation.table_name, operation.item_id, failure.reason
                );
                result.failed_requests.insert(operation.item_id, failure);
            }
            DispatchOutcome::Cancelled => cancelled = true,
        }
    }
    drop(dispatches);

    if cancelled || cancellation.is_cancelled() {
        // Completed operations stay removed; everything else returns to
        // pending.
        for mut operation in inner.queue.list(scope)? {
            if operation.state == OperationState::Attempted {
                inner.queue.mark_pending(&mut operation)?;
            }
        }
        inner.local.commit()?;
        drop(guard);
        return Err(ClientError::Cancelled);
    }

    inner.local.commit()?;
    drop(guard);
    Ok(result)
}

async fn dispatch(
    inner: &EngineInner,
    operation: &QueuedOperation,
    cancellation: &CancellationToken,
) -> DispatchOutcome {
    if cancellation.is_cancelled() {
        return DispatchOutcome::Cancelled;
    }

    let registration = match inner.registration(&operation.table_name) {
        Ok(registration) => registration,
        Err(err) => return DispatchOutcome::Failed(ServiceResponse::transport(err.to_string())),
    };
    let client = match inner.client_for(registration) {
        Ok(client) => client,
        Err(err) => return DispatchOutcome::Failed(ServiceResponse::transport(err.to_string())),
    };
    let request = match build_request(inner, registration, operation) {
        Ok(request) => request,
        Err(err) => return DispatchOutcome::Failed(ServiceResponse::transport(err.to_string())),
    };

    match client.send(request, cancellation).await {
        Ok(response) => DispatchOutcome::Response(response),
        Err(ClientError::Cancelled) => DispatchOutcome::Cancelled,
        Err(err) => DispatchOutcome::Failed(ServiceResponse::transport(err.to_string())),
    }
}

fn build_request(
    inner: &EngineInner,
    registration: &TableRegistration,
    operation: &QueuedOperation,
) -> Result<HttpRequest> {
    let (method, url) = match operation.kind {
        OperationKind::Add => (Method::POST, inner.table_url(registration)),
        OperationKind::Replace => (
            Method::PUT,
            inner.item_url(registration, &operation.item_id),
        ),
        OperationKind::Delete => (
            Method::DELETE,
            inner.item_url(registration, &operation.item_id),
        ),
    };
    let url = Url::parse(&url)
        .map_err(|err| ClientError::config(format!("invalid operation URL '{url}': {err}")))?;

    let mut request = HttpRequest::new(method, url);
    request
        .headers
        .insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(version) = &operation.entity_version {
        request
            .headers
            .insert(IF_MATCH, conditional::if_match_value(version)?);
    }
    if let Some(item) = &operation.item {
        request = request.with_json(item)?;
    }
    Ok(request)
}

/// Apply one response to the queue and the local store.
fn reconcile(
    inner: &EngineInner,
    mut operation: QueuedOperation,
    response: &HttpResponse,
    result: &mut PushResult,
) -> Result<()> {
    let status = response.status.as_u16();

    if response.status.is_success() {
        match operation.kind {
            OperationKind::Delete => {
                inner.queue.complete(&operation)?;
                result.completed_operations += 1;
            }
            OperationKind::Add | OperationKind::Replace => {
                match authoritative_entity(response) {
                    Ok((id, entity)) => {
                        // The server copy replaces the local row through the
                        // service-initiated path, so no new operation queues.
                        if let Err(err) = inner.write_back(&operation.table_name, &id, entity) {
                            // The server accepted the mutation; only the
                            // local write failed. Leave the operation pending
                            // and report it.
                            warn!("local write-back of '{}/{id}' failed: {err}", operation.table_name);
                            inner.queue.mark_pending(&mut operation)?;
                            result.failed_requests.insert(
                                operation.item_id.clone(),
                                ServiceResponse::transport(err.to_string()),
                            );
                            return Ok(());
                        }
                        inner.queue.complete(&operation)?;
                        result.completed_operations += 1;
                    }
                    Err(err) => {
                        inner.queue.mark_failed(&mut operation, Some(status))?;
                        result.failed_requests.insert(
                            operation.item_id.clone(),
                            ServiceResponse::protocol(status, err.to_string()),
                        );
                    }
                }
            }
        }
        return Ok(());
    }

    // A delete of something already gone has still converged.
    if operation.kind == OperationKind::Delete && matches!(status, 404 | 410) {
        inner.queue.complete(&operation)?;
        result.completed_operations += 1;
        return Ok(());
    }

    inner.queue.mark_failed(&mut operation, Some(status))?;
    debug!(
        "push of '{}/{}' rejected with HTTP {status}",
        operation.table_name, operation.item_id
    );
    result
        .failed_requests
        .insert(operation.item_id, ServiceResponse::from_http(response));
    Ok(())
}

fn authoritative_entity(response: &HttpResponse) -> Result<(String, Value)> {
    let entity: Value = response.json()?;
    let props = SystemProperties::from_value(&entity)
        .map_err(|err| ClientError::protocol(format!("2xx response body is not an entity: {err}")))?;
    Ok((props.id, entity))
}
