//! The pull engine: bounded-parallel paged fetch with delta-token
//! advancement and single-writer local apply.
//!
//! Fetch workers page through each request's result set and feed pages
//! into a bounded channel; one consumer applies them to the local store
//! under the synchronization lock. Delta tokens only ever move forward,
//! and each advance commits before further rows from the same page are
//! applied.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use log::{debug, warn};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Method, Url};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use tablesync_core::entity::epoch;
use tablesync_core::query::{ComparisonOp, Constant, FilterExpr};
use tablesync_core::{
    OrderBy, Page, QueryDescription, SystemProperties, UPDATED_AT_FIELD,
};

use crate::engine::EngineInner;
use crate::errors::{ClientError, Result};
use crate::events::SyncEvent;
use crate::http::{HttpRequest, TableHttpClient};
use crate::push::validate_parallelism;
use crate::response::ServiceResponse;

/// Pages buffered between the fetch workers and the apply worker;
/// producers block when the apply side falls behind.
const PAGE_CHANNEL_CAPACITY: usize = 16;

/// One query to pull.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub table_name: String,
    /// Optional label distinguishing this query's delta token from other
    /// pulls of the same table.
    pub query_id: Option<String>,
    pub query: QueryDescription,
}

impl PullRequest {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            query_id: None,
            query: QueryDescription::new(),
        }
    }

    pub fn with_query(mut self, query: QueryDescription) -> Self {
        self.query = query;
        self
    }

    pub fn with_query_id(mut self, label: impl Into<String>) -> Self {
        self.query_id = Some(label.into());
        self
    }

    /// The delta-token key: the table name, optionally suffixed.
    pub fn effective_query_id(&self) -> String {
        match &self.query_id {
            Some(label) => format!("{}:{label}", self.table_name),
            None => self.table_name.clone(),
        }
    }
}

/// Options controlling a pull.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Concurrent fetch workers, clamped to `[1, 8]` by validation.
    pub parallel_operations: usize,
    /// Commit after every fetched page, not just at the end.
    pub save_after_every_service_request: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            parallel_operations: 1,
            save_after_every_service_request: true,
        }
    }
}

/// Aggregate result of a pull. Per-request failures land in
/// `failed_requests` keyed by query id; they are never thrown.
#[derive(Debug, Default)]
pub struct PullResult {
    pub items_applied: usize,
    pub failed_requests: HashMap<String, ServiceResponse>,
}

impl PullResult {
    pub fn is_successful(&self) -> bool {
        self.failed_requests.is_empty()
    }
}

/// One fetched page, or a terminal failure, en route to the apply worker.
struct PageMessage {
    query_id: String,
    items: Vec<Value>,
    total_count: Option<i64>,
    /// Cumulative items fetched for this query, this page included.
    cumulative: usize,
    error: Option<ServiceResponse>,
}

struct RequestState {
    table_name: String,
    token: DateTime<FixedOffset>,
    transient: HashSet<String>,
    failed: bool,
}

pub(crate) async fn run_pull(
    inner: &Arc<EngineInner>,
    requests: Vec<PullRequest>,
    options: &PullOptions,
    cancellation: &CancellationToken,
) -> Result<PullResult> {
    validate_parallelism(options.parallel_operations)?;
    if requests.is_empty() {
        return Ok(PullResult::default());
    }

    let mut seen = HashSet::new();
    for request in &requests {
        inner.registration(&request.table_name)?;
        if !seen.insert(request.effective_query_id()) {
            return Err(ClientError::Core(tablesync_core::Error::Validation(
                format!("duplicate pull query id '{}'", request.effective_query_id()),
            )));
        }
    }

    let (sender, mut receiver) = mpsc::channel::<PageMessage>(PAGE_CHANNEL_CAPACITY);
    let limiter = Arc::new(Semaphore::new(options.parallel_operations));
    let mut states: HashMap<String, RequestState> = HashMap::new();
    let mut workers = Vec::new();

    for request in requests {
        let query_id = request.effective_query_id();
        // Delta tokens are read before the lock; set-max semantics keep the
        // later write safe.
        let token = inner.delta.get(&query_id)?;
        let registration = inner.registration(&request.table_name)?;
        let table_url = inner.table_url(registration);
        let client = inner.client_for(registration)?;
        let query_string = effective_query(&request.query, token).to_query_string();

        states.insert(
            query_id.clone(),
            RequestState {
                table_name: request.table_name.clone(),
                token,
                transient: registration.transient_fields.clone(),
                failed: false,
            },
        );
        workers.push(tokio::spawn(fetch_worker(FetchJob {
            query_id,
            table_url,
            query_string,
            client,
            sender: sender.clone(),
            limiter: Arc::clone(&limiter),
            cancellation: cancellation.clone(),
        })));
    }
    drop(sender);

    // The apply side is the single writer over the local store.
    let guard = inner.lock.acquire(cancellation).await?;
    for query_id in states.keys() {
        inner.events.publish(SyncEvent::PullStarted {
            query_id: query_id.clone(),
        });
    }

    let mut result = PullResult::default();
    while let Some(message) = receiver.recv().await {
        let Some(state) = states.get_mut(&message.query_id) else {
            continue;
        };

        if let Some(failure) = message.error {
            warn!(
                "pull of '{}' failed: status={:?} reason={:?}",
                message.query_id, failure.status, failure.reason
            );
            state.failed = true;
            inner.events.publish(SyncEvent::LocalException {
                query_id: Some(message.query_id.clone()),
                message: failure
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("service returned HTTP {:?}", failure.status)),
            });
            result.failed_requests.insert(message.query_id, failure);
            continue;
        }

        for item in &message.items {
            match apply_item(inner, state, &message.query_id, item) {
                Ok(()) => result.items_applied += 1,
                Err(err) => {
                    // Local failures are recorded and the pull continues
                    // with the next record.
                    warn!("failed to apply record for '{}': {err}", message.query_id);
                    inner.events.publish(SyncEvent::LocalException {
                        query_id: Some(message.query_id.clone()),
                        message: err.to_string(),
                    });
                }
            }
        }

        inner.events.publish(SyncEvent::ItemsFetched {
            query_id: message.query_id.clone(),
            items_processed: message.cumulative,
            total_items: message.total_count,
        });

        if options.save_after_every_service_request {
            // Page-boundary commit; any delta-advance commit for this page
            // has already happened inside apply_item.
            inner.local.commit()?;
            inner.events.publish(SyncEvent::ItemsCommitted {
                query_id: message.query_id.clone(),
                items_committed: message.cumulative,
            });
        }
    }

    for worker in workers {
        let _ = worker.await;
    }

    inner.local.commit()?;
    for (query_id, state) in &states {
        inner.events.publish(SyncEvent::PullEnded {
            query_id: query_id.clone(),
            failed: state.failed,
        });
    }
    drop(guard);

    if cancellation.is_cancelled() {
        return Err(ClientError::Cancelled);
    }
    Ok(result)
}

/// Derive the query actually sent to the service: the delta conjunct,
/// forced soft-delete inclusion and total count, cleared paging, and the
/// only ordering under which delta advancement is correct.
fn effective_query(
    query: &QueryDescription,
    token: DateTime<FixedOffset>,
) -> QueryDescription {
    let mut effective = query.clone();
    if token > epoch() {
        let newer = FilterExpr::compare(
            ComparisonOp::Gt,
            FilterExpr::member(UPDATED_AT_FIELD),
            FilterExpr::Constant(Constant::DateTime(token)),
        );
        effective.filter = Some(match effective.filter.take() {
            Some(existing) => FilterExpr::and(existing, newer),
            None => newer,
        });
    }
    effective.include_deleted = true;
    effective.request_total_count = true;
    effective.skip = None;
    effective.top = None;
    effective.order_by = vec![OrderBy::ascending(UPDATED_AT_FIELD)];
    effective
}

/// Apply one incoming record under the synchronization lock.
fn apply_item(
    inner: &EngineInner,
    state: &mut RequestState,
    query_id: &str,
    item: &Value,
) -> Result<()> {
    let props = SystemProperties::from_value(item)?;
    let existing = inner.local.get(&state.table_name, &props.id)?;

    if props.deleted {
        if existing.is_some() {
            inner.local.delete(&state.table_name, &props.id)?;
        }
    } else {
        let next = match existing {
            None => item.clone(),
            Some(local_row) => merge_except_transient(local_row, item, &state.transient),
        };
        inner.write_back(&state.table_name, &props.id, next)?;
    }

    if let Some(updated_at) = props.updated_at {
        if updated_at > state.token {
            inner.delta.set(query_id, updated_at)?;
            state.token = updated_at;
            // Intermediate commit before further rows from this page: some
            // stores reject an added-then-modified row in one transaction.
            inner.local.commit()?;
        }
    }
    Ok(())
}

/// Copy every incoming property except the transient ones into the local
/// row.
fn merge_except_transient(
    mut local: Value,
    incoming: &Value,
    transient: &HashSet<String>,
) -> Value {
    let (Some(local_map), Some(incoming_map)) = (local.as_object_mut(), incoming.as_object())
    else {
        return incoming.clone();
    };
    for (key, value) in incoming_map {
        if !transient.contains(key) {
            local_map.insert(key.clone(), value.clone());
        }
    }
    local
}

struct FetchJob {
    query_id: String,
    table_url: String,
    query_string: String,
    client: Arc<TableHttpClient>,
    sender: mpsc::Sender<PageMessage>,
    limiter: Arc<Semaphore>,
    cancellation: CancellationToken,
}

impl FetchJob {
    async fn fail(&self, failure: ServiceResponse) {
        let _ = self
            .sender
            .send(PageMessage {
                query_id: self.query_id.clone(),
                items: Vec::new(),
                total_count: None,
                cumulative: 0,
                error: Some(failure),
            })
            .await;
    }
}

/// Page through one request's result set, following `nextLink` verbatim.
async fn fetch_worker(job: FetchJob) {
    let _permit = tokio::select! {
        _ = job.cancellation.cancelled() => return,
        permit = Arc::clone(&job.limiter).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    let mut next_link: Option<String> = None;
    let mut cumulative = 0usize;

    loop {
        if job.cancellation.is_cancelled() {
            return;
        }

        let query = next_link.as_deref().unwrap_or(&job.query_string);
        let target = format!("{}?{query}", job.table_url);
        let url = match Url::parse(&target) {
            Ok(url) => url,
            Err(err) => {
                job.fail(ServiceResponse::transport(format!(
                    "invalid page URL '{target}': {err}"
                )))
                .await;
                return;
            }
        };

        let mut request = HttpRequest::new(Method::GET, url);
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        let response = match job.client.send(request, &job.cancellation).await {
            Ok(response) => response,
            Err(ClientError::Cancelled) => return,
            Err(err) => {
                job.fail(ServiceResponse::transport(err.to_string())).await;
                return;
            }
        };

        if !response.status.is_success() {
            job.fail(ServiceResponse::from_http(&response)).await;
            return;
        }

        let page: Page<Value> = match response.json() {
            Ok(page) => page,
            Err(err) => {
                job.fail(ServiceResponse::protocol(
                    response.status.as_u16(),
                    format!("malformed page envelope: {err}"),
                ))
                .await;
                return;
            }
        };

        cumulative += page.items.len();
        debug!(
            "fetched page for '{}': {} item(s), nextLink={:?}",
            job.query_id,
            page.items.len(),
            page.next_link
        );

        let message = PageMessage {
            query_id: job.query_id.clone(),
            items: page.items,
            total_count: page.count,
            cumulative,
            error: None,
        };
        if job.sender.send(message).await.is_err() {
            return;
        }

        match page.next_link {
            Some(link) => next_link = Some(link),
            None => return,
        }
    }
}
