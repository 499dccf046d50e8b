//! Table controller routes: OData query, CRUD, and conditional-request
//! semantics over the in-memory repository.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::header::{ETAG, IF_MATCH, IF_NONE_MATCH, LOCATION};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use tracing::debug;

use tablesync_core::query::{compare_entities, matches, project};
use tablesync_core::{Page, QueryDescription, ID_FIELD, VERSION_FIELD};

use crate::error::{ApiError, ApiResult};
use crate::repository::{TableError, TableStore};

/// Items per response page unless the embedder configures otherwise.
const DEFAULT_PAGE_SIZE: u64 = 100;
/// Largest honoured `$top`; larger values are clamped.
const MAX_TOP: u64 = 128_000;

pub struct AppState {
    pub store: TableStore,
    page_size: u64,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            store: TableStore::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.clamp(1, MAX_TOP);
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status))
        .route("/tables/{table}", get(query_table).post(create_item))
        .route(
            "/tables/{table}/{id}",
            get(read_item).put(replace_item).delete(delete_item),
        )
}

async fn status() -> Json<Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Strong-ETag extraction for `If-Match`/`If-None-Match`. A weak or
/// malformed validator yields the empty token, which compares unequal to
/// every stored version: weak validators never match.
fn header_version(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?.trim().to_string();
    if raw.starts_with("W/") || raw.starts_with("w/") {
        return Some(String::new());
    }
    match raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => Some(inner.to_string()),
        None => Some(String::new()),
    }
}

fn row_version(row: &Value) -> Option<&str> {
    row.get(VERSION_FIELD).and_then(Value::as_str)
}

/// Build an entity response carrying the row's version as a strong ETag.
fn entity_response(status: StatusCode, row: &Value) -> Response {
    let mut response = (status, Json(row.clone())).into_response();
    if let Some(etag) = row_version(row)
        .and_then(|version| HeaderValue::from_str(&format!("\"{version}\"")).ok())
    {
        response.headers_mut().insert(ETAG, etag);
    }
    response
}

fn table_error(err: TableError) -> ApiResult<Response> {
    match err {
        TableError::UnknownTable | TableError::NotFound => Err(ApiError::NotFound),
        TableError::Gone => Ok(StatusCode::GONE.into_response()),
        TableError::Conflict(existing) => Ok(entity_response(StatusCode::CONFLICT, &existing)),
        TableError::PreconditionFailed(current) => {
            Ok(entity_response(StatusCode::PRECONDITION_FAILED, &current))
        }
        TableError::InvalidPayload(message) => Err(ApiError::BadRequest(message)),
        TableError::Internal(message) => Err(ApiError::Internal(message)),
    }
}

fn parse_query(raw: Option<String>) -> ApiResult<QueryDescription> {
    Ok(QueryDescription::parse(raw.as_deref().unwrap_or(""))?)
}

async fn query_table(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Response> {
    let query = parse_query(raw)?;
    let rows = match state.store.list(&table) {
        Ok(rows) => rows,
        Err(err) => return table_error(err),
    };

    let mut filtered = Vec::with_capacity(rows.len());
    for row in rows {
        if !query.include_deleted
            && row
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        {
            continue;
        }
        if let Some(filter) = &query.filter {
            if !matches(filter, &row)? {
                continue;
            }
        }
        filtered.push(row);
    }

    filtered.sort_by(|a, b| {
        compare_entities(a, b, &query.order_by).then_with(|| {
            let left = a.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default();
            let right = b.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default();
            left.cmp(right)
        })
    });

    let total = filtered.len() as u64;
    let skip = query.skip.unwrap_or(0);
    let top = query.top.map(|top| top.min(MAX_TOP));
    let window_end = match top {
        Some(top) => skip.saturating_add(top).min(total),
        None => total,
    };
    let start = skip.min(total);
    let take = window_end.saturating_sub(start).min(state.page_size);
    let end = start + take;

    let items: Vec<Value> = filtered[start as usize..end as usize]
        .iter()
        .map(|row| project(row, &query.selection))
        .collect();

    let next_link = if end < window_end {
        let mut next = query.clone();
        next.skip = Some(end);
        next.top = top.map(|top| top - (end - skip));
        Some(next.to_query_string())
    } else {
        None
    };

    debug!(
        %table,
        total,
        returned = items.len(),
        has_next = next_link.is_some(),
        "query"
    );

    let page = Page {
        items,
        count: query.request_total_count.then_some(total as i64),
        next_link,
    };
    Ok(Json(page).into_response())
}

async fn create_item(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<Response> {
    let row = match state.store.create(&table, payload) {
        Ok(row) => row,
        Err(err) => return table_error(err),
    };

    let mut response = entity_response(StatusCode::CREATED, &row);
    if let Some(id) = row.get(ID_FIELD).and_then(Value::as_str) {
        if let Ok(location) = HeaderValue::from_str(&format!("/tables/{table}/{id}")) {
            response.headers_mut().insert(LOCATION, location);
        }
    }
    Ok(response)
}

async fn read_item(
    State(state): State<Arc<AppState>>,
    Path((table, id)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let query = parse_query(raw)?;
    let row = match state.store.read(&table, &id, query.include_deleted) {
        Ok(row) => row,
        Err(err) => return table_error(err),
    };

    if let Some(version) = header_version(&headers, IF_NONE_MATCH) {
        if row_version(&row) == Some(version.as_str()) {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }
    Ok(entity_response(StatusCode::OK, &row))
}

async fn replace_item(
    State(state): State<Arc<AppState>>,
    Path((table, id)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> ApiResult<Response> {
    let query = parse_query(raw)?;
    let expected = header_version(&headers, IF_MATCH);
    match state.store.replace(
        &table,
        &id,
        payload,
        expected.as_deref(),
        query.include_deleted,
    ) {
        Ok(row) => Ok(entity_response(StatusCode::OK, &row)),
        Err(err) => table_error(err),
    }
}

async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path((table, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let expected = header_version(&headers, IF_MATCH);
    match state.store.delete(&table, &id, expected.as_deref()) {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err) => table_error(err),
    }
}
