//! Direct (online) table access, bypassing the offline queue.
//!
//! A [`RemoteTable`] issues CRUD and query calls straight against the
//! service, with the same conditional-request semantics the push engine
//! uses. Unlike push and pull, these calls are not aggregated: a
//! non-success response raises [`ClientError::Service`] carrying the
//! server's response.

use std::sync::Arc;

use reqwest::header::{HeaderValue, ACCEPT, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tablesync_core::{Page, QueryDescription, SystemProperties};

use crate::errors::{ClientError, Result};
use crate::http::{conditional, HttpRequest, HttpResponse, TableHttpClient};
use crate::response::ServiceResponse;

/// Online view of one registered table.
pub struct RemoteTable {
    client: Arc<TableHttpClient>,
    table_url: String,
}

impl RemoteTable {
    pub(crate) fn new(client: Arc<TableHttpClient>, table_url: String) -> Self {
        Self { client, table_url }
    }

    fn item_url(&self, id: &str) -> String {
        format!("{}/{}", self.table_url, urlencoding::encode(id))
    }

    fn parse_url(text: &str) -> Result<Url> {
        Url::parse(text).map_err(|err| ClientError::config(format!("invalid URL '{text}': {err}")))
    }

    fn service_error(response: &HttpResponse) -> ClientError {
        let service = ServiceResponse::from_http(response);
        ClientError::Service {
            status: service.status,
            response: Box::new(service),
        }
    }

    async fn send(
        &self,
        mut request: HttpRequest,
        cancellation: &CancellationToken,
    ) -> Result<HttpResponse> {
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));
        self.client.send(request, cancellation).await
    }

    /// Fetch a single page of a query.
    pub async fn query(
        &self,
        query: &QueryDescription,
        cancellation: &CancellationToken,
    ) -> Result<Page<Value>> {
        let url = Self::parse_url(&format!("{}?{}", self.table_url, query.to_query_string()))?;
        let response = self.send(HttpRequest::new(Method::GET, url), cancellation).await?;
        if !response.status.is_success() {
            return Err(Self::service_error(&response));
        }
        response.json()
    }

    /// Fetch every item of a query, following `nextLink` until exhausted.
    pub async fn query_all(
        &self,
        query: &QueryDescription,
        cancellation: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(query.to_query_string());
        while let Some(query_string) = next {
            let url = Self::parse_url(&format!("{}?{query_string}", self.table_url))?;
            let response = self
                .send(HttpRequest::new(Method::GET, url), cancellation)
                .await?;
            if !response.status.is_success() {
                return Err(Self::service_error(&response));
            }
            let page: Page<Value> = response.json()?;
            items.extend(page.items);
            next = page.next_link;
        }
        Ok(items)
    }

    /// Fetch an entity by id.
    pub async fn read(&self, id: &str, cancellation: &CancellationToken) -> Result<Value> {
        let url = Self::parse_url(&self.item_url(id))?;
        let response = self.send(HttpRequest::new(Method::GET, url), cancellation).await?;
        if !response.status.is_success() {
            return Err(Self::service_error(&response));
        }
        response.json()
    }

    /// Cache-validating read: `Ok(None)` when the given version is still
    /// current on the server.
    pub async fn read_if_newer(
        &self,
        id: &str,
        version: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<Value>> {
        let url = Self::parse_url(&self.item_url(id))?;
        let mut request = HttpRequest::new(Method::GET, url);
        request
            .headers
            .insert(IF_NONE_MATCH, conditional::if_none_match_value(version)?);

        let response = self.send(request, cancellation).await?;
        if response.status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !response.status.is_success() {
            return Err(Self::service_error(&response));
        }
        Ok(Some(response.json()?))
    }

    /// Create an entity; returns the server's authoritative copy.
    pub async fn create(&self, item: &Value, cancellation: &CancellationToken) -> Result<Value> {
        let url = Self::parse_url(&self.table_url)?;
        let request = HttpRequest::new(Method::POST, url).with_json(item)?;
        let response = self.send(request, cancellation).await?;
        if !response.status.is_success() {
            return Err(Self::service_error(&response));
        }
        response.json()
    }

    /// Replace an entity, conditioned on the payload's `version` field
    /// when present.
    pub async fn replace(&self, item: &Value, cancellation: &CancellationToken) -> Result<Value> {
        let props = SystemProperties::from_value(item)?;
        let url = Self::parse_url(&self.item_url(&props.id))?;
        let mut request = HttpRequest::new(Method::PUT, url).with_json(item)?;
        if let Some(version) = &props.version {
            request
                .headers
                .insert(IF_MATCH, conditional::if_match_value(version)?);
        }

        let response = self.send(request, cancellation).await?;
        if !response.status.is_success() {
            return Err(Self::service_error(&response));
        }
        response.json()
    }

    /// Delete an entity, conditioned on `version` when given.
    pub async fn delete(
        &self,
        id: &str,
        version: Option<&str>,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let url = Self::parse_url(&self.item_url(id))?;
        let mut request = HttpRequest::new(Method::DELETE, url);
        if let Some(version) = version {
            request
                .headers
                .insert(IF_MATCH, conditional::if_match_value(version)?);
        }

        let response = self.send(request, cancellation).await?;
        if !response.status.is_success() {
            return Err(Self::service_error(&response));
        }
        Ok(())
    }
}
