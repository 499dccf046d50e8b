//! Client construction: endpoint validation, default headers, and the
//! `(endpoint, name)` client cache.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::errors::{ClientError, Result};
use crate::http::pipeline::{
    HttpRequest, HttpResponse, HttpTransport, Pipeline, PipelinePolicy, ReqwestTransport,
};

/// Default per-request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for the HTTP clients an engine constructs.
#[derive(Clone)]
pub struct ClientOptions {
    pub endpoint: String,
    pub timeout: Duration,
    pub policies: Vec<PipelinePolicy>,
    pub default_headers: HeaderMap,
}

impl ClientOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            policies: Vec::new(),
            default_headers: HeaderMap::new(),
        }
    }
}

/// Validate and normalize a base endpoint.
///
/// The URI must be absolute; the scheme must be `https`, or `http` only
/// when the host is loopback (`127.0.0.0/8`, `::1`, or `localhost`).
/// Query and fragment components are stripped and a trailing slash is
/// appended.
pub fn validate_endpoint(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| ClientError::config(format!("invalid endpoint '{endpoint}': {err}")))?;

    match url.scheme() {
        "https" => {}
        "http" => {
            let host = url.host_str().unwrap_or_default();
            if !is_loopback_host(host) {
                return Err(ClientError::config(format!(
                    "endpoint '{endpoint}' must use https (http is allowed only for loopback hosts)"
                )));
            }
        }
        other => {
            return Err(ClientError::config(format!(
                "endpoint scheme '{other}' is not supported"
            )))
        }
    }

    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return v4.is_loopback();
    }
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(v6) = trimmed.parse::<Ipv6Addr>() {
        return v6.is_loopback();
    }
    false
}

/// A named HTTP client bound to a validated endpoint.
pub struct TableHttpClient {
    pipeline: Pipeline,
    default_headers: HeaderMap,
}

impl TableHttpClient {
    /// Send a request through the pipeline, injecting default headers the
    /// request has not set itself. Cancellation aborts the in-flight send.
    pub async fn send(
        &self,
        mut request: HttpRequest,
        cancellation: &CancellationToken,
    ) -> Result<HttpResponse> {
        for (name, value) in self.default_headers.iter() {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ClientError::Cancelled),
            response = self.pipeline.send(request) => response,
        }
    }
}

/// Builds and caches [`TableHttpClient`]s.
///
/// Clients are cached by name against this factory's endpoint; repeated
/// `create_client` calls with the same name return the same instance.
pub struct ClientFactory {
    options: ClientOptions,
    endpoint: Url,
    cache: Mutex<HashMap<String, Arc<TableHttpClient>>>,
}

impl ClientFactory {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let endpoint = validate_endpoint(&options.endpoint)?;
        Ok(Self {
            options,
            endpoint,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The validated, normalized base endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn create_client(&self, name: &str) -> Result<Arc<TableHttpClient>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| ClientError::config("client cache mutex poisoned"))?;
        if let Some(client) = cache.get(name) {
            return Ok(Arc::clone(client));
        }

        let default_transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(self.options.timeout)?);
        let pipeline = Pipeline::new(&self.options.policies, default_transport)?;
        let client = Arc::new(TableHttpClient {
            pipeline,
            default_headers: self.options.default_headers.clone(),
        });
        cache.insert(name.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_endpoints_are_normalized() {
        let url = validate_endpoint("https://api.example.com/sync?token=1#frag").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/sync/");

        let url = validate_endpoint("https://api.example.com").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/");
    }

    #[test]
    fn http_is_loopback_only() {
        assert!(validate_endpoint("http://localhost:8080/").is_ok());
        assert!(validate_endpoint("http://LOCALHOST/").is_ok());
        assert!(validate_endpoint("http://127.0.0.1/").is_ok());
        assert!(validate_endpoint("http://127.8.9.10/").is_ok());
        assert!(validate_endpoint("http://[::1]:5000/").is_ok());

        assert!(validate_endpoint("http://api.example.com/").is_err());
        assert!(validate_endpoint("http://10.0.0.1/").is_err());
        assert!(validate_endpoint("ftp://example.com/").is_err());
        assert!(validate_endpoint("not a url").is_err());
    }

    #[test]
    fn clients_are_cached_by_name() {
        let factory = ClientFactory::new(ClientOptions::new("https://api.example.com/")).unwrap();
        let first = factory.create_client("movies").unwrap();
        let again = factory.create_client("movies").unwrap();
        let other = factory.create_client("books").unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
