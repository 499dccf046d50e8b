//! The request pipeline: an ordered chain of delegating interceptors
//! ending in a terminal transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::errors::{ClientError, Result};

/// A transport-neutral request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Attach a JSON body and its content type.
    pub fn with_json(mut self, value: &serde_json::Value) -> Result<Self> {
        self.body = Some(serde_json::to_vec(value).map_err(tablesync_core::Error::from)?);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }
}

/// A transport-neutral response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ClientError::protocol(format!("malformed JSON body: {err}")))
    }

    /// A response header as text, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// The terminal element of a pipeline: sends the request, forwards to
/// nothing.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// The remainder of a pipeline, from an interceptor's point of view.
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn HttpInterceptor>],
    transport: &'a dyn HttpTransport,
}

impl<'a> Next<'a> {
    /// Forward the request to the rest of the chain.
    pub async fn run(self, request: HttpRequest) -> Result<HttpResponse> {
        match self.interceptors.split_first() {
            Some((head, rest)) => {
                head.intercept(
                    request,
                    Next {
                        interceptors: rest,
                        transport: self.transport,
                    },
                )
                .await
            }
            None => self.transport.send(request).await,
        }
    }
}

/// A delegating pipeline element: may mutate the request, must forward to
/// `next`, and may transform the response on the way back.
#[async_trait]
pub trait HttpInterceptor: Send + Sync {
    async fn intercept(&self, request: HttpRequest, next: Next<'_>) -> Result<HttpResponse>;
}

/// One configured element of a pipeline.
#[derive(Clone)]
pub enum PipelinePolicy {
    Interceptor(Arc<dyn HttpInterceptor>),
    Transport(Arc<dyn HttpTransport>),
}

/// An ordered interceptor chain ending in a transport.
#[derive(Clone)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    transport: Arc<dyn HttpTransport>,
}

impl Pipeline {
    /// Compose a pipeline from configured policies.
    ///
    /// A terminal transport may appear only in the last position;
    /// anywhere else is a configuration error. When the policy list has
    /// no transport, `default_transport` terminates the chain.
    pub fn new(
        policies: &[PipelinePolicy],
        default_transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let mut interceptors = Vec::new();
        let mut transport: Option<Arc<dyn HttpTransport>> = None;

        for (index, policy) in policies.iter().enumerate() {
            match policy {
                PipelinePolicy::Interceptor(interceptor) => {
                    interceptors.push(Arc::clone(interceptor))
                }
                PipelinePolicy::Transport(terminal) => {
                    if index + 1 != policies.len() {
                        return Err(ClientError::config(
                            "a non-delegating transport may only terminate the pipeline",
                        ));
                    }
                    transport = Some(Arc::clone(terminal));
                }
            }
        }

        Ok(Self {
            interceptors,
            transport: transport.unwrap_or(default_transport),
        })
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        Next {
            interceptors: &self.interceptors,
            transport: self.transport.as_ref(),
        }
        .run(request)
        .await
    }
}

/// The production transport: reqwest with a per-request timeout and
/// automatic decompression.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|err| ClientError::config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.seen
                .lock()
                .unwrap()
                .push(request.header_trail());
            Ok(HttpResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Vec::new(),
            })
        }
    }

    impl HttpRequest {
        fn header_trail(&self) -> String {
            self.headers
                .get("x-trail")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string()
        }
    }

    struct TrailInterceptor(&'static str);

    #[async_trait]
    impl HttpInterceptor for TrailInterceptor {
        async fn intercept(&self, mut request: HttpRequest, next: Next<'_>) -> Result<HttpResponse> {
            let trail = format!("{}{}", request.header_trail(), self.0);
            request.headers.insert("x-trail", trail.parse().unwrap());
            next.run(request).await
        }
    }

    fn request() -> HttpRequest {
        HttpRequest::new(Method::GET, Url::parse("https://example.com/tables/x").unwrap())
    }

    #[tokio::test]
    async fn interceptors_run_in_declared_order() {
        let transport = Arc::new(RecordingTransport {
            seen: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::new(
            &[
                PipelinePolicy::Interceptor(Arc::new(TrailInterceptor("a"))),
                PipelinePolicy::Interceptor(Arc::new(TrailInterceptor("b"))),
            ],
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
        )
        .unwrap();

        pipeline.send(request()).await.unwrap();
        assert_eq!(*transport.seen.lock().unwrap(), vec!["ab".to_string()]);
    }

    #[tokio::test]
    async fn explicit_transport_must_be_last() {
        let transport: Arc<dyn HttpTransport> = Arc::new(RecordingTransport {
            seen: Mutex::new(Vec::new()),
        });

        let misplaced = Pipeline::new(
            &[
                PipelinePolicy::Transport(Arc::clone(&transport)),
                PipelinePolicy::Interceptor(Arc::new(TrailInterceptor("a"))),
            ],
            Arc::clone(&transport),
        );
        assert!(matches!(misplaced, Err(ClientError::Config(_))));

        let valid = Pipeline::new(
            &[
                PipelinePolicy::Interceptor(Arc::new(TrailInterceptor("a"))),
                PipelinePolicy::Transport(Arc::clone(&transport)),
            ],
            Arc::clone(&transport),
        );
        assert!(valid.is_ok());
    }

    #[test]
    fn json_body_sets_content_type() {
        let request = request().with_json(&serde_json::json!({"id": "m1"})).unwrap();
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(request.body.is_some());
    }
}
