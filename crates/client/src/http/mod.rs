//! HTTP plumbing: the interceptor pipeline, the reqwest transport, the
//! caching client factory, and conditional-request helpers.

pub mod conditional;
pub mod factory;
pub mod pipeline;

pub use factory::{validate_endpoint, ClientFactory, ClientOptions, TableHttpClient};
pub use pipeline::{
    HttpInterceptor, HttpRequest, HttpResponse, HttpTransport, Next, Pipeline, PipelinePolicy,
    ReqwestTransport,
};
