//! # Pulse Net
//!
//! HTTP networking for the InsightPulse offline worker and its UI shell.
//!
//! ## Design Goals
//!
//! 1. **One seam**: everything that touches the network goes through [`Fetcher`]
//! 2. **Snapshots**: a [`Response`] owns its body, so cloning it for the cache
//!    never races the caller reading it
//! 3. **Typed API**: [`ApiClient`] speaks the login/analyze contract

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod api;

pub use api::ApiClient;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Upstream returned {status}: {detail}")]
    Upstream { status: StatusCode, detail: String },

    #[error("Not logged in")]
    Unauthenticated,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NetError {
    /// Whether the request never produced a response (rejected, aborted or
    /// timed out) as opposed to the server answering with an error.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            NetError::RequestFailed(_)
                | NetError::Timeout(_)
                | NetError::Cancelled
                | NetError::HttpError(_)
        )
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as set by the page issuing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Only same-origin targets are allowed.
    SameOrigin,
    /// Cross-origin allowed with CORS.
    #[default]
    Cors,
    /// Cross-origin allowed, response is opaque.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub mode: RequestMode,
    pub referrer: Option<Url>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            mode: RequestMode::default(),
            referrer: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Create a POST request with a JSON body.
    pub fn post_json<T: serde::Serialize>(url: Url, payload: &T) -> Result<Self, NetError> {
        let body = serde_json::to_vec(payload).map_err(|e| NetError::InvalidInput(e.to_string()))?;
        Ok(Self::post(url, Bytes::from(body)).header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Only GET requests may be answered from or written to a cache.
    pub fn is_safe_read(&self) -> bool {
        self.method == Method::GET
    }
}

/// How a response may be observed by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response shared via CORS.
    Cors,
    /// Cross-origin no-cors response; contents are not inspectable.
    Opaque,
    /// Synthesized network error.
    Error,
}

/// HTTP response with its body fully read.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub body: Bytes,
}

impl Response {
    /// Build a response for `request` from parts.
    pub fn new(request: &Request, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id: request.id,
            url: request.url.clone(),
            status,
            headers,
            response_type: ResponseType::Basic,
            body,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Only complete, readable 200 responses may be stored.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK && self.response_type != ResponseType::Opaque
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can turn a request into a response.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("InsightPulse/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetcher backed by a real HTTP client.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client })
    }
}

/// Classify a response by the request's mode and whether it crossed origins.
pub fn response_type_for(request: &Request) -> ResponseType {
    let cross_origin = request
        .referrer
        .as_ref()
        .is_some_and(|r| r.origin() != request.url.origin());
    match (cross_origin, request.mode) {
        (false, _) => ResponseType::Basic,
        (true, RequestMode::NoCors) => ResponseType::Opaque,
        (true, _) => ResponseType::Cors,
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header(http::header::REFERER, referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or_default())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            request_id: request.id,
            url,
            status,
            headers,
            response_type: response_type_for(request),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.is_safe_read());
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let url = Url::parse("https://example.com/analyze").unwrap();
        let request = Request::post_json(url, &serde_json::json!({"text": "hi"})).unwrap();
        assert_eq!(request.method, Method::POST);
        assert!(!request.is_safe_read());
        assert_eq!(
            request.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(request.body.as_deref(), Some(&br#"{"text":"hi"}"#[..]));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_response_type_classification() {
        let page = Url::parse("https://app.example.com/").unwrap();
        let same = Request::get(page.join("/style.css").unwrap()).referrer(page.clone());
        assert_eq!(response_type_for(&same), ResponseType::Basic);

        let cdn = Url::parse("https://cdn.example.net/chart.js").unwrap();
        let cors = Request::get(cdn.clone()).referrer(page.clone());
        assert_eq!(response_type_for(&cors), ResponseType::Cors);

        let opaque = Request::get(cdn).referrer(page).mode(RequestMode::NoCors);
        assert_eq!(response_type_for(&opaque), ResponseType::Opaque);
    }

    #[test]
    fn test_cacheable_only_plain_200() {
        let request = Request::get(Url::parse("https://example.com/a").unwrap());
        let mut response = Response::new(&request, StatusCode::OK, HeaderMap::new(), Bytes::new());
        assert!(response.is_cacheable());

        response.response_type = ResponseType::Opaque;
        assert!(!response.is_cacheable());

        let partial = Response::new(
            &request,
            StatusCode::PARTIAL_CONTENT,
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(partial.ok());
        assert!(!partial.is_cacheable());
    }

    #[test]
    fn test_network_failure_classification() {
        assert!(NetError::Cancelled.is_network_failure());
        assert!(NetError::Timeout(Duration::from_secs(1)).is_network_failure());
        assert!(!NetError::Unauthenticated.is_network_failure());
        assert!(!NetError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            detail: "down".into()
        }
        .is_network_failure());
    }

    #[tokio::test]
    async fn test_http_fetcher_reads_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/style.css"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/css")
                    .set_body_string("body { margin: 0 }"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/style.css", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type(), Some("text/css"));
        assert_eq!(response.text().unwrap(), "body { margin: 0 }");
        assert_eq!(response.response_type, ResponseType::Basic);
    }

    #[tokio::test]
    async fn test_http_fetcher_forwards_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/analyze", server.uri())).unwrap();
        let request = Request::post(url, Bytes::from_static(b"{}")).header(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused_is_network_failure() {
        let server = MockServer::start().await;
        let url = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        drop(server);

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let err = fetcher.fetch(&Request::get(url)).await.unwrap_err();
        assert!(err.is_network_failure());
    }
}
