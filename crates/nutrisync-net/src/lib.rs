//! # NutriSync Net
//!
//! Request/response model and network access for the NutriSync offline gateway.
//!
//! ## Design Goals
//!
//! 1. **Consume-once bodies**: a [`Response`] body can be read exactly once;
//!    [`Response::tee`] is the only way to get two readable copies.
//! 2. **Pluggable network**: the gateway talks to a [`Network`], so tests can
//!    script responses and outages.
//! 3. **Async HTTP**: [`HttpNetwork`] is the reqwest-backed production network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub use url::Url;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Body stream failed: {0}")]
    Body(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
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

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    /// Sub-resource fetch (script, image, XHR).
    #[default]
    Cors,
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

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
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

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a top-level page load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

/// HTTP response.
///
/// The body is owned by the response and consumed by [`Response::bytes`] and
/// friends, so it can be read at most once.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    /// Create a response with a fully loaded body.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let body = if body.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Full(body)
        };
        Self {
            url,
            status,
            headers,
            body,
        }
    }

    /// Create a response whose body arrives in chunks.
    pub fn streaming(
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        chunks: mpsc::Receiver<Result<Bytes, NetError>>,
    ) -> Self {
        Self {
            url,
            status,
            headers,
            body: ResponseBody::Stream(chunks),
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Parsed `Content-Type` header, if present and valid.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        match self.body {
            ResponseBody::Full(b) => Ok(b),
            ResponseBody::Stream(mut rx) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
            ResponseBody::Empty => Ok(Bytes::new()),
        }
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }

    /// Get the body as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| NetError::Body(e.to_string()))
    }

    /// Split into two independent responses with identical status, headers
    /// and body.
    ///
    /// The body is read once; both halves share the same immutable buffer, so
    /// consuming one never empties the other.
    ///
    /// A streaming body is drained completely before either half is returned,
    /// so the caller waits for the whole body, not just the headers.
    /// [`HttpNetwork`] already buffers bodies, so this only matters for
    /// streaming responses built by hand.
    pub async fn tee(self) -> Result<(Response, Response), NetError> {
        let Response {
            url,
            status,
            headers,
            body,
        } = self;

        let body = match body {
            ResponseBody::Full(b) => b,
            ResponseBody::Empty => Bytes::new(),
            stream @ ResponseBody::Stream(_) => {
                Response {
                    url: url.clone(),
                    status,
                    headers: headers.clone(),
                    body: stream,
                }
                .bytes()
                .await?
            }
        };

        let copy = Response::new(url.clone(), status, headers.clone(), body.clone());
        Ok((Response::new(url, status, headers, body), copy))
    }
}

/// Something that can perform a network fetch.
///
/// A non-2xx status is a successful fetch; only transport failures are errors.
pub trait Network: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

/// Configuration for [`HttpNetwork`].
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
            user_agent: format!("NutriSync-Gateway/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed [`Network`].
pub struct HttpNetwork {
    client: Client,
    config: LoaderConfig,
}

impl HttpNetwork {
    /// Create a new HTTP network.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpNetwork initialized");

        Ok(Self { client, config })
    }

    async fn send(&self, request: Request) -> Result<Response, NetError> {
        debug!(
            id = request.id.raw(),
            url = %request.url,
            method = %request.method,
            "Fetching from network"
        );

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(timeout);

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
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

        Ok(Response::new(url, status, headers, body))
    }
}

impl Network for HttpNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = Request::get(url("https://example.com"))
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(10));

        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_request() {
        let request = Request::navigate(url("https://example.com/"));
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);
    }

    #[test]
    fn test_parse_rejects_bad_url() {
        assert!(matches!(
            Request::parse("not a url"),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let response = Response::new(url("https://example.com/"), StatusCode::OK, headers, Bytes::new());
        assert_eq!(response.content_type().unwrap().subtype(), mime::JSON);
    }

    #[tokio::test]
    async fn test_tee_full_body() {
        let response = Response::new(
            url("https://example.com/a"),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"hello"),
        );

        let (a, b) = response.tee().await.unwrap();
        assert_eq!(a.status, b.status);
        assert_eq!(a.bytes().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_tee_streaming_body() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"{\"score\":"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"0.9}"))).await.unwrap();
        drop(tx);

        let response = Response::streaming(url("https://example.com/s"), StatusCode::OK, HeaderMap::new(), rx);
        let (a, b) = response.tee().await.unwrap();

        let value: serde_json::Value = a.json().await.unwrap();
        assert_eq!(value["score"], 0.9);
        assert_eq!(b.text().await.unwrap(), "{\"score\":0.9}");
    }

    #[tokio::test]
    async fn test_tee_waits_for_end_of_stream() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"head "))).await.unwrap();

        let response = Response::streaming(url("https://example.com/s"), StatusCode::OK, HeaderMap::new(), rx);
        let mut tee = Box::pin(response.tee());
        assert!(futures::poll!(&mut tee).is_pending());

        tx.send(Ok(Bytes::from_static(b"tail"))).await.unwrap();
        drop(tx);
        let (a, b) = tee.await.unwrap();
        assert_eq!(a.text().await.unwrap(), "head tail");
        assert_eq!(b.text().await.unwrap(), "head tail");
    }

    #[tokio::test]
    async fn test_tee_stream_error_propagates() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(Err(NetError::Body("reset".into()))).await.unwrap();
        drop(tx);

        let response = Response::streaming(url("https://example.com/s"), StatusCode::OK, HeaderMap::new(), rx);
        assert!(matches!(response.tee().await, Err(NetError::Body(_))));
    }

    #[tokio::test]
    async fn test_http_network_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"name\":\"NutriSync\"}"))
            .mount(&server)
            .await;

        let network = HttpNetwork::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/manifest.json", server.uri())).unwrap();
        let response = network.fetch(request).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.text().await.unwrap(), "{\"name\":\"NutriSync\"}");
    }

    #[tokio::test]
    async fn test_http_network_non_success_is_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let network = HttpNetwork::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = network.fetch(request).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_http_network_connection_refused() {
        let network = HttpNetwork::new(LoaderConfig::default()).unwrap();
        // Port 9 (discard) is not listening on test hosts.
        let request = Request::parse("http://127.0.0.1:9/api/health").unwrap();
        assert!(network.fetch(request).await.is_err());
    }
}
