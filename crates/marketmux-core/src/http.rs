//! HTTP transport abstraction for provider adapters.
//!
//! Adapters never talk to `reqwest` directly; they go through the
//! [`HttpClient`] trait so tests can substitute a scripted transport and
//! assert on outbound traffic (including its absence, for cache-hit paths).
//!
//! Every request carries an explicit timeout. Upstream calls with no
//! deadline are the most likely source of request-path stalls, so the
//! default is deliberately short.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default per-request deadline in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Outgoing GET request envelope. All upstream market-data endpoints used by
/// this engine are plain GETs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// HTTP response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok_json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    message: String,
    retryable: bool,
}

impl HttpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// Adapter transport contract.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Production HTTP client backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    /// Create a new client with default configuration.
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent("marketmux/0.1.0")
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    /// Create a client wrapping a custom `reqwest::Client`.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .get(&request.url)
                .timeout(Duration::from_millis(request.timeout_ms));
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            let response = builder.send().await.map_err(|error| {
                if error.is_timeout() {
                    HttpError::new(format!("request timed out: {error}"))
                } else if error.is_connect() {
                    HttpError::new(format!("connection failed: {error}"))
                } else {
                    HttpError::non_retryable(format!("request failed: {error}"))
                }
            })?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|error| HttpError::new(format!("failed to read body: {error}")))?;

            Ok(HttpResponse { status, body })
        })
    }
}

/// Deterministic transport for tests: canned responses matched by URL
/// substring, with every outbound URL recorded.
#[derive(Clone, Default)]
pub struct ScriptedHttpClient {
    inner: Arc<Mutex<ScriptedInner>>,
}

#[derive(Default)]
struct ScriptedInner {
    routes: Vec<ScriptedRoute>,
    calls: Vec<String>,
}

struct ScriptedRoute {
    url_contains: String,
    responses: Vec<Result<HttpResponse, HttpError>>,
    served: usize,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to any URL containing `url_contains`. Multiple responses for
    /// the same route are served in order, repeating the last one.
    pub fn route(&self, url_contains: impl Into<String>, response: HttpResponse) -> &Self {
        self.push_route(url_contains.into(), Ok(response));
        self
    }

    /// Fail any URL containing `url_contains` with a transport error.
    pub fn route_error(&self, url_contains: impl Into<String>, error: HttpError) -> &Self {
        self.push_route(url_contains.into(), Err(error));
        self
    }

    fn push_route(&self, url_contains: String, response: Result<HttpResponse, HttpError>) {
        let mut inner = self.inner.lock().expect("scripted client lock poisoned");
        if let Some(route) = inner
            .routes
            .iter_mut()
            .find(|route| route.url_contains == url_contains)
        {
            route.responses.push(response);
        } else {
            inner.routes.push(ScriptedRoute {
                url_contains,
                responses: vec![response],
                served: 0,
            });
        }
    }

    /// Every URL requested through this client, in order.
    pub fn calls(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("scripted client lock poisoned")
            .calls
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner
            .lock()
            .expect("scripted client lock poisoned")
            .calls
            .len()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        let result = {
            let mut inner = self.inner.lock().expect("scripted client lock poisoned");
            inner.calls.push(request.url.clone());

            match inner
                .routes
                .iter_mut()
                .find(|route| request.url.contains(route.url_contains.as_str()))
            {
                Some(route) => {
                    let index = route.served.min(route.responses.len() - 1);
                    route.served += 1;
                    route.responses[index].clone()
                }
                None => Err(HttpError::non_retryable(format!(
                    "no scripted response for url '{}'",
                    request.url
                ))),
            }
        };

        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_serves_routes_in_order_and_records_calls() {
        let client = ScriptedHttpClient::new();
        client.route("/quote", HttpResponse::ok_json(r#"{"first":true}"#));
        client.route("/quote", HttpResponse::with_status(500, "boom"));

        let first = client
            .execute(HttpRequest::get("https://example.test/quote?symbol=AAPL"))
            .await
            .expect("scripted response");
        assert!(first.is_success());

        let second = client
            .execute(HttpRequest::get("https://example.test/quote?symbol=AAPL"))
            .await
            .expect("scripted response");
        assert_eq!(second.status, 500);

        // Last response repeats once the queue is drained.
        let third = client
            .execute(HttpRequest::get("https://example.test/quote?symbol=AAPL"))
            .await
            .expect("scripted response");
        assert_eq!(third.status, 500);

        assert_eq!(client.call_count(), 3);
        assert!(client.calls()[0].contains("symbol=AAPL"));
    }

    #[tokio::test]
    async fn scripted_client_errors_on_unmatched_url() {
        let client = ScriptedHttpClient::new();
        let err = client
            .execute(HttpRequest::get("https://example.test/unknown"))
            .await
            .expect_err("must fail");
        assert!(!err.retryable());
    }

    #[test]
    fn request_builder_sets_timeout_and_headers() {
        let request = HttpRequest::get("https://example.test")
            .with_header("X-Token", "abc")
            .with_timeout_ms(1_000);
        assert_eq!(request.timeout_ms, 1_000);
        assert_eq!(request.headers.get("x-token").map(String::as_str), Some("abc"));
    }
}
