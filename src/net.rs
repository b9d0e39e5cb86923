//! Shared HTTP transport.
//!
//! Every adapter and the verifier go through [`HttpClient`]: automatic
//! retries on transport errors, 429 and 5xx (except 501), `Retry-After`
//! support, exponential backoff with jitter, default headers, an optional
//! session cookie jar, and a hard cap on response body size.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use http::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use rand::Rng;
use reqwest::{cookie::Jar, Client, Method, Response, StatusCode, Url};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-request wall clock bound.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Largest single resource the client will read, bytes. 500 MiB.
pub const DEFAULT_MAX_ARTIFACT_SIZE: u64 = 500 * 1024 * 1024;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("response from {url} exceeded the {limit}-byte cap")]
    TooLarge { url: String, limit: u64 },

    #[error("scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl HttpError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::FORBIDDEN) | Some(StatusCode::UNAUTHORIZED)
        )
    }

    pub fn is_too_large(&self) -> bool {
        matches!(self, HttpError::TooLarge { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientBuilder {
    default_headers: HeaderMap,
    cookies: Vec<(Url, String)>,
    timeout: Duration,
    max_retries: u32,
    max_body: u64,
    ignore_proxy: bool,
    user_agent: String,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            default_headers: HeaderMap::new(),
            cookies: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            max_body: DEFAULT_MAX_ARTIFACT_SIZE,
            ignore_proxy: false,
            user_agent: concat!("cormorant/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injected on every request unless the request sets the same header.
    pub fn default_header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Pre-seed the cookie jar, e.g. with a platform web-session cookie.
    pub fn cookie(mut self, url: Url, cookie: impl Into<String>) -> Self {
        self.cookies.push((url, cookie.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Cap on any single response body, bytes.
    pub fn max_body(mut self, max_body: u64) -> Self {
        self.max_body = max_body;
        self
    }

    /// Drop `HTTP_PROXY`/`HTTPS_PROXY` inheritance for this client.
    pub fn ignore_proxy(mut self, ignore_proxy: bool) -> Self {
        self.ignore_proxy = ignore_proxy;
        self
    }

    pub fn build(self, cancel: CancellationToken) -> Result<HttpClient, HttpError> {
        let jar = Arc::new(Jar::default());
        for (url, cookie) in &self.cookies {
            jar.add_cookie_str(cookie, url);
        }
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(self.default_headers)
            .cookie_provider(jar)
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(10));
        if self.ignore_proxy {
            builder = builder.no_proxy();
        }
        Ok(HttpClient {
            client: builder.build()?,
            max_retries: self.max_retries,
            max_body: self.max_body,
            cancel,
        })
    }
}

/// Retrying client shared by every adapter. Safe for concurrent use.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    max_retries: u32,
    max_body: u64,
    cancel: CancellationToken,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    pub fn max_body(&self) -> u64 {
        self.max_body
    }

    /// GET returning the raw response. Per-request headers take precedence
    /// over the client defaults.
    pub async fn get(
        &self,
        url: Url,
        headers: Option<HeaderMap>,
    ) -> Result<Response, HttpError> {
        self.execute(Method::GET, url, headers).await
    }

    /// GET a JSON page, returning the decoded body and response headers (the
    /// headers carry pagination state on some platforms).
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<(T, HeaderMap), HttpError> {
        let response = self.get(url, None).await?;
        let headers = response.headers().clone();
        let body = response.json::<T>().await?;
        Ok((body, headers))
    }

    /// GET a raw resource, streaming the body and failing once it exceeds
    /// the configured cap.
    pub async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, HttpError> {
        self.get_bytes_with_headers(url, None).await
    }

    pub async fn get_bytes_with_headers(
        &self,
        url: Url,
        headers: Option<HeaderMap>,
    ) -> Result<Vec<u8>, HttpError> {
        let response = self.get(url.clone(), headers).await?;
        if let Some(declared) = response.content_length() {
            if declared > self.max_body {
                return Err(HttpError::TooLarge { url: url.to_string(), limit: self.max_body });
            }
        }
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Err(HttpError::Cancelled);
            }
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > self.max_body {
                return Err(HttpError::TooLarge { url: url.to_string(), limit: self.max_body });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// POST with a JSON body; used by the verifier probes.
    pub async fn post_json(
        &self,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<Response, HttpError> {
        let mut attempt = 0u32;
        loop {
            let request = self.client.request(Method::POST, url.clone()).json(body);
            match self.try_once(request.build()?, &url, &mut attempt).await? {
                Some(response) => return Ok(response),
                None => continue,
            }
        }
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        headers: Option<HeaderMap>,
    ) -> Result<Response, HttpError> {
        let mut attempt = 0u32;
        loop {
            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(headers) = &headers {
                request = request.headers(headers.clone());
            }
            match self.try_once(request.build()?, &url, &mut attempt).await? {
                Some(response) => return Ok(response),
                None => continue,
            }
        }
    }

    /// One attempt of the retry loop. `Ok(Some(..))` is a final success,
    /// `Ok(None)` means "sleep already done, go again".
    async fn try_once(
        &self,
        request: reqwest::Request,
        url: &Url,
        attempt: &mut u32,
    ) -> Result<Option<Response>, HttpError> {
        if self.cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Err(HttpError::Cancelled),
            outcome = self.client.execute(request) => outcome,
        };
        match outcome {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(Some(response));
                }
                if retryable_status(status) && *attempt < self.max_retries {
                    let delay = retry_after(response.headers())
                        .unwrap_or_else(|| backoff_delay(*attempt));
                    debug!(%url, %status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    self.sleep(delay).await?;
                    *attempt += 1;
                    return Ok(None);
                }
                Err(HttpError::Status { url: url.to_string(), status })
            }
            Err(e) if transient(&e) && *attempt < self.max_retries => {
                let delay = backoff_delay(*attempt);
                debug!(%url, error = %e, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                self.sleep(delay).await?;
                *attempt += 1;
                Ok(None)
            }
            Err(e) if transient(&e) => Err(HttpError::Exhausted {
                url: url.to_string(),
                attempts: *attempt + 1,
                source: e,
            }),
            Err(e) => Err(HttpError::Transport(e)),
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<(), HttpError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HttpError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

fn transient(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Parse the delta-seconds form of `Retry-After`. HTTP-date values fall back
/// to the computed backoff.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds.min(120)))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .checked_mul(1u32 << attempt.min(16))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    let jitter = rand::rng().random_range(0.0..=0.5);
    exp.mul_f64(1.0 + jitter)
}

/// Validate a user-supplied base URL: scheme and host are required.
pub fn validate_base_url(url: &Url) -> Result<(), String> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!("unsupported URL scheme {:?}", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err("URL has no host".to_owned());
    }
    Ok(())
}

/// Classify a fetch failure for a single unit of work: `true` means the
/// caller should skip the unit and continue, `false` means abort.
pub fn skippable(error: &HttpError) -> bool {
    !matches!(error, HttpError::Cancelled)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn client(max_retries: u32) -> HttpClient {
        HttpClient::builder()
            .max_retries(max_retries)
            .build(CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(0) >= BACKOFF_BASE);
        assert!(backoff_delay(1) >= backoff_delay(0).min(BACKOFF_CAP));
        assert!(backoff_delay(30) <= BACKOFF_CAP.mul_f64(1.5));
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2025 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn not_implemented_is_not_retryable() {
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!retryable_status(StatusCode::NOT_IMPLEMENTED));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn base_url_validation() {
        assert!(validate_base_url(&Url::parse("https://gitlab.example.com").unwrap()).is_ok());
        assert!(validate_base_url(&Url::parse("ftp://gitlab.example.com").unwrap()).is_err());
        assert!(validate_base_url(&Url::parse("unix:/run/sock").unwrap()).is_err());
    }

    #[tokio::test]
    async fn retries_until_success_on_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/flaky", server.uri())).unwrap();
        let body = client(3).get_bytes(url).await.unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/down", server.uri())).unwrap();
        let err = client(1).get_bytes(url).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn status_501_surfaces_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nope"))
            .respond_with(ResponseTemplate::new(501))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/nope", server.uri())).unwrap();
        let err = client(3).get_bytes(url).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NOT_IMPLEMENTED));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let http = HttpClient::builder()
            .max_body(1024)
            .build(CancellationToken::new())
            .unwrap();
        let url = Url::parse(&format!("{}/big", server.uri())).unwrap();
        assert!(http.get_bytes(url).await.unwrap_err().is_too_large());
    }

    #[tokio::test]
    async fn body_of_exactly_the_cap_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/edge"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1024]))
            .mount(&server)
            .await;

        let http = HttpClient::builder()
            .max_body(1024)
            .build(CancellationToken::new())
            .unwrap();
        let url = Url::parse(&format!("{}/edge", server.uri())).unwrap();
        assert_eq!(http.get_bytes(url).await.unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn cancelled_client_refuses_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let http = HttpClient::builder().build(cancel).unwrap();
        let err = http.get_bytes(Url::parse("http://127.0.0.1:9/x").unwrap()).await.unwrap_err();
        assert!(matches!(err, HttpError::Cancelled));
    }
}
