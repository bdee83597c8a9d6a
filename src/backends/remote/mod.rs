//! Remote asynchronous scanning backend.
//!
//! A scan is a small state machine:
//!
//! ```text
//! Initiating --POST--> Polling --GET every poll_interval--> Completed
//!                                                        \-> Failed
//!                                                        \-> TimedOut
//! ```
//!
//! The `completed` status response already carries the vulnerability
//! counts, so there is no separate retrieval step. The whole exchange runs
//! under the per-scan timeout resolved from the registry override or the
//! default; a timeout reports how many polls were made.

mod client;

pub use client::{
    sanitize_token, RemoteApiClient, RemoteScanPayload, RemoteScanState, RemoteScanStatus,
    ScanStartRequest, MAX_ATTEMPTS, SCAN_PATH,
};

use crate::config::BackendTimeouts;
use crate::core::result::duration_serde;
use crate::core::{
    RegistryCredentials, ScanBackend, ScanError, ScanFailure, ScanRequest, ScanResult, ScanStatus,
};
use client::BACKEND_TYPE;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn empty_token() -> SecretString {
    SecretString::new(String::new().into())
}

/// Remote backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    /// Base URL of the scanning API.
    pub api_url: String,

    /// Bearer token (kept secret).
    #[serde(skip, default = "empty_token")]
    pub token: SecretString,

    /// Project the scans are filed under.
    pub project_id: String,

    /// Whether TLS certificates are verified.
    pub verify_tls: bool,

    /// Interval between status polls.
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,

    /// Timeout for a single HTTP request.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Base of the HTTP retry backoff.
    #[serde(with = "duration_serde")]
    pub retry_base: Duration,

    /// Per-scan timeouts.
    pub timeouts: BackendTimeouts,

    /// Credentials forwarded to the service, keyed by registry name.
    #[serde(skip)]
    pub credentials: HashMap<String, RegistryCredentials>,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            token: empty_token(),
            project_id: String::new(),
            verify_tls: true,
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            timeouts: BackendTimeouts::new(Duration::from_secs(600)),
            credentials: HashMap::new(),
        }
    }
}

impl RemoteBackendConfig {
    /// Creates a configuration for the given API, token and project.
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            token: SecretString::new(token.into().into()),
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Enables or disables TLS certificate verification.
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the default per-scan timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.default = timeout;
        self
    }

    /// Sets a registry-specific timeout.
    pub fn with_registry_timeout(mut self, registry: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts = self.timeouts.with_override(registry, timeout);
        self
    }

    /// Sets the base of the HTTP retry backoff.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Adds credentials for a registry.
    pub fn with_credentials(
        mut self,
        registry: impl Into<String>,
        credentials: RegistryCredentials,
    ) -> Self {
        self.credentials.insert(registry.into(), credentials);
        self
    }
}

/// Scans through a remote asynchronous scanning API.
#[derive(Debug)]
pub struct RemoteBackend {
    config: RemoteBackendConfig,
    client: RemoteApiClient,
}

impl RemoteBackend {
    /// Creates a new remote backend.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: RemoteBackendConfig) -> Result<Self, ScanError> {
        let client = RemoteApiClient::new(
            config.api_url.clone(),
            config.token.clone(),
            config.verify_tls,
            config.request_timeout,
        )?
        .with_retry_base(config.retry_base);
        Ok(Self { config, client })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RemoteBackendConfig {
        &self.config
    }

    fn poll_timeout(
        &self,
        result: ScanResult,
        scan_id: &str,
        attempts: u32,
        started: Instant,
    ) -> ScanFailure {
        let elapsed = started.elapsed();
        tracing::warn!(
            scan_id = %scan_id,
            image = %result.image_ref,
            attempts = attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Remote scan timed out"
        );
        result
            .with_detail("poll_attempts", serde_json::json!(attempts))
            .fail(
                ScanStatus::Timeout,
                ScanError::PollTimeout {
                    scan_id: scan_id.to_string(),
                    attempts,
                    elapsed,
                },
            )
    }
}

#[async_trait]
impl ScanBackend for RemoteBackend {
    fn backend_type(&self) -> &str {
        BACKEND_TYPE
    }

    async fn scan(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanResult, ScanFailure> {
        let mut result = ScanResult::start(request, BACKEND_TYPE);
        let timeout = self.config.timeouts.for_registry(&request.registry);
        let started = Instant::now();
        let deadline = started + timeout;

        let body = ScanStartRequest::new(
            &request.image_ref,
            &self.config.project_id,
            self.config.credentials.get(&request.registry),
        );

        let initiated = tokio::select! {
            initiated = self.client.initiate_scan(&body, &cancel) => initiated,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(result.fail(ScanStatus::Timeout, ScanError::timeout(BACKEND_TYPE, timeout)));
            }
        };
        let scan_id = match initiated {
            Ok(scan_id) => scan_id,
            Err(e) => {
                tracing::warn!(
                    request_id = %request.id,
                    image = %request.image_ref,
                    error = %e,
                    "Failed to start remote scan"
                );
                return Err(result.fail(ScanStatus::Failed, e));
            }
        };

        tracing::info!(
            request_id = %request.id,
            image = %request.image_ref,
            scan_id = %scan_id,
            "Remote scan started"
        );
        result.remote_scan_id = Some(scan_id.clone());

        let mut attempts = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.poll_timeout(result, &scan_id, attempts, started));
                }
                _ = cancel.cancelled() => {
                    return Err(result.fail(ScanStatus::Failed, ScanError::Cancelled));
                }
            }

            attempts += 1;
            let polled = tokio::select! {
                polled = self.client.scan_status(&scan_id, &cancel) => polled,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.poll_timeout(result, &scan_id, attempts, started));
                }
            };
            let status = match polled {
                Ok(status) => status,
                Err(e) => return Err(result.fail(ScanStatus::Failed, e)),
            };
            result.protocol_status = Some(status.status.as_str().to_string());

            match status.status {
                RemoteScanState::Completed => {
                    result.vulnerabilities = status.result.map(|payload| payload.vulnerabilities);
                    tracing::info!(
                        request_id = %request.id,
                        scan_id = %scan_id,
                        attempts = attempts,
                        findings = result.vulnerabilities.map(|v| v.total()).unwrap_or(0),
                        "Remote scan completed"
                    );
                    return Ok(result
                        .with_detail("poll_attempts", serde_json::json!(attempts))
                        .finish(ScanStatus::Success));
                }
                RemoteScanState::Failed => {
                    let message = status
                        .error
                        .unwrap_or_else(|| "no error message reported".to_string());
                    return Err(result.fail(
                        ScanStatus::Failed,
                        ScanError::RemoteScanFailed { scan_id, message },
                    ));
                }
                RemoteScanState::Unknown => {
                    tracing::warn!(scan_id = %scan_id, "Unknown remote scan state; still polling");
                }
                RemoteScanState::Pending | RemoteScanState::Running => {
                    tracing::debug!(
                        scan_id = %scan_id,
                        state = status.status.as_str(),
                        attempts = attempts,
                        "Remote scan in progress"
                    );
                }
            }
        }
    }

    fn validate_config(&self) -> Result<(), ScanError> {
        let url = self.config.api_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ScanError::configuration(
                "remote api_url must be an http:// or https:// URL",
            ));
        }
        if self.config.token.expose_secret().is_empty() {
            return Err(ScanError::configuration("remote API token must not be empty"));
        }
        if self.config.project_id.trim().is_empty() {
            return Err(ScanError::configuration("remote project_id must not be empty"));
        }
        if self.config.poll_interval.is_zero() {
            return Err(ScanError::configuration(
                "remote poll_interval must be greater than zero",
            ));
        }
        self.config.timeouts.validate(BACKEND_TYPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const TOKEN: &str = "test-token-1234";

    /// One scripted reply of the mock server.
    #[derive(Clone)]
    enum Reply {
        Status(u16),
        RateLimited(u64),
        Started(&'static str),
        State(serde_json::Value),
    }

    #[derive(Default)]
    struct MockApi {
        starts: Mutex<VecDeque<Reply>>,
        polls: Mutex<VecDeque<Reply>>,
        last_poll: Mutex<Option<Reply>>,
        posts: AtomicUsize,
        gets: AtomicUsize,
        polled_ids: Mutex<Vec<String>>,
    }

    impl MockApi {
        fn new(starts: Vec<Reply>, polls: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                starts: Mutex::new(starts.into()),
                polls: Mutex::new(polls.into()),
                ..Default::default()
            })
        }
    }

    fn render(reply: Reply) -> Response {
        match reply {
            Reply::Status(code) => {
                (StatusCode::from_u16(code).unwrap(), "scripted error").into_response()
            }
            Reply::RateLimited(secs) => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
                "slow down",
            )
                .into_response(),
            Reply::Started(id) => (StatusCode::CREATED, Json(json!({ "scan_id": id }))).into_response(),
            Reply::State(body) => (StatusCode::OK, Json(body)).into_response(),
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {}", TOKEN))
            .unwrap_or(false)
    }

    async fn start_scan(
        State(api): State<Arc<MockApi>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Response {
        api.posts.fetch_add(1, Ordering::SeqCst);
        if !authorized(&headers) || body.get("image").is_none() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let reply = api
            .starts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Started("scan-1"));
        render(reply)
    }

    async fn scan_status(
        State(api): State<Arc<MockApi>>,
        Path(scan_id): Path<String>,
        headers: HeaderMap,
    ) -> Response {
        api.gets.fetch_add(1, Ordering::SeqCst);
        api.polled_ids.lock().unwrap().push(scan_id);
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let next = api.polls.lock().unwrap().pop_front();
        let reply = match next {
            Some(reply) => {
                *api.last_poll.lock().unwrap() = Some(reply.clone());
                reply
            }
            None => api
                .last_poll
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Reply::State(json!({ "status": "running" }))),
        };
        render(reply)
    }

    async fn serve(api: Arc<MockApi>) -> String {
        let app = Router::new()
            .route(SCAN_PATH, post(start_scan))
            .route(&format!("{}/{{scan_id}}", SCAN_PATH), get(scan_status))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn backend(url: &str, timeout: Duration) -> RemoteBackend {
        RemoteBackend::new(
            RemoteBackendConfig::new(url, TOKEN, "proj-1")
                .with_poll_interval(Duration::from_millis(100))
                .with_retry_base(Duration::from_millis(10))
                .with_timeout(timeout),
        )
        .unwrap()
    }

    fn request() -> ScanRequest {
        ScanRequest::new("registry.local/app:1.0", "local")
    }

    #[tokio::test]
    async fn test_running_then_completed() {
        let api = MockApi::new(
            vec![],
            vec![
                Reply::State(json!({ "status": "running" })),
                Reply::State(json!({ "status": "running" })),
                Reply::State(json!({
                    "status": "completed",
                    "result": { "vulnerabilities": { "critical": 1, "high": 2, "medium": 0, "low": 5 } }
                })),
            ],
        );
        let url = serve(Arc::clone(&api)).await;

        let result = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, ScanStatus::Success);
        assert_eq!(result.remote_scan_id.as_deref(), Some("scan-1"));
        assert_eq!(result.protocol_status.as_deref(), Some("completed"));
        assert_eq!(result.vulnerabilities.unwrap().total(), 8);
        assert_eq!(api.posts.load(Ordering::SeqCst), 1);
        assert!(api.gets.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_initiate_retries_server_errors() {
        let api = MockApi::new(
            vec![Reply::Status(503), Reply::Status(503), Reply::Started("scan-7")],
            vec![Reply::State(json!({ "status": "completed" }))],
        );
        let url = serve(Arc::clone(&api)).await;

        let result = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.remote_scan_id.as_deref(), Some("scan-7"));
        assert_eq!(api.posts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_initiate_gives_up_after_three_attempts() {
        let api = MockApi::new(
            vec![Reply::Status(502), Reply::Status(502), Reply::Status(502)],
            vec![],
        );
        let url = serve(Arc::clone(&api)).await;

        let failure = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            ScanError::UnexpectedStatus { status: 502, .. }
        ));
        assert_eq!(api.posts.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let api = MockApi::new(vec![Reply::Status(401)], vec![]);
        let url = serve(Arc::clone(&api)).await;

        let failure = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ScanError::AuthenticationFailed { .. }));
        assert_eq!(failure.status(), ScanStatus::Failed);
        assert_eq!(api.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_not_found_is_not_retried() {
        let api = MockApi::new(vec![], vec![Reply::Status(404)]);
        let url = serve(Arc::clone(&api)).await;

        let failure = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            ScanError::UnexpectedStatus { status: 404, .. }
        ));
        assert_eq!(failure.status(), ScanStatus::Failed);
        assert_eq!(api.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scan_id_with_reserved_characters() {
        let api = MockApi::new(
            vec![Reply::Started("a/b?c")],
            vec![Reply::State(json!({ "status": "completed" }))],
        );
        let url = serve(Arc::clone(&api)).await;

        let result = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.remote_scan_id.as_deref(), Some("a/b?c"));
        assert_eq!(*api.polled_ids.lock().unwrap(), vec!["a/b?c".to_string()]);
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let api = MockApi::new(
            vec![Reply::RateLimited(1), Reply::Started("scan-9")],
            vec![Reply::State(json!({ "status": "completed" }))],
        );
        let url = serve(Arc::clone(&api)).await;

        let started = std::time::Instant::now();
        let result = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        // The 10ms computed backoff was overridden by the one-second header.
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(api.posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_timeout_reports_attempts() {
        let api = MockApi::new(vec![], vec![Reply::State(json!({ "status": "running" }))]);
        let url = serve(Arc::clone(&api)).await;

        let failure = backend(&url, Duration::from_secs(1))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.status(), ScanStatus::Timeout);
        match failure.error {
            ScanError::PollTimeout { attempts, .. } => assert!(attempts >= 5, "attempts = {}", attempts),
            other => panic!("unexpected error: {}", other),
        }
        assert!(failure.result.details.contains_key("poll_attempts"));
    }

    #[tokio::test]
    async fn test_remote_failure_state() {
        let api = MockApi::new(
            vec![],
            vec![Reply::State(json!({ "status": "failed", "error": "manifest unknown" }))],
        );
        let url = serve(Arc::clone(&api)).await;

        let failure = backend(&url, Duration::from_secs(10))
            .scan(&request(), CancellationToken::new())
            .await
            .unwrap_err();

        match failure.error {
            ScanError::RemoteScanFailed { scan_id, message } => {
                assert_eq!(scan_id, "scan-1");
                assert_eq!(message, "manifest unknown");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_polling() {
        let api = MockApi::new(vec![], vec![Reply::State(json!({ "status": "pending" }))]);
        let url = serve(Arc::clone(&api)).await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        let failure = backend(&url, Duration::from_secs(10))
            .scan(&request(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ScanError::Cancelled));
    }

    #[test]
    fn test_validate_config() {
        let valid = RemoteBackend::new(RemoteBackendConfig::new(
            "https://scanner.example.com",
            TOKEN,
            "proj-1",
        ))
        .unwrap();
        assert!(valid.validate_config().is_ok());

        let no_token = RemoteBackend::new(RemoteBackendConfig::new(
            "https://scanner.example.com",
            "",
            "proj-1",
        ))
        .unwrap();
        assert!(no_token.validate_config().is_err());

        let bad_url =
            RemoteBackend::new(RemoteBackendConfig::new("scanner.example.com", TOKEN, "proj-1"))
                .unwrap();
        assert!(bad_url.validate_config().is_err());

        let no_project =
            RemoteBackend::new(RemoteBackendConfig::new("https://scanner.example.com", TOKEN, ""))
                .unwrap();
        assert!(no_project.validate_config().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = RemoteBackendConfig::default();
        assert!(config.verify_tls);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.timeouts.default, Duration::from_secs(600));
    }
}
