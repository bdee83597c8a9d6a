//! HTTP client for the remote scanning API.
//!
//! Every call goes through [`RemoteApiClient::send_with_retry`]: up to three
//! attempts with `base * 2^(attempt-1)` between them, for transport failures
//! and statuses 429, 500, 502, 503 and 504. A 429 carrying `Retry-After`
//! waits the number of seconds the server asked for instead. Any other
//! status is handed back on the first attempt.

use crate::core::{RegistryCredentials, ScanError, VulnerabilityCounts};

use reqwest::{RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) const BACKEND_TYPE: &str = "remote";

/// Path of the scan-start endpoint, relative to the API URL.
pub const SCAN_PATH: &str = "/api/scanning/v1/registry/scan";

/// Attempts made per HTTP call.
pub const MAX_ATTEMPTS: u32 = 3;

/// Statuses worth another attempt.
pub(crate) const RETRIABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Returns a form of `token` that is safe to log.
///
/// Keeps the first two and last two characters. Tokens of four characters
/// or fewer are masked entirely.
pub fn sanitize_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Returns true if `status` is worth another attempt.
pub(crate) fn is_retriable_status(status: u16) -> bool {
    RETRIABLE_STATUSES.contains(&status)
}

/// Registry credentials as sent to the remote service.
#[derive(Serialize)]
pub(crate) struct WireCredentials<'a> {
    username: &'a str,
    password: &'a str,
}

/// Body of the scan-start request.
#[derive(Serialize)]
pub struct ScanStartRequest<'a> {
    image: &'a str,
    project_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    registry_credentials: Option<WireCredentials<'a>>,
}

impl<'a> ScanStartRequest<'a> {
    /// Creates a start request, with credentials when the registry has them.
    pub fn new(
        image: &'a str,
        project_id: &'a str,
        credentials: Option<&'a RegistryCredentials>,
    ) -> Self {
        Self {
            image,
            project_id,
            registry_credentials: credentials.map(|c| WireCredentials {
                username: &c.username,
                password: c.password.expose_secret(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScanStartResponse {
    scan_id: String,
}

/// State reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteScanState {
    /// Accepted, not started.
    Pending,
    /// In progress.
    Running,
    /// Finished; the result is in the same response.
    Completed,
    /// Finished with an error.
    Failed,
    /// A state this client does not know; treated as in progress.
    #[serde(other)]
    Unknown,
}

impl RemoteScanState {
    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Result payload carried by a `completed` status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteScanPayload {
    /// Findings by severity.
    #[serde(default)]
    pub vulnerabilities: VulnerabilityCounts,
}

/// Response of the status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteScanStatus {
    /// Current state.
    pub status: RemoteScanState,
    /// Error message, for `failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Result, for `completed`.
    #[serde(default)]
    pub result: Option<RemoteScanPayload>,
}

/// Client for the remote scanning API.
pub struct RemoteApiClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    retry_base: Duration,
}

impl RemoteApiClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        token: SecretString,
        verify_tls: bool,
        request_timeout: Duration,
    ) -> Result<Self, ScanError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        if !verify_tls {
            tracing::warn!(
                api_url = %base_url,
                "TLS certificate verification is DISABLED for the remote scanning API"
            );
        }

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| ScanError::configuration(format!("failed to build HTTP client: {}", e)))?;

        tracing::debug!(
            api_url = %base_url,
            token = %sanitize_token(token.expose_secret()),
            verify_tls = verify_tls,
            "Remote API client configured"
        );

        Ok(Self {
            http,
            base_url,
            token,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Sets the base of the exponential backoff between attempts.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Returns the absolute URL for `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Returns the status URL for `scan_id`.
    ///
    /// The id is pushed as a single escaped path segment, so a server value
    /// holding `/`, `?` or `#` cannot change the path or add a query.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` if the API URL cannot carry a path.
    pub fn status_url(&self, scan_id: &str) -> Result<reqwest::Url, ScanError> {
        let endpoint = self.endpoint(SCAN_PATH);
        let mut url = reqwest::Url::parse(&endpoint).map_err(|e| {
            ScanError::configuration(format!("invalid remote API URL '{}': {}", endpoint, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                ScanError::configuration(format!("remote API URL '{}' cannot carry a path", endpoint))
            })?
            .push(scan_id);
        Ok(url)
    }

    /// Returns the wait before the attempt after `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Sends a request, retrying transient failures.
    ///
    /// `build` is called once per attempt; the bearer token is added here.
    /// Returns the last response received, whatever its status.
    ///
    /// # Errors
    ///
    /// * `ScanError::ConnectionFailed` - every attempt failed at transport level.
    /// * `ScanError::Cancelled` - `cancel` fired.
    pub async fn send_with_retry<F>(
        &self,
        operation: &str,
        build: F,
        cancel: &CancellationToken,
    ) -> Result<Response, ScanError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let request = build(&self.http).bearer_auth(self.token.expose_secret());

            let sent = tokio::select! {
                sent = request.send() => sent,
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            };

            let wait = match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !is_retriable_status(status) || attempt >= MAX_ATTEMPTS {
                        return Ok(response);
                    }
                    let wait = if status == 429 {
                        retry_after(&response).unwrap_or_else(|| self.backoff(attempt))
                    } else {
                        self.backoff(attempt)
                    };
                    tracing::warn!(
                        operation = operation,
                        status = status,
                        attempt = attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Remote API returned retriable status"
                    );
                    wait
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ScanError::connection_failed(
                            BACKEND_TYPE,
                            format!("{} failed after {} attempts: {}", operation, attempt, e),
                        ));
                    }
                    let wait = self.backoff(attempt);
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Remote API request failed"
                    );
                    wait
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            }
            attempt += 1;
        }
    }

    /// Starts a scan and returns the identifier the service assigned.
    pub async fn initiate_scan(
        &self,
        body: &ScanStartRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ScanError> {
        let url = self.endpoint(SCAN_PATH);
        let response = self
            .send_with_retry("initiate scan", |http| http.post(&url).json(body), cancel)
            .await?;

        let status = response.status().as_u16();
        if status != 200 && status != 201 {
            return Err(status_error(response).await);
        }

        let parsed: ScanStartResponse = response
            .json()
            .await
            .map_err(|e| ScanError::malformed(BACKEND_TYPE, format!("scan start response: {}", e)))?;
        if parsed.scan_id.is_empty() {
            return Err(ScanError::malformed(BACKEND_TYPE, "scan start response has an empty scan_id"));
        }
        Ok(parsed.scan_id)
    }

    /// Fetches the status of a scan.
    pub async fn scan_status(
        &self,
        scan_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteScanStatus, ScanError> {
        let url = self.status_url(scan_id)?;
        let response = self
            .send_with_retry("poll scan status", |http| http.get(url.clone()), cancel)
            .await?;

        if response.status().as_u16() != 200 {
            return Err(status_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ScanError::malformed(BACKEND_TYPE, format!("scan status response: {}", e)))
    }
}

impl std::fmt::Debug for RemoteApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteApiClient")
            .field("base_url", &self.base_url)
            .field("token", &sanitize_token(self.token.expose_secret()))
            .field("retry_base", &self.retry_base)
            .finish()
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turns a non-success response into the matching error.
async fn status_error(response: Response) -> ScanError {
    let status = response.status().as_u16();
    let wait = retry_after(&response);
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }

    match status {
        401 | 403 => ScanError::AuthenticationFailed {
            backend: BACKEND_TYPE.to_string(),
            reason: format!("HTTP {}: {}", status, body),
        },
        429 => ScanError::RateLimited {
            backend: BACKEND_TYPE.to_string(),
            retry_after: wait,
        },
        _ => ScanError::UnexpectedStatus {
            backend: BACKEND_TYPE.to_string(),
            status,
            body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_token() {
        assert_eq!(sanitize_token("abcdefgh"), "ab...gh");
        assert_eq!(sanitize_token("abcde"), "ab...de");
        assert_eq!(sanitize_token("abcd"), "****");
        assert_eq!(sanitize_token(""), "****");
    }

    #[test]
    fn test_retriable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retriable_status(status));
        }
        for status in [200, 201, 400, 401, 403, 404, 501] {
            assert!(!is_retriable_status(status));
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let client = RemoteApiClient::new(
            "http://localhost",
            SecretString::new("token-value".into()),
            true,
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(client.backoff(1), Duration::from_secs(1));
        assert_eq!(client.backoff(2), Duration::from_secs(2));
        assert_eq!(client.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = RemoteApiClient::new(
            "https://scanner.example.com/",
            SecretString::new("token-value".into()),
            true,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.endpoint(SCAN_PATH),
            "https://scanner.example.com/api/scanning/v1/registry/scan"
        );
    }

    #[test]
    fn test_status_url_escapes_scan_id() {
        let client = RemoteApiClient::new(
            "https://scanner.example.com",
            SecretString::new("token-value".into()),
            true,
            Duration::from_secs(5),
        )
        .unwrap();

        let url = client.status_url("a/b?c#d").unwrap();
        assert_eq!(
            url.as_str(),
            "https://scanner.example.com/api/scanning/v1/registry/scan/a%2Fb%3Fc%23d"
        );
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn client_logs(verify_tls: bool) -> String {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            RemoteApiClient::new(
                "https://scanner.example.com",
                SecretString::new("token-value".into()),
                verify_tls,
                Duration::from_secs(5),
            )
            .unwrap();
        });
        logs.contents()
    }

    #[test]
    fn test_disabled_tls_verification_warns() {
        let logs = client_logs(false);
        assert!(logs.contains("WARN"), "logs: {}", logs);
        assert!(logs.contains("TLS certificate verification is DISABLED"));
        assert!(!logs.contains("token-value"));

        assert!(!client_logs(true).contains("TLS certificate verification"));
    }

    #[test]
    fn test_debug_hides_token() {
        let client = RemoteApiClient::new(
            "http://localhost",
            SecretString::new("supersecrettoken".into()),
            true,
            Duration::from_secs(5),
        )
        .unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("supersecrettoken"));
        assert!(debug.contains("su...en"));
    }

    #[test]
    fn test_start_request_body() {
        let credentials = RegistryCredentials::new("robot", "pw");
        let body = ScanStartRequest::new("app:1.0", "proj-1", Some(&credentials));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["image"], "app:1.0");
        assert_eq!(json["project_id"], "proj-1");
        assert_eq!(json["registry_credentials"]["username"], "robot");

        let body = ScanStartRequest::new("app:1.0", "proj-1", None);
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("registry_credentials").is_none());
    }

    #[test]
    fn test_status_parsing() {
        let status: RemoteScanStatus = serde_json::from_str(
            r#"{"status":"completed","result":{"vulnerabilities":{"critical":1,"high":2,"medium":3,"low":4}}}"#,
        )
        .unwrap();
        assert_eq!(status.status, RemoteScanState::Completed);
        assert_eq!(status.result.unwrap().vulnerabilities.total(), 10);

        let status: RemoteScanStatus = serde_json::from_str(r#"{"status":"queued"}"#).unwrap();
        assert_eq!(status.status, RemoteScanState::Unknown);
    }
}
