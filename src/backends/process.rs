//! Local process backend.
//!
//! Runs a scanner executable once per request. The command line comes from
//! an argument template in which `{image}` and `{registry}` are replaced;
//! registry credentials are passed through environment variables so they
//! never show up in the process list. The child always runs under a
//! timeout resolved from the registry override or the default, and is
//! killed and reaped on every path that does not end in a normal exit.
//!
//! Exit codes map as follows:
//!
//! | Exit code | Status | Meaning |
//! |-----------|--------|---------|
//! | 0 | `success` | clean |
//! | 1-9 | `success` | scan ran and reported findings |
//! | anything else | `failed` | scanner error |

use crate::config::BackendTimeouts;
use crate::core::result::MAX_CAPTURED_OUTPUT;
use crate::core::{
    RegistryCredentials, ScanBackend, ScanError, ScanFailure, ScanRequest, ScanResult, ScanStatus,
};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BACKEND_TYPE: &str = "process";

/// How long output readers may keep running after the child was killed.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Highest exit code that still means "scan ran, findings reported".
const MAX_FINDINGS_EXIT_CODE: i32 = 9;

/// Configuration for [`ProcessBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    /// Scanner executable, resolved through `PATH` if not absolute.
    pub executable: String,

    /// Argument template. `{image}` and `{registry}` are substituted; if
    /// no argument mentions `{image}`, the image reference is appended.
    pub args: Vec<String>,

    /// Environment variable receiving the registry user name.
    pub username_env: String,

    /// Environment variable receiving the registry password.
    pub password_env: String,

    /// Extra environment for every run.
    pub env: HashMap<String, String>,

    /// Per-scan timeouts.
    pub timeouts: BackendTimeouts,

    /// Credentials keyed by registry name.
    #[serde(skip)]
    pub credentials: HashMap<String, RegistryCredentials>,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            executable: "trivy".to_string(),
            args: vec![
                "image".to_string(),
                "--quiet".to_string(),
                "--format".to_string(),
                "json".to_string(),
                "--exit-code".to_string(),
                "1".to_string(),
                "{image}".to_string(),
            ],
            username_env: "TRIVY_USERNAME".to_string(),
            password_env: "TRIVY_PASSWORD".to_string(),
            env: HashMap::new(),
            timeouts: BackendTimeouts::new(Duration::from_secs(300)),
            credentials: HashMap::new(),
        }
    }
}

impl ProcessBackendConfig {
    /// Creates a configuration for the given executable and argument template.
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            ..Self::default()
        }
    }

    /// Sets the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.default = timeout;
        self
    }

    /// Sets a registry-specific timeout.
    pub fn with_registry_timeout(mut self, registry: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts = self.timeouts.with_override(registry, timeout);
        self
    }

    /// Sets the credential environment variable names.
    pub fn with_credential_env(
        mut self,
        username_env: impl Into<String>,
        password_env: impl Into<String>,
    ) -> Self {
        self.username_env = username_env.into();
        self.password_env = password_env.into();
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

    /// Adds an environment variable for every run.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Runs a local scanner executable per request.
#[derive(Debug)]
pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

impl ProcessBackend {
    /// Creates a new process backend.
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProcessBackendConfig {
        &self.config
    }

    /// Expands the argument template for one request.
    pub fn build_args(&self, request: &ScanRequest) -> Vec<String> {
        let mut mentions_image = false;
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| {
                mentions_image |= arg.contains("{image}");
                arg.replace("{image}", &request.image_ref)
                    .replace("{registry}", &request.registry)
            })
            .collect();
        if !mentions_image {
            args.push(request.image_ref.clone());
        }
        args
    }

    fn command(&self, request: &ScanRequest) -> Command {
        let mut command = Command::new(&self.config.executable);
        command
            .args(self.build_args(request))
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(credentials) = self.config.credentials.get(&request.registry) {
            command
                .env(&self.config.username_env, &credentials.username)
                .env(
                    &self.config.password_env,
                    credentials.password.expose_secret(),
                );
        }
        command
    }
}

enum Completion {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ScanBackend for ProcessBackend {
    fn backend_type(&self) -> &str {
        BACKEND_TYPE
    }

    async fn scan(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanResult, ScanFailure> {
        let result = ScanResult::start(request, BACKEND_TYPE)
            .with_detail("executable", serde_json::json!(self.config.executable));
        let timeout = self.config.timeouts.for_registry(&request.registry);

        tracing::debug!(
            request_id = %request.id,
            image = %request.image_ref,
            executable = %self.config.executable,
            timeout_ms = timeout.as_millis() as u64,
            has_credentials = self.config.credentials.contains_key(&request.registry),
            "Starting scanner process"
        );

        let mut child = match ScopedChild::spawn(&mut self.command(request)) {
            Ok(child) => child,
            Err(e) => {
                return Err(result.fail(
                    ScanStatus::Failed,
                    ScanError::backend_unavailable(
                        BACKEND_TYPE,
                        format!("failed to start '{}': {}", self.config.executable, e),
                    ),
                ));
            }
        };

        let stdout = child.stdout_reader();
        let stderr = child.stderr_reader();

        let completion = tokio::select! {
            status = child.wait() => Completion::Exited(status),
            _ = tokio::time::sleep(timeout) => Completion::TimedOut,
            _ = cancel.cancelled() => Completion::Cancelled,
        };

        if !matches!(completion, Completion::Exited(Ok(_))) {
            child.terminate().await;
        }

        let stdout = collect_output(stdout).await;
        let stderr = collect_output(stderr).await;
        let mut result = result.with_output(&stdout, &stderr);

        match completion {
            Completion::Exited(Ok(status)) => {
                result.exit_code = status.code();
                match status.code() {
                    Some(0) => {
                        tracing::debug!(request_id = %request.id, "Scanner exited clean");
                        Ok(result.finish(ScanStatus::Success))
                    }
                    Some(code @ 1..=MAX_FINDINGS_EXIT_CODE) => {
                        tracing::debug!(
                            request_id = %request.id,
                            exit_code = code,
                            "Scanner reported findings"
                        );
                        Ok(result.finish(ScanStatus::Success))
                    }
                    code => {
                        let stderr = result.stderr.clone();
                        tracing::warn!(
                            request_id = %request.id,
                            image = %request.image_ref,
                            exit_code = ?code,
                            "Scanner process failed"
                        );
                        Err(result.fail(
                            ScanStatus::Failed,
                            ScanError::ProcessFailed {
                                exit_code: code,
                                stderr,
                            },
                        ))
                    }
                }
            }
            Completion::Exited(Err(e)) => Err(result.fail(ScanStatus::Failed, ScanError::Io(e))),
            Completion::TimedOut => {
                tracing::warn!(
                    request_id = %request.id,
                    image = %request.image_ref,
                    timeout_ms = timeout.as_millis() as u64,
                    "Scanner process timed out and was killed"
                );
                Err(result.fail(ScanStatus::Timeout, ScanError::timeout(BACKEND_TYPE, timeout)))
            }
            Completion::Cancelled => {
                tracing::debug!(request_id = %request.id, "Scanner process cancelled");
                Err(result.fail(ScanStatus::Failed, ScanError::Cancelled))
            }
        }
    }

    fn validate_config(&self) -> Result<(), ScanError> {
        if self.config.executable.trim().is_empty() {
            return Err(ScanError::configuration(
                "process backend executable must not be empty",
            ));
        }
        if self.config.username_env.is_empty() || self.config.password_env.is_empty() {
            return Err(ScanError::configuration(
                "process backend credential variable names must not be empty",
            ));
        }
        self.config.timeouts.validate(BACKEND_TYPE)
    }
}

/// A child process that is killed and reaped unless it exits on its own.
struct ScopedChild {
    child: Child,
    reaped: bool,
}

impl ScopedChild {
    fn spawn(command: &mut Command) -> std::io::Result<Self> {
        Ok(Self {
            child: command.spawn()?,
            reaped: false,
        })
    }

    fn stdout_reader(&mut self) -> Option<JoinHandle<Vec<u8>>> {
        self.child.stdout.take().map(|out| tokio::spawn(read_capped(out)))
    }

    fn stderr_reader(&mut self) -> Option<JoinHandle<Vec<u8>>> {
        self.child.stderr.take().map(|err| tokio::spawn(read_capped(err)))
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(status)
    }

    /// Kills the child and waits for it to be reaped.
    async fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Scanner process already gone");
        }
        match self.child.wait().await {
            Ok(_) => self.reaped = true,
            Err(e) => tracing::warn!(error = %e, "Failed to reap scanner process"),
        }
    }
}

impl Drop for ScopedChild {
    fn drop(&mut self) {
        if !self.reaped {
            // kill_on_drop covers the kill; the runtime reaps the orphan.
            let _ = self.child.start_kill();
        }
    }
}

/// Reads a stream to the end, keeping at most `MAX_CAPTURED_OUTPUT` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_CAPTURED_OUTPUT.saturating_sub(captured.len());
                captured.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    captured
}

/// Waits briefly for a reader task; grandchildren may hold the pipe open.
async fn collect_output(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}
