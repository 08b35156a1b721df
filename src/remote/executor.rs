//! Remote executor
//!
//! Fan-out of shell commands and small file payloads to sets of storage
//! nodes. Every multi-host call returns a full per-host outcome map; a
//! failure on one host never prevents the others from running.

use crate::error::{Error, Result};
use crate::remote::locality::LocalIdentity;
use crate::remote::transport::ShellTransport;
use base64::Engine;
use futures::future;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Default fan-out width
pub const DEFAULT_PARALLEL: usize = 10;

/// Default per-host command deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Counter distinguishing concurrent staging files on one host
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Per-Host Results
// =============================================================================

/// Outcome of one command on one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostResult {
    /// Target host as given by the caller
    pub host: String,
    /// Process exit code, `None` if the command never completed
    pub exit_code: Option<i32>,
    /// Combined stdout + stderr
    pub output: String,
    /// Whether the command completed with exit code 0
    pub success: bool,
    /// Whether the per-host deadline elapsed
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl HostResult {
    pub fn ok(host: impl Into<String>, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            host: host.into(),
            exit_code: Some(0),
            output: output.into(),
            success: true,
            timed_out: false,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failed(
        host: impl Into<String>,
        exit_code: i32,
        output: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            exit_code: Some(exit_code),
            output: output.into(),
            success: false,
            timed_out: false,
            duration_ms: duration.as_millis() as u64,
        }
    }

    fn cancelled(host: impl Into<String>, duration: Duration) -> Self {
        Self {
            host: host.into(),
            exit_code: None,
            output: "cancelled before dispatch".to_string(),
            success: false,
            timed_out: false,
            duration_ms: duration.as_millis() as u64,
        }
    }

    fn from_output(
        host: &str,
        output: crate::remote::transport::CmdOutput,
        duration: Duration,
        timeout: Duration,
    ) -> Self {
        let text = if output.timed_out {
            format!("timed out after {}s", timeout.as_secs())
        } else {
            output.output
        };
        Self {
            host: host.to_string(),
            exit_code: output.exit_code,
            success: !output.timed_out && output.exit_code == Some(0),
            timed_out: output.timed_out,
            output: text,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Per-host outcome map of one fan-out operation.
///
/// Kept whole so callers decide whether 1-of-N failures are fatal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostReport {
    results: BTreeMap<String, HostResult>,
}

impl HostReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: HostResult) {
        self.results.insert(result.host.clone(), result);
    }

    pub fn get(&self, host: &str) -> Option<&HostResult> {
        self.results.get(host)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostResult> {
        self.results.values()
    }

    pub fn all_ok(&self) -> bool {
        self.results.values().all(|r| r.success)
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|r| !r.success)
            .map(|r| r.host.as_str())
            .collect()
    }

    pub fn succeeded_hosts(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|r| r.success)
            .map(|r| r.host.as_str())
            .collect()
    }

    /// First successful result, if any. Used for one-peer probes.
    pub fn first_success(&self) -> Option<&HostResult> {
        self.results.values().find(|r| r.success)
    }

    /// Collapse into a `Result`: the report itself on full success,
    /// `Error::PartialFailure` carrying the map otherwise.
    pub fn into_result(self, operation: &str) -> Result<HostReport> {
        if self.all_ok() {
            Ok(self)
        } else {
            Err(Error::partial(operation, self))
        }
    }
}

// =============================================================================
// Executor Configuration
// =============================================================================

/// Configuration for the remote executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrent targets per call
    pub parallel: usize,
    /// Per-host command deadline
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Per-call overrides for one executor invocation
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Override the fan-out width
    pub parallel: Option<usize>,
    /// Override the per-host deadline
    pub timeout: Option<Duration>,
    /// Cooperative cancellation. Hosts not yet dispatched are skipped;
    /// in-flight commands run to their per-host deadline.
    pub cancel: Option<CancellationToken>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Default::default()
        }
    }
}

// =============================================================================
// Remote Executor
// =============================================================================

/// Delivers commands and file payloads to sets of target hosts.
///
/// Targets are classified local-vs-remote once per call against the
/// controller's [`LocalIdentity`]; local targets bypass SSH entirely.
pub struct RemoteExecutor {
    transport: Arc<dyn ShellTransport>,
    identity: LocalIdentity,
    config: ExecutorConfig,
}

impl RemoteExecutor {
    pub fn new(
        transport: Arc<dyn ShellTransport>,
        identity: LocalIdentity,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            identity,
            config,
        })
    }

    /// Run `command` on every host, bounded by the fan-out width.
    pub async fn exec(&self, hosts: &[String], command: &str, opts: &ExecOptions) -> HostReport {
        let parallel = opts.parallel.unwrap_or(self.config.parallel).max(1);
        let timeout = opts.timeout.unwrap_or(self.config.default_timeout);
        let semaphore = Arc::new(Semaphore::new(parallel));

        let tasks: Vec<_> = hosts
            .iter()
            .map(|host| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await;
                    self.run_on(host, command, timeout, opts.cancel.as_ref()).await
                }
            })
            .collect();

        let mut report = HostReport::new();
        for result in future::join_all(tasks).await {
            if !result.success {
                debug!(host = %result.host, output = %result.output, "command failed");
            }
            report.insert(result);
        }
        report
    }

    /// Run `command` on a single host, surfacing failure as an error.
    pub async fn exec_one(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<HostResult> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let result = self.run_on(host, command, timeout, None).await;
        if result.success {
            Ok(result)
        } else if result.timed_out {
            Err(Error::Timeout {
                host: host.to_string(),
                seconds: timeout.as_secs(),
            })
        } else {
            Err(Error::Remote {
                host: host.to_string(),
                reason: result.output,
            })
        }
    }

    /// Place `content` at `remote_path` on every host.
    ///
    /// The payload is staged under `/tmp` and promoted into place with a
    /// privileged move, so a success host always holds exactly `content`.
    /// The payload rides base64-encoded to survive shell escaping across
    /// the SSH hop. `post_command` runs once on every host that reported
    /// success; its failure demotes that host's result.
    pub async fn distribute(
        &self,
        hosts: &[String],
        content: &str,
        remote_path: &str,
        post_command: Option<&str>,
        opts: &ExecOptions,
    ) -> HostReport {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let staging = format!(
            "/tmp/.sds-dist-{}-{}",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let parent = parent_dir(remote_path);
        let command = format!(
            "printf '%s' '{encoded}' | base64 -d > {staging} && \
             mkdir -p {parent} && mv {staging} {remote_path}"
        );

        let mut report = self.exec(hosts, &command, opts).await;

        if let Some(post) = post_command {
            let targets: Vec<String> = report
                .succeeded_hosts()
                .iter()
                .map(|h| h.to_string())
                .collect();
            if !targets.is_empty() {
                let post_report = self.exec(&targets, post, opts).await;
                for result in post_report.iter() {
                    if !result.success {
                        warn!(host = %result.host, "post-distribute command failed");
                        report.insert(result.clone());
                    }
                }
            }
        }

        report
    }

    /// Privileged delete of `remote_path` on every host. An absent file
    /// is not an error.
    pub async fn remove(
        &self,
        hosts: &[String],
        remote_path: &str,
        opts: &ExecOptions,
    ) -> HostReport {
        self.exec(hosts, &format!("rm -f {remote_path}"), opts).await
    }

    /// Whether `host` classifies as the controller's own machine.
    pub fn is_local(&self, host: &str) -> bool {
        self.identity.is_local(host)
    }

    async fn run_on(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> HostResult {
        let started = Instant::now();
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return HostResult::cancelled(host, started.elapsed());
        }
        let output = if self.identity.is_local(host) {
            self.transport.run_local(command, timeout).await
        } else {
            self.transport.run_remote(host, command, timeout).await
        };
        HostResult::from_output(host, output, started.elapsed(), timeout)
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}
