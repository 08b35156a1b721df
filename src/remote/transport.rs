//! Shell transports
//!
//! The executor delivers every command through the [`ShellTransport`] seam:
//! a local shell for the controller's own host and an SSH session for
//! everything else. The trait keeps orchestration testable without a
//! cluster behind it.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

// =============================================================================
// Command Output
// =============================================================================

/// Outcome of one shell invocation on one host.
///
/// Spawn failures and timeouts are folded in rather than surfaced as
/// errors so that one bad host never aborts a fan-out.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Process exit code, `None` if the process never ran or was killed
    pub exit_code: Option<i32>,
    /// Combined stdout + stderr
    pub output: String,
    /// Whether the per-host deadline elapsed
    pub timed_out: bool,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    fn spawn_error(err: impl std::fmt::Display) -> Self {
        Self {
            exit_code: None,
            output: format!("failed to spawn shell: {err}"),
            timed_out: false,
        }
    }

    fn timeout() -> Self {
        Self {
            exit_code: None,
            output: String::new(),
            timed_out: true,
        }
    }
}

// =============================================================================
// Shell Transport Seam
// =============================================================================

/// Delivery seam between the executor and the machines it drives.
///
/// Implementations must apply `timeout` themselves so a hung remote shell
/// cannot wedge the fan-out.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    /// Run a command on the controller host.
    async fn run_local(&self, command: &str, timeout: Duration) -> CmdOutput;

    /// Run a command on a remote host.
    async fn run_remote(&self, host: &str, command: &str, timeout: Duration) -> CmdOutput;
}

// =============================================================================
// System Shell
// =============================================================================

/// Configuration for the system shell transport
#[derive(Debug, Clone)]
pub struct SystemShellConfig {
    /// User for SSH sessions
    pub ssh_user: String,
    /// TCP connect deadline handed to the SSH client
    pub connect_timeout_secs: u64,
}

impl Default for SystemShellConfig {
    fn default() -> Self {
        Self {
            ssh_user: "root".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Production transport: `sh -c` locally, the system SSH client remotely.
pub struct SystemShell {
    config: SystemShellConfig,
}

impl SystemShell {
    pub fn new(config: SystemShellConfig) -> Self {
        Self { config }
    }

    /// Spawn a local process and collect combined output under a deadline.
    async fn run_command(mut command: tokio::process::Command, timeout: Duration) -> CmdOutput {
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return CmdOutput::spawn_error(err),
        };

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = String::new();
        let mut err_buf = String::new();

        // Drain the pipes while waiting so a chatty command cannot block
        // on a full pipe buffer.
        let wait = async {
            let readers = async {
                if let Some(out) = stdout.as_mut() {
                    let _ = out.read_to_string(&mut out_buf).await;
                }
                if let Some(err) = stderr.as_mut() {
                    let _ = err.read_to_string(&mut err_buf).await;
                }
            };
            let (status, _) = tokio::join!(child.wait(), readers);
            status
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(status)) => {
                if !err_buf.is_empty() && !out_buf.is_empty() && !out_buf.ends_with('\n') {
                    out_buf.push('\n');
                }
                out_buf.push_str(&err_buf);
                CmdOutput {
                    exit_code: status.code(),
                    output: out_buf,
                    timed_out: false,
                }
            }
            Ok(Err(err)) => CmdOutput::spawn_error(err),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                CmdOutput::timeout()
            }
        }
    }
}

#[async_trait]
impl ShellTransport for SystemShell {
    async fn run_local(&self, command: &str, timeout: Duration) -> CmdOutput {
        debug!(command, "running local command");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        Self::run_command(cmd, timeout).await
    }

    async fn run_remote(&self, host: &str, command: &str, timeout: Duration) -> CmdOutput {
        debug!(host, command, "running remote command");
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg(format!("{}@{}", self.config.ssh_user, host))
            .arg("--")
            .arg(command);
        Self::run_command(cmd, timeout).await
    }
}

// =============================================================================
// Mock Transport (test support)
// =============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use base64::Engine;
    use parking_lot::Mutex;

    /// Host label under which local invocations are recorded.
    pub const LOCAL: &str = "<local>";

    /// Scripted response keyed on (host substring, command substring).
    struct Rule {
        host: Option<String>,
        needle: String,
        output: CmdOutput,
    }

    /// Records every (host, command) pair and replays scripted outputs.
    ///
    /// Unmatched commands succeed with empty output, so tests only script
    /// the probes they care about.
    #[derive(Default)]
    pub struct MockTransport {
        calls: Mutex<Vec<(String, String)>>,
        rules: Mutex<Vec<Rule>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Script the output for any command containing `needle`, on any host.
        pub fn respond(&self, needle: &str, output: &str) {
            self.respond_with(None, needle, CmdOutput {
                exit_code: Some(0),
                output: output.to_string(),
                timed_out: false,
            });
        }

        /// Script a non-zero exit for commands containing `needle` on `host`.
        pub fn fail_on(&self, host: &str, needle: &str) {
            self.respond_with(Some(host.to_string()), needle, CmdOutput {
                exit_code: Some(1),
                output: "mock failure".to_string(),
                timed_out: false,
            });
        }

        pub fn respond_on(&self, host: &str, needle: &str, output: &str) {
            self.respond_with(Some(host.to_string()), needle, CmdOutput {
                exit_code: Some(0),
                output: output.to_string(),
                timed_out: false,
            });
        }

        fn respond_with(&self, host: Option<String>, needle: &str, output: CmdOutput) {
            self.rules.lock().push(Rule {
                host,
                needle: needle.to_string(),
                output,
            });
        }

        /// All recorded (host, command) pairs, in call order.
        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }

        /// Commands recorded against one host, in call order.
        pub fn commands_for(&self, host: &str) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, c)| c.clone())
                .collect()
        }

        /// Whether any command on `host` contained `needle`.
        pub fn saw(&self, host: &str, needle: &str) -> bool {
            self.commands_for(host).iter().any(|c| c.contains(needle))
        }

        /// Decode the payload the executor distributed to `path` on `host`.
        ///
        /// Parses the executor's own staging command shape, so it tracks
        /// the last write that targeted the path.
        pub fn distributed_content(&self, host: &str, path: &str) -> Option<String> {
            let needle = format!(" {path}");
            for command in self.commands_for(host).iter().rev() {
                if !command.contains("base64 -d") || !command.contains(&needle) {
                    continue;
                }
                let start = command.find("printf '%s' '")? + "printf '%s' '".len();
                let end = command[start..].find('\'')? + start;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&command[start..end])
                    .ok()?;
                return String::from_utf8(bytes).ok();
            }
            None
        }

        fn lookup(&self, host: &str, command: &str) -> CmdOutput {
            // Newest rule wins, so tests can rescript a probe mid-scenario.
            let rules = self.rules.lock();
            for rule in rules.iter().rev() {
                let host_ok = rule.host.as_deref().map_or(true, |h| h == host);
                if host_ok && command.contains(&rule.needle) {
                    return rule.output.clone();
                }
            }
            CmdOutput {
                exit_code: Some(0),
                output: String::new(),
                timed_out: false,
            }
        }

        fn record(&self, host: &str, command: &str) -> CmdOutput {
            self.calls
                .lock()
                .push((host.to_string(), command.to_string()));
            self.lookup(host, command)
        }
    }

    #[async_trait]
    impl ShellTransport for MockTransport {
        async fn run_local(&self, command: &str, _timeout: Duration) -> CmdOutput {
            self.record(LOCAL, command)
        }

        async fn run_remote(&self, host: &str, command: &str, _timeout: Duration) -> CmdOutput {
            self.record(host, command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_shell_captures_output() {
        let shell = SystemShell::new(SystemShellConfig::default());
        let out = shell
            .run_local("printf hello-from-shell", Duration::from_secs(5))
            .await;
        assert!(out.success());
        assert_eq!(out.output, "hello-from-shell");
    }

    #[tokio::test]
    async fn test_local_shell_nonzero_exit() {
        let shell = SystemShell::new(SystemShellConfig::default());
        let out = shell.run_local("exit 3", Duration::from_secs(5)).await;
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_local_shell_timeout() {
        let shell = SystemShell::new(SystemShellConfig::default());
        let out = shell.run_local("sleep 5", Duration::from_millis(100)).await;
        assert!(out.timed_out);
        assert!(!out.success());
    }
}
