//! Remote command delivery
//!
//! Fans shell commands and small file payloads out to sets of storage
//! nodes with bounded parallelism, short-circuiting targets that resolve
//! to the controller's own host.

pub mod executor;
pub mod locality;
pub mod transport;

pub use executor::{ExecOptions, ExecutorConfig, HostReport, HostResult, RemoteExecutor};
pub use locality::LocalIdentity;
pub use transport::{CmdOutput, ShellTransport, SystemShell, SystemShellConfig};
