//! Remote executor trait

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::CommandResult;

/// A handle onto one machine: run shell commands and deliver files.
///
/// Installation steps never care whether the machine is local or reached
/// over SSH; they only see this trait.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command and collect its exit status and output.
    ///
    /// A non-zero exit status is NOT an error at this layer; callers
    /// inspect [`CommandResult::success`].
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Run a shell command, failing with [`ExecError::Timeout`] if it does
    /// not finish in time.
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Deliver a single local file to an exact remote path.
    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), ExecError>;

    /// Deliver a local file or directory tree into an existing remote
    /// directory, preserving the basename (like `scp -r local dir/`).
    async fn send_tree(&self, local: &Path, remote_dir: &Path) -> Result<(), ExecError>;

    /// Executor type name for logging ("ssh", "local", ...)
    fn executor_type(&self) -> &'static str;
}
