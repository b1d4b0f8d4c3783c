//! Named handle onto one managed machine
//!
//! Wraps a [`RemoteExecutor`] with the operations the role agents share:
//! checked command execution with full failure context, service
//! lifecycle, package queries, distro detection and file delivery.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, instrument};

use fleetmon_exec::result::CommandResult;
use fleetmon_exec::traits::RemoteExecutor;
use fleetmon_pkg::Distro;

use crate::error::InstallError;
use crate::poll::{Retry, wait_until};

/// One managed machine
#[derive(Clone)]
pub struct Host {
    id: String,
    hostname: String,
    executor: Arc<dyn RemoteExecutor>,
}

impl Host {
    /// Create a handle
    pub fn new(
        id: impl Into<String>,
        hostname: impl Into<String>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            executor,
        }
    }

    /// Declared host id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Network address
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Underlying executor
    #[must_use]
    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        Arc::clone(&self.executor)
    }

    /// Run a command; a non-zero exit is not an error here.
    ///
    /// # Errors
    /// Fails only on transport errors.
    pub async fn run(&self, command: &str) -> Result<CommandResult, InstallError> {
        Ok(self.executor.run(command).await?)
    }

    /// Run a command, logging and failing on non-zero exit.
    ///
    /// # Errors
    /// [`InstallError::CommandFailed`] carrying command, host, status,
    /// stdout and stderr.
    pub async fn checked_run(&self, command: &str) -> Result<CommandResult, InstallError> {
        let result = self.executor.run(command).await?;

        if !result.success() {
            error!(
                host = %self.hostname,
                command = %command,
                status = result.status,
                stdout = %result.stdout,
                stderr = %result.stderr,
                "command failed"
            );
            return Err(InstallError::CommandFailed {
                host: self.hostname.clone(),
                command: command.to_string(),
                status: result.status,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }

        Ok(result)
    }

    /// Deliver a single file to an exact path
    ///
    /// # Errors
    /// Fails on transfer errors.
    pub async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), InstallError> {
        Ok(self.executor.send_file(local, remote).await?)
    }

    /// Deliver a file or directory into a remote directory
    ///
    /// # Errors
    /// Fails on transfer errors.
    pub async fn send_tree(&self, local: &Path, remote_dir: &Path) -> Result<(), InstallError> {
        Ok(self.executor.send_tree(local, remote_dir).await?)
    }

    /// Whether an exact package is installed
    ///
    /// # Errors
    /// Fails only on transport errors.
    pub async fn rpm_installed(&self, name: &str) -> Result<bool, InstallError> {
        let result = self.run(&format!("rpm -q {name}")).await?;
        Ok(result.success())
    }

    /// Detect the distribution
    ///
    /// # Errors
    /// Fails for non-RHEL-family hosts.
    pub async fn distro(&self) -> Result<Distro, InstallError> {
        Ok(Distro::detect(self.executor.as_ref()).await?)
    }

    /// Verify the peer is reachable from this host
    ///
    /// # Errors
    /// A failed ping is a failed pre-flight check.
    pub async fn ping(&self, peer: &str) -> Result<(), InstallError> {
        self.checked_run(&format!("ping -c 1 {peer}")).await?;
        Ok(())
    }

    /// Start a service
    ///
    /// # Errors
    /// Fails when the init system reports failure.
    pub async fn service_start(&self, service: &str) -> Result<(), InstallError> {
        self.checked_run(&format!("service {service} start")).await?;
        Ok(())
    }

    /// Stop a service
    ///
    /// # Errors
    /// Fails when the init system reports failure.
    pub async fn service_stop(&self, service: &str) -> Result<(), InstallError> {
        self.checked_run(&format!("service {service} stop")).await?;
        Ok(())
    }

    /// Restart a service
    ///
    /// # Errors
    /// Fails when the init system reports failure.
    pub async fn service_restart(&self, service: &str) -> Result<(), InstallError> {
        self.checked_run(&format!("service {service} restart"))
            .await?;
        Ok(())
    }

    /// Exit status of `service <name> status`
    ///
    /// # Errors
    /// Fails only on transport errors; the status itself is the answer
    /// (0 active, 3 stopped under sysv conventions).
    pub async fn service_status(&self, service: &str) -> Result<i32, InstallError> {
        let result = self.run(&format!("service {service} status")).await?;
        Ok(result.status)
    }

    /// Enable a service at boot
    ///
    /// # Errors
    /// Fails when chkconfig reports failure.
    pub async fn service_enable(&self, service: &str) -> Result<(), InstallError> {
        self.checked_run(&format!("chkconfig {service} on")).await?;
        Ok(())
    }

    /// Poll until a command exits with the expected status.
    ///
    /// Service starts and database commands report success before the
    /// underlying state has settled; this is the convergence loop for
    /// both.
    ///
    /// # Errors
    /// [`InstallError::Timeout`] when the deadline elapses.
    #[instrument(skip(self), fields(host = %self.hostname))]
    pub async fn wait_command_status(
        &self,
        command: &str,
        expect: i32,
        retry: Retry,
    ) -> Result<(), InstallError> {
        let what = format!("[{command}] on host [{}] to exit {expect}", self.hostname);
        wait_until(&what, retry, async || {
            match self.executor.run(command).await {
                Ok(result) => result.status == expect,
                Err(e) => {
                    debug!(host = %self.hostname, command = %command, error = %e, "probe failed, retrying");
                    false
                }
            }
        })
        .await?;
        Ok(())
    }

    /// Put SELinux into permissive mode, persistently.
    ///
    /// Hosts without SELinux (or with it already disabled) are a no-op.
    ///
    /// # Errors
    /// Fails when the config file rewrite fails.
    pub async fn disable_selinux(&self) -> Result<(), InstallError> {
        // setenforce exits non-zero when SELinux is already disabled
        self.run("setenforce 0").await?;
        self.checked_run(
            "[ ! -f /etc/selinux/config ] || \
             sed -i 's/^SELINUX=.*/SELINUX=permissive/' /etc/selinux/config",
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("executor", &self.executor.executor_type())
            .finish()
    }
}
