//! SSH command execution and file delivery using russh

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use crate::error::ExecError;
use crate::keys::KeySource;
use crate::result::{CommandResult, ConnectionInfo};
use crate::traits::RemoteExecutor;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no). The
        // installer typically runs against freshly provisioned hosts that
        // are not in known_hosts yet.
        Ok(true)
    }
}

/// SSH executor
///
/// Manages one SSH session per managed host. Connections are established
/// on first use and reused for every subsequent command and transfer.
pub struct SshExecutor {
    /// Connection configuration
    conn_info: ConnectionInfo,
    /// Resolved identity file
    key_path: std::path::PathBuf,
    /// SSH session (initialized on first use)
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("conn_info", &self.conn_info)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if no usable identity file is found
    pub fn new(conn_info: ConnectionInfo, key_source: &KeySource) -> Result<Self, ExecError> {
        let key_path = key_source
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            conn_info,
            key_path,
            session: Mutex::new(None),
        })
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    /// Connect to the remote host
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.is_some() {
            return Ok(());
        }

        info!(
            host = %self.conn_info.host,
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler;

        let mut session = client::connect(
            config,
            (&self.conn_info.host[..], self.conn_info.port),
            handler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let key_pair = load_secret_key(&self.key_path, None)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.conn_info.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "public key authentication failed".to_string(),
            ));
        }

        info!(host = %self.conn_info.host, "SSH connected and authenticated");

        *session_lock = Some(session);
        Ok(())
    }

    /// Execute command on remote host
    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn execute_remote(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let mut session_lock = self.session.lock().await;

        let session = session_lock.as_mut().ok_or(ExecError::NotConnected)?;

        debug!(command = %cmd, "executing remote command");

        let start = Instant::now();

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            let msg = channel.wait().await;

            match msg {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        // stderr
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = exit_status.cast_signed();
                }
                Some(ChannelMsg::Eof) | None => break,
                _ => {}
            }
        }

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        debug!(
            command = %cmd,
            status = status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }

    /// Run a remote command feeding `stdin` from an async reader.
    ///
    /// The workhorse of both file-delivery paths: the reader is streamed
    /// through the channel, EOF is signalled, and the remote exit status
    /// is collected.
    async fn execute_with_stdin<R>(&self, cmd: &str, stdin: R) -> Result<i32, ExecError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut session_lock = self.session.lock().await;

        let session = session_lock.as_mut().ok_or(ExecError::NotConnected)?;

        debug!(command = %cmd, "executing remote command with streamed stdin");

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .data(stdin)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        channel
            .eof()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = -1;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = exit_status.cast_signed();
                }
                Some(ChannelMsg::Eof) | None => break,
                _ => {}
            }
        }

        Ok(status)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.connect().await?;
        self.execute_remote(cmd).await
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        // Ensure connection first (outside of timeout)
        self.connect().await?;

        let result = timeout(timeout_duration, self.execute_remote(cmd)).await;

        match result {
            Ok(Ok(cmd_result)) => Ok(cmd_result),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                error!(
                    command = %cmd,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    /// Deliver a single file by streaming it into `cat` on the remote side.
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), ExecError> {
        self.connect().await?;

        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| ExecError::TransferFailed {
                path: local.display().to_string(),
                reason: e.to_string(),
            })?;

        let cmd = format!("cat > '{}'", remote.display());
        let status = self.execute_with_stdin(&cmd, file).await?;
        if status != 0 {
            return Err(ExecError::TransferFailed {
                path: local.display().to_string(),
                reason: format!("remote write exited with status {status}"),
            });
        }

        debug!(
            local = %local.display(),
            remote = %remote.display(),
            "file delivered"
        );
        Ok(())
    }

    /// Deliver a directory tree by piping a local `tar` stream into a
    /// remote `tar -xf -`, preserving the source basename under
    /// `remote_dir`.
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn send_tree(&self, local: &Path, remote_dir: &Path) -> Result<(), ExecError> {
        self.connect().await?;

        let parent = local.parent().unwrap_or_else(|| Path::new("/"));
        let base = local
            .file_name()
            .ok_or_else(|| ExecError::TransferFailed {
                path: local.display().to_string(),
                reason: "path has no basename".to_string(),
            })?;

        let mut tar = tokio::process::Command::new("tar")
            .arg("-cf")
            .arg("-")
            .arg("-C")
            .arg(parent)
            .arg(base)
            .stdout(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let tar_out = tar.stdout.take().ok_or_else(|| {
            ExecError::SpawnError("tar produced no stdout handle".to_string())
        })?;

        let cmd = format!("tar -xf - -C '{}'", remote_dir.display());
        let status = self.execute_with_stdin(&cmd, tar_out).await?;

        let tar_status = tar
            .wait()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        if !tar_status.success() {
            return Err(ExecError::TransferFailed {
                path: local.display().to_string(),
                reason: "local tar failed".to_string(),
            });
        }
        if status != 0 {
            return Err(ExecError::TransferFailed {
                path: local.display().to_string(),
                reason: format!("remote tar exited with status {status}"),
            });
        }

        debug!(
            local = %local.display(),
            remote = %remote_dir.display(),
            "tree delivered"
        );
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

impl SshExecutor {
    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Command and transfer paths require an SSH server; the trait surface
    // is exercised against LocalExecutor and the integration-test mock.
    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_connection() {}
}
