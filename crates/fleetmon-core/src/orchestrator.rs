//! Run orchestration
//!
//! One [`Orchestrator::install`] call is one run: take the lock, parse
//! and validate the topology, mount the installation medium, build the
//! role agents, install the server first and then every client, and
//! always clean the mount point up again. Execution is strictly
//! sequential; the only fan-out ever attempted is across runs, and the
//! lock forbids it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use tracing::{error, info, instrument, warn};

use fleetmon_exec::keys::KeySource;
use fleetmon_exec::traits::RemoteExecutor;
use fleetmon_exec::{ConnectionInfo, LocalExecutor, SshExecutor};

use crate::agent::client::{ClientAgent, ClientFeatures};
use crate::agent::server::ServerAgent;
use crate::config::{ConfigError, SshHostDecl, Topology};
use crate::error::InstallError;
use crate::host::Host;
use crate::lock::{InstallLock, LockError};
use crate::stack::Stack;

/// Builds executors for declared hosts.
///
/// The default factory opens SSH sessions; tests substitute scripted
/// executors.
pub trait HostFactory: Send + Sync {
    /// Executor for a declared host
    ///
    /// # Errors
    /// Fails when the executor cannot be constructed (e.g. no usable
    /// SSH identity).
    fn executor(&self, decl: &SshHostDecl) -> Result<Arc<dyn RemoteExecutor>, InstallError>;

    /// Executor for the machine the installer runs on
    fn local(&self) -> Arc<dyn RemoteExecutor>;
}

/// SSH-backed default factory
#[derive(Debug, Clone, Default)]
pub struct SshHostFactory;

impl HostFactory for SshHostFactory {
    fn executor(&self, decl: &SshHostDecl) -> Result<Arc<dyn RemoteExecutor>, InstallError> {
        let conn = ConnectionInfo::new(&decl.hostname, "root");
        let key = match &decl.ssh_identity_file {
            Some(path) => KeySource::Path(path.clone()),
            None => KeySource::Default,
        };
        Ok(Arc::new(SshExecutor::new(conn, &key)?))
    }

    fn local(&self) -> Arc<dyn RemoteExecutor> {
        Arc::new(LocalExecutor::new())
    }
}

/// The installation engine
pub struct Orchestrator {
    stack: Arc<Stack>,
    factory: Arc<dyn HostFactory>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(Stack::default(), Arc::new(SshHostFactory))
    }
}

impl Orchestrator {
    /// Create an orchestrator with the given stack constants and host
    /// factory
    pub fn new(stack: Stack, factory: Arc<dyn HostFactory>) -> Self {
        Self {
            stack: Arc::new(stack),
            factory,
        }
    }

    /// Run one installation against `config_path`, staging artifacts in
    /// `workspace`.
    ///
    /// # Errors
    /// [`InstallError::ConcurrentRun`] immediately when another run holds
    /// the lock; otherwise the first failing step.
    #[instrument(skip(self))]
    pub async fn install(&self, workspace: &Path, config_path: &Path) -> Result<(), InstallError> {
        let _lock = InstallLock::acquire(config_path).map_err(|e| match e {
            LockError::Contended(path) => {
                error!(lock = %path, "another run is in progress, aborting to prevent conflicts");
                InstallError::ConcurrentRun(path)
            }
            LockError::Io(e) => InstallError::Io(e),
        })?;

        info!(
            config = %config_path.display(),
            workspace = %workspace.display(),
            "starting installation"
        );

        self.install_locked(workspace, config_path).await
    }

    async fn install_locked(
        &self,
        workspace: &Path,
        config_path: &Path,
    ) -> Result<(), InstallError> {
        tokio::fs::create_dir_all(workspace).await?;

        // Keep an audit copy of the configuration beside the run artifacts
        let audit_copy = workspace.join("fleetmon.conf");
        tokio::fs::copy(config_path, &audit_copy).await?;

        let text = tokio::fs::read_to_string(config_path).await?;
        let topology = Topology::parse(&text)?;

        self.mount_and_install(workspace, &topology).await
    }

    async fn mount_and_install(
        &self,
        workspace: &Path,
        topology: &Topology,
    ) -> Result<(), InstallError> {
        let local = Host::new("local", "localhost", self.factory.local());

        let iso_path = match &topology.iso_path {
            Some(path) => path.clone(),
            None => {
                let found = discover_iso(&local).await?;
                info!(iso = %found.display(), "no [iso_path] configured, using medium from the working directory");
                found
            }
        };

        // Randomized so runs against different configurations never
        // collide on the mount point
        let mount_point = PathBuf::from(format!("/mnt/fleetmon-{}", random_suffix()));

        local
            .checked_run(&format!(
                "mkdir -p {0} && mount -o loop {1} {0}",
                mount_point.display(),
                iso_path.display()
            ))
            .await?;

        let result = self.install_mounted(workspace, topology, &mount_point).await;

        // Cleanup always runs. A failed unmount becomes the run's error;
        // a failed rmdir is only logged.
        let unmount = local
            .checked_run(&format!("umount {}", mount_point.display()))
            .await;

        match local.run(&format!("rmdir {}", mount_point.display())).await {
            Ok(r) if !r.success() => {
                warn!(mount = %mount_point.display(), stderr = %r.stderr, "failed to remove mount point");
            }
            Err(e) => {
                warn!(mount = %mount_point.display(), error = %e, "failed to remove mount point");
            }
            Ok(_) => {}
        }

        match (result, unmount) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(_)) => Ok(()),
        }
    }

    /// Install against an already-mounted medium.
    ///
    /// Separated from the mount handling so the whole sequencing is
    /// drivable against a staged media directory.
    ///
    /// # Errors
    /// The first failing step aborts the run; earlier remote state is
    /// not rolled back.
    pub async fn install_mounted(
        &self,
        workspace: &Path,
        topology: &Topology,
        media: &Path,
    ) -> Result<(), InstallError> {
        // Host handles; validation already guaranteed unique ids and
        // resolvable references
        let mut hosts: HashMap<&str, Host> = HashMap::new();
        for decl in &topology.ssh_hosts {
            let executor = self.factory.executor(decl)?;
            hosts.insert(
                decl.host_id.as_str(),
                Host::new(&decl.host_id, &decl.hostname, executor),
            );
        }

        let server_decl = &topology.server_host;
        let server_host = hosts
            .get(server_decl.host_id.as_str())
            .ok_or_else(|| ConfigError::UnknownHostId {
                role: "server",
                host_id: server_decl.host_id.clone(),
            })?
            .clone();

        let mut server = ServerAgent::new(
            server_host,
            workspace.to_path_buf(),
            Arc::clone(&self.stack),
        )?;

        let mut clients = Vec::new();
        for decl in &topology.client_hosts {
            let host = hosts
                .get(decl.host_id.as_str())
                .ok_or_else(|| ConfigError::UnknownHostId {
                    role: "client",
                    host_id: decl.host_id.clone(),
                })?
                .clone();

            let features = ClientFeatures::from_decl(decl);
            if topology.clients_reinstall {
                info!(
                    host = %host.hostname(),
                    plugins = %features.summary(),
                    "client will collect the configured metrics"
                );
            }

            clients.push(ClientAgent::new(
                host,
                workspace.to_path_buf(),
                server.hostname().to_string(),
                server.influx_client(),
                Arc::clone(&self.stack),
                &features,
            ));
        }

        // Pre-flight every host before mutating any of them
        server.check().await?;
        for client in &mut clients {
            client.check().await?;
        }

        if server_decl.reinstall {
            info!(
                erase = server_decl.erase_influxdb,
                drop = server_decl.drop_database,
                "installing server on [{}]",
                server.hostname()
            );
            server
                .reinstall(server_decl.erase_influxdb, server_decl.drop_database, media)
                .await?;
        } else {
            info!("server will not be reinstalled according to the configuration");
        }

        if topology.clients_reinstall {
            for client in &mut clients {
                // The server installation already staged the medium on
                // its own host
                let skip_copy =
                    server_decl.reinstall && client.hostname() == server.hostname();
                client.reinstall(media, skip_copy).await?;
            }
        } else {
            info!("clients will not be reinstalled, restarting agents instead");
            for client in &clients {
                client.restart_only().await?;
            }
        }

        info!("installation finished");
        Ok(())
    }
}

/// Look for a medium in the working directory
async fn discover_iso(local: &Host) -> Result<PathBuf, InstallError> {
    let result = local.run("ls fleetmon-*.iso").await?;
    if !result.success() {
        return Err(InstallError::MediaNotFound);
    }
    result
        .stdout
        .split_whitespace()
        .next()
        .map(PathBuf::from)
        .ok_or(InstallError::MediaNotFound)
}

fn random_suffix() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    suffix.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_suffix_shape() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(suffix, suffix.to_lowercase());
    }

    #[test]
    fn test_suffixes_differ() {
        assert_ne!(random_suffix(), random_suffix());
    }
}
