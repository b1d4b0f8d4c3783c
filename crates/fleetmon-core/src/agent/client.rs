//! Client role agent
//!
//! Owns one host's collectd deployment: media delivery, package
//! replacement, the two-phase configuration rollout and data-freshness
//! verification against the server's time-series store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use fleetmon_client::InfluxdbClient;
use fleetmon_pkg::{Distro, PackageKind, RpmTree};

use crate::collectd::{
    CONFIG_FINAL_FNAME, CONFIG_TEST_FNAME, CollectdConfig, INTERVAL_FINAL, INTERVAL_TEST,
};
use crate::config::ClientDecl;
use crate::error::InstallError;
use crate::host::Host;
use crate::poll::wait_until;
use crate::stack::Stack;

/// Feature flags selecting the optional collection plugins
#[derive(Debug, Clone, Default)]
pub struct ClientFeatures {
    /// Lustre object-storage role
    pub lustre_oss: bool,
    /// Lustre metadata role
    pub lustre_mds: bool,
    /// Accelerator layer
    pub ime: bool,
    /// High-speed fabric
    pub infiniband: bool,
    /// Storage arrays polled from this host
    pub sfas: Vec<crate::config::SfaDecl>,
}

impl ClientFeatures {
    /// Features selected by a client declaration
    #[must_use]
    pub fn from_decl(decl: &ClientDecl) -> Self {
        Self {
            lustre_oss: decl.lustre_oss,
            lustre_mds: decl.lustre_mds,
            ime: decl.ime,
            infiniband: decl.infiniband,
            sfas: decl.sfas.clone(),
        }
    }

    /// Human-readable plugin summary for the run log
    #[must_use]
    pub fn summary(&self) -> String {
        let mut enabled = String::from("memory, CPU, df(/), load, sensors, disk, uptime, users");
        if self.lustre_oss {
            enabled.push_str(", Lustre OSS");
        }
        if self.lustre_mds {
            enabled.push_str(", Lustre MDS");
        }
        if self.ime {
            enabled.push_str(", IME");
        }
        if self.infiniband {
            enabled.push_str(", IB");
        }
        if !self.sfas.is_empty() {
            enabled.push_str(", SFA");
        }
        enabled
    }

    fn build_config(&self, interval: u64, server_hostname: &str) -> CollectdConfig {
        let mut config = CollectdConfig::new(interval, server_hostname);
        if self.lustre_oss || self.lustre_mds {
            config.enable_lustre(self.lustre_oss, self.lustre_mds);
        }
        if self.ime {
            config.enable_ime();
        }
        for sfa in &self.sfas {
            config.enable_sfa(sfa);
        }
        if self.infiniband {
            config.enable_infiniband();
        }
        config
    }
}

/// Which of the two configurations to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPhase {
    /// Short-interval configuration used during verification
    Test,
    /// Long-interval configuration left in place
    Final,
}

/// Agent owning one client host
pub struct ClientAgent {
    host: Host,
    /// Local audit directory and remote staging directory (same path on
    /// both sides; the directory name carries the run timestamp)
    workspace: PathBuf,
    server_hostname: String,
    influx: InfluxdbClient,
    stack: Arc<Stack>,
    config_test: CollectdConfig,
    config_final: CollectdConfig,
    distro: Option<Distro>,
    rpms: Option<RpmTree>,
    /// Last timestamp observed per measurement during verification
    last_seen: HashMap<String, i64>,
}

impl ClientAgent {
    /// Create the agent; configurations are fixed from here on.
    pub fn new(
        host: Host,
        workspace: PathBuf,
        server_hostname: impl Into<String>,
        influx: InfluxdbClient,
        stack: Arc<Stack>,
        features: &ClientFeatures,
    ) -> Self {
        let server_hostname = server_hostname.into();
        let config_test = features.build_config(INTERVAL_TEST, &server_hostname);
        let config_final = features.build_config(INTERVAL_FINAL, &server_hostname);

        Self {
            host,
            workspace,
            server_hostname,
            influx,
            stack,
            config_test,
            config_final,
            distro: None,
            rpms: None,
            last_seen: HashMap::new(),
        }
    }

    /// Host this agent manages
    #[must_use]
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Network address of the managed host
    #[must_use]
    pub fn hostname(&self) -> &str {
        self.host.hostname()
    }

    /// Media directory on the managed host
    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.workspace.join("ISO")
    }

    /// Pre-flight: the host must reach the server and run a supported
    /// distribution. Finds problems before any mutation happens.
    ///
    /// # Errors
    /// A failed ping or an unsupported distro fails the whole run.
    #[instrument(skip(self), fields(host = %self.host.hostname()))]
    pub async fn check(&mut self) -> Result<(), InstallError> {
        self.host.ping(&self.server_hostname).await?;
        let distro = self.host.distro().await?;
        debug!(host = %self.host.hostname(), distro = %distro, "pre-flight check passed");
        self.distro = Some(distro);
        Ok(())
    }

    /// Deliver the installation medium and cache its package listings.
    ///
    /// With `skip_copy` the transfer is skipped (the medium is already in
    /// place from the server installation on the same host); the
    /// listings are still scanned.
    ///
    /// # Errors
    /// Fails on transfer or listing errors, or when [`Self::check`] has
    /// not run.
    #[instrument(skip(self, mount), fields(host = %self.host.hostname()))]
    pub async fn send_media(&mut self, mount: &Path, skip_copy: bool) -> Result<(), InstallError> {
        let distro = self
            .distro
            .ok_or_else(|| InstallError::MediaNotPrepared(self.host.hostname().to_string()))?;

        if skip_copy {
            debug!(host = %self.host.hostname(), "medium already delivered, skipping transfer");
        } else {
            self.host
                .checked_run(&format!("mkdir -p {}", self.workspace.display()))
                .await?;
            self.host.send_tree(mount, &self.workspace).await?;

            // The mount point name is randomized; normalize it to ISO/
            let base = mount
                .file_name()
                .map(|b| b.to_string_lossy().to_string())
                .unwrap_or_default();
            self.host
                .checked_run(&format!(
                    "cd {} && mv {base} ISO",
                    self.workspace.display()
                ))
                .await?;
        }

        let mut rpms = RpmTree::new(
            self.host.executor(),
            self.host.hostname(),
            self.media_dir(),
            distro,
        );
        rpms.scan().await?;
        self.rpms = Some(rpms);
        Ok(())
    }

    /// Cached package listings
    ///
    /// # Errors
    /// Fails when the medium has not been delivered yet.
    pub fn rpms(&self) -> Result<&RpmTree, InstallError> {
        self.rpms
            .as_ref()
            .ok_or_else(|| InstallError::MediaNotPrepared(self.host.hostname().to_string()))
    }

    /// Install the named dependent packages, skipping those already
    /// present.
    ///
    /// # Errors
    /// A missing package file is fatal.
    pub async fn ensure_dependent(&self, names: &[String]) -> Result<(), InstallError> {
        let rpms = self.rpms()?;
        for name in names {
            if self.host.rpm_installed(name).await? {
                continue;
            }
            rpms.install(PackageKind::Dependent, name).await?;
        }
        Ok(())
    }

    /// Install the client's dependent packages.
    ///
    /// lm_sensors-libs may be present in a version the bundled
    /// lm_sensors conflicts with; remove it first when lm_sensors itself
    /// is absent.
    ///
    /// # Errors
    /// A missing package file is fatal.
    async fn install_dependencies(&self) -> Result<(), InstallError> {
        if !self.host.rpm_installed("lm_sensors").await?
            && self.host.rpm_installed("lm_sensors-libs").await?
        {
            self.host
                .checked_run("rpm -e lm_sensors-libs --nodeps")
                .await?;
        }

        self.ensure_dependent(&self.stack.client_dependent_rpms)
            .await
    }

    /// Wipe and reinstall the collectd package set.
    ///
    /// The unconditional uninstall guarantees no stale version lingers;
    /// a missing bundle package is a fatal error, not a skip.
    ///
    /// # Errors
    /// Fails on any package or command error.
    #[instrument(skip(self), fields(host = %self.host.hostname()))]
    pub async fn replace_collectd(&self) -> Result<(), InstallError> {
        self.install_dependencies().await?;

        let rpms = self.rpms()?;
        rpms.uninstall_matching("collectd").await?;
        rpms.install(PackageKind::Collectd, "libcollectdclient").await?;
        rpms.install(PackageKind::Collectd, "collectd").await?;
        rpms.reinstall(PackageKind::Xml, "xml_definition").await?;

        Ok(())
    }

    async fn push_config(&self, phase: ConfigPhase) -> Result<(), InstallError> {
        let (config, fname) = match phase {
            ConfigPhase::Test => (&self.config_test, CONFIG_TEST_FNAME),
            ConfigPhase::Final => (&self.config_final, CONFIG_FINAL_FNAME),
        };

        // Keep the rendered file in the workspace for audit, then push it
        let local = self
            .workspace
            .join(format!("{fname}.{}", self.host.hostname()));
        tokio::fs::create_dir_all(&self.workspace).await?;
        tokio::fs::write(&local, config.render()).await?;

        self.host
            .send_file(&local, &self.stack.collectd_config_path)
            .await?;
        debug!(host = %self.host.hostname(), phase = ?phase, "configuration delivered");
        Ok(())
    }

    /// Start collectd and make sure it stayed up.
    ///
    /// A start can report success while the service is already dead
    /// again, so the live status is queried explicitly.
    ///
    /// # Errors
    /// Fails when the service is not running after the start.
    pub async fn start_collectd(&self) -> Result<(), InstallError> {
        self.host.service_start("collectd").await?;
        self.host.checked_run("service collectd status").await?;
        self.host.service_enable("collectd").await?;
        Ok(())
    }

    /// Restart collectd
    ///
    /// # Errors
    /// Fails when the init system reports failure.
    pub async fn restart_collectd(&self) -> Result<(), InstallError> {
        self.host.service_restart("collectd").await
    }

    /// Poll the server's store until every expected measurement shows a
    /// fresh datapoint tagged with this host.
    ///
    /// Fresh means: first-ever observation, or a timestamp strictly
    /// greater than the last observed one. An unreachable store counts
    /// as not-ready and is retried until the deadline.
    ///
    /// # Errors
    /// [`InstallError::NoDataReceived`] for the first measurement whose
    /// deadline elapses.
    #[instrument(skip(self), fields(host = %self.host.hostname()))]
    pub async fn verify(&mut self) -> Result<(), InstallError> {
        let measurements = self.config_test.checks().to_vec();
        for measurement in measurements {
            let what = format!(
                "datapoint of [{measurement}] from host [{}]",
                self.host.hostname()
            );
            let hostname = self.host.hostname().to_string();
            let influx = &self.influx;
            let last_seen = &mut self.last_seen;

            let waited = wait_until(&what, self.stack.poll.data, async || {
                match influx.last_datapoint(&measurement, &hostname).await {
                    Ok(timestamp) => match last_seen.get(&measurement) {
                        None => {
                            last_seen.insert(measurement.clone(), timestamp);
                            true
                        }
                        Some(&previous) if timestamp > previous => {
                            last_seen.insert(measurement.clone(), timestamp);
                            true
                        }
                        Some(_) => {
                            debug!(
                                measurement = %measurement,
                                timestamp,
                                "timestamp not advancing yet"
                            );
                            false
                        }
                    },
                    Err(e) => {
                        debug!(measurement = %measurement, error = %e, "store not answering yet");
                        false
                    }
                }
            })
            .await;

            if waited.is_err() {
                return Err(InstallError::NoDataReceived {
                    host: self.host.hostname().to_string(),
                    measurement,
                });
            }
            info!(host = %self.host.hostname(), measurement = %measurement, "datapoint observed");
        }
        Ok(())
    }

    /// Full two-phase reinstall of this client.
    ///
    /// # Errors
    /// Any phase failure aborts this host and, upward, the whole run.
    #[instrument(skip(self, mount), fields(host = %self.host.hostname()))]
    pub async fn reinstall(&mut self, mount: &Path, skip_copy: bool) -> Result<(), InstallError> {
        self.send_media(mount, skip_copy).await?;
        self.host.disable_selinux().await?;
        self.replace_collectd().await?;
        self.push_config(ConfigPhase::Test).await?;
        self.start_collectd().await?;
        self.verify().await?;
        self.push_config(ConfigPhase::Final).await?;
        self.restart_collectd().await?;

        info!(host = %self.host.hostname(), "client installed and verified");
        Ok(())
    }

    /// Restart the already-installed agent without touching anything else
    ///
    /// # Errors
    /// Fails when the init system reports failure.
    pub async fn restart_only(&self) -> Result<(), InstallError> {
        self.restart_collectd().await
    }
}

impl std::fmt::Debug for ClientAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAgent")
            .field("host", &self.host)
            .field("workspace", &self.workspace)
            .field("server", &self.server_hostname)
            .field("prepared", &self.rpms.is_some())
            .finish_non_exhaustive()
    }
}
