//! Server role agent
//!
//! Owns the time-series database and the dashboard server on the
//! designated host: package lifecycle, firewall, database provisioning,
//! datasource/dashboard replacement and continuous-query installation.
//! Package handling for its own host goes through an embedded
//! [`ClientAgent`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use fleetmon_client::{Datasource, GrafanaClient, InfluxdbClient, ProbeOutcome};
use fleetmon_pkg::{Distro, PackageKind};

use crate::agent::client::{ClientAgent, ClientFeatures};
use crate::error::InstallError;
use crate::host::Host;
use crate::poll::wait_until;
use crate::stack::{CqSpec, Stack};

/// Agent owning the server host
pub struct ServerAgent {
    host: Host,
    stack: Arc<Stack>,
    grafana: GrafanaClient,
    influx: InfluxdbClient,
    /// Package operations on the server's own host
    client: ClientAgent,
}

impl ServerAgent {
    /// Create the agent and its service clients
    ///
    /// # Errors
    /// Fails when the service URLs cannot be built.
    pub fn new(host: Host, workspace: PathBuf, stack: Arc<Stack>) -> Result<Self, InstallError> {
        let grafana = GrafanaClient::new(stack.grafana_url(host.hostname()))?;
        let influx = InfluxdbClient::new(stack.influxdb_url(host.hostname()), &stack.database)?;

        let client = ClientAgent::new(
            host.clone(),
            workspace,
            host.hostname().to_string(),
            influx.clone(),
            Arc::clone(&stack),
            &ClientFeatures::default(),
        );

        Ok(Self {
            host,
            stack,
            grafana,
            influx,
            client,
        })
    }

    /// Network address of the server host
    #[must_use]
    pub fn hostname(&self) -> &str {
        self.host.hostname()
    }

    /// A store client for building client agents against this server
    #[must_use]
    pub fn influx_client(&self) -> InfluxdbClient {
        self.influx.clone()
    }

    /// Pre-flight: the server role requires a RHEL7 family host; the
    /// generic reachability check is delegated to the embedded client.
    ///
    /// # Errors
    /// [`InstallError::DistroGate`] on any other distribution.
    #[instrument(skip(self), fields(host = %self.host.hostname()))]
    pub async fn check(&mut self) -> Result<(), InstallError> {
        let distro = self.host.distro().await?;
        if distro != Distro::Rhel7 {
            return Err(InstallError::DistroGate {
                host: self.host.hostname().to_string(),
                distro: distro.to_string(),
            });
        }

        self.client.check().await
    }

    /// Full server installation
    ///
    /// # Errors
    /// Any step failure aborts the run; clients are never installed
    /// after a failed server installation.
    #[instrument(skip(self, mount), fields(host = %self.host.hostname()))]
    pub async fn reinstall(
        &mut self,
        erase_influxdb: bool,
        drop_database: bool,
        mount: &Path,
    ) -> Result<(), InstallError> {
        self.client.send_media(mount, false).await?;
        self.client
            .ensure_dependent(&self.stack.server_dependent_rpms)
            .await?;
        self.open_firewall_ports().await?;
        self.influxdb_reinstall(erase_influxdb, drop_database).await?;
        self.grafana_reinstall(mount).await?;
        self.provision_continuous_queries().await?;

        info!(host = %self.host.hostname(), "server installed");
        Ok(())
    }

    /// Open the stack's service ports, but only when a firewall is both
    /// installed and running (idempotent no-op otherwise).
    ///
    /// # Errors
    /// Fails when an add-port or reload command fails.
    pub async fn open_firewall_ports(&self) -> Result<(), InstallError> {
        if !self.host.rpm_installed("firewalld").await? {
            debug!(host = %self.host.hostname(), "firewalld not installed, skipping ports");
            return Ok(());
        }

        let state = self.host.run("firewall-cmd --state").await?;
        if !state.success() {
            debug!(host = %self.host.hostname(), "firewall not running, skipping ports");
            return Ok(());
        }

        for port in &self.stack.firewall_ports {
            self.host
                .checked_run(&format!(
                    "firewall-cmd --zone=public --add-port={port}/tcp --permanent"
                ))
                .await?;
        }
        self.host.checked_run("firewall-cmd --reload").await?;
        Ok(())
    }

    /// Remove an installed database package, waiting for the service to
    /// actually stop before erasing it.
    async fn influxdb_uninstall(&self) -> Result<(), InstallError> {
        if !self.host.rpm_installed("influxdb").await? {
            return Ok(());
        }

        self.host.service_stop("influxdb").await?;
        // sysv status exits 3 once the service is really down
        self.host
            .wait_command_status("service influxdb status", 3, self.stack.poll.service)
            .await?;
        self.host.checked_run("rpm -e --nodeps influxdb").await?;
        Ok(())
    }

    /// Database lifecycle: uninstall, optional data wipe, install, patch
    /// configuration, start, enable, (re)create the database.
    ///
    /// A requested drop uses the convergence loop (a create right after a
    /// drop is observed to need settling time); an opportunistic create
    /// without a preceding drop polls instead, and a create following a
    /// successful drop is a single confirmed call.
    ///
    /// # Errors
    /// Any step failure is fatal.
    #[instrument(skip(self), fields(host = %self.host.hostname()))]
    pub async fn influxdb_reinstall(
        &self,
        erase_influxdb: bool,
        drop_database: bool,
    ) -> Result<(), InstallError> {
        self.influxdb_uninstall().await?;

        if erase_influxdb {
            info!(host = %self.host.hostname(), "erasing time-series data");
            self.host
                .checked_run(&format!(
                    "rm {} -fr",
                    self.stack.influxdb_data_dir.display()
                ))
                .await?;
        }

        self.client.rpms()?.install(PackageKind::Server, "influxdb").await?;

        let diff = self.client.media_dir().join(&self.stack.influxdb_config_diff);
        self.host
            .checked_run(&format!(
                "patch -i {} {}",
                diff.display(),
                self.stack.influxdb_config_path.display()
            ))
            .await?;

        self.host.service_start("influxdb").await?;
        self.host
            .wait_command_status("service influxdb status", 0, self.stack.poll.service)
            .await?;
        self.host.service_enable("influxdb").await?;

        let create = format!("influx -execute \"CREATE DATABASE {}\"", self.stack.database);
        if drop_database {
            let drop = format!("influx -execute \"DROP DATABASE {}\"", self.stack.database);
            self.host
                .wait_command_status(&drop, 0, self.stack.poll.database)
                .await?;
            self.host.checked_run(&create).await?;
        } else {
            self.host
                .wait_command_status(&create, 0, self.stack.poll.database)
                .await?;
        }

        Ok(())
    }

    /// Dashboard server lifecycle: replace the package, wait for the API
    /// to come up, then idempotently replace datasource, dashboards,
    /// branding and the status-panel plugin.
    ///
    /// # Errors
    /// Any step failure is fatal; a reachable-but-unhealthy API is
    /// [`InstallError::GrafanaDegraded`].
    #[instrument(skip(self, mount), fields(host = %self.host.hostname()))]
    pub async fn grafana_reinstall(&self, mount: &Path) -> Result<(), InstallError> {
        if self.host.rpm_installed("grafana").await? {
            self.host.checked_run("rpm -e --nodeps grafana").await?;
        }
        self.client.rpms()?.install(PackageKind::Server, "grafana").await?;

        self.host.service_restart("grafana-server").await?;

        // Poll only while unreachable; once connected, the answer stands.
        let mut outcome = ProbeOutcome::Unreachable;
        let what = format!("grafana on host [{}]", self.host.hostname());
        wait_until(&what, self.stack.poll.grafana, async || {
            outcome = self.grafana.probe().await;
            outcome != ProbeOutcome::Unreachable
        })
        .await?;
        if let ProbeOutcome::Degraded(status) = outcome {
            return Err(InstallError::GrafanaDegraded(status));
        }

        self.host.service_enable("grafana-server").await?;

        let datasource = Datasource::influxdb(
            self.stack.datasource.clone(),
            self.stack.influxdb_url(self.host.hostname()),
            self.stack.database.clone(),
        );
        self.grafana.replace_datasource(&datasource).await?;

        for (title, fname) in &self.stack.dashboards {
            let path = mount.join("dashboards").join(fname);
            let text = tokio::fs::read_to_string(&path).await?;
            let dashboard: serde_json::Value = serde_json::from_str(&text)?;
            self.grafana.replace_dashboard(title, &dashboard).await?;
            debug!(dashboard = %title, "dashboard replaced");
        }

        for (asset, destination) in &self.stack.branding {
            self.host
                .checked_run(&format!(
                    "/bin/cp -f {}/{asset} {destination}",
                    self.client.media_dir().display()
                ))
                .await?;
        }

        // Full directory replace of the status-panel plugin
        let plugin_dir = self.stack.grafana_plugin_dir.join(&self.stack.status_panel);
        self.host
            .checked_run(&format!("rm -fr {}", plugin_dir.display()))
            .await?;
        self.host
            .checked_run(&format!(
                "cp -a {}/{} {}",
                self.client.media_dir().display(),
                self.stack.status_panel,
                self.stack.grafana_plugin_dir.display()
            ))
            .await?;

        Ok(())
    }

    /// Install every downsampling rule, replacing conflicting ones.
    ///
    /// # Errors
    /// A second creation failure after a drop is fatal.
    #[instrument(skip(self), fields(host = %self.host.hostname()))]
    pub async fn provision_continuous_queries(&self) -> Result<(), InstallError> {
        for rule in &self.stack.continuous_queries {
            self.create_or_replace_cq(rule).await?;
        }
        Ok(())
    }

    /// "Create or replace" for a query language that has no such verb:
    /// try create; on conflict drop the same-named query and retry
    /// create exactly once.
    async fn create_or_replace_cq(&self, rule: &CqSpec) -> Result<(), InstallError> {
        let cq_name = self.stack.cq_name(&rule.measurement);
        let target = self.stack.cq_measurement(&rule.measurement);
        let groups: Vec<&str> = rule.groups.iter().map(String::as_str).collect();

        let first = self
            .influx
            .create_continuous_query(&cq_name, &target, &rule.measurement, &groups, &rule.interval)
            .await;
        if first.is_ok() {
            return Ok(());
        }

        warn!(
            cq = %cq_name,
            "continuous query creation failed, dropping existing query and retrying"
        );
        self.influx.drop_continuous_query(&cq_name).await?;
        self.influx
            .create_continuous_query(&cq_name, &target, &rule.measurement, &groups, &rule.interval)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ServerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAgent")
            .field("host", &self.host)
            .field("database", &self.stack.database)
            .finish_non_exhaustive()
    }
}
