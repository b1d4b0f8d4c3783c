//! Declarative topology
//!
//! The YAML input names every reachable host once under `ssh_hosts` and
//! then assigns roles by host id: exactly one `server_host` and any
//! number of `client_hosts`. Parsing is serde; everything serde cannot
//! express (uniqueness, cross-references) happens in [`Topology::validate`]
//! before any executor is constructed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Two ssh_hosts entries share an id
    #[error("multiple SSH hosts with the same ID [{0}]")]
    DuplicateHostId(String),

    /// Two client_hosts entries share an id
    #[error("multiple client hosts with the same ID [{0}]")]
    DuplicateClientId(String),

    /// A role references an undeclared host
    #[error("{role} host with ID [{host_id}] is not declared in [ssh_hosts]")]
    UnknownHostId {
        /// "server" or "client"
        role: &'static str,
        /// The dangling reference
        host_id: String,
    },

    /// Two storage arrays on one client share a name
    #[error("multiple SFAs with the same name [{0}]")]
    DuplicateSfaName(String),

    /// A controller address appears in more than one array
    #[error("multiple SFAs with the same controller host [{0}]")]
    DuplicateControllerHost(String),
}

/// One reachable machine
#[derive(Debug, Clone, Deserialize)]
pub struct SshHostDecl {
    /// Unique identifier referenced by the role sections
    pub host_id: String,
    /// Network address
    pub hostname: String,
    /// Optional SSH identity file
    #[serde(default)]
    pub ssh_identity_file: Option<PathBuf>,
}

/// The server role declaration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDecl {
    /// Which ssh_hosts entry carries the server
    pub host_id: String,
    /// Wipe the on-disk time-series data before reinstalling
    #[serde(default)]
    pub erase_influxdb: bool,
    /// Drop the database before recreating it
    #[serde(default)]
    pub drop_database: bool,
    /// Whether to (re)install the server at all
    #[serde(default = "default_true")]
    pub reinstall: bool,
}

/// A storage-array descriptor monitored from a client
#[derive(Debug, Clone, Deserialize)]
pub struct SfaDecl {
    /// Array name, unique per client
    pub name: String,
    /// First controller address
    pub controller0_host: String,
    /// Second controller address
    pub controller1_host: String,
}

/// A client role declaration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientDecl {
    /// Which ssh_hosts entry carries this client
    pub host_id: String,
    /// Host serves Lustre object storage targets
    #[serde(default)]
    pub lustre_oss: bool,
    /// Host serves Lustre metadata targets
    #[serde(default)]
    pub lustre_mds: bool,
    /// Host runs the accelerator layer
    #[serde(default)]
    pub ime: bool,
    /// Host has a high-speed fabric to monitor
    #[serde(default)]
    pub infiniband: bool,
    /// Storage arrays polled from this host
    #[serde(default)]
    pub sfas: Vec<SfaDecl>,
    /// Accepted per-client; the run-level `clients_reinstall` governs
    #[serde(default = "default_true")]
    pub reinstall: bool,
}

/// The parsed declarative input
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    /// Every reachable machine
    pub ssh_hosts: Vec<SshHostDecl>,
    /// The server role
    pub server_host: ServerDecl,
    /// The client roles
    pub client_hosts: Vec<ClientDecl>,
    /// Reinstall clients (false: restart the agents only)
    #[serde(default = "default_true")]
    pub clients_reinstall: bool,
    /// Installation medium; auto-discovered in the working directory when
    /// absent
    #[serde(default)]
    pub iso_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Topology {
    /// Parse a topology from YAML text
    ///
    /// # Errors
    /// Missing required keys (`ssh_hosts`, `server_host`, `client_hosts`,
    /// per-entry ids and addresses) surface as YAML errors; invariant
    /// violations as [`ConfigError`].
    pub fn parse(text: &str) -> Result<Self, crate::error::InstallError> {
        let topology: Topology = serde_yaml::from_str(text)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Load and validate a topology from a file
    ///
    /// # Errors
    /// See [`Topology::parse`].
    pub fn load(path: &Path) -> Result<Self, crate::error::InstallError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Check every invariant that serde cannot express.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut host_ids = HashSet::new();
        for host in &self.ssh_hosts {
            if !host_ids.insert(host.host_id.as_str()) {
                return Err(ConfigError::DuplicateHostId(host.host_id.clone()));
            }
        }

        if !host_ids.contains(self.server_host.host_id.as_str()) {
            return Err(ConfigError::UnknownHostId {
                role: "server",
                host_id: self.server_host.host_id.clone(),
            });
        }

        let mut client_ids = HashSet::new();
        let mut controller_hosts = HashSet::new();
        for client in &self.client_hosts {
            if !client_ids.insert(client.host_id.as_str()) {
                return Err(ConfigError::DuplicateClientId(client.host_id.clone()));
            }
            if !host_ids.contains(client.host_id.as_str()) {
                return Err(ConfigError::UnknownHostId {
                    role: "client",
                    host_id: client.host_id.clone(),
                });
            }

            let mut sfa_names = HashSet::new();
            for sfa in &client.sfas {
                if !sfa_names.insert(sfa.name.as_str()) {
                    return Err(ConfigError::DuplicateSfaName(sfa.name.clone()));
                }
                for controller in [&sfa.controller0_host, &sfa.controller1_host] {
                    if !controller_hosts.insert(controller.as_str()) {
                        return Err(ConfigError::DuplicateControllerHost(controller.clone()));
                    }
                }
            }
        }

        Ok(())
    }

    /// Find a host declaration by id; validation guarantees presence for
    /// every role reference.
    #[must_use]
    pub fn ssh_host(&self, host_id: &str) -> Option<&SshHostDecl> {
        self.ssh_hosts.iter().find(|h| h.host_id == host_id)
    }
}
