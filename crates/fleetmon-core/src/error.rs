//! Run-level error type

use thiserror::Error;

use crate::config::ConfigError;
use crate::poll::PollTimeout;

/// Errors that abort an installation run
#[derive(Error, Debug)]
pub enum InstallError {
    /// Another run holds the lock for this configuration file
    #[error("another installation already holds the lock on [{0}]")]
    ConcurrentRun(String),

    /// Invalid declarative configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local I/O error (workspace, audit copy, dashboard payloads)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid YAML
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Dashboard payload is not valid JSON
    #[error("failed to parse dashboard payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level execution failure
    #[error(transparent)]
    Exec(#[from] fleetmon_exec::ExecError),

    /// Package resolution or rpm failure
    #[error(transparent)]
    Package(#[from] fleetmon_pkg::PackageError),

    /// Grafana / InfluxDB API failure
    #[error(transparent)]
    Client(#[from] fleetmon_client::ClientError),

    /// A remote command exited non-zero
    #[error("command [{command}] on host [{host}] failed with status {status}")]
    CommandFailed {
        /// Host the command ran on
        host: String,
        /// The command line
        command: String,
        /// Exit status
        status: i32,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// A bounded poll ran out of time
    #[error(transparent)]
    Timeout(#[from] PollTimeout),

    /// No installation medium configured or discoverable
    #[error("no installation medium configured and none found in the working directory")]
    MediaNotFound,

    /// A package operation was attempted before the media was delivered
    #[error("installation medium on host [{0}] has not been prepared")]
    MediaNotPrepared(String),

    /// The server host runs an unsupported distribution
    #[error("host [{host}] runs [{distro}], the server role requires a RHEL7 family host")]
    DistroGate {
        /// Offending host
        host: String,
        /// Detected distribution
        distro: String,
    },

    /// Grafana answered the probe but is unhealthy
    #[error("grafana is reachable but unhealthy (status {0})")]
    GrafanaDegraded(u16),

    /// Data-freshness verification never saw a datapoint advance
    #[error("no data received from host [{host}] for measurement [{measurement}]")]
    NoDataReceived {
        /// Monitored host
        host: String,
        /// Measurement that stayed silent
        measurement: String,
    },
}
