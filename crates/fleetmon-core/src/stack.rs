//! Fixed names, paths, ports and tunables of the deployed stack
//!
//! All well-known constants live in one injected [`Stack`] value instead
//! of module globals, so tests (and forks of the stack) can substitute
//! alternate names and fast polling profiles.

use std::path::PathBuf;
use std::time::Duration;

use crate::poll::Retry;

/// A server-side downsampling rule
#[derive(Debug, Clone)]
pub struct CqSpec {
    /// Source measurement
    pub measurement: String,
    /// Tags to group by
    pub groups: Vec<String>,
    /// Aggregation window
    pub interval: String,
}

impl CqSpec {
    fn new(measurement: &str, groups: &[&str], interval: &str) -> Self {
        Self {
            measurement: measurement.to_string(),
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            interval: interval.to_string(),
        }
    }
}

/// Polling profiles for the different readiness checks
#[derive(Debug, Clone, Copy)]
pub struct PollTunables {
    /// Service active/stopped after start/stop
    pub service: Retry,
    /// Grafana reachability after restart
    pub grafana: Retry,
    /// Database commands right after destructive operations
    pub database: Retry,
    /// Measurement freshness during client verification
    pub data: Retry,
}

impl Default for PollTunables {
    fn default() -> Self {
        let second = Duration::from_secs(1);
        Self {
            service: Retry::new(second, Duration::from_secs(90)),
            grafana: Retry::new(second, Duration::from_secs(60)),
            database: Retry::new(second, Duration::from_secs(60)),
            data: Retry::new(second, Duration::from_secs(90)),
        }
    }
}

/// Well-known names and locations of the monitoring stack
#[derive(Debug, Clone)]
pub struct Stack {
    /// InfluxDB database all agents write into
    pub database: String,
    /// Grafana datasource name pointing at that database
    pub datasource: String,
    /// Grafana HTTP port
    pub grafana_port: u16,
    /// InfluxDB HTTP port
    pub influxdb_port: u16,
    /// TCP ports opened in the server firewall
    pub firewall_ports: Vec<u16>,
    /// Continuous query name prefix
    pub cq_prefix: String,
    /// Downsampled measurement name prefix
    pub cq_measurement_prefix: String,
    /// Downsampling rules installed on the server
    pub continuous_queries: Vec<CqSpec>,
    /// Dashboard title -> payload file under `dashboards/` on the medium
    pub dashboards: Vec<(String, String)>,
    /// Branding assets on the medium -> destination under the Grafana
    /// public image directory
    pub branding: Vec<(String, String)>,
    /// Status-panel plugin directory name on the medium
    pub status_panel: String,
    /// Grafana plugin directory on the server
    pub grafana_plugin_dir: PathBuf,
    /// Agent configuration target path on every client
    pub collectd_config_path: PathBuf,
    /// InfluxDB configuration file patched after install
    pub influxdb_config_path: PathBuf,
    /// Name of the configuration patch at the media root
    pub influxdb_config_diff: String,
    /// On-disk data directory wiped by `erase_influxdb`
    pub influxdb_data_dir: PathBuf,
    /// Dependent packages required on every client
    pub client_dependent_rpms: Vec<String>,
    /// Dependent packages required on the server
    pub server_dependent_rpms: Vec<String>,
    /// Polling profiles
    pub poll: PollTunables,
}

impl Stack {
    /// Grafana base URL on the given server host
    #[must_use]
    pub fn grafana_url(&self, hostname: &str) -> String {
        format!("http://{hostname}:{}", self.grafana_port)
    }

    /// InfluxDB base URL on the given server host
    #[must_use]
    pub fn influxdb_url(&self, hostname: &str) -> String {
        format!("http://{hostname}:{}", self.influxdb_port)
    }

    /// Continuous query name for a measurement
    #[must_use]
    pub fn cq_name(&self, measurement: &str) -> String {
        format!("{}{measurement}", self.cq_prefix)
    }

    /// Downsampled measurement name for a measurement
    #[must_use]
    pub fn cq_measurement(&self, measurement: &str) -> String {
        format!("{}{measurement}", self.cq_measurement_prefix)
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self {
            database: "esmon_database".to_string(),
            datasource: "esmon_datasource".to_string(),
            grafana_port: 3000,
            influxdb_port: 8086,
            firewall_ports: vec![3000, 4242, 8086, 8088, 25826],
            cq_prefix: "cq_".to_string(),
            cq_measurement_prefix: "cqm_".to_string(),
            continuous_queries: vec![
                CqSpec::new("mdt_jobstats_samples", &["job_id", "optype", "fs_name"], "1m"),
                CqSpec::new("ost_jobstats_samples", &["job_id", "optype", "fs_name"], "1m"),
                CqSpec::new(
                    "ost_brw_stats_rpc_bulk_samples",
                    &["size", "field", "fs_name"],
                    "1m",
                ),
                CqSpec::new("ost_stats_bytes", &["optype", "fs_name"], "1m"),
                CqSpec::new("md_stats", &["optype", "fs_name"], "1m"),
                CqSpec::new("mdt_acctuser_samples", &["user_id", "optype", "fs_name"], "1m"),
                CqSpec::new("ost_acctuser_samples", &["user_id", "optype", "fs_name"], "1m"),
                CqSpec::new("ost_kbytesinfo_used", &["user_id", "optype", "fs_name"], "10m"),
            ],
            dashboards: vec![
                ("Cluster Status".to_string(), "cluster_status.json".to_string()),
                (
                    "Lustre Statistics".to_string(),
                    "lustre_statistics.json".to_string(),
                ),
                (
                    "Server Statistics".to_string(),
                    "server_statistics.json".to_string(),
                ),
                (
                    "SFA Physical Disk".to_string(),
                    "SFA_physical_disk.json".to_string(),
                ),
                (
                    "SFA Virtual Disk".to_string(),
                    "SFA_virtual_disk.json".to_string(),
                ),
            ],
            branding: vec![
                (
                    "fleetmon-logo.svg".to_string(),
                    "/usr/share/grafana/public/img/grafana_icon.svg".to_string(),
                ),
                (
                    "fleetmon-logo.png".to_string(),
                    "/usr/share/grafana/public/img/fav32.png".to_string(),
                ),
            ],
            status_panel: "Grafana_Status_panel".to_string(),
            grafana_plugin_dir: PathBuf::from("/var/lib/grafana/plugins"),
            collectd_config_path: PathBuf::from("/etc/collectd.conf"),
            influxdb_config_path: PathBuf::from("/etc/influxdb/influxdb.conf"),
            influxdb_config_diff: "influxdb.conf.diff".to_string(),
            influxdb_data_dir: PathBuf::from("/var/lib/influxdb"),
            client_dependent_rpms: vec![
                "yajl".to_string(),
                "lm_sensors-libs".to_string(),
                "zeromq3".to_string(),
            ],
            server_dependent_rpms: vec!["yajl".to_string(), "zeromq3".to_string()],
            poll: PollTunables::default(),
        }
    }
}
