//! fleetmon-client: HTTP clients for the monitoring stack
//!
//! Typed clients for the two services the installer provisions: the
//! Grafana admin API (datasources, dashboards, health) and the InfluxDB
//! query endpoint (continuous queries, measurement freshness).
//!
//! # Examples
//!
//! ```no_run
//! use fleetmon_client::{GrafanaClient, InfluxdbClient, ProbeOutcome};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let grafana = GrafanaClient::new("http://server1:3000")?;
//! match grafana.probe().await {
//!     ProbeOutcome::Healthy => {}
//!     ProbeOutcome::Degraded(status) => eprintln!("up but unhealthy: {status}"),
//!     ProbeOutcome::Unreachable => eprintln!("not reachable yet"),
//! }
//!
//! let influx = InfluxdbClient::new("http://server1:8086", "metrics_db")?;
//! let ts = influx.last_datapoint("memory", "client1.example.com").await?;
//! println!("latest memory datapoint at {ts}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod grafana;
pub mod influxdb;

pub use error::{ClientError, Result};
pub use grafana::{Datasource, GrafanaClient, ProbeOutcome};
pub use influxdb::InfluxdbClient;
