//! InfluxDB query-endpoint client

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::error::{ClientError, Result};

/// Client bound to one InfluxDB instance and one database
#[derive(Debug, Clone)]
pub struct InfluxdbClient {
    client: Client,
    base_url: Url,
    database: String,
}

impl InfluxdbClient {
    /// Create a client for the given endpoint and database
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn new(base_url: impl AsRef<str>, database: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            client: Client::new(),
            base_url,
            database: database.into(),
        })
    }

    /// Database this client is bound to
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Submit a query, optionally requesting timestamps in the given
    /// epoch precision ("s", "ms", ...).
    ///
    /// # Errors
    /// Non-OK status or transport failure is an error.
    pub async fn query(&self, query: &str, epoch: Option<&str>) -> Result<Value> {
        let mut url = self.base_url.join("/query")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("db", &self.database);
            pairs.append_pair("q", query);
            if let Some(epoch) = epoch {
                pairs.append_pair("epoch", epoch);
            }
        }

        debug!(query = %query, "submitting InfluxDB query");

        let response = self.client.post(url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), query = %query, message = %message, "InfluxDB query failed");
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    /// Install a continuous query downsampling `source` into `target`.
    ///
    /// # Errors
    /// Fails on non-OK status; the caller owns the drop-and-retry
    /// protocol for conflicting names.
    pub async fn create_continuous_query(
        &self,
        cq_name: &str,
        target: &str,
        source: &str,
        groups: &[&str],
        interval: &str,
    ) -> Result<()> {
        let query = build_continuous_query(&self.database, cq_name, target, source, groups, interval);
        self.query(&query, None).await?;
        Ok(())
    }

    /// Drop a continuous query by name
    ///
    /// # Errors
    /// Fails on non-OK status.
    pub async fn drop_continuous_query(&self, cq_name: &str) -> Result<()> {
        let query = format!("DROP CONTINUOUS QUERY {} ON \"{}\";", cq_name, self.database);
        self.query(&query, None).await?;
        Ok(())
    }

    /// Timestamp (epoch seconds) of the most recent datapoint of
    /// `measurement` tagged with `fqdn`.
    ///
    /// # Errors
    /// Fails when the query fails or the response does not carry exactly
    /// one series with exactly one row.
    pub async fn last_datapoint(&self, measurement: &str, fqdn: &str) -> Result<i64> {
        let query = format!(
            "SELECT * FROM \"{measurement}\" WHERE fqdn = '{fqdn}' ORDER BY time DESC LIMIT 1;"
        );
        let data = self.query(&query, Some("s")).await?;
        extract_timestamp(&data)
    }
}

/// Render the CREATE CONTINUOUS QUERY statement
#[must_use]
pub fn build_continuous_query(
    database: &str,
    cq_name: &str,
    target: &str,
    source: &str,
    groups: &[&str],
    interval: &str,
) -> String {
    let mut group_string = String::new();
    for group in groups {
        group_string.push_str(&format!(", \"{group}\""));
    }
    format!(
        "CREATE CONTINUOUS QUERY {cq_name} ON \"{database}\"\n\
         \x20 BEGIN SELECT sum(\"value\") INTO \"{target}\" \
         FROM \"{source}\" GROUP BY time({interval}){group_string}\n\
         END;"
    )
}

/// Pull the single `time` value out of a freshness-query response.
///
/// The response must contain exactly one result with exactly one series,
/// a `columns` list including `time`, and exactly one row; anything else
/// is an [`ClientError::UnexpectedShape`] error.
pub fn extract_timestamp(data: &Value) -> Result<i64> {
    let results = data
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| shape_error("no [results] array", data))?;
    if results.len() != 1 {
        return Err(shape_error("[results] is not a one-element array", data));
    }

    let series = results[0]
        .get("series")
        .and_then(Value::as_array)
        .ok_or_else(|| shape_error("no [series] in the result", data))?;
    if series.len() != 1 {
        return Err(shape_error("[series] is not a one-element array", data));
    }

    let columns = series[0]
        .get("columns")
        .and_then(Value::as_array)
        .ok_or_else(|| shape_error("no [columns] in the series", data))?;
    let time_index = columns
        .iter()
        .position(|c| c.as_str() == Some("time"))
        .ok_or_else(|| shape_error("no [time] in the columns", data))?;

    let values = series[0]
        .get("values")
        .and_then(Value::as_array)
        .ok_or_else(|| shape_error("no [values] in the series", data))?;
    if values.len() != 1 {
        return Err(shape_error("[values] is not a one-element array", data));
    }

    values[0]
        .get(time_index)
        .and_then(Value::as_i64)
        .ok_or_else(|| shape_error("[time] value is not an integer", data))
}

fn shape_error(reason: &str, data: &Value) -> ClientError {
    ClientError::UnexpectedShape(format!("{reason} in [{data}]"))
}
