//! Grafana admin API client

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::error::{ClientError, Result};

/// Result of a reachability probe against the Grafana base URL.
///
/// `Unreachable` (transport failure) is retried by callers; `Degraded`
/// (connected, non-OK status) is a definitive answer and ends polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Could not connect at all
    Unreachable,
    /// Connected but the service answered with a non-OK status
    Degraded(u16),
    /// Connected and healthy
    Healthy,
}

/// Datasource registration payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    pub name: String,
    pub is_default: bool,
    pub r#type: String,
    pub url: String,
    pub access: String,
    pub database: String,
    pub basic_auth: bool,
}

impl Datasource {
    /// InfluxDB datasource in proxy mode, the only kind this stack uses
    #[must_use]
    pub fn influxdb(name: impl Into<String>, url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_default: true,
            r#type: "influxdb".to_string(),
            url: url.into(),
            access: "proxy".to_string(),
            database: database.into(),
            basic_auth: false,
        }
    }
}

/// Client for the Grafana admin API
#[derive(Debug, Clone)]
pub struct GrafanaClient {
    client: Client,
    base_url: Url,
    user: String,
    password: String,
}

impl GrafanaClient {
    /// Create a new client with the default admin credentials
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            client: Client::new(),
            base_url,
            user: "admin".to_string(),
            password: "admin".to_string(),
        })
    }

    /// Override the admin credentials
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(ClientError::Url)
    }

    /// Probe the base URL.
    ///
    /// Never fails: a transport error is `Unreachable`, a non-OK answer is
    /// `Degraded`. Callers poll on `Unreachable` only.
    pub async fn probe(&self) -> ProbeOutcome {
        let Ok(url) = self.url("/") else {
            return ProbeOutcome::Unreachable;
        };
        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await;

        match response {
            Err(e) => {
                debug!(url = %url, error = %e, "grafana not reachable");
                ProbeOutcome::Unreachable
            }
            Ok(r) if r.status() == StatusCode::OK => ProbeOutcome::Healthy,
            Ok(r) => {
                debug!(url = %url, status = r.status().as_u16(), "grafana reachable but not OK");
                ProbeOutcome::Degraded(r.status().as_u16())
            }
        }
    }

    /// Whether a datasource with this name exists
    ///
    /// # Errors
    /// Any status other than OK or NOT_FOUND is an API error.
    pub async fn datasource_exists(&self, name: &str) -> Result<bool> {
        let url = self.url(&format!("/api/datasources/name/{name}"))?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ClientError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Register a datasource
    ///
    /// # Errors
    /// Non-OK status is an API error.
    pub async fn create_datasource(&self, datasource: &Datasource) -> Result<()> {
        let url = self.url("/api/datasources")?;
        let response = self
            .client
            .post(url)
            .basic_auth(&self.user, Some(&self.password))
            .json(datasource)
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// Delete a datasource by name
    ///
    /// # Errors
    /// Non-OK status is an API error.
    pub async fn delete_datasource(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("/api/datasources/name/{name}"))?;
        let response = self
            .client
            .delete(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// Delete-if-present then create: the end state is exactly one
    /// datasource with this name, whatever was there before.
    ///
    /// # Errors
    /// Fails if any step fails.
    pub async fn replace_datasource(&self, datasource: &Datasource) -> Result<()> {
        if self.datasource_exists(&datasource.name).await? {
            self.delete_datasource(&datasource.name).await?;
        }
        self.create_datasource(datasource).await
    }

    /// Whether a dashboard with this title exists
    ///
    /// # Errors
    /// Any status other than OK or NOT_FOUND is an API error.
    pub async fn dashboard_exists(&self, name: &str) -> Result<bool> {
        let url = self.url(&format!("/api/dashboards/db/{}", slugify(name)))?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ClientError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Import a dashboard payload under the given title.
    ///
    /// # Errors
    /// Fails when the payload violates its structural invariants or the
    /// API answers non-OK.
    pub async fn create_dashboard(&self, name: &str, dashboard: &Value) -> Result<()> {
        check_dashboard(name, dashboard)?;

        let body = serde_json::json!({
            "dashboard": dashboard,
            "overwrite": false,
        });

        let url = self.url("/api/dashboards/db")?;
        let response = self
            .client
            .post(url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// Delete a dashboard by title
    ///
    /// # Errors
    /// Non-OK status is an API error.
    pub async fn delete_dashboard(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("/api/dashboards/db/{}", slugify(name)))?;
        let response = self
            .client
            .delete(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        self.expect_ok(response).await
    }

    /// Delete-if-present then create for dashboards.
    ///
    /// # Errors
    /// Fails if any step fails.
    pub async fn replace_dashboard(&self, name: &str, dashboard: &Value) -> Result<()> {
        if self.dashboard_exists(name).await? {
            self.delete_dashboard(name).await?;
        }
        self.create_dashboard(name, dashboard).await
    }

    async fn expect_ok(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), message = %message, "grafana API error");
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// Validate a dashboard payload before import: the internal id must be
/// unset (Grafana assigns it) and the title must equal the intended name.
///
/// # Errors
/// Returns `InvalidDashboard` naming the violated invariant.
pub fn check_dashboard(name: &str, dashboard: &Value) -> Result<()> {
    if let Some(id) = dashboard.get("id") {
        if !id.is_null() {
            return Err(ClientError::InvalidDashboard {
                name: name.to_string(),
                reason: format!("expected [id] to be [null], but got [{id}]"),
            });
        }
    }

    let title = dashboard.get("title").and_then(Value::as_str);
    if title != Some(name) {
        return Err(ClientError::InvalidDashboard {
            name: name.to_string(),
            reason: format!(
                "expected [title] to be [{name}], but got [{}]",
                title.unwrap_or("<missing>")
            ),
        });
    }

    Ok(())
}

/// Grafana's dashboard URL slug: lowercase ASCII alphanumerics with runs
/// of anything else collapsed into single dashes.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Cluster Status"), "cluster-status");
        assert_eq!(slugify("SFA Physical Disk"), "sfa-physical-disk");
        assert_eq!(slugify("  Lustre   Statistics "), "lustre-statistics");
    }

    #[test]
    fn test_check_dashboard_rejects_preset_id() {
        let dashboard = json!({"id": 7, "title": "Cluster Status"});
        let err = check_dashboard("Cluster Status", &dashboard).unwrap_err();
        assert!(matches!(err, ClientError::InvalidDashboard { .. }));
    }

    #[test]
    fn test_check_dashboard_rejects_title_mismatch() {
        let dashboard = json!({"id": null, "title": "Something Else"});
        let err = check_dashboard("Cluster Status", &dashboard).unwrap_err();
        assert!(matches!(err, ClientError::InvalidDashboard { .. }));
    }

    #[test]
    fn test_check_dashboard_accepts_valid() {
        let dashboard = json!({"id": null, "title": "Cluster Status"});
        check_dashboard("Cluster Status", &dashboard).unwrap();
    }

    #[tokio::test]
    async fn test_probe_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = GrafanaClient::new(server.uri()).unwrap();
        assert_eq!(client.probe().await, ProbeOutcome::Healthy);

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert_eq!(client.probe().await, ProbeOutcome::Degraded(503));

        // A port nothing listens on
        let gone = GrafanaClient::new("http://127.0.0.1:1").unwrap();
        assert_eq!(gone.probe().await, ProbeOutcome::Unreachable);
    }

    #[tokio::test]
    async fn test_replace_dashboard_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dashboards/db/cluster-status"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/dashboards/db"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GrafanaClient::new(server.uri()).unwrap();
        let dashboard = json!({"id": null, "title": "Cluster Status"});
        client
            .replace_dashboard("Cluster Status", &dashboard)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replace_dashboard_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dashboards/db/cluster-status"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/dashboards/db/cluster-status"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/dashboards/db"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GrafanaClient::new(server.uri()).unwrap();
        let dashboard = json!({"id": null, "title": "Cluster Status"});
        client
            .replace_dashboard("Cluster Status", &dashboard)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_datasource_replace_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/datasources/name/metrics_source"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/datasources"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GrafanaClient::new(server.uri()).unwrap();
        let datasource =
            Datasource::influxdb("metrics_source", "http://server1:8086", "metrics_db");
        client.replace_datasource(&datasource).await.unwrap();
    }
}
