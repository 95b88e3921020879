//! HTTP client for probing a running monitor

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

/// Client for a monitor's unauthenticated endpoints
pub struct MonitorClient {
    client: Client,
    base_url: Url,
}

/// Outcome of a health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub url: String,
    pub status_code: u16,
    pub body: String,
    pub latency_ms: u64,
    pub checked_at: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status_code == 200 && self.body.trim() == "OK"
    }
}

impl MonitorClient {
    /// Create a new client; monitors usually run with self-signed certificates
    pub fn new(base_url: &str, strict_tls: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!strict_tls)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid monitor URL")?;

        Ok(Self { client, base_url })
    }

    /// GET /agi/health
    pub async fn health(&self) -> Result<HealthReport> {
        let url = self.base_url.join("agi/health").context("Invalid path")?;
        let started = Instant::now();

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context("Failed to send request")?;

        let status_code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(HealthReport {
            url: url.to_string(),
            status_code,
            body,
            latency_ms: started.elapsed().as_millis() as u64,
            checked_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_ok() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/agi/health")
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;

        let client = MonitorClient::new(&server.url(), false).unwrap();
        let report = client.health().await.unwrap();

        mock.assert_async().await;
        assert!(report.is_healthy());
        assert_eq!(report.status_code, 200);
    }

    #[tokio::test]
    async fn test_health_unhealthy_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/agi/health")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let client = MonitorClient::new(&server.url(), false).unwrap();
        let report = client.health().await.unwrap();
        assert!(!report.is_healthy());
        assert_eq!(report.status_code, 503);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(MonitorClient::new("not a url", false).is_err());
    }
}
