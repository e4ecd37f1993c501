//! API client for the manager's query API

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tier_lib::{InstanceStatus, ResourceHistorySample, ThresholdConfig};
use url::Url;

/// API client for the manager
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request; a 404 yields `None`
    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        response
            .json()
            .await
            .map(Some)
            .context("Failed to parse response")
    }

    pub async fn instances(&self) -> Result<Vec<InstanceStatus>> {
        Ok(self
            .get_optional("api/v1/instances")
            .await?
            .unwrap_or_default())
    }

    pub async fn instance(&self, host: &str) -> Result<Option<InstanceStatus>> {
        self.get_optional(&format!("api/v1/instances/{}", host)).await
    }

    /// Samples of the trailing `minutes`, newest first
    pub async fn history(&self, host: &str, minutes: u32) -> Result<Option<Vec<ResourceHistorySample>>> {
        self.get_optional(&format!("api/v1/instances/{}/history?minutes={}", host, minutes))
            .await
    }

    pub async fn thresholds(&self, host: &str) -> Result<Option<ThresholdConfig>> {
        self.get_optional(&format!("api/v1/instances/{}/thresholds", host))
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tier_lib::AgentStatus;

    #[tokio::test]
    async fn test_instance_found_and_missing() {
        let mut server = mockito::Server::new_async().await;
        let status = InstanceStatus::new("web-01", AgentStatus::Up, true);
        let found = server
            .mock("GET", "/api/v1/instances/web-01")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&status).unwrap())
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/api/v1/instances/ghost")
            .with_status(404)
            .with_body(r#"{"error": "Instance ghost not found"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let instance = client.instance("web-01").await.unwrap().unwrap();
        assert_eq!(instance.agent_status, AgentStatus::Up);
        assert!(client.instance("ghost").await.unwrap().is_none());

        found.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_history_query_and_server_error() {
        let mut server = mockito::Server::new_async().await;
        let history = server
            .mock("GET", "/api/v1/instances/web-01/history")
            .match_query(mockito::Matcher::UrlEncoded("minutes".into(), "15".into()))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/instances")
            .with_status(500)
            .with_body(r#"{"error": "disk full"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let samples = client.history("web-01", 15).await.unwrap().unwrap();
        assert!(samples.is_empty());
        history.assert_async().await;

        let err = client.instances().await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }
}
