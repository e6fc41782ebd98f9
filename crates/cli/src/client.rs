//! Daemon HTTP client

use anyhow::{anyhow, Result};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use flowscout_common::{AnalysisParams, Job, RunningJob, StepRecord, TestPlan};

/// A stored flow as listed by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowFile {
    pub name: String,
    pub path: String,
    pub content: String,
}

/// Client for communicating with the FlowScout daemon
pub struct DaemonClient {
    http: Client,
    base: String,
}

impl DaemonClient {
    pub fn new(addr: &str) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base: addr.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Check if the daemon is healthy
    pub async fn health_check(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    // Jobs

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        decode(self.http.get(self.url("/api/jobs")).send().await?).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        decode(self.http.get(self.url(&format!("/api/jobs/{}", id))).send().await?).await
    }

    /// Live view of a running job, `None` once it has finished
    pub async fn live_job(&self, id: &str) -> Result<Option<RunningJob>> {
        let resp = self
            .http
            .get(self.url(&format!("/api/jobs/{}/live", id)))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    pub async fn list_flows(&self, id: &str) -> Result<Vec<FlowFile>> {
        decode(self.http.get(self.url(&format!("/api/jobs/{}/flows", id))).send().await?).await
    }

    pub async fn list_steps(&self, id: &str) -> Result<Vec<StepRecord>> {
        decode(self.http.get(self.url(&format!("/api/jobs/{}/steps", id))).send().await?).await
    }

    pub async fn submit_analysis(&self, params: &AnalysisParams) -> Result<Job> {
        let path = if params.devices.is_empty() {
            "/api/analyses"
        } else {
            "/api/analyses/batch"
        };
        decode(self.http.post(self.url(path)).json(params).send().await?).await
    }

    pub async fn resume(&self, id: &str) -> Result<Job> {
        decode(
            self.http
                .post(self.url(&format!("/api/jobs/{}/resume", id)))
                .send()
                .await?,
        )
        .await
    }

    pub async fn send_hint(&self, id: &str, message: &str) -> Result<()> {
        let _: Value = decode(
            self.http
                .post(self.url(&format!("/api/jobs/{}/hint", id)))
                .json(&json!({ "message": message }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    // Test plans

    pub async fn get_test_plan(&self, id: &str) -> Result<TestPlan> {
        decode(self.http.get(self.url(&format!("/api/test-plans/{}", id))).send().await?).await
    }

    pub async fn run_test_plan(&self, id: &str, flows_only: bool) -> Result<Job> {
        decode(
            self.http
                .post(self.url(&format!("/api/test-plans/{}/run", id)))
                .json(&json!({ "flows_only": flows_only }))
                .send()
                .await?,
        )
        .await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    debug!("{} -> {}", resp.url(), status);
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(anyhow!("daemon returned {}: {}", status, error_message(&body)));
    }
    Ok(serde_json::from_str(&body)?)
}

/// The `error` field of an API error body, or the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(r#"{"error": "job is not accepting hints"}"#), "job is not accepting hints");
        assert_eq!(error_message("  Bad Gateway\n"), "Bad Gateway");
    }

    #[test]
    fn test_url_joins_base() {
        let client = DaemonClient::new("http://127.0.0.1:8787/").unwrap();
        assert_eq!(client.url("/api/jobs"), "http://127.0.0.1:8787/api/jobs");
    }
}
