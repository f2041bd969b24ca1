//! Status hook delivery.

use std::time::Duration;

use jobservice_protocols::{JobServiceError, JobServiceResult, StatusChange};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

/// Bytes of a rejected response body kept in the error.
const MAX_ERROR_BODY: usize = 4096;

/// Transport settings of the hook client.
#[derive(Debug, Clone)]
pub struct HookClientConfig {
    pub timeout: Duration,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for HookClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_idle_per_host: 20,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Posts status changes to registered hook URLs over a shared connection pool.
#[derive(Debug, Clone)]
pub struct HookClient {
    client: Client,
}

impl HookClient {
    pub fn new(config: HookClientConfig) -> JobServiceResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build()
            .map_err(|e| JobServiceError::Fatal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// POST `change` as JSON to `url`. Anything but `200 OK` is an error.
    pub async fn report_status(&self, url: &str, change: &StatusChange) -> JobServiceResult<()> {
        let response = self
            .client
            .post(url)
            .json(change)
            .send()
            .await
            .map_err(|e| JobServiceError::Hook(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = read_bounded(response, MAX_ERROR_BODY).await;
            return Err(if body.is_empty() {
                JobServiceError::Hook(format!("failed to report status to {}: {}", url, status))
            } else {
                JobServiceError::Hook(format!(
                    "failed to report status to {}: {}, {}",
                    url, status, body
                ))
            });
        }

        debug!(job_id = %change.job_id, status = %change.status, "Status reported to {}", url);
        Ok(())
    }
}

/// Read at most `limit` bytes of the body; the rest is never downloaded.
async fn read_bounded(mut response: Response, limit: usize) -> String {
    let mut body = Vec::new();
    while body.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&body).trim().to_string()
}
