// Endpoint failover for read-only chain queries
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{RelayerError, Result};

const INITIAL_ROUND_DELAY_MS: u64 = 500;
const MAX_ROUND_DELAY_MS: u64 = 10_000;

/// A list of equivalent endpoints for one chain API.
///
/// Read-only requests start at the last endpoint that answered and rotate on
/// failure. After every endpoint failed once, the pool waits with exponential
/// backoff before the next round. Broadcasts are never retried here.
pub struct EndpointPool {
    chain_id: String,
    urls: Vec<String>,
    current: AtomicUsize,
    client: Client,
    max_rounds: u32,
}

impl EndpointPool {
    pub fn new(chain_id: &str, urls: Vec<String>, timeout: Duration, max_rounds: u32) -> Result<Self> {
        if urls.is_empty() {
            return Err(RelayerError::Config(format!(
                "no endpoints configured for {}",
                chain_id
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            chain_id: chain_id.to_string(),
            urls: urls
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
            client,
            max_rounds: max_rounds.max(1),
        })
    }

    pub fn current_url(&self) -> &str {
        &self.urls[self.current.load(Ordering::Relaxed) % self.urls.len()]
    }

    /// GET `path` and parse JSON, failing over across endpoints
    pub async fn get_json(&self, operation: &str, path: &str) -> Result<Value> {
        self.get_json_optional(operation, path)
            .await?
            .ok_or_else(|| RelayerError::query(&self.chain_id, operation, format!("{} not found", path)))
    }

    /// Same as `get_json`, but a 404 answer is `Ok(None)` instead of a failure
    pub async fn get_json_optional(&self, operation: &str, path: &str) -> Result<Option<Value>> {
        let mut delay_ms = INITIAL_ROUND_DELAY_MS;
        let mut last_error = String::new();

        for round in 0..self.max_rounds {
            let start = self.current.load(Ordering::Relaxed);
            for offset in 0..self.urls.len() {
                let index = (start + offset) % self.urls.len();
                let url = format!("{}{}", self.urls[index], path);

                match self.fetch(&url).await {
                    Ok(value) => {
                        if index != start {
                            debug!("{}: switched to endpoint {}", self.chain_id, self.urls[index]);
                        }
                        self.current.store(index, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!(
                            "{}: {} failed on {}: {}",
                            self.chain_id, operation, self.urls[index], e
                        );
                        last_error = e.to_string();
                    }
                }
            }

            if round + 1 < self.max_rounds {
                let jitter = fastrand::u64(0..=delay_ms / 10);
                sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(MAX_ROUND_DELAY_MS);
            }
        }

        Err(RelayerError::query(&self.chain_id, operation, last_error))
    }

    /// POST a JSON body to the current endpoint, exactly once
    pub async fn post_json(&self, operation: &str, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.current_url(), path);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() && value.get("tx_response").is_none() {
            return Err(RelayerError::query(
                &self.chain_id,
                operation,
                format!("HTTP {}: {}", status, value),
            ));
        }
        Ok(value)
    }

    async fn fetch(&self, url: &str) -> Result<Option<Value>> {
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RelayerError::query(
                    &self.chain_id,
                    url,
                    format!("HTTP {}: {}", status, body),
                ))
            }
        }
    }
}
