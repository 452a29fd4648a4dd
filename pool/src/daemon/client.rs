/// HTTP JSON-RPC daemon client
///
/// One `reqwest` client shared by every endpoint with basic auth per endpoint.
/// Every call reaches the daemon; transport failures are counted but never
/// suppress later requests, so a block found right after an outage is still
/// submitted.

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;

use super::{map_reply, DaemonCmd, DaemonError, DaemonResult, DaemonRpc};
use crate::config::DaemonEndpointConfig;
use crate::metrics::prometheus as metrics;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Endpoint {
    url: String,
    user: Option<String>,
    password: Option<String>,
}

pub struct DaemonClient {
    endpoints: Vec<Endpoint>,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(configs: &[DaemonEndpointConfig]) -> anyhow::Result<Self> {
        Self::with_timeout(configs, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(configs: &[DaemonEndpointConfig], timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoints = configs
            .iter()
            .map(|c| Endpoint {
                url: c.url(),
                user: c.user.clone().filter(|u| !u.is_empty()),
                password: c.password.clone(),
            })
            .collect::<Vec<_>>();

        for e in &endpoints {
            tracing::info!("Daemon endpoint configured: {}", e.url);
        }
        Ok(Self { endpoints, http })
    }

    fn request_id() -> u64 {
        let secs = chrono::Utc::now().timestamp().max(0) as u64;
        secs * 1000 + rand::thread_rng().gen_range(0..1000)
    }

    async fn post(&self, index: usize, body: &Value) -> Result<Value, DaemonError> {
        let endpoint = self.endpoints.get(index).ok_or(DaemonError::NoEndpoints)?;

        metrics::inc_daemon_requests();
        let result = self.send(endpoint, body).await;
        if let Err(e) = &result {
            metrics::inc_daemon_errors();
            tracing::debug!("Daemon {} request failed: {}", endpoint.url, e);
        }
        result
    }

    async fn send(&self, endpoint: &Endpoint, body: &Value) -> Result<Value, DaemonError> {
        let mut request = self.http.post(&endpoint.url).json(body);
        if let Some(user) = &endpoint.user {
            request = request.basic_auth(user, endpoint.password.as_ref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DaemonError::Timeout
            } else {
                DaemonError::Transport(e.to_string())
            }
        })?;

        // bitcoind answers RPC errors with HTTP 500 and a JSON body
        let status = response.status();
        let text = response.text().await.map_err(|e| DaemonError::Transport(e.to_string()))?;
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Ok(value),
            Err(_) if !status.is_success() => Err(DaemonError::Http(status.as_u16())),
            Err(e) => Err(DaemonError::Decode(e.to_string())),
        }
    }
}

#[async_trait]
impl DaemonRpc for DaemonClient {
    fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn call(&self, index: usize, method: &str, params: &Value) -> DaemonResult {
        let body = json!({
            "jsonrpc": "2.0",
            "id": Self::request_id(),
            "method": method,
            "params": params,
        });
        let reply = self.post(index, &body).await?;
        map_reply(&reply)
    }

    async fn call_batch(&self, index: usize, batch: &[DaemonCmd]) -> Result<Vec<DaemonResult>, DaemonError> {
        let base = Self::request_id();
        let body = Value::Array(
            batch
                .iter()
                .enumerate()
                .map(|(i, cmd)| {
                    json!({
                        "jsonrpc": "2.0",
                        "id": base + i as u64,
                        "method": cmd.method,
                        "params": cmd.params,
                    })
                })
                .collect(),
        );

        let reply = self.post(index, &body).await?;
        let replies = reply
            .as_array()
            .ok_or_else(|| DaemonError::Decode("batch reply is not an array".into()))?;
        if replies.len() != batch.len() {
            return Err(DaemonError::Decode(format!(
                "batch reply has {} entries, expected {}",
                replies.len(),
                batch.len()
            )));
        }

        // Replies may arrive in any order; match them back by id.
        let mut ordered: Vec<DaemonResult> = vec![Err(DaemonError::Decode("missing reply".into())); batch.len()];
        for (pos, r) in replies.iter().enumerate() {
            let slot = r
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| id.checked_sub(base))
                .map(|i| i as usize)
                .filter(|i| *i < batch.len())
                .unwrap_or(pos);
            ordered[slot] = map_reply(r);
        }
        Ok(ordered)
    }
}
