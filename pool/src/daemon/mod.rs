/// Blockchain daemon JSON-RPC access
///
/// Pools talk to one or more daemons of the same chain. Calls fan out with
/// three strategies: all endpoints (health, sync), first success (templates,
/// block submission) and first endpoint only.

pub mod client;
pub mod mock;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub use client::DaemonClient;
pub use mock::MockDaemon;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DaemonError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("http status {0}")]
    Http(u16),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("no daemon endpoints configured")]
    NoEndpoints,
}

pub type DaemonResult = Result<Value, DaemonError>;

/// One entry of a batched request.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonCmd {
    pub method: String,
    pub params: Value,
}

impl DaemonCmd {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Map a JSON-RPC reply object (`{result, error}`) to a result.
pub fn map_reply(reply: &Value) -> DaemonResult {
    match reply.get("error") {
        Some(err) if !err.is_null() => Err(DaemonError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
        }),
        _ => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
    }
}

#[async_trait]
pub trait DaemonRpc: Send + Sync {
    fn endpoint_count(&self) -> usize;

    /// Issue one call against endpoint `index`.
    async fn call(&self, index: usize, method: &str, params: &Value) -> DaemonResult;

    /// Issue a batch against endpoint `index`. Replies keep request order.
    async fn call_batch(&self, index: usize, batch: &[DaemonCmd]) -> Result<Vec<DaemonResult>, DaemonError>;

    /// One result per endpoint, in configuration order.
    async fn execute_all(&self, method: &str, params: Value) -> Vec<DaemonResult> {
        let calls = (0..self.endpoint_count()).map(|i| self.call(i, method, &params));
        futures::future::join_all(calls).await
    }

    /// First successful reply from any endpoint, or the last error.
    async fn execute_any(&self, method: &str, params: Value) -> DaemonResult {
        if self.endpoint_count() == 0 {
            return Err(DaemonError::NoEndpoints);
        }
        let calls = (0..self.endpoint_count()).map(|i| self.call(i, method, &params));
        futures::future::select_ok(calls).await.map(|(value, _)| value)
    }

    async fn execute_single(&self, method: &str, params: Value) -> DaemonResult {
        if self.endpoint_count() == 0 {
            return Err(DaemonError::NoEndpoints);
        }
        self.call(0, method, &params).await
    }

    /// Batch against every endpoint, keeping the first complete answer.
    async fn execute_batch_any(&self, batch: Vec<DaemonCmd>) -> Result<Vec<DaemonResult>, DaemonError> {
        if self.endpoint_count() == 0 {
            return Err(DaemonError::NoEndpoints);
        }
        let calls = (0..self.endpoint_count()).map(|i| self.call_batch(i, &batch));
        futures::future::select_ok(calls).await.map(|(replies, _)| replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_reply() {
        assert_eq!(map_reply(&json!({"result": 5, "error": null})), Ok(json!(5)));
        assert_eq!(
            map_reply(&json!({"result": null, "error": {"code": -8, "message": "bad"}})),
            Err(DaemonError::Rpc { code: -8, message: "bad".into() })
        );
        assert_eq!(map_reply(&json!({})), Ok(Value::Null));
    }
}
