/// In-process daemon used by tests and benchmarks.
///
/// Every endpoint answers from the same handler table. Unknown methods
/// reply with JSON-RPC error -32601 like a real node would.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{DaemonCmd, DaemonError, DaemonResult, DaemonRpc};

type Handler = Arc<dyn Fn(&Value) -> DaemonResult + Send + Sync>;

pub struct MockDaemon {
    endpoints: usize,
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::with_endpoints(1)
    }

    pub fn with_endpoints(endpoints: usize) -> Self {
        Self {
            endpoints,
            handlers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer `method` with the result of `handler(params)`.
    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> DaemonResult + Send + Sync + 'static,
    {
        self.handlers.lock().insert(method.to_string(), Arc::new(handler));
    }

    /// Answer `method` with a fixed value.
    pub fn respond(&self, method: &str, value: Value) {
        self.on(method, move |_| Ok(value.clone()));
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn dispatch(&self, method: &str, params: &Value) -> DaemonResult {
        self.calls.lock().push((method.to_string(), params.clone()));
        let handler = self.handlers.lock().get(method).cloned();
        match handler {
            Some(h) => h(params),
            None => Err(DaemonError::Rpc {
                code: -32601,
                message: format!("Method not found: {}", method),
            }),
        }
    }
}

impl Default for MockDaemon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DaemonRpc for MockDaemon {
    fn endpoint_count(&self) -> usize {
        self.endpoints
    }

    async fn call(&self, _index: usize, method: &str, params: &Value) -> DaemonResult {
        self.dispatch(method, params)
    }

    async fn call_batch(&self, _index: usize, batch: &[DaemonCmd]) -> Result<Vec<DaemonResult>, DaemonError> {
        Ok(batch.iter().map(|cmd| self.dispatch(&cmd.method, &cmd.params)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fan_out_strategies() {
        let daemon = MockDaemon::with_endpoints(3);
        daemon.respond("getpeerinfo", json!([{"addr": "1.2.3.4"}]));

        let all = daemon.execute_all("getpeerinfo", json!([])).await;
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|r| r.is_ok()));

        assert!(daemon.execute_any("getpeerinfo", json!([])).await.is_ok());
        assert!(daemon.execute_single("nosuchmethod", json!([])).await.is_err());
        assert_eq!(daemon.calls_to("getpeerinfo").len(), 4);
    }

    #[tokio::test]
    async fn test_batch_keeps_order() {
        let daemon = MockDaemon::new();
        daemon.respond("a", json!(1));
        daemon.respond("b", json!(2));
        let replies = daemon
            .execute_batch_any(vec![DaemonCmd::new("b", json!([])), DaemonCmd::new("a", json!([]))])
            .await
            .unwrap();
        assert_eq!(replies[0], Ok(json!(2)));
        assert_eq!(replies[1], Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_no_endpoints() {
        let daemon = MockDaemon::with_endpoints(0);
        assert_eq!(daemon.execute_any("x", json!([])).await, Err(DaemonError::NoEndpoints));
        assert!(daemon.execute_all("x", json!([])).await.is_empty());
    }
}
