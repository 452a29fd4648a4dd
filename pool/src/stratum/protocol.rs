/// Stratum protocol message types and serialization
///
/// Line-delimited JSON-RPC: requests from miners, responses to them and
/// server-initiated notifications (`mining.notify`, `mining.set_difficulty`, ...)

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names shared by all coin families.
pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const SUGGEST_DIFFICULTY: &str = "mining.suggest_difficulty";
    pub const SUGGEST_TARGET: &str = "mining.suggest_target";
    pub const EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
    pub const SET_TARGET: &str = "mining.set_target";
    pub const NOTIFY: &str = "mining.notify";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// JSON-RPC version (usually "2.0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request ID
    #[serde(default)]
    pub id: Value,

    /// Method name
    pub method: String,

    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl StratumRequest {
    /// Positional parameters, or an empty slice when absent / not an array.
    pub fn params_array(&self) -> &[Value] {
        match &self.params {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        }
    }

    /// Positional parameter `index` as a string slice.
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params_array().get(index).and_then(Value::as_str)
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_null()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    /// JSON-RPC version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request ID
    pub id: Value,

    /// Result (if success)
    pub result: Option<Value>,

    /// Error (if failure). Always serialized so legacy miners see `"error": null`.
    pub error: Option<StratumError>,
}

impl StratumResponse {
    /// Create success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create error response
    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Server to client push message. Stratum convention is `"id": null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl StratumNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id: Value::Null,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("stratum error {code}: {message}")]
pub struct StratumError {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StratumError {
    pub const MINUS_ONE: i32 = -1;
    pub const OTHER: i32 = 20;
    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::OTHER, message)
    }

    pub fn unsupported(method: &str) -> Self {
        Self::other(format!("Unsupported request {}", method))
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "Unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(Self::NOT_SUBSCRIBED, "Not subscribed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_with_positional_params() {
        let raw = r#"{"id":1,"method":"mining.submit","params":["miner.rig","00000001","00000000","5d1e2f3a","1a2b3c4d"]}"#;
        let req: StratumRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, methods::SUBMIT);
        assert_eq!(req.params_array().len(), 5);
        assert_eq!(req.param_str(1), Some("00000001"));
        assert!(req.has_id());
    }

    #[test]
    fn test_request_without_params_or_id() {
        let req: StratumRequest = serde_json::from_str(r#"{"method":"mining.subscribe"}"#).unwrap();
        assert!(req.params_array().is_empty());
        assert!(!req.has_id());
    }

    #[test]
    fn test_response_always_carries_error_field() {
        let resp = StratumResponse::success(json!(7), json!(true));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"error\":null"));
        assert!(text.contains("\"result\":true"));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = StratumResponse::error(json!(3), StratumError::unsupported("mining.foo"));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["error"]["code"], 20);
        assert_eq!(value["error"]["message"], "Unsupported request mining.foo");
        assert!(value["result"].is_null());
    }

    #[test]
    fn test_notification_has_null_id() {
        let n = StratumNotification::new(methods::SET_DIFFICULTY, json!([16]));
        let value = serde_json::to_value(&n).unwrap();
        assert!(value["id"].is_null());
        assert_eq!(value["method"], "mining.set_difficulty");
    }
}
