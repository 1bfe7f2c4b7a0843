use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_core::{ContextError, ContextKey, Level, Principal};

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// Response envelope: `{ id, success, result?, error?: { code, message, data? } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Error object. Domain failures use the error's `kind()` as `code`.
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes (used internally for routing)
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

pub fn error_code_to_string(code: i32) -> &'static str {
    match code {
        PARSE_ERROR => "PARSE_ERROR",
        INVALID_REQUEST => "INVALID_REQUEST",
        METHOD_NOT_FOUND => "METHOD_NOT_FOUND",
        INVALID_PARAMS => "INVALID_PARAMS",
        INTERNAL_ERROR => "INTERNAL_ERROR",
        _ => "UNKNOWN_ERROR",
    }
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: error_code_to_string(code).to_string(),
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Domain error, keeping the kind and offending key for client retry logic.
    pub fn context_error(id: Option<Value>, err: &ContextError) -> Self {
        let data = match err {
            ContextError::BatchPartialFailure { failures } => Some(serde_json::json!({ "failures": failures })),
            ContextError::VersionConflict { key, expected, actual } => Some(serde_json::json!({
                "key": key,
                "expected": expected,
                "actual": actual,
            })),
            other => other.key().map(|key| serde_json::json!({ "key": key })),
        };
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: err.kind().to_string(),
                message: err.to_string(),
                data,
            }),
        }
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, msg)
    }

    pub fn internal_error(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, PARSE_ERROR, "Parse error")
    }
}

/// camelCase aliases accepted for snake_case parameters.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("expectedVersion", "expected_version"),
    ("parentId", "parent_id"),
    ("includeInherited", "include_inherited"),
    ("autoCreateAncestors", "auto_create_ancestors"),
    ("scopeId", "scope_id"),
    ("subscriptionId", "subscription_id"),
    ("targetSeq", "target_seq"),
    ("fromSeq", "from_seq"),
    ("toSeq", "to_seq"),
    ("keepMilestones", "keep_milestones"),
    ("olderThan", "older_than"),
    ("stopOnError", "stop_on_error"),
    ("deadlineMs", "deadline_ms"),
];

/// Rename known camelCase keys to snake_case. snake_case wins when both are present.
pub fn normalize_params(params: &Value) -> Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if result.contains_key(snake) {
            result.remove(camel);
        } else if let Some(val) = result.remove(camel) {
            result.insert(snake.to_string(), val);
        }
    }
    Value::Object(result)
}

/// Extract a required string param from the RPC params object.
pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

pub fn require_u64(params: &Value, key: &str) -> Result<u64, String> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn optional_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn optional_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// `level` + `id` params as a key.
pub fn require_key(params: &Value) -> Result<ContextKey, String> {
    let level: Level = require_str(params, "level")?.parse()?;
    let id = require_str(params, "id")?;
    Ok(ContextKey::new(level, id))
}

pub fn require_author(params: &Value) -> Result<Principal, String> {
    require_str(params, "author").map(Principal::new)
}

/// Deserialize a structured param, or the whole params object when `key` is `None`.
pub fn parse<T: DeserializeOwned>(params: &Value, key: Option<&str>) -> Result<T, String> {
    let value = match key {
        Some(key) => params.get(key).cloned().unwrap_or(Value::Null),
        None => params.clone(),
    };
    serde_json::from_value(value).map_err(|e| match key {
        Some(key) => format!("Invalid parameter {key}: {e}"),
        None => format!("Invalid parameters: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rpc_request() {
        let raw = r#"{"method":"context.get","params":{"level":"project","id":"p1"},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "context.get");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(json!(1)));
    }

    #[test]
    fn success_response_serializes() {
        let resp = RpcResponse::success(Some(json!(1)), json!({"ok": true}));
        let raw = serde_json::to_string(&resp).unwrap();
        assert!(raw.contains("\"result\""));
        assert!(!raw.contains("\"error\""));
        assert!(raw.contains("\"success\":true"));
    }

    #[test]
    fn error_response_has_success_false() {
        let resp = RpcResponse::error(Some(json!(1)), INVALID_PARAMS, "bad param");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["code"], "INVALID_PARAMS");
        assert_eq!(v["error"]["message"], "bad param");
    }

    #[test]
    fn context_errors_use_kind_as_code() {
        let err = ContextError::NotFound {
            key: ContextKey::task("t1"),
        };
        let v = serde_json::to_value(RpcResponse::context_error(Some(json!(7)), &err)).unwrap();
        assert_eq!(v["error"]["code"], "not_found");
        assert_eq!(v["error"]["data"]["key"]["id"], "t1");

        let err = ContextError::VersionConflict {
            key: ContextKey::project("p1"),
            expected: 1,
            actual: 2,
        };
        let v = serde_json::to_value(RpcResponse::context_error(None, &err)).unwrap();
        assert_eq!(v["error"]["code"], "version_conflict");
        assert_eq!(v["error"]["data"]["actual"], 2);

        let v = serde_json::to_value(RpcResponse::context_error(None, &ContextError::DeadlineExceeded)).unwrap();
        assert!(v["error"].get("data").is_none());
    }

    #[test]
    fn normalize_renames_camel_case() {
        let p = normalize_params(&json!({"expectedVersion": 3, "includeInherited": true, "id": "x"}));
        assert_eq!(p["expected_version"], 3);
        assert_eq!(p["include_inherited"], true);
        assert!(p.get("expectedVersion").is_none());

        let p = normalize_params(&json!({"parentId": "a", "parent_id": "b"}));
        assert_eq!(p["parent_id"], "b");
        assert!(p.get("parentId").is_none());
    }

    #[test]
    fn key_params() {
        let key = require_key(&json!({"level": "branch", "id": "b1"})).unwrap();
        assert_eq!(key, ContextKey::branch("b1"));
        assert!(require_key(&json!({"level": "galaxy", "id": "x"})).is_err());
        assert!(require_key(&json!({"level": "task"})).unwrap_err().contains("id"));
    }

    #[test]
    fn parse_structured_params() {
        let levels: Vec<Level> = parse(&json!({"levels": ["task"]}), Some("levels")).unwrap();
        assert_eq!(levels, vec![Level::Task]);
        let err = parse::<Vec<Level>>(&json!({"levels": 3}), Some("levels")).unwrap_err();
        assert!(err.starts_with("Invalid parameter levels"));
    }
}
