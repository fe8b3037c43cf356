//! Wire protocol: JSON-RPC 2.0 call and result envelopes
//!
//! Inbound envelopes are validated once at the boundary into [`CallEnvelope`];
//! outbound envelopes are a closed [`Outcome`] so a response can never carry
//! both a result and an error.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// The only protocol tag accepted on inbound envelopes
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP revision advertised in the `initialize` handshake
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Header carrying the session id in both directions
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header a reconnecting subscriber uses to send its last seen sequence
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

// ── Error codes ──

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SESSION_NOT_FOUND: i64 = -32001;

/// Well-known methods
pub mod methods {
    /// Fast path: tool catalogue
    pub const LIST_TOOLS: &str = "list-tools";
    /// Fast path: invoke a named tool
    pub const INVOKE_TOOL: &str = "invoke-tool";
    pub const LIST_TOOLS_ALIAS: &str = "listTools";
    pub const INVOKE_TOOL_ALIAS: &str = "callTool";

    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Methods answered directly from the tool registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPath {
    ListTools,
    InvokeTool,
}

impl FastPath {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            methods::LIST_TOOLS | methods::LIST_TOOLS_ALIAS => Some(Self::ListTools),
            methods::INVOKE_TOOL | methods::INVOKE_TOOL_ALIAS => Some(Self::InvokeTool),
            _ => None,
        }
    }
}

/// Correlation token (can be string or number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A validated inbound call
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub method: String,
    pub params: Value,
    /// Absent for notifications
    pub id: Option<RequestId>,
}

/// Why an inbound envelope was rejected, with whatever id could be salvaged
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidEnvelope {
    pub id: Option<RequestId>,
    pub reason: String,
}

impl InvalidEnvelope {
    fn new(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

impl CallEnvelope {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }

    /// Validate a raw JSON value into a call envelope
    pub fn from_value(raw: Value) -> Result<Self, InvalidEnvelope> {
        let Value::Object(mut obj) = raw else {
            return Err(InvalidEnvelope::new(None, "envelope must be a JSON object"));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(v) => match serde_json::from_value::<RequestId>(v) {
                Ok(id) => Some(id),
                Err(_) => {
                    return Err(InvalidEnvelope::new(None, "id must be a string or an integer"));
                }
            },
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(InvalidEnvelope::new(
                    id,
                    format!("unsupported protocol version '{other}'"),
                ));
            }
            None => return Err(InvalidEnvelope::new(id, "missing 'jsonrpc' protocol tag")),
        }

        let method = match obj.remove("method") {
            Some(Value::String(m)) if !m.trim().is_empty() => m,
            _ => return Err(InvalidEnvelope::new(id, "missing 'method'")),
        };

        Ok(Self {
            method,
            params: obj.remove("params").unwrap_or(Value::Null),
            id,
        })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Error body of a result envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Exactly one of `result` / `error`
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

/// Outbound result envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireResponse")]
pub struct ResponseEnvelope {
    pub id: Option<RequestId>,
    pub outcome: Outcome,
}

impl ResponseEnvelope {
    pub fn ok(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn err(id: Option<RequestId>, error: &crate::GatewayError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error.to_rpc()),
        }
    }

    pub fn from_result(id: Option<RequestId>, result: Result<Value, crate::GatewayError>) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(e) => Self::err(id, &e),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(v) => Some(v),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(e) => Some(e),
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing a map of owned JSON values cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for ResponseEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Outcome::Result(value) => map.serialize_entry("result", value)?,
            Outcome::Error(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct WireResponse {
    jsonrpc: String,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl TryFrom<WireResponse> for ResponseEnvelope {
    type Error = String;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        if wire.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported protocol version '{}'", wire.jsonrpc));
        }
        let outcome = match (wire.result, wire.error) {
            (Some(_), Some(_)) => return Err("response carries both result and error".into()),
            (None, Some(error)) => Outcome::Error(error),
            (result, None) => Outcome::Result(result.unwrap_or(Value::Null)),
        };
        Ok(Self {
            id: wire.id,
            outcome,
        })
    }
}

// ── MCP payloads ──

/// MCP server capabilities
#[derive(Debug, Serialize)]
pub struct ServerCapabilities {
    pub tools: ToolsCapability,
}

/// MCP tools capability
#[derive(Debug, Serialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// MCP server info
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// MCP initialize result
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// MCP tool call result
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// MCP tool content block
#[derive(Debug, Serialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: text.into(),
            }],
            is_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayError;
    use serde_json::json;

    #[test]
    fn test_valid_envelope() {
        let env = CallEnvelope::from_value(json!({
            "jsonrpc": "2.0", "method": "list-tools", "id": 1
        }))
        .unwrap();
        assert_eq!(env.method, "list-tools");
        assert_eq!(env.id, Some(RequestId::Number(1)));
        assert_eq!(env.params, Value::Null);
        assert!(!env.is_notification());
    }

    #[test]
    fn test_string_id_and_params() {
        let env = CallEnvelope::from_value(json!({
            "jsonrpc": "2.0", "method": "invoke-tool", "id": "req-7",
            "params": {"name": "get-alerts"}
        }))
        .unwrap();
        assert_eq!(env.id, Some(RequestId::from("req-7")));
        assert_eq!(env.params["name"], "get-alerts");
    }

    #[test]
    fn test_null_id_is_notification() {
        let env =
            CallEnvelope::from_value(json!({"jsonrpc": "2.0", "method": "ping", "id": null})).unwrap();
        assert!(env.is_notification());
    }

    #[test]
    fn test_wrong_version_rejected_with_id() {
        let err = CallEnvelope::from_value(json!({"jsonrpc": "1.0", "method": "x", "id": 4}))
            .unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(4)));
        assert!(err.reason.contains("1.0"));
    }

    #[test]
    fn test_missing_tag_rejected() {
        let err = CallEnvelope::from_value(json!({"method": "x"})).unwrap_err();
        assert!(err.reason.contains("jsonrpc"));
    }

    #[test]
    fn test_missing_or_blank_method_rejected() {
        assert!(CallEnvelope::from_value(json!({"jsonrpc": "2.0", "id": 1})).is_err());
        assert!(CallEnvelope::from_value(json!({"jsonrpc": "2.0", "method": "  "})).is_err());
        assert!(CallEnvelope::from_value(json!({"jsonrpc": "2.0", "method": 3})).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let err = CallEnvelope::from_value(json!([1, 2])).unwrap_err();
        assert!(err.id.is_none());
    }

    #[test]
    fn test_fractional_id_rejected() {
        assert!(CallEnvelope::from_value(json!({"jsonrpc": "2.0", "method": "x", "id": 1.5})).is_err());
    }

    #[test]
    fn test_fast_path_names() {
        assert_eq!(FastPath::from_method("list-tools"), Some(FastPath::ListTools));
        assert_eq!(FastPath::from_method("listTools"), Some(FastPath::ListTools));
        assert_eq!(FastPath::from_method("invoke-tool"), Some(FastPath::InvokeTool));
        assert_eq!(FastPath::from_method("callTool"), Some(FastPath::InvokeTool));
        assert_eq!(FastPath::from_method("tools/list"), None);
    }

    #[test]
    fn test_response_ok_shape() {
        let resp = ResponseEnvelope::ok(Some(RequestId::Number(1)), json!({"tools": []}));
        let json = resp.to_value();
        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}));
    }

    #[test]
    fn test_response_err_shape_without_id() {
        let resp = ResponseEnvelope::err(None, &GatewayError::tool_not_found("nope"));
        let json = resp.to_value();
        assert_eq!(json["id"], Value::Null);
        assert_eq!(json["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(json["error"]["message"], "Tool 'nope' not found");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_response_parse_back() {
        let parsed: ResponseEnvelope = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": "a", "error": {"code": -32603, "message": "boom"}
        }))
        .unwrap();
        assert_eq!(parsed.error().unwrap().code, INTERNAL_ERROR);
        assert!(parsed.result().is_none());

        let both = serde_json::from_value::<ResponseEnvelope>(json!({
            "jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}
        }));
        assert!(both.is_err());
    }

    #[test]
    fn test_tool_call_result_text() {
        let json = serde_json::to_value(ToolCallResult::text("hello")).unwrap();
        assert_eq!(json, json!({"content": [{"type": "text", "text": "hello"}]}));
    }

    #[test]
    fn test_initialize_result_serialization() {
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "weather".to_string(),
                version: "0.1.0".to_string(),
            },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(json["capabilities"]["tools"]["listChanged"], false);
        assert_eq!(json["serverInfo"]["name"], "weather");
    }
}
