//! Gateway error taxonomy

use thiserror::Error;

use crate::protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, RpcError,
    SESSION_NOT_FOUND,
};

/// Every failure the router can report to a caller.
///
/// Messages are written for the caller; internal error values are rendered
/// to text before they get here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Body was not JSON at all
    #[error("Parse error: {0}")]
    Parse(String),

    /// Malformed envelope: wrong protocol tag, missing method
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Internal(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl GatewayError {
    pub fn tool_not_found(name: &str) -> Self {
        Self::MethodNotFound(format!("Tool '{name}' not found"))
    }

    pub fn tool_failed(name: &str, message: impl std::fmt::Display) -> Self {
        Self::Internal(format!("Error calling tool {name}: {message}"))
    }

    /// Numeric JSON-RPC code for this error class
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Internal(_) => INTERNAL_ERROR,
            Self::SessionNotFound(_) => SESSION_NOT_FOUND,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(GatewayError::Parse("x".into()).code(), -32700);
        assert_eq!(GatewayError::InvalidRequest("x".into()).code(), -32600);
        assert_eq!(GatewayError::tool_not_found("x").code(), -32601);
        assert_eq!(GatewayError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(GatewayError::Internal("x".into()).code(), -32603);
        assert_eq!(GatewayError::SessionNotFound("x".into()).code(), -32001);
    }

    #[test]
    fn test_tool_messages() {
        assert_eq!(
            GatewayError::tool_not_found("does-not-exist").to_string(),
            "Tool 'does-not-exist' not found"
        );
        assert_eq!(
            GatewayError::tool_failed("get-alerts", "boom").to_string(),
            "Error calling tool get-alerts: boom"
        );
    }

    #[test]
    fn test_to_rpc() {
        let rpc = GatewayError::SessionNotFound("abc".into()).to_rpc();
        assert_eq!(rpc.code, SESSION_NOT_FOUND);
        assert_eq!(rpc.message, "Session not found: abc");
    }
}
