//! Tool invocation against the shared registry

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use nimbus_core::{ToolDefinition, ToolRegistry};
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::error::GatewayError;
use crate::protocol::ToolCallResult;

/// Invokes tools by name and shapes their output into protocol results.
///
/// Shared by the fast path and the transport's `tools/call`. Handler
/// failures, including panics, come back as [`GatewayError::Internal`] and
/// never escape the call.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn list(&self) -> Vec<ToolDefinition> {
        self.registry.list_tools()
    }

    /// `{"tools": [...]}` in registration order
    pub fn catalogue(&self) -> Value {
        json!({ "tools": self.list() })
    }

    /// Invoke the tool named in `params.name` with `params.arguments`
    pub async fn invoke(&self, params: &Value) -> Result<Value, GatewayError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| GatewayError::InvalidParams("missing tool name".to_string()))?;

        let Some(tool) = self.registry.get(name) else {
            warn!("Unknown tool requested: {}", name);
            return Err(GatewayError::tool_not_found(name));
        };

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(args @ Value::Object(_)) => args.clone(),
            Some(_) => {
                return Err(GatewayError::InvalidParams(format!(
                    "arguments for tool {name} must be an object"
                )));
            }
        };
        check_required(name, &tool.input_schema(), &arguments)?;

        debug!("Calling tool: {}", name);
        match AssertUnwindSafe(tool.execute(arguments)).catch_unwind().await {
            Ok(Ok(text)) => serde_json::to_value(ToolCallResult::text(text))
                .map_err(|e| GatewayError::tool_failed(name, e)),
            Ok(Err(e)) => {
                warn!("Tool {} failed: {:#}", name, e);
                Err(GatewayError::tool_failed(name, e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Tool {} panicked: {}", name, message);
                Err(GatewayError::tool_failed(name, message))
            }
        }
    }
}

/// Every property listed in the schema's `required` array must be present
fn check_required(name: &str, schema: &Value, arguments: &Value) -> Result<(), GatewayError> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for field in required.iter().filter_map(Value::as_str) {
        if arguments.get(field).is_none_or(Value::is_null) {
            return Err(GatewayError::InvalidParams(format!(
                "missing required argument '{field}' for tool {name}"
            )));
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use nimbus_core::{ToolHandler, json_schema};

    /// Echoes `text` back, fails on `fail`, panics on `panic`
    pub struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input text"
        }

        fn input_schema(&self) -> Value {
            json_schema(json!({ "text": { "type": "string" } }), vec!["text"])
        }

        async fn execute(&self, input: Value) -> Result<String> {
            let text = input["text"].as_str().unwrap_or_default().to_string();
            match text.as_str() {
                "fail" => bail!("upstream exploded"),
                "panic" => panic!("handler bug"),
                _ => Ok(text),
            }
        }
    }

    pub struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleep for `ms` milliseconds"
        }

        fn input_schema(&self) -> Value {
            json_schema(json!({ "ms": { "type": "number" } }), vec![])
        }

        async fn execute(&self, input: Value) -> Result<String> {
            let ms = input["ms"].as_u64().unwrap_or(50);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok("done".to_string())
        }
    }

    pub fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        registry.register(Arc::new(SlowTool)).unwrap();
        Arc::new(registry)
    }

    pub fn dispatcher() -> Arc<ToolDispatcher> {
        Arc::new(ToolDispatcher::new(registry()))
    }
}
