//! Session transports

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::dispatch::ToolDispatcher;
use crate::error::GatewayError;
use crate::protocol::{
    CallEnvelope, InitializeResult, MCP_PROTOCOL_VERSION, ResponseEnvelope, ServerCapabilities,
    ServerInfo, ToolsCapability, methods,
};
use crate::registry::TransportFactory;
use crate::session::Session;
use crate::stream::EventStream;

/// What a call produced
#[derive(Debug)]
pub enum Delivery {
    /// Synchronous result envelope
    Reply(ResponseEnvelope),
    /// Notification consumed; nothing to send back
    Accepted,
    /// Long-lived subscription
    Stream(EventStream),
}

/// Streaming endpoint bound to exactly one session
#[async_trait]
pub trait Transport: Send + Sync {
    async fn handle(
        &self,
        session: &Arc<Session>,
        envelope: CallEnvelope,
    ) -> Result<Delivery, GatewayError>;

    /// Open a subscriber stream resuming after `cursor`
    fn open_stream(&self, session: &Arc<Session>, cursor: u64) -> Result<EventStream, GatewayError> {
        EventStream::open(session.clone(), cursor)
    }
}

/// MCP streamable transport: answers the standard methods and records every
/// outbound message in the session's event log.
pub struct StreamableTransport {
    dispatcher: Arc<ToolDispatcher>,
}

impl StreamableTransport {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Factory handing every new session its own transport
    pub fn factory(dispatcher: Arc<ToolDispatcher>) -> TransportFactory {
        Arc::new(move |_session_id: &str| -> Box<dyn Transport> {
            Box::new(StreamableTransport::new(dispatcher.clone()))
        })
    }

    fn initialize(&self, session: &Session) -> Result<Value, GatewayError> {
        let state = session.mark_active();
        info!(session_id = %session.id(), %state, "Session initialized");
        serde_json::to_value(InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
        .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

#[async_trait]
impl Transport for StreamableTransport {
    async fn handle(
        &self,
        session: &Arc<Session>,
        envelope: CallEnvelope,
    ) -> Result<Delivery, GatewayError> {
        let result = match envelope.method.as_str() {
            methods::INITIALIZE => self.initialize(session),
            methods::INITIALIZED => return Ok(Delivery::Accepted),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(self.dispatcher.catalogue()),
            methods::TOOLS_CALL => self.dispatcher.invoke(&envelope.params).await,
            other => Err(GatewayError::MethodNotFound(format!("Unknown method: {other}"))),
        };

        if envelope.is_notification() {
            debug!(
                session_id = %session.id(),
                method = %envelope.method,
                "Notification handled"
            );
            return Ok(Delivery::Accepted);
        }

        let response = ResponseEnvelope::from_result(envelope.id, result);
        if let Err(e) = session.publish(response.to_value()) {
            // The reply still goes out directly; only replay is lost.
            warn!(session_id = %session.id(), "Failed to record response: {}", e);
        }
        Ok(Delivery::Reply(response))
    }
}
