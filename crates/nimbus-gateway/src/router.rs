//! Request router: fast path vs. session transport
//!
//! Every inbound call is validated before anything is touched. Valid calls
//! are bound to a session; `list-tools` / `invoke-tool` are answered straight
//! from the tool registry, everything else goes to the session's transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nimbus_core::ToolRegistry;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::dispatch::ToolDispatcher;
use crate::error::GatewayError;
use crate::protocol::{CallEnvelope, FastPath, RequestId, ResponseEnvelope};
use crate::registry::SessionRegistry;
use crate::session::{SessionInfo, SessionState};
use crate::transport::Delivery;

/// Correlation id used on probe replies
pub const PROBE_REQUEST_ID: &str = "probe";

/// Result of routing one call
#[derive(Debug)]
pub struct Routed {
    /// Session the call was bound to; `None` when rejected before resolution
    pub session_id: Option<String>,
    pub delivery: Delivery,
}

impl Routed {
    fn rejected(response: ResponseEnvelope) -> Self {
        Self {
            session_id: None,
            delivery: Delivery::Reply(response),
        }
    }
}

/// Registry snapshot for the debug endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Introspection {
    pub status: &'static str,
    pub message: &'static str,
    pub active_sessions: usize,
    pub session_ids: Vec<String>,
    pub sessions: Vec<SessionInfo>,
    pub timestamp: DateTime<Utc>,
}

pub struct Router {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<ToolDispatcher>,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Wire up a router over `tools` with streamable transports and an in-memory event log
    pub fn with_tools(config: GatewayConfig, tools: Arc<ToolRegistry>) -> Self {
        let dispatcher = Arc::new(ToolDispatcher::new(tools));
        let registry = Arc::new(SessionRegistry::streamable(config, dispatcher.clone()));
        Self::new(registry, dispatcher)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    /// Route a raw request body
    pub async fn route_bytes(&self, body: &[u8], session_header: Option<&str>) -> Routed {
        match serde_json::from_slice::<Value>(body) {
            Ok(raw) => self.route(raw, session_header).await,
            Err(e) => {
                warn!("Unparseable request body: {}", e);
                Routed::rejected(ResponseEnvelope::err(None, &GatewayError::Parse(e.to_string())))
            }
        }
    }

    /// Route one decoded call envelope
    pub async fn route(&self, raw: Value, session_header: Option<&str>) -> Routed {
        let envelope = match CallEnvelope::from_value(raw) {
            Ok(envelope) => envelope,
            Err(invalid) => {
                warn!("Rejected envelope: {}", invalid.reason);
                let error = GatewayError::InvalidRequest(invalid.reason);
                return Routed::rejected(ResponseEnvelope::err(invalid.id, &error));
            }
        };

        let session = match self.registry.resolve(session_header).await {
            Ok(session) => session,
            Err(e) => return Routed::rejected(ResponseEnvelope::err(envelope.id, &e)),
        };
        let session_id = Some(session.id().to_string());

        let Some(fast) = FastPath::from_method(&envelope.method) else {
            let id = envelope.id.clone();
            let delivery = match session.handle(envelope).await {
                Ok(delivery) => delivery,
                Err(e) => Delivery::Reply(ResponseEnvelope::err(id, &e)),
            };
            return Routed {
                session_id,
                delivery,
            };
        };

        debug!(session_id = %session.id(), method = %envelope.method, "Fast path call");
        let result = match session.begin_work() {
            Err(e) => Err(e),
            Ok(_guard) => match fast {
                FastPath::ListTools => Ok(self.dispatcher.catalogue()),
                FastPath::InvokeTool => self.dispatcher.invoke(&envelope.params).await,
            },
        };
        Routed {
            session_id,
            delivery: Delivery::Reply(ResponseEnvelope::from_result(envelope.id, result)),
        }
    }

    /// Open (or resume) the subscriber stream of a session.
    ///
    /// Without a known session id this mints a probe session and replies with
    /// the tool catalogue, unless probes are disabled.
    pub async fn subscribe(
        &self,
        session_header: Option<&str>,
        cursor: Option<u64>,
    ) -> Result<Routed, GatewayError> {
        if let Some(id) = session_header {
            if let Some(session) = self.registry.get(id).await {
                let stream = session.subscribe(cursor)?;
                return Ok(Routed {
                    session_id: Some(session.id().to_string()),
                    delivery: Delivery::Stream(stream),
                });
            }
        }

        if !self.registry.config().probe_sessions {
            return Err(GatewayError::SessionNotFound(
                session_header.unwrap_or_default().to_string(),
            ));
        }

        let probe = self.registry.create_probe().await?;
        Ok(Routed {
            session_id: Some(probe.id().to_string()),
            delivery: Delivery::Reply(ResponseEnvelope::ok(
                Some(RequestId::from(PROBE_REQUEST_ID)),
                self.dispatcher.catalogue(),
            )),
        })
    }

    /// Terminate a session. Unknown ids are a client error and leave the registry untouched.
    pub async fn terminate(&self, session_header: Option<&str>) -> Result<SessionState, GatewayError> {
        let id = session_header.unwrap_or_default();
        let session = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;

        Ok(session.request_close())
    }

    pub async fn introspect(&self) -> Introspection {
        let sessions = self.registry.list().await;
        Introspection {
            status: "ok",
            message: "Weather MCP server is running",
            active_sessions: sessions.len(),
            session_ids: sessions.iter().map(|s| s.id.clone()).collect(),
            sessions,
            timestamp: Utc::now(),
        }
    }
}
