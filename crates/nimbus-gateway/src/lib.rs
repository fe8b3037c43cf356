//! nimbus-gateway: session-multiplexed streaming JSON-RPC gateway
//!
//! Inbound calls are validated, bound to a session, and then either answered
//! straight from the tool registry (the fast path) or handed to the session's
//! transport, which records every outbound message in a resumable event log.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event_store;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod stream;
pub mod transport;

pub use config::GatewayConfig;
pub use dispatch::ToolDispatcher;
pub use error::GatewayError;
pub use event_store::{Event, EventStore, EventStoreError, InMemoryEventStore, Replay};
pub use protocol::{CallEnvelope, Outcome, RequestId, ResponseEnvelope, RpcError};
pub use registry::{SessionRegistry, TransportFactory};
pub use router::{Introspection, Routed, Router};
pub use session::{LifecycleEvent, LifecycleObserver, Session, SessionInfo, SessionKind, SessionState};
pub use stream::{EventStream, StreamItem};
pub use transport::{Delivery, StreamableTransport, Transport};
