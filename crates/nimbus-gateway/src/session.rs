//! Session lifecycle
//!
//! A session walks `Initializing → Active → Closing → Closed` and never skips
//! a state. Each transition is reported to a [`LifecycleObserver`], normally
//! the registry. Closing becomes Closed only once every in-flight call has
//! released its [`WorkGuard`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::event_store::{Event, EventStore, EventStoreError};
use crate::protocol::CallEnvelope;
use crate::stream::EventStream;
use crate::transport::{Delivery, Transport};

/// Capacity of the live fan-out buffer; slower subscribers catch up from the store
const LIVE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Active)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Standard,
    /// Minted for a subscribe that carried no usable session id
    Probe,
}

/// A single state transition of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub session_id: String,
    pub from: SessionState,
    pub to: SessionState,
}

/// Receives the transitions of every session it is attached to
pub trait LifecycleObserver: Send + Sync {
    /// Runs under the session's lifecycle lock, in transition order. Must not
    /// block or take locks that are held while inspecting sessions.
    fn transition(&self, event: &LifecycleEvent);

    /// Runs once the session has reached Closed, with no session lock held
    fn closed(&self, _session_id: &str) {}
}

impl LifecycleObserver for mpsc::UnboundedSender<LifecycleEvent> {
    fn transition(&self, event: &LifecycleEvent) {
        let _ = self.send(event.clone());
    }
}

/// Introspection snapshot of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub cursor: u64,
    pub streams: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

struct Lifecycle {
    state: SessionState,
    /// Termination asked for while still Initializing; no new work is accepted
    close_requested: bool,
    in_flight: usize,
    last_activity: DateTime<Utc>,
}

pub struct Session {
    id: String,
    kind: SessionKind,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    /// Last sequence delivered to a subscriber
    cursor: AtomicU64,
    streams: AtomicUsize,
    events: Arc<dyn EventStore>,
    live: broadcast::Sender<Event>,
    closed: CancellationToken,
    observer: Arc<dyn LifecycleObserver>,
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: String,
        kind: SessionKind,
        transport: Box<dyn Transport>,
        events: Arc<dyn EventStore>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        let now = Utc::now();
        let (live, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            id,
            kind,
            created_at: now,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Initializing,
                close_requested: false,
                in_flight: 0,
                last_activity: now,
            }),
            cursor: AtomicU64::new(0),
            streams: AtomicUsize::new(0),
            events,
            live,
            closed: CancellationToken::new(),
            observer,
            transport,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.load(Ordering::Acquire)
    }

    /// Resolves once the session reaches Closed
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one transition. Runs under the lifecycle lock so observers see
    /// transitions in order.
    fn advance(&self, lc: &mut Lifecycle, to: SessionState) {
        let from = lc.state;
        debug_assert!(from.can_transition_to(to), "{from} -> {to}");
        lc.state = to;
        info!(session_id = %self.id, %from, %to, "Session state changed");
        self.observer.transition(&LifecycleEvent {
            session_id: self.id.clone(),
            from,
            to,
        });
    }

    /// Closing → Closed when nothing is in flight. Returns true if Closed was reached.
    fn settle(&self, lc: &mut Lifecycle) -> bool {
        if lc.state == SessionState::Closing && lc.in_flight == 0 {
            self.advance(lc, SessionState::Closed);
            return true;
        }
        false
    }

    /// Initializing → Active → Closing for a termination that can no longer
    /// wait on a handshake, then Closed if nothing is in flight.
    fn walk_closed(&self, lc: &mut Lifecycle) -> bool {
        self.advance(lc, SessionState::Active);
        self.advance(lc, SessionState::Closing);
        self.settle(lc)
    }

    fn on_closed(&self) {
        self.closed.cancel();
        self.events.evict(&self.id);
        self.observer.closed(&self.id);
    }

    /// Transport reports the handshake complete. A termination deferred during
    /// Initializing proceeds straight to Closing.
    pub fn mark_active(&self) -> SessionState {
        let mut lc = self.lock();
        if lc.state != SessionState::Initializing {
            return lc.state;
        }
        self.advance(&mut lc, SessionState::Active);

        let mut closed = false;
        if lc.close_requested {
            self.advance(&mut lc, SessionState::Closing);
            closed = self.settle(&mut lc);
        }
        let state = lc.state;
        drop(lc);

        if closed {
            self.on_closed();
        }
        state
    }

    /// Ask the session to terminate; returns the state after the request.
    ///
    /// While Initializing with calls in flight the close waits for the
    /// handshake, or for the last call to finish, whichever comes first.
    pub fn request_close(&self) -> SessionState {
        let mut lc = self.lock();
        let mut closed = false;
        match lc.state {
            SessionState::Initializing if lc.in_flight == 0 => {
                closed = self.walk_closed(&mut lc);
            }
            SessionState::Initializing => {
                debug!(session_id = %self.id, "Termination deferred until in-flight calls finish");
                lc.close_requested = true;
            }
            SessionState::Active => {
                self.advance(&mut lc, SessionState::Closing);
                closed = self.settle(&mut lc);
            }
            SessionState::Closing | SessionState::Closed => {}
        }
        let state = lc.state;
        drop(lc);

        if closed {
            self.on_closed();
        }
        state
    }

    /// Close unconditionally, completing a pending handshake first so every
    /// state is still visited.
    pub fn shutdown(&self) -> SessionState {
        let state = self.request_close();
        if state == SessionState::Initializing {
            return self.mark_active();
        }
        state
    }

    /// Register one unit of in-flight work; refused once termination was requested.
    pub fn begin_work(self: &Arc<Self>) -> Result<WorkGuard, GatewayError> {
        let mut lc = self.lock();
        match lc.state {
            SessionState::Closing | SessionState::Closed => {
                Err(GatewayError::SessionNotFound(self.id.clone()))
            }
            SessionState::Initializing if lc.close_requested => {
                Err(GatewayError::SessionNotFound(self.id.clone()))
            }
            SessionState::Initializing | SessionState::Active => {
                lc.in_flight += 1;
                lc.last_activity = Utc::now();
                Ok(WorkGuard {
                    session: self.clone(),
                })
            }
        }
    }

    fn end_work(&self) {
        let mut lc = self.lock();
        lc.in_flight = lc.in_flight.saturating_sub(1);
        lc.last_activity = Utc::now();
        let closed = if lc.state == SessionState::Initializing {
            lc.close_requested && lc.in_flight == 0 && self.walk_closed(&mut lc)
        } else {
            self.settle(&mut lc)
        };
        drop(lc);

        if closed {
            self.on_closed();
        }
    }

    pub fn touch(&self) {
        self.lock().last_activity = Utc::now();
    }

    /// True when no subscriber is attached and nothing happened for `timeout`
    pub fn is_idle(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.stream_count() > 0 {
            return false;
        }
        let lc = self.lock();
        if lc.in_flight > 0 {
            return false;
        }
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - lc.last_activity > timeout,
            Err(_) => false,
        }
    }

    /// Append an outbound message to the session log and fan it out to live
    /// subscribers.
    pub fn publish(&self, payload: Value) -> Result<Event, GatewayError> {
        let event = self
            .events
            .append(&self.id, payload)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        // No receivers is fine; the store keeps it for later subscribers.
        let _ = self.live.send(event.clone());
        Ok(event)
    }

    /// Retained events after `cursor`
    pub fn replay(&self, cursor: u64) -> Result<Vec<Event>, GatewayError> {
        match self.events.since(&self.id, cursor) {
            Ok(replay) => Ok(replay.collect()),
            Err(e @ EventStoreError::CursorExpired { .. }) => {
                Err(GatewayError::InvalidRequest(e.to_string()))
            }
            Err(e) => Err(GatewayError::Internal(e.to_string())),
        }
    }

    pub(crate) fn live_receiver(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    pub(crate) fn record_cursor(&self, sequence: u64) {
        self.cursor.store(sequence, Ordering::Release);
    }

    pub(crate) fn attach_stream(&self) {
        self.streams.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn detach_stream(&self) {
        self.streams.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    /// Open a subscriber stream resuming after `cursor`, or after the
    /// session's recorded cursor when none is given.
    pub fn subscribe(self: &Arc<Self>, cursor: Option<u64>) -> Result<EventStream, GatewayError> {
        if self.state() == SessionState::Closed {
            return Err(GatewayError::SessionNotFound(self.id.clone()));
        }
        let cursor = cursor.unwrap_or_else(|| self.cursor());
        let last = self.events.last_sequence(&self.id);
        if cursor > last {
            return Err(GatewayError::InvalidRequest(format!(
                "Last-Event-ID {cursor} is ahead of the session log (last event {last})"
            )));
        }
        self.transport.open_stream(self, cursor)
    }

    /// Hand a call to this session's transport, holding a work guard for its duration.
    pub async fn handle(self: &Arc<Self>, envelope: CallEnvelope) -> Result<Delivery, GatewayError> {
        let _guard = self.begin_work()?;
        debug!(session_id = %self.id, method = %envelope.method, "Transport call");
        self.transport.handle(self, envelope).await
    }

    pub fn info(&self) -> SessionInfo {
        let lc = self.lock();
        SessionInfo {
            id: self.id.clone(),
            kind: self.kind,
            state: lc.state,
            cursor: self.cursor(),
            streams: self.stream_count(),
            created_at: self.created_at,
            last_activity: lc.last_activity,
        }
    }
}

/// Held for the duration of one call; dropping it may complete Closing → Closed
pub struct WorkGuard {
    session: Arc<Session>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.session.end_work();
    }
}

#[cfg(test)]
impl Session {
    pub(crate) fn events_for_test(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// Fan out without appending, to exercise out-of-order delivery
    pub(crate) fn broadcast_for_test(&self, event: Event) {
        let _ = self.live.send(event);
    }
}
