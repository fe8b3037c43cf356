//! Per-session append-only event log backing stream resumption

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// One outbound protocol message, stamped with its place in the session log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub session_id: String,
    /// Starts at 1, contiguous per session
    pub sequence: u64,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventStoreError {
    /// The reader's cursor points before the oldest retained event
    #[error("cursor {cursor} has expired; oldest retained event is {oldest}")]
    CursorExpired { cursor: u64, oldest: u64 },

    #[error("event log for session {0} is exhausted")]
    Exhausted(String),
}

/// Storage seam for session event logs.
///
/// Readers must always observe a contiguous, strictly increasing run of
/// sequences: `since` either returns every retained event after the cursor
/// or fails with [`EventStoreError::CursorExpired`].
pub trait EventStore: Send + Sync {
    /// Append a payload and return the stored event
    fn append(&self, session_id: &str, payload: Value) -> Result<Event, EventStoreError>;

    /// Snapshot of events with `sequence > cursor`, ascending
    fn since(&self, session_id: &str, cursor: u64) -> Result<Replay, EventStoreError>;

    /// Highest sequence ever assigned for the session (0 if none)
    fn last_sequence(&self, session_id: &str) -> u64;

    /// Drop the session's whole log
    fn evict(&self, session_id: &str);
}

/// Finite, owned snapshot of a slice of a session log
#[derive(Debug, Clone, Default)]
pub struct Replay {
    events: std::vec::IntoIter<Event>,
}

impl Replay {
    fn new(events: Vec<Event>) -> Self {
        Self {
            events: events.into_iter(),
        }
    }
}

impl Iterator for Replay {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.events.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.events.size_hint()
    }
}

impl ExactSizeIterator for Replay {}

#[derive(Debug, Default)]
struct SessionLog {
    events: VecDeque<Event>,
    last_sequence: u64,
}

/// In-process event store; each session's log sits under its own map shard
pub struct InMemoryEventStore {
    logs: DashMap<String, SessionLog>,
    /// 0 = unbounded
    max_events: usize,
}

impl InMemoryEventStore {
    pub fn new(max_events: usize) -> Self {
        Self {
            logs: DashMap::new(),
            max_events,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Number of sessions with a log
    pub fn session_count(&self) -> usize {
        self.logs.len()
    }

    /// Number of events currently retained for a session
    pub fn retained(&self, session_id: &str) -> usize {
        self.logs
            .get(session_id)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, session_id: &str, payload: Value) -> Result<Event, EventStoreError> {
        let mut log = self.logs.entry(session_id.to_string()).or_default();

        let sequence = log
            .last_sequence
            .checked_add(1)
            .ok_or_else(|| EventStoreError::Exhausted(session_id.to_string()))?;

        let event = Event {
            session_id: session_id.to_string(),
            sequence,
            payload,
            timestamp: Utc::now(),
        };
        log.last_sequence = sequence;
        log.events.push_back(event.clone());

        if self.max_events > 0 {
            while log.events.len() > self.max_events {
                log.events.pop_front();
            }
        }

        Ok(event)
    }

    fn since(&self, session_id: &str, cursor: u64) -> Result<Replay, EventStoreError> {
        let Some(log) = self.logs.get(session_id) else {
            return Ok(Replay::default());
        };

        if let Some(oldest) = log.events.front().map(|e| e.sequence) {
            if cursor.saturating_add(1) < oldest {
                return Err(EventStoreError::CursorExpired { cursor, oldest });
            }
        }

        let events = log
            .events
            .iter()
            .filter(|e| e.sequence > cursor)
            .cloned()
            .collect();
        Ok(Replay::new(events))
    }

    fn last_sequence(&self, session_id: &str) -> u64 {
        self.logs
            .get(session_id)
            .map(|log| log.last_sequence)
            .unwrap_or(0)
    }

    fn evict(&self, session_id: &str) {
        if let Some((_, log)) = self.logs.remove(session_id) {
            debug!(
                session_id = session_id,
                events = log.events.len(),
                "Evicted session event log"
            );
        }
    }
}
