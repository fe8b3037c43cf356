//! Resumable subscriber stream over a session's event log

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::event_store::Event;
use crate::protocol::RpcError;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(Event),
    /// Terminal; the stream yields nothing after this
    Error(RpcError),
}

/// Replays retained events after a cursor, then follows live publishes.
///
/// Sequences come out strictly increasing and gap-free. A live event that
/// arrives ahead of the next expected sequence triggers a refill from the
/// store; duplicates between the backlog and the live feed are skipped.
/// Ends when the session closes. Dropping the stream only detaches it.
pub struct EventStream {
    session: Arc<Session>,
    backlog: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    last_delivered: u64,
    closed: CancellationToken,
    finished: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("session", &self.session.id())
            .field("last_delivered", &self.last_delivered)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

impl EventStream {
    pub fn open(session: Arc<Session>, cursor: u64) -> Result<Self, GatewayError> {
        // Subscribe before reading the backlog so nothing published in between is missed.
        let live = session.live_receiver();
        let backlog: VecDeque<Event> = session.replay(cursor)?.into();
        debug!(
            session_id = %session.id(),
            cursor,
            backlog = backlog.len(),
            "Opened event stream"
        );
        session.attach_stream();
        Ok(Self {
            closed: session.closed(),
            session,
            backlog,
            live,
            last_delivered: cursor,
            finished: false,
        })
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Sequence of the last event handed out (the resume cursor)
    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }

    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.sequence <= self.last_delivered {
                    continue;
                }
                return Some(self.deliver(event));
            }

            tokio::select! {
                biased;
                received = self.live.recv() => match received {
                    Ok(event) if event.sequence <= self.last_delivered => continue,
                    Ok(event) if event.sequence == self.last_delivered + 1 => {
                        return Some(self.deliver(event));
                    }
                    Ok(_) => {
                        if let Err(item) = self.refill() {
                            return Some(item);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            session_id = %self.session.id(),
                            skipped,
                            "Subscriber lagged; catching up from the event log"
                        );
                        if let Err(item) = self.refill() {
                            return Some(item);
                        }
                    }
                    Err(RecvError::Closed) => {
                        self.finished = true;
                        return None;
                    }
                },
                _ = self.closed.cancelled() => {
                    debug!(session_id = %self.session.id(), "Session closed; ending stream");
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, event: Event) -> StreamItem {
        self.last_delivered = event.sequence;
        self.session.record_cursor(event.sequence);
        StreamItem::Event(event)
    }

    fn refill(&mut self) -> Result<(), StreamItem> {
        match self.session.replay(self.last_delivered) {
            Ok(events) => {
                self.backlog.extend(events);
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.session.id(), "Event stream cannot resume: {}", e);
                self.finished = true;
                Err(StreamItem::Error(e.to_rpc()))
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.session.detach_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::session::testing::{NullTransport, session};
    use crate::session::{SessionKind, SessionState};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next_sequence(stream: &mut EventStream) -> u64 {
        match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
            Ok(Some(StreamItem::Event(e))) => e.sequence,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backlog_then_live() {
        let (s, _, _rx) = session("s1");
        s.publish(json!(1)).unwrap();
        s.publish(json!(2)).unwrap();

        let mut stream = s.subscribe(Some(0)).unwrap();
        assert_eq!(s.stream_count(), 1);
        assert_eq!(next_sequence(&mut stream).await, 1);
        assert_eq!(next_sequence(&mut stream).await, 2);

        s.publish(json!(3)).unwrap();
        assert_eq!(next_sequence(&mut stream).await, 3);
        assert_eq!(s.cursor(), 3);
    }

    #[tokio::test]
    async fn test_resume_without_duplicates() {
        let (s, _, _rx) = session("s1");
        for i in 1..=3 {
            s.publish(json!(i)).unwrap();
        }
        let mut first = s.subscribe(Some(0)).unwrap();
        assert_eq!(next_sequence(&mut first).await, 1);
        assert_eq!(next_sequence(&mut first).await, 2);
        drop(first);
        assert_eq!(s.stream_count(), 0);
        assert_eq!(s.cursor(), 2);

        s.publish(json!(4)).unwrap();

        // No explicit cursor: resumes from the recorded one
        let mut second = s.subscribe(None).unwrap();
        assert_eq!(next_sequence(&mut second).await, 3);
        assert_eq!(next_sequence(&mut second).await, 4);
    }

    #[tokio::test]
    async fn test_gap_in_live_feed_is_filled_from_store() {
        let (s, _, _rx) = session("s1");
        let mut stream = s.subscribe(Some(0)).unwrap();

        // Simulate out-of-order fan-out: 2 is broadcast before 1
        let first = s.events_for_test().append("s1", json!(1)).unwrap();
        let second = s.events_for_test().append("s1", json!(2)).unwrap();
        s.broadcast_for_test(second);
        s.broadcast_for_test(first);

        assert_eq!(next_sequence(&mut stream).await, 1);
        assert_eq!(next_sequence(&mut stream).await, 2);
        s.publish(json!(3)).unwrap();
        assert_eq!(next_sequence(&mut stream).await, 3);
    }

    #[tokio::test]
    async fn test_stream_ends_when_session_closes() {
        let (s, _, _rx) = session("s1");
        s.mark_active();
        let mut stream = s.subscribe(Some(0)).unwrap();
        let waiter = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        s.request_close();
        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(item.is_none());
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_expired_cursor_refused() {
        let store = Arc::new(InMemoryEventStore::new(2));
        let (tx, _rx) = mpsc::unbounded_channel();
        let s = Arc::new(Session::new(
            "s1".into(),
            SessionKind::Standard,
            Box::new(NullTransport),
            store,
            Arc::new(tx),
        ));
        for i in 1..=5 {
            s.publish(json!(i)).unwrap();
        }
        let err = s.subscribe(Some(1)).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));

        let mut stream = s.subscribe(Some(3)).unwrap();
        assert_eq!(next_sequence(&mut stream).await, 4);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_catches_up() {
        let (s, _, _rx) = session("s1");
        let mut stream = s.subscribe(Some(0)).unwrap();
        for i in 0..600 {
            s.publish(json!(i)).unwrap();
        }
        for expected in 1..=600 {
            assert_eq!(next_sequence(&mut stream).await, expected);
        }
    }
}
