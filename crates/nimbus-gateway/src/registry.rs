//! Session registry, the process-wide map from session id to session
//!
//! The map lock is held only for map operations, never across a transport or
//! tool await. The registry observes every session it creates and drops a
//! session from the map as soon as it reaches Closed. The reaper task only
//! expires idle sessions.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::dispatch::ToolDispatcher;
use crate::error::GatewayError;
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::session::{
    LifecycleEvent, LifecycleObserver, Session, SessionInfo, SessionKind, SessionState,
};
use crate::transport::{StreamableTransport, Transport};

/// Maximum accepted length of a client-supplied session id
const MAX_SESSION_ID_LEN: usize = 128;

/// Prefix of ids minted for probe sessions
pub const PROBE_PREFIX: &str = "probe-";

/// Builds the transport for a new session, given its id
pub type TransportFactory = Arc<dyn Fn(&str) -> Box<dyn Transport> + Send + Sync>;

type SessionMap = RwLock<HashMap<String, Arc<Session>>>;

fn read(map: &SessionMap) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(map: &SessionMap) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
    map.write().unwrap_or_else(PoisonError::into_inner)
}

/// Removes sessions from the map as they reach Closed
struct ClosedSessionRemover {
    sessions: Weak<SessionMap>,
}

impl LifecycleObserver for ClosedSessionRemover {
    fn transition(&self, _event: &LifecycleEvent) {}

    fn closed(&self, session_id: &str) {
        let Some(sessions) = self.sessions.upgrade() else {
            return;
        };
        if write(&sessions).remove(session_id).is_some() {
            info!(session_id, "Removed closed session");
        }
    }
}

pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    events: Arc<dyn EventStore>,
    factory: TransportFactory,
    config: GatewayConfig,
    observer: Arc<dyn LifecycleObserver>,
}

/// A supplied id worth looking up: bounded length, no control characters
fn usable_id(id: &str) -> Option<&str> {
    let id = id.trim();
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN || id.chars().any(char::is_control) {
        return None;
    }
    Some(id)
}

impl SessionRegistry {
    pub fn new(config: GatewayConfig, events: Arc<dyn EventStore>, factory: TransportFactory) -> Self {
        let sessions = Arc::new(RwLock::new(HashMap::new()));
        let observer = Arc::new(ClosedSessionRemover {
            sessions: Arc::downgrade(&sessions),
        });
        Self {
            sessions,
            events,
            factory,
            config,
            observer,
        }
    }

    /// Registry whose sessions use [`StreamableTransport`] over an in-memory event log
    pub fn streamable(config: GatewayConfig, dispatcher: Arc<ToolDispatcher>) -> Self {
        let events = Arc::new(InMemoryEventStore::new(config.max_events_per_session));
        Self::new(config, events, StreamableTransport::factory(dispatcher))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Return the live session for `id`, or create a fresh one.
    ///
    /// An unknown, malformed or Closed id is ignored and a new id is minted.
    pub async fn resolve(&self, id: Option<&str>) -> Result<Arc<Session>, GatewayError> {
        let id = id.and_then(usable_id);

        if let Some(id) = id {
            if let Some(session) = read(&self.sessions).get(id) {
                if session.state() != SessionState::Closed {
                    return Ok(session.clone());
                }
            }
        }

        let mut sessions = write(&self.sessions);
        if let Some(id) = id {
            match sessions.get(id) {
                Some(session) if session.state() != SessionState::Closed => {
                    return Ok(session.clone());
                }
                Some(_) => {
                    debug!(session_id = id, "Dropping closed session");
                    sessions.remove(id);
                }
                None => debug!(session_id = id, "Unknown session id; creating a new session"),
            }
        }
        self.create(&mut sessions, SessionKind::Standard)
    }

    /// Live session for `id` without creating one
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let id = usable_id(id)?;
        read(&self.sessions)
            .get(id)
            .filter(|s| s.state() != SessionState::Closed)
            .cloned()
    }

    /// Mint an ephemeral session for a subscriber that had no usable id
    pub async fn create_probe(&self) -> Result<Arc<Session>, GatewayError> {
        let mut sessions = write(&self.sessions);
        self.create(&mut sessions, SessionKind::Probe)
    }

    fn create(
        &self,
        sessions: &mut HashMap<String, Arc<Session>>,
        kind: SessionKind,
    ) -> Result<Arc<Session>, GatewayError> {
        if sessions.len() >= self.config.max_sessions {
            warn!("Session limit reached ({})", self.config.max_sessions);
            return Err(GatewayError::Internal(format!(
                "session limit reached ({})",
                self.config.max_sessions
            )));
        }

        let id = match kind {
            SessionKind::Standard => Uuid::new_v4().to_string(),
            SessionKind::Probe => format!("{PROBE_PREFIX}{}", Uuid::new_v4()),
        };
        let session = Arc::new(Session::new(
            id.clone(),
            kind,
            (self.factory)(&id),
            self.events.clone(),
            self.observer.clone(),
        ));
        sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, ?kind, "Created session");
        Ok(session)
    }

    /// Remove a session from the map. Idempotent.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = write(&self.sessions).remove(id);
        if removed.is_some() {
            info!(session_id = id, "Removed session");
        }
        removed
    }

    pub async fn count(&self) -> usize {
        read(&self.sessions).len()
    }

    /// Sorted ids of all registered sessions
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every registered session, sorted by id
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = read(&self.sessions).values().cloned().collect();
        let mut list: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Start the idle reaper, which closes sessions past the idle timeout on
    /// every tick until `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(registry.config.reap_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sweep.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = sweep.tick() => {
                        let expired = registry.sweep_idle().await;
                        if expired > 0 {
                            info!("Expired {} idle session(s)", expired);
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        })
    }

    /// Close sessions idle past the configured timeout; returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        let Some(timeout) = self.config.idle_timeout() else {
            return 0;
        };
        let now = Utc::now();
        let idle: Vec<Arc<Session>> = read(&self.sessions)
            .values()
            .filter(|s| s.is_idle(timeout, now))
            .cloned()
            .collect();

        for session in &idle {
            info!(session_id = %session.id(), "Closing idle session");
            session.shutdown();
        }
        idle.len()
    }

    /// Close and drop every session; used on process shutdown
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = write(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.shutdown();
        }
        if !drained.is_empty() {
            info!("Closed {} session(s) on shutdown", drained.len());
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::NullTransport;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_registry(config: GatewayConfig) -> (Arc<SessionRegistry>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let factory: TransportFactory = Arc::new(move |_id: &str| -> Box<dyn Transport> {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(NullTransport)
        });
        let registry = SessionRegistry::new(
            config,
            Arc::new(InMemoryEventStore::unbounded()),
            factory,
        );
        (Arc::new(registry), built)
    }

    #[tokio::test]
    async fn test_resolve_creates_and_reuses() {
        let (registry, built) = counting_registry(GatewayConfig::default());
        let first = registry.resolve(None).await.unwrap();
        assert_eq!(first.state(), SessionState::Initializing);
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let again = registry.resolve(Some(first.id())).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_gets_fresh_session() {
        let (registry, _) = counting_registry(GatewayConfig::default());
        let session = registry.resolve(Some("made-up")).await.unwrap();
        assert_ne!(session.id(), "made-up");
        assert!(registry.get("made-up").await.is_none());

        let long = "x".repeat(MAX_SESSION_ID_LEN + 1);
        let other = registry.resolve(Some(&long)).await.unwrap();
        assert_ne!(other.id(), long);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (registry, _) = counting_registry(GatewayConfig::default());
        let mut ids = HashSet::new();
        for _ in 0..100 {
            ids.insert(registry.resolve(None).await.unwrap().id().to_string());
        }
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_converges() {
        let (registry, built) = counting_registry(GatewayConfig::default());
        let seed = registry.resolve(None).await.unwrap();
        let id = seed.id().to_string();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.resolve(Some(&id)).await.unwrap() })
            })
            .collect();
        for h in handles {
            assert!(Arc::ptr_eq(&h.await.unwrap(), &seed));
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let (registry, _) = counting_registry(GatewayConfig::default());
        let old = registry.resolve(None).await.unwrap();
        old.shutdown();
        assert!(registry.get(old.id()).await.is_none());

        let fresh = registry.resolve(Some(old.id())).await.unwrap();
        assert_ne!(fresh.id(), old.id());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (registry, _) = counting_registry(GatewayConfig::default());
        let s = registry.resolve(None).await.unwrap();
        assert!(registry.remove(s.id()).await.is_some());
        assert!(registry.remove(s.id()).await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let (registry, _) = counting_registry(GatewayConfig {
            max_sessions: 2,
            ..GatewayConfig::default()
        });
        registry.resolve(None).await.unwrap();
        registry.create_probe().await.unwrap();
        let err = registry.resolve(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(ref m) if m.contains("limit")));
    }

    #[tokio::test]
    async fn test_probe_prefix_and_listing() {
        let (registry, _) = counting_registry(GatewayConfig::default());
        let probe = registry.create_probe().await.unwrap();
        let standard = registry.resolve(None).await.unwrap();
        assert!(probe.id().starts_with(PROBE_PREFIX));
        assert_eq!(probe.kind(), SessionKind::Probe);

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert!(listed.windows(2).all(|w| w[0].id < w[1].id));
        let ids = registry.ids().await;
        assert!(ids.contains(&standard.id().to_string()));
    }

    #[tokio::test]
    async fn test_closed_session_leaves_map_without_reaper() {
        let (registry, _) = counting_registry(GatewayConfig::default());
        let s = registry.resolve(None).await.unwrap();
        let keep = registry.resolve(None).await.unwrap();
        s.mark_active();
        let work = s.begin_work().unwrap();
        s.request_close();
        assert_eq!(registry.count().await, 2);

        drop(work);
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.ids().await, vec![keep.id().to_string()]);
    }

    #[tokio::test]
    async fn test_reaper_expires_idle_sessions() {
        let (registry, _) = counting_registry(GatewayConfig {
            idle_timeout_secs: 1,
            reap_interval_secs: 1,
            ..GatewayConfig::default()
        });
        let shutdown = CancellationToken::new();
        let reaper = registry.spawn_reaper(shutdown.clone());
        registry.resolve(None).await.unwrap();

        for _ in 0..60 {
            if registry.count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(registry.count().await, 0);

        shutdown.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let (registry, _) = counting_registry(GatewayConfig {
            idle_timeout_secs: 1,
            ..GatewayConfig::default()
        });
        let idle = registry.resolve(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let busy = registry.resolve(None).await.unwrap();

        assert_eq!(registry.sweep_idle().await, 1);
        assert_eq!(idle.state(), SessionState::Closed);
        assert!(registry.get(idle.id()).await.is_none());
        assert_eq!(busy.state(), SessionState::Initializing);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let (registry, _) = counting_registry(GatewayConfig::default());
        let a = registry.resolve(None).await.unwrap();
        let b = registry.resolve(None).await.unwrap();
        b.mark_active();
        assert_eq!(registry.shutdown_all().await, 2);
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
        assert_eq!(registry.count().await, 0);
    }
}
