//! Registry of live bidirectional sessions.
//!
//! Every inbound event touches the session's activity clock. A single
//! periodic sweep evicts sessions that stayed silent longer than the idle
//! window; there are no per-session timers. When the last session leaves,
//! the connection lifecycle manager is told it can close the backing store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use campusdock_protocol::{ServerMessage, SessionStatusEntry};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::ActivityClock;

/// Outbound side of a session, provided by the transport layer.
pub trait SessionTransport: Send + Sync {
    /// Queue a message without blocking. Returns false if it was dropped.
    fn deliver(&self, msg: ServerMessage) -> bool;

    /// Ask the transport to hang up. Must be safe to call more than once.
    fn force_disconnect(&self);
}

/// Signals from the registry to whoever owns the backing-store connection.
pub trait ConnectionDemand: Send + Sync {
    fn demand_observed(&self);
    fn idle_candidate(&self);
}

/// Identity of a session as announced by the transport layer
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub peer_address: SocketAddr,
    pub client_descriptor: String,
}

struct SessionEntry {
    info: SessionInfo,
    connected_at: Instant,
    activity: ActivityClock,
    transport: Arc<dyn SessionTransport>,
}

/// Live sessions keyed by id
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    demand: Arc<dyn ConnectionDemand>,
}

impl SessionRegistry {
    pub fn new(demand: Arc<dyn ConnectionDemand>) -> Self {
        Self {
            sessions: DashMap::new(),
            demand,
        }
    }

    /// Add a session with `lastSeenAt = now`.
    pub fn register(&self, info: SessionInfo, transport: Arc<dyn SessionTransport>) {
        let now = Instant::now();
        let id = info.id.clone();
        let peer = info.peer_address;
        let previous = self.sessions.insert(
            id.clone(),
            SessionEntry {
                info,
                connected_at: now,
                activity: ActivityClock::starting_at(now),
                transport,
            },
        );
        if previous.is_some() {
            warn!(
                component = "registry",
                event = "session.register.replaced",
                session_id = %id,
                "Session id registered twice, previous record replaced"
            );
        }

        self.demand.demand_observed();

        info!(
            component = "registry",
            event = "session.registered",
            session_id = %id,
            peer = %peer,
            count = self.sessions.len(),
            "Session registered"
        );
    }

    /// Record activity. Unknown ids are ignored; the session may have just
    /// been evicted and must not be resurrected.
    pub fn touch(&self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut entry) => {
                entry.activity.touch();
                true
            }
            None => false,
        }
    }

    /// Delete a session record. Idempotent.
    pub fn remove(&self, id: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(id) else {
            return false;
        };

        info!(
            component = "registry",
            event = "session.removed",
            session_id = %id,
            lifetime_ms = entry.connected_at.elapsed().as_millis() as u64,
            count = self.sessions.len(),
            "Session removed"
        );
        self.signal_if_empty();
        true
    }

    /// Evict every session silent for longer than `idle_window` as of `now`.
    ///
    /// Returns the evicted ids. Each evicted transport is force-disconnected
    /// exactly once.
    pub fn sweep(&self, now: Instant, idle_window: Duration) -> Vec<String> {
        // Collect first: removing while iterating would deadlock on the shard.
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.activity.is_idle(now, idle_window))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for id in candidates {
            let removed = self
                .sessions
                .remove_if(&id, |_, entry| entry.activity.is_idle(now, idle_window));
            if let Some((_, entry)) = removed {
                info!(
                    component = "registry",
                    event = "session.evicted",
                    session_id = %id,
                    idle_ms = entry.activity.idle_for(now).as_millis() as u64,
                    "Evicting idle session"
                );
                entry.transport.force_disconnect();
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            self.signal_if_empty();
        }
        evicted
    }

    /// Spawn the periodic sweep. The task only holds a weak reference and
    /// stops once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, idle_window: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let first_tick = Instant::now() + interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                let evicted = registry.sweep(Instant::now(), idle_window);
                debug!(
                    component = "registry",
                    event = "session.sweep.tick",
                    evicted = evicted.len(),
                    remaining = registry.len(),
                    "Idle sweep finished"
                );
            }
        })
    }

    /// Snapshot for diagnostics, oldest connection first.
    pub fn list_status(&self) -> Vec<SessionStatusEntry> {
        let now = Instant::now();
        let mut rows: Vec<(Instant, SessionStatusEntry)> = self
            .sessions
            .iter()
            .map(|entry| {
                (
                    entry.connected_at,
                    SessionStatusEntry {
                        id: entry.info.id.clone(),
                        peer_address: entry.info.peer_address.to_string(),
                        client_descriptor: entry.info.client_descriptor.clone(),
                        idle_ms: entry.activity.idle_for(now).as_millis() as u64,
                        connected_ms: now.saturating_duration_since(entry.connected_at).as_millis()
                            as u64,
                    },
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Best-effort delivery to one session.
    pub fn deliver(&self, id: &str, msg: ServerMessage) -> bool {
        // Clone the transport out so the shard lock is not held while sending.
        let transport = self.sessions.get(id).map(|e| Arc::clone(&e.transport));
        transport.is_some_and(|t| t.deliver(msg))
    }

    /// Best-effort delivery to every session. Returns how many accepted it.
    pub fn broadcast(&self, msg: ServerMessage) -> usize {
        let transports: Vec<Arc<dyn SessionTransport>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(&e.transport))
            .collect();
        transports
            .into_iter()
            .filter(|t| t.deliver(msg.clone()))
            .count()
    }

    /// Operator-triggered hang-up of a single session.
    pub fn disconnect(&self, id: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(id) else {
            return false;
        };
        info!(
            component = "registry",
            event = "session.disconnected_by_operator",
            session_id = %id,
            "Disconnecting session"
        );
        entry.transport.force_disconnect();
        self.signal_if_empty();
        true
    }

    /// Operator-triggered sweep with a custom threshold.
    pub fn disconnect_idle(&self, threshold: Duration) -> Vec<String> {
        self.sweep(Instant::now(), threshold)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn signal_if_empty(&self) {
        if self.sessions.is_empty() {
            debug!(
                component = "registry",
                event = "session.registry.empty",
                "No live sessions remain"
            );
            self.demand.idle_candidate();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::lifecycle::tests::{settle, FakeConnector};
    use crate::lifecycle::ConnectionLifecycleManager;

    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub delivered: Mutex<Vec<ServerMessage>>,
        pub disconnects: AtomicUsize,
        pub refuse: AtomicBool,
    }

    impl FakeTransport {
        pub(crate) fn messages(&self) -> Vec<ServerMessage> {
            self.delivered.lock().unwrap().clone()
        }

        pub(crate) fn take(&self) -> Vec<ServerMessage> {
            std::mem::take(&mut *self.delivered.lock().unwrap())
        }
    }

    impl SessionTransport for FakeTransport {
        fn deliver(&self, msg: ServerMessage) -> bool {
            if self.refuse.load(Ordering::SeqCst) {
                return false;
            }
            self.delivered.lock().unwrap().push(msg);
            true
        }

        fn force_disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingDemand {
        pub observed: AtomicUsize,
        pub idle: AtomicUsize,
    }

    impl ConnectionDemand for RecordingDemand {
        fn demand_observed(&self) {
            self.observed.fetch_add(1, Ordering::SeqCst);
        }

        fn idle_candidate(&self) {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn info(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            peer_address: "127.0.0.1:5000".parse().unwrap(),
            client_descriptor: format!("test-client/{id}"),
        }
    }

    fn new_registry() -> (Arc<SessionRegistry>, Arc<RecordingDemand>) {
        let demand = Arc::new(RecordingDemand::default());
        (Arc::new(SessionRegistry::new(demand.clone())), demand)
    }

    #[tokio::test(start_paused = true)]
    async fn register_signals_demand_and_last_remove_signals_idle() {
        let (registry, demand) = new_registry();
        registry.register(info("s1"), Arc::new(FakeTransport::default()));
        registry.register(info("s2"), Arc::new(FakeTransport::default()));
        assert_eq!(demand.observed.load(Ordering::SeqCst), 2);

        assert!(registry.remove("s1"));
        assert_eq!(demand.idle.load(Ordering::SeqCst), 0);

        assert!(registry.remove("s2"));
        assert!(!registry.remove("s2"));
        assert_eq!(demand.idle.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_after_eviction_does_not_resurrect() {
        let (registry, _demand) = new_registry();
        let transport = Arc::new(FakeTransport::default());
        registry.register(info("s1"), transport.clone());

        tokio::time::advance(Duration::from_secs(200)).await;
        let evicted = registry.sweep(Instant::now(), Duration::from_secs(180));
        assert_eq!(evicted, vec!["s1".to_string()]);

        assert!(!registry.touch("s1"));
        assert!(!registry.contains("s1"));
        assert!(registry.list_status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn touched_session_survives_sweep() {
        let (registry, _demand) = new_registry();
        let quiet = Arc::new(FakeTransport::default());
        let chatty = Arc::new(FakeTransport::default());
        registry.register(info("quiet"), quiet.clone());
        registry.register(info("chatty"), chatty.clone());

        tokio::time::advance(Duration::from_secs(170)).await;
        assert!(registry.touch("chatty"));
        tokio::time::advance(Duration::from_secs(20)).await;

        let evicted = registry.sweep(Instant::now(), Duration::from_secs(180));
        assert_eq!(evicted, vec!["quiet".to_string()]);
        assert_eq!(quiet.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(chatty.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_evicts_on_next_tick_exactly_once() {
        let (registry, demand) = new_registry();
        let transport = Arc::new(FakeTransport::default());
        registry.register(info("s1"), transport.clone());
        let _sweeper =
            registry.spawn_sweeper(Duration::from_secs(30), Duration::from_secs(180));

        // Step one second at a time so every tick lands on its own deadline.
        for _ in 0..181 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert!(registry.contains("s1"), "tick at 180s sees exactly 180s of silence");

        for _ in 0..29 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert!(!registry.contains("s1"));
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(demand.idle.load(Ordering::SeqCst), 1);

        for _ in 0..90 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_tolerates_empty_registry_and_stops_when_dropped() {
        let (registry, demand) = new_registry();
        let sweeper =
            registry.spawn_sweeper(Duration::from_secs(30), Duration::from_secs(180));

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert!(!sweeper.is_finished());
        assert_eq!(demand.idle.load(Ordering::SeqCst), 0);

        drop(registry);
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn last_session_leaving_closes_backing_store_immediately() {
        let (connector, _stats) = FakeConnector::new();
        let manager = ConnectionLifecycleManager::new(connector, Duration::from_secs(600));
        let registry = SessionRegistry::new(Arc::new(manager.clone()));

        registry.register(info("s1"), Arc::new(FakeTransport::default()));
        drop(manager.acquire().await.unwrap());
        assert!(manager.is_open());

        registry.remove("s1");
        assert!(!manager.is_open());
        settle().await;
        assert_eq!(manager.closes_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_leaving_mid_open_still_closes_store_before_next_tick() {
        let (mut connector, _stats) = FakeConnector::new();
        connector.open_delay = Duration::from_millis(50);
        let manager = ConnectionLifecycleManager::new(connector, Duration::from_secs(60));
        let registry = Arc::new(SessionRegistry::new(Arc::new(manager.clone())));
        let _sweeper =
            registry.spawn_sweeper(Duration::from_secs(30), Duration::from_secs(180));

        registry.register(info("s1"), Arc::new(FakeTransport::default()));
        let warmup = manager.clone();
        tokio::spawn(async move { drop(warmup.acquire().await) });
        settle().await;
        tokio::time::advance(Duration::from_millis(10)).await;

        registry.remove("s1");
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        settle().await;
        assert!(!manager.is_open(), "closed once the warm-up lease dropped");
        assert_eq!(manager.closes_total(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(!manager.is_open());
        assert_eq!(manager.opens_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn list_status_reports_oldest_first() {
        let (registry, _demand) = new_registry();
        registry.register(info("b"), Arc::new(FakeTransport::default()));
        tokio::time::advance(Duration::from_secs(5)).await;
        registry.register(info("a"), Arc::new(FakeTransport::default()));
        tokio::time::advance(Duration::from_secs(2)).await;

        let rows = registry.list_status();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "b");
        assert_eq!(rows[0].idle_ms, 7_000);
        assert_eq!(rows[0].connected_ms, 7_000);
        assert_eq!(rows[1].id, "a");
        assert_eq!(rows[1].idle_ms, 2_000);
        assert_eq!(rows[1].peer_address, "127.0.0.1:5000");
        assert_eq!(rows[1].client_descriptor, "test-client/a");
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_and_broadcast_are_best_effort() {
        let (registry, _demand) = new_registry();
        let open = Arc::new(FakeTransport::default());
        let full = Arc::new(FakeTransport::default());
        full.refuse.store(true, Ordering::SeqCst);
        registry.register(info("open"), open.clone());
        registry.register(info("full"), full.clone());

        assert!(!registry.deliver("missing", ServerMessage::Pong));
        assert!(!registry.deliver("full", ServerMessage::Pong));
        assert!(registry.deliver("open", ServerMessage::Pong));

        let accepted = registry.broadcast(ServerMessage::CourseAdded {
            message: "Nuevo curso agregado".into(),
        });
        assert_eq!(accepted, 1);
        assert_eq!(open.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_disconnects() {
        let (registry, demand) = new_registry();
        let a = Arc::new(FakeTransport::default());
        let b = Arc::new(FakeTransport::default());
        registry.register(info("a"), a.clone());
        tokio::time::advance(Duration::from_secs(60)).await;
        registry.register(info("b"), b.clone());

        assert_eq!(
            registry.disconnect_idle(Duration::from_secs(30)),
            vec!["a".to_string()]
        );
        assert!(registry.disconnect("b"));
        assert!(!registry.disconnect("b"));

        assert_eq!(a.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(b.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(demand.idle.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
