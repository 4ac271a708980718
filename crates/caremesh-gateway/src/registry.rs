use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use caremesh_types::events::{PresenceStatus, ServerEvent};

use crate::error::RelayError;
use crate::presence;
use crate::store::{Store, blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the writer half of a connection is asked to send.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Transport-level liveness probe.
    Ping,
    Close { code: u16, reason: String },
}

/// One live transport session.
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: OnceLock<Uuid>,
    outbound: mpsc::Sender<Outbound>,
    alive: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The bound identity, `None` until authenticated.
    pub fn identity(&self) -> Option<Uuid> {
        self.identity.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Non-blocking enqueue. A full queue means the client cannot keep up, so
    /// the connection is closed rather than silently losing events.
    fn send(&self, msg: Outbound) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %self.id, "Outbound queue full, closing slow connection");
                self.cancel.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn touch(&self) {
        self.alive.store(true, Ordering::Release);
        if let Ok(mut at) = self.last_heartbeat.lock() {
            *at = Instant::now();
        }
    }

    fn since_heartbeat(&self, now: Instant) -> Duration {
        self.last_heartbeat
            .lock()
            .map(|at| now.saturating_duration_since(*at))
            .unwrap_or(Duration::MAX)
    }
}

/// Returned by [`SessionRegistry::register`] to the task that owns the socket.
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Fires when the registry drops the connection.
    pub cancel: CancellationToken,
}

/// Maps identities to their live connections and owns presence.
///
/// Each identity has its own async lock. Admission and removal for the same
/// identity are serialized on it, and the durable presence write plus the
/// broadcast happen while it is held, so an offline announcement can never
/// overtake the online announcement of a connection admitted concurrently.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn Store>,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    identities: DashMap<Uuid, Arc<tokio::sync::Mutex<HashSet<ConnectionId>>>>,
    queue_capacity: usize,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                connections: DashMap::new(),
                identities: DashMap::new(),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Track a freshly accepted, not yet authenticated connection.
    pub fn register(&self) -> Registration {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let cancel = CancellationToken::new();
        let handle = Arc::new(ConnectionHandle {
            id,
            identity: OnceLock::new(),
            outbound: tx,
            alive: AtomicBool::new(true),
            last_heartbeat: Mutex::new(Instant::now()),
            cancel: cancel.clone(),
        });
        self.inner.connections.insert(id, handle);
        debug!(connection = %id, "Connection registered");

        Registration {
            id,
            outbound: rx,
            cancel,
        }
    }

    /// Bind `conn` to `identity`. A connection binds at most once.
    pub async fn admit(&self, conn: ConnectionId, identity: Uuid) -> Result<(), RelayError> {
        let handle = self.handle(conn).ok_or(RelayError::ConnectionClosed)?;
        handle
            .identity
            .set(identity)
            .map_err(|_| RelayError::AlreadyBound)?;

        let slot = self.slot(identity);
        let mut live = slot.lock().await;
        // remove() cancels before it takes this lock.
        if handle.is_closed() {
            drop(live);
            drop(slot);
            self.prune_slot(identity);
            return Err(RelayError::ConnectionClosed);
        }

        let first = live.is_empty();
        live.insert(conn);
        info!(%identity, connection = %conn, devices = live.len(), "Connection admitted");

        if first {
            if let Err(e) = blocking(&self.inner.store, move |s| s.set_presence(identity, true)).await {
                warn!(%identity, "Failed to persist online presence: {}", e);
            }
            presence::announce(self, identity, PresenceStatus::Online);
        }
        Ok(())
    }

    /// Drop a connection. Presence flips to offline only when this was the
    /// identity's last one. Returns the identity that went offline, if any.
    pub async fn remove(&self, conn: ConnectionId) -> Option<Uuid> {
        let (_, handle) = self.inner.connections.remove(&conn)?;
        handle.cancel.cancel();

        let identity = handle.identity()?;
        let slot = self.slot(identity);
        let mut live = slot.lock().await;
        if !live.remove(&conn) {
            drop(live);
            drop(slot);
            self.prune_slot(identity);
            return None;
        }
        info!(%identity, connection = %conn, devices = live.len(), "Connection removed");

        if !live.is_empty() {
            return None;
        }
        if let Err(e) = blocking(&self.inner.store, move |s| s.set_presence(identity, false)).await {
            warn!(%identity, "Failed to persist offline presence: {}", e);
        }
        presence::announce(self, identity, PresenceStatus::Offline);
        drop(live);
        drop(slot);
        self.prune_slot(identity);
        Some(identity)
    }

    pub async fn live_connections_for(&self, identity: Uuid) -> Vec<ConnectionId> {
        let Some(slot) = self.inner.identities.get(&identity).map(|s| s.clone()) else {
            return vec![];
        };
        let live = slot.lock().await;
        live.iter().copied().collect()
    }

    pub async fn is_online(&self, identity: Uuid) -> bool {
        !self.live_connections_for(identity).await.is_empty()
    }

    /// Identities with at least one live connection.
    pub async fn online_identities(&self) -> Vec<Uuid> {
        let slots: Vec<(Uuid, Arc<tokio::sync::Mutex<HashSet<ConnectionId>>>)> = self
            .inner
            .identities
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut online = Vec::new();
        for (identity, slot) in slots {
            if !slot.lock().await.is_empty() {
                online.push(identity);
            }
        }
        online
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<Uuid> {
        self.handle(conn).and_then(|h| h.identity())
    }

    /// Queue an event for one connection. False if it is gone or cannot take
    /// more; the caller treats that as the recipient being offline.
    pub fn push(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        self.handle(conn)
            .is_some_and(|h| h.send(Outbound::Event(event)))
    }

    /// Push to every live connection of `identity`. Returns how many took it.
    pub async fn push_to_identity(&self, identity: Uuid, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for conn in self.live_connections_for(identity).await {
            if self.push(conn, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue an event for every authenticated connection not bound to `except`.
    pub(crate) fn push_to_all_except(&self, except: Uuid, event: &ServerEvent) -> usize {
        let targets: Vec<Arc<ConnectionHandle>> = self
            .inner
            .connections
            .iter()
            .filter(|e| e.value().identity().is_some_and(|id| id != except))
            .map(|e| e.value().clone())
            .collect();

        targets
            .iter()
            .filter(|h| h.send(Outbound::Event(event.clone())))
            .count()
    }

    /// Ask the writer to send a close frame, then stop the connection.
    pub fn close(&self, conn: ConnectionId, code: u16, reason: &str) {
        if let Some(handle) = self.handle(conn) {
            let _ = handle.outbound.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    pub fn mark_heartbeat(&self, conn: ConnectionId) {
        if let Some(handle) = self.handle(conn) {
            handle.touch();
        }
    }

    /// One heartbeat cycle. A connection that has not answered since the
    /// previous sweep and whose last heartbeat is at least `threshold` old is
    /// evicted; everyone else is probed again.
    pub async fn sweep_dead(&self, threshold: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let handles: Vec<Arc<ConnectionHandle>> = self
            .inner
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let mut dead = Vec::new();
        for handle in handles {
            let answered = handle.alive.swap(false, Ordering::AcqRel);
            if !answered && handle.since_heartbeat(now) >= threshold {
                dead.push(handle.id);
            } else {
                handle.send(Outbound::Ping);
            }
        }

        for conn in &dead {
            warn!(connection = %conn, "Heartbeat missed, evicting connection");
            self.remove(*conn).await;
        }
        dead
    }

    /// Run [`sweep_dead`](Self::sweep_dead) every `period` until `shutdown`.
    pub fn spawn_sweeper(
        &self,
        period: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_dead(period).await;
                        if !evicted.is_empty() {
                            info!("Heartbeat sweep evicted {} connection(s)", evicted.len());
                        }
                    }
                }
            }
        })
    }

    fn handle(&self, conn: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.inner.connections.get(&conn).map(|h| h.clone())
    }

    fn slot(&self, identity: Uuid) -> Arc<tokio::sync::Mutex<HashSet<ConnectionId>>> {
        self.inner
            .identities
            .entry(identity)
            .or_default()
            .clone()
    }

    // Drop an empty slot nobody else holds. `slot()` clones under the same
    // shard lock, so a waiting admit always keeps its entry alive.
    fn prune_slot(&self, identity: Uuid) {
        self.inner.identities.remove_if(&identity, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|live| live.is_empty())
        });
    }
}
