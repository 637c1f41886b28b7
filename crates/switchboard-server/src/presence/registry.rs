//! Connection registry: who is reachable right now.
//!
//! Holds every admitted connection in this process, indexed by connection id
//! and by identity (the presence entry). The registry is the only place that
//! owns the outbound side of a connection's channel; dropping a handle closes
//! that connection's write loop.

use std::collections::{HashMap, HashSet};
use switchboard_core::{Identity, ServerEvent};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Capacity of each connection's outbound channel.
pub const OUTBOUND_CAPACITY: usize = 256;

/// A frame queued for a connection's write loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Close the socket after flushing everything queued before this.
    Close { reason: String },
}

/// Liveness sub-state of an admitted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Admitted, nothing received yet.
    Admitted,
    /// Heartbeat or traffic seen within the last heartbeat interval.
    Active,
    /// Quiet for longer than one heartbeat interval, still inside the grace window.
    Idle,
}

/// A live connection owned by this process.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub identity: Identity,
    pub alive: bool,
    pub state: ConnState,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    /// Whether this connection holds an increment of the shared quota counter.
    pub quota_counted: bool,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(conn_id: String, identity: Identity, sender: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            identity,
            alive: true,
            state: ConnState::Admitted,
            connected_at: now,
            last_heartbeat: now,
            quota_counted: false,
            sender,
        }
    }

    pub fn counted(mut self, counted: bool) -> Self {
        self.quota_counted = counted;
        self
    }

    /// Queue a frame without waiting. Returns `false` if the channel is full or closed.
    pub fn send(&self, frame: Outbound) -> bool {
        self.sender.try_send(frame).is_ok()
    }

    /// Whether the write loop behind this handle has gone away.
    pub fn transport_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct Removal {
    pub handle: ConnectionHandle,
    /// True if this was the identity's last connection in this process.
    pub identity_now_empty: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<String, ConnectionHandle>,
    /// identity id → connection ids.
    presence: HashMap<String, HashSet<String>>,
}

impl RegistryInner {
    fn remove(&mut self, conn_id: &str) -> Option<Removal> {
        let handle = self.connections.remove(conn_id)?;
        let mut identity_now_empty = true;
        if let Some(set) = self.presence.get_mut(&handle.identity.id) {
            set.remove(conn_id);
            identity_now_empty = set.is_empty();
            if identity_now_empty {
                self.presence.remove(&handle.identity.id);
            }
        }
        Some(Removal {
            handle,
            identity_now_empty,
        })
    }
}

/// Registry of live connections for one gateway process.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an admitted connection under its identity.
    pub async fn register(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.write().await;
        // A connection id belongs to at most one presence entry.
        inner.remove(&handle.conn_id);

        let conn_id = handle.conn_id.clone();
        let identity = handle.identity.id.clone();
        inner
            .presence
            .entry(identity.clone())
            .or_default()
            .insert(conn_id.clone());
        inner.connections.insert(conn_id.clone(), handle);

        info!(conn_id = %conn_id, identity = %identity, "connection registered");
    }

    /// Remove a connection. Returns `None` if it was never registered or is
    /// already gone, so cleanup runs at most once per connection.
    pub async fn unregister(&self, conn_id: &str) -> Option<Removal> {
        let removal = self.inner.write().await.remove(conn_id);
        if let Some(r) = &removal {
            debug!(
                conn_id,
                identity = %r.handle.identity.id,
                last = r.identity_now_empty,
                "connection unregistered"
            );
        }
        removal
    }

    /// Record a heartbeat: alive again, timestamp refreshed.
    pub async fn heartbeat(&self, conn_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(conn_id) {
            Some(handle) => {
                handle.alive = true;
                handle.last_heartbeat = Instant::now();
                handle.state = ConnState::Active;
                true
            }
            None => false,
        }
    }

    /// Record that a connection no longer holds a quota increment.
    pub async fn uncount(&self, conn_id: &str) {
        if let Some(handle) = self.inner.write().await.connections.get_mut(conn_id) {
            handle.quota_counted = false;
        }
    }

    /// Flag a connection whose transport failed; the next sweep evicts it.
    pub async fn mark_dead(&self, conn_id: &str) {
        if let Some(handle) = self.inner.write().await.connections.get_mut(conn_id) {
            handle.alive = false;
        }
    }

    async fn mark_all_dead(&self, conn_ids: &[String]) {
        if conn_ids.is_empty() {
            return;
        }
        let mut inner = self.inner.write().await;
        for id in conn_ids {
            if let Some(handle) = inner.connections.get_mut(id) {
                handle.alive = false;
            }
        }
    }

    /// Queue a frame for one connection.
    pub async fn send_to(&self, conn_id: &str, frame: Outbound) -> bool {
        let sent = self
            .inner
            .read()
            .await
            .connections
            .get(conn_id)
            .is_some_and(|h| h.send(frame));
        if !sent {
            self.mark_dead(conn_id).await;
        }
        sent
    }

    /// Push an event to every live connection of `identity_id`.
    ///
    /// Returns how many connections accepted it. Connections whose channel
    /// rejects the frame are marked dead.
    pub async fn send_to_identity(&self, identity_id: &str, event: &ServerEvent) -> usize {
        let (delivered, failed) = {
            let inner = self.inner.read().await;
            let mut delivered = 0;
            let mut failed = Vec::new();
            if let Some(ids) = inner.presence.get(identity_id) {
                for id in ids {
                    match inner.connections.get(id) {
                        Some(h) if h.alive && h.send(Outbound::Event(event.clone())) => {
                            delivered += 1
                        }
                        Some(_) => failed.push(id.clone()),
                        None => {}
                    }
                }
            }
            (delivered, failed)
        };
        self.mark_all_dead(&failed).await;
        delivered
    }

    /// Push an event to every privileged connection, optionally skipping one.
    pub async fn send_to_privileged(&self, event: &ServerEvent, except: Option<&str>) -> usize {
        let (delivered, failed) = {
            let inner = self.inner.read().await;
            let mut delivered = 0;
            let mut failed = Vec::new();
            for (id, h) in &inner.connections {
                if !h.identity.is_privileged() || except == Some(id.as_str()) {
                    continue;
                }
                if h.alive && h.send(Outbound::Event(event.clone())) {
                    delivered += 1;
                } else {
                    failed.push(id.clone());
                }
            }
            (delivered, failed)
        };
        self.mark_all_dead(&failed).await;
        delivered
    }

    /// Number of live connections held by an identity.
    pub async fn connection_count(&self, identity_id: &str) -> usize {
        self.inner
            .read()
            .await
            .presence
            .get(identity_id)
            .map_or(0, HashSet::len)
    }

    pub async fn is_online(&self, identity_id: &str) -> bool {
        self.connection_count(identity_id).await > 0
    }

    pub async fn identity_of(&self, conn_id: &str) -> Option<Identity> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|h| h.identity.clone())
    }

    pub async fn state_of(&self, conn_id: &str) -> Option<ConnState> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|h| h.state)
    }

    /// Connections due for eviction at `now`: flagged dead, or silent for
    /// longer than `timeout`. Connections quiet for more than `idle_after`
    /// are moved to [`ConnState::Idle`] on the way.
    pub async fn expired(&self, now: Instant, idle_after: Duration, timeout: Duration) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();
        for (id, h) in inner.connections.iter_mut() {
            let age = now.saturating_duration_since(h.last_heartbeat);
            if !h.alive || age > timeout {
                expired.push(id.clone());
            } else if age > idle_after {
                h.state = ConnState::Idle;
            }
        }
        expired
    }

    /// Connections whose write loop ended without an explicit disconnect.
    pub async fn vanished(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .connections
            .values()
            .filter(|h| h.transport_closed())
            .map(|h| h.conn_id.clone())
            .collect()
    }

    /// Every registered connection id.
    pub async fn conn_ids(&self) -> Vec<String> {
        self.inner.read().await.connections.keys().cloned().collect()
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::Role;

    fn handle(conn: &str, who: &str, role: Role) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (
            ConnectionHandle::new(conn.into(), Identity::new(who, role), tx),
            rx,
        )
    }

    fn ack() -> ServerEvent {
        ServerEvent::reconnect_requested("test", 0)
    }

    #[tokio::test]
    async fn register_and_unregister_tracks_presence() {
        let reg = ConnectionRegistry::new();
        let (h1, _rx1) = handle("c1", "alice", Role::Standard);
        let (h2, _rx2) = handle("c2", "alice", Role::Standard);
        reg.register(h1).await;
        reg.register(h2).await;
        assert_eq!(reg.connection_count("alice").await, 2);

        let r = reg.unregister("c1").await.unwrap();
        assert!(!r.identity_now_empty);
        let r = reg.unregister("c2").await.unwrap();
        assert!(r.identity_now_empty);
        assert!(!reg.is_online("alice").await);

        // Second removal is a no-op.
        assert!(reg.unregister("c2").await.is_none());
    }

    #[tokio::test]
    async fn reregistering_moves_connection_between_entries() {
        let reg = ConnectionRegistry::new();
        let (h, _rx) = handle("c1", "alice", Role::Standard);
        reg.register(h).await;
        let (h, _rx2) = handle("c1", "bob", Role::Standard);
        reg.register(h).await;
        assert_eq!(reg.connection_count("alice").await, 0);
        assert_eq!(reg.connection_count("bob").await, 1);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn send_to_identity_reaches_every_device() {
        let reg = ConnectionRegistry::new();
        let (h1, mut rx1) = handle("c1", "alice", Role::Standard);
        let (h2, mut rx2) = handle("c2", "alice", Role::Standard);
        let (h3, mut rx3) = handle("c3", "bob", Role::Standard);
        reg.register(h1).await;
        reg.register(h2).await;
        reg.register(h3).await;

        assert_eq!(reg.send_to_identity("alice", &ack()).await, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
        assert_eq!(reg.send_to_identity("nobody", &ack()).await, 0);
    }

    #[tokio::test]
    async fn closed_transport_is_marked_dead_and_vanished() {
        let reg = ConnectionRegistry::new();
        let (h, rx) = handle("c1", "alice", Role::Standard);
        reg.register(h).await;
        drop(rx);

        assert_eq!(reg.vanished().await, vec!["c1".to_string()]);
        assert_eq!(reg.send_to_identity("alice", &ack()).await, 0);
        let expired = reg
            .expired(Instant::now(), Duration::from_secs(25), Duration::from_secs(60))
            .await;
        assert_eq!(expired, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn privileged_broadcast_skips_standard_and_sender() {
        let reg = ConnectionRegistry::new();
        let (a1, mut rx_a1) = handle("a1", "agent-1", Role::Privileged);
        let (a2, mut rx_a2) = handle("a2", "agent-2", Role::Privileged);
        let (u, mut rx_u) = handle("u1", "alice", Role::Standard);
        reg.register(a1).await;
        reg.register(a2).await;
        reg.register(u).await;

        assert_eq!(reg.send_to_privileged(&ack(), Some("a1")).await, 1);
        assert!(rx_a1.try_recv().is_err());
        assert!(rx_a2.try_recv().is_ok());
        assert!(rx_u.try_recv().is_err());
    }

    #[tokio::test]
    async fn expiry_and_idle_transitions() {
        let reg = ConnectionRegistry::new();
        let (h, _rx) = handle("c1", "alice", Role::Standard);
        reg.register(h).await;
        assert!(reg.heartbeat("c1").await);
        assert_eq!(reg.state_of("c1").await, Some(ConnState::Active));

        let interval = Duration::from_secs(25);
        let timeout = Duration::from_secs(60);
        let start = Instant::now();

        assert!(reg.expired(start + Duration::from_secs(30), interval, timeout).await.is_empty());
        assert_eq!(reg.state_of("c1").await, Some(ConnState::Idle));

        let expired = reg.expired(start + Duration::from_secs(61), interval, timeout).await;
        assert_eq!(expired, vec!["c1".to_string()]);
    }
}
