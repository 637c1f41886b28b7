//! Gateway orchestrator: admission, inbound dispatch, outbound routing and
//! disconnect cleanup.
//!
//! Transport-agnostic. A connection task hands the gateway the handshake
//! credential and the sending half of its outbound channel; everything the
//! gateway wants to push to that connection goes through the channel.

pub mod dispatch;

pub use dispatch::{Access, EventTable, Handler, HandlerFuture};

use crate::auth::CredentialVerifier;
use crate::config::{GatewayConfig, QuotaFailurePolicy};
use crate::messages::MessageStore;
use crate::presence::{AdmissionGate, ConnectionHandle, ConnectionRegistry, Outbound, QuotaCheck, QuotaCounter};
use crate::queue::OfflineQueue;
use crate::reconnect::{ReconnectAdvisory, ResumeStore};
use crate::store::KvStore;
use std::sync::Arc;
use switchboard_core::events::{codes, reasons, ConnectionErrorPayload, QueuedMessagesPayload};
use switchboard_core::{
    decode_frame, generate_id, now_millis, ChatMessage, Identity, InboundFrame, QueuedMessage,
    SbError, ServerEvent,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// An admitted connection as seen by event handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub conn_id: String,
    pub identity: Identity,
}

/// Why a handshake did not end in admission.
#[derive(Debug)]
pub enum Rejection {
    /// No bearer credential on the handshake.
    MissingCredential,
    /// The verifier refused the credential.
    InvalidCredential(SbError),
    /// The identity already holds `limit` connections.
    QuotaExceeded { current: u64, limit: u32 },
    /// The quota could not be read and policy says reject.
    QuotaUnavailable(SbError),
}

impl Rejection {
    /// The `connectionError` to send before closing, if any. Authentication
    /// failures close without a word.
    pub fn connection_error(&self) -> Option<ServerEvent> {
        match self {
            Rejection::MissingCredential | Rejection::InvalidCredential(_) => None,
            Rejection::QuotaExceeded { limit, .. } => {
                Some(ServerEvent::ConnectionError(ConnectionErrorPayload {
                    code: codes::MAX_CONNECTIONS_EXCEEDED.to_string(),
                    message: format!("maximum of {limit} concurrent connections reached"),
                }))
            }
            Rejection::QuotaUnavailable(_) => {
                Some(ServerEvent::ConnectionError(ConnectionErrorPayload {
                    code: codes::QUOTA_UNAVAILABLE.to_string(),
                    message: "connection quota temporarily unavailable".to_string(),
                }))
            }
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::MissingCredential => "missing_credential",
            Rejection::InvalidCredential(_) => "invalid_credential",
            Rejection::QuotaExceeded { .. } => "quota_exceeded",
            Rejection::QuotaUnavailable(_) => "quota_unavailable",
        }
    }
}

/// Outcome of routing one message to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed to this many live connections.
    Direct(usize),
    /// Recipient offline; parked in the offline queue.
    Queued,
    /// Recipient offline and the queue could not be written.
    Dropped,
}

/// The per-process gateway.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ConnectionRegistry>,
    quota: QuotaCounter,
    gate: AdmissionGate,
    queue: OfflineQueue,
    resume: ResumeStore,
    advisory: ReconnectAdvisory,
    verifier: Arc<dyn CredentialVerifier>,
    messages: Arc<dyn MessageStore>,
    events: EventTable,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn KvStore>,
        verifier: Arc<dyn CredentialVerifier>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        let quota = QuotaCounter::new(
            store.clone(),
            config.max_connections_per_identity,
            config.quota_ttl,
        );
        let queue = OfflineQueue::new(store.clone(), config.queue_ttl);
        let resume = ResumeStore::new(store, config.reconnect_state_ttl);
        let advisory = ReconnectAdvisory::from_config(&config);

        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            quota,
            gate: AdmissionGate::new(),
            queue,
            resume,
            advisory,
            verifier,
            messages,
            events: EventTable::standard(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn quota(&self) -> &QuotaCounter {
        &self.quota
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn resume(&self) -> &ResumeStore {
        &self.resume
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    /// Run the handshake for a new connection and greet it.
    ///
    /// On success the connection is registered, counted against the quota
    /// (standard identities only) and `sender` becomes its outbound channel.
    /// `connected` is the first event on that channel, followed by any queued
    /// messages. On failure nothing has been registered or counted.
    ///
    /// A standard identity's admission holds its [`AdmissionGate`] permit
    /// from the quota check through the queue drain, the same permit
    /// [`Gateway::deliver_or_enqueue`] takes, so a message is either drained
    /// here or delivered live afterwards.
    pub async fn admit(
        &self,
        credential: Option<&str>,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<ConnectionContext, Rejection> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(Rejection::MissingCredential)?;

        let identity = self.verifier.verify(credential).await.map_err(|e| {
            debug!(error = %e, "credential rejected");
            Rejection::InvalidCredential(e)
        })?;

        let ctx = ConnectionContext {
            conn_id: generate_id(),
            identity,
        };

        if ctx.identity.is_privileged() {
            self.greet(&ctx, &sender);
            self.registry
                .register(ConnectionHandle::new(ctx.conn_id.clone(), ctx.identity.clone(), sender))
                .await;
            info!(conn_id = %ctx.conn_id, identity = %ctx.identity.id, role = %ctx.identity.role, "connection admitted");
            return Ok(ctx);
        }

        let _permit = self.gate.enter(&ctx.identity.id).await;
        let id = ctx.identity.id.as_str();

        let counted = match self.quota.check(id).await {
            Ok(QuotaCheck::Allowed { .. }) => true,
            Ok(QuotaCheck::Exceeded { current, limit }) => {
                info!(identity = id, current, limit, "connection quota exceeded");
                return Err(Rejection::QuotaExceeded { current, limit });
            }
            Err(e) => match self.config.quota_store_failure {
                QuotaFailurePolicy::Reject => {
                    warn!(identity = id, error = %e, "quota check failed, rejecting");
                    return Err(Rejection::QuotaUnavailable(e));
                }
                QuotaFailurePolicy::Admit => {
                    warn!(identity = id, error = %e, "quota check failed, admitting uncounted");
                    false
                }
            },
        };

        // Nothing reaches the channel before registration, so `connected`
        // stays first. A rejected connection's channel is never pumped.
        self.greet(&ctx, &sender);
        self.registry
            .register(ConnectionHandle::new(ctx.conn_id.clone(), ctx.identity.clone(), sender).counted(counted))
            .await;

        if counted {
            if let Err(e) = self.quota.acquire(id).await {
                match self.config.quota_store_failure {
                    QuotaFailurePolicy::Reject => {
                        warn!(identity = id, error = %e, "quota increment failed, rejecting");
                        self.registry.unregister(&ctx.conn_id).await;
                        return Err(Rejection::QuotaUnavailable(e));
                    }
                    QuotaFailurePolicy::Admit => {
                        warn!(identity = id, error = %e, "quota increment failed, admitting uncounted");
                        self.registry.uncount(&ctx.conn_id).await;
                    }
                }
            }
        }

        info!(conn_id = %ctx.conn_id, identity = id, role = %ctx.identity.role, "connection admitted");
        self.flush_offline(&ctx).await;
        Ok(ctx)
    }

    fn greet(&self, ctx: &ConnectionContext, sender: &mpsc::Sender<Outbound>) {
        let connected = ServerEvent::Connected(self.advisory.connected(&ctx.conn_id));
        if sender.try_send(Outbound::Event(connected)).is_err() {
            warn!(conn_id = %ctx.conn_id, "could not queue connected event");
        }
    }

    async fn flush_offline(&self, ctx: &ConnectionContext) -> usize {
        let messages = match self.queue.drain(&ctx.identity.id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(identity = %ctx.identity.id, error = %e, "offline queue drain failed");
                return 0;
            }
        };
        if messages.is_empty() {
            return 0;
        }

        let count = messages.len();
        let batch = ServerEvent::QueuedMessages(QueuedMessagesPayload {
            messages: messages.clone(),
            count,
        });
        if self.registry.send_to(&ctx.conn_id, Outbound::Event(batch)).await {
            info!(conn_id = %ctx.conn_id, identity = %ctx.identity.id, count, "queued messages delivered");
            count
        } else {
            warn!(conn_id = %ctx.conn_id, count, "queued batch not delivered, requeueing");
            if let Err(e) = self.queue.requeue(&ctx.identity.id, &messages).await {
                warn!(identity = %ctx.identity.id, error = %e, "requeue failed, batch lost");
            }
            0
        }
    }

    /// Tear down a connection. Safe to call more than once; only the first
    /// call for a registered connection touches the quota.
    pub async fn on_disconnect(&self, conn_id: &str, reason: &str) -> bool {
        let Some(identity) = self.registry.identity_of(conn_id).await else {
            return false;
        };

        let _permit = if identity.is_privileged() {
            None
        } else {
            Some(self.gate.enter(&identity.id).await)
        };

        let Some(removal) = self.registry.unregister(conn_id).await else {
            return false;
        };

        if !identity.is_privileged() {
            let result = if removal.identity_now_empty {
                self.quota.reset(&identity.id).await
            } else if removal.handle.quota_counted {
                self.quota.release(&identity.id).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!(identity = %identity.id, error = %e, "quota release failed");
            }
        }

        info!(conn_id, identity = %identity.id, reason, "connection closed");
        true
    }

    /// Decode and handle one inbound text frame. Returns the reply for the
    /// sending connection, if any.
    pub async fn handle_text(&self, ctx: &ConnectionContext, text: &str) -> Option<ServerEvent> {
        match decode_frame(text) {
            Ok(frame) => self.handle_event(ctx, frame).await,
            Err(e) => {
                debug!(conn_id = %ctx.conn_id, error = %e, "undecodable frame");
                Some(ServerEvent::error("", e.code(), e.to_string()))
            }
        }
    }

    /// Route one decoded inbound event through the event table.
    pub async fn handle_event(&self, ctx: &ConnectionContext, frame: InboundFrame) -> Option<ServerEvent> {
        let InboundFrame { event, data } = frame;
        let Some(route) = self.events.lookup(&event) else {
            debug!(conn_id = %ctx.conn_id, event = %event, "unknown event");
            return Some(ServerEvent::error(
                &event,
                codes::UNKNOWN_EVENT,
                format!("unknown event `{event}`"),
            ));
        };

        if !route.access.permits(ctx.identity.role) {
            let err = SbError::Forbidden(format!("`{event}` is not available to {} identities", ctx.identity.role));
            info!(conn_id = %ctx.conn_id, identity = %ctx.identity.id, event = %event, "unauthorized action");
            return Some(ServerEvent::error(&event, err.code(), err.to_string()));
        }

        debug!(conn_id = %ctx.conn_id, event = %event, "inbound event");
        match (route.handler)(self, ctx, data).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(conn_id = %ctx.conn_id, event = %event, error = %e, "event failed");
                Some(ServerEvent::error(&event, e.code(), e.to_string()))
            }
        }
    }

    /// Push a message to every live connection of `recipient`, or park it in
    /// the offline queue if there are none. Never both.
    ///
    /// Serialized with the recipient's admission: a connection that comes up
    /// while the enqueue is in flight drains the message.
    pub async fn deliver_or_enqueue(&self, recipient: &str, message: &ChatMessage) -> Delivery {
        let _permit = self.gate.enter(recipient).await;
        let event = ServerEvent::NewMessage(message.clone());
        let delivered = self.registry.send_to_identity(recipient, &event).await;
        if delivered > 0 {
            return Delivery::Direct(delivered);
        }

        let queued = QueuedMessage::from_chat(message, now_millis());
        match self.queue.enqueue(recipient, &queued).await {
            Ok(_) => Delivery::Queued,
            Err(e) => {
                warn!(recipient, error = %e, "offline enqueue failed");
                Delivery::Dropped
            }
        }
    }

    /// Push an event to every privileged connection.
    pub async fn broadcast_privileged(&self, event: &ServerEvent) -> usize {
        self.registry.send_to_privileged(event, None).await
    }

    /// Ask every connection to come back later and close it.
    pub async fn request_reconnect_all(&self, reason: &str) -> usize {
        let advisory = ServerEvent::reconnect_requested(reason, now_millis());
        let mut notified = 0;
        for conn_id in self.registry.conn_ids().await {
            if self.registry.send_to(&conn_id, Outbound::Event(advisory.clone())).await {
                notified += 1;
            }
            self.registry
                .send_to(&conn_id, Outbound::Close { reason: reason.to_string() })
                .await;
        }
        notified
    }

    /// Shorthand used on graceful shutdown.
    pub async fn shutdown(&self) -> usize {
        let n = self.request_reconnect_all(reasons::SERVER_SHUTDOWN).await;
        info!(notified = n, "shutdown advisory sent");
        n
    }
}


#[cfg(test)]
mod tests {
    use super::harness::*;
    use super::*;
    use crate::store::quota_key;
    use switchboard_core::events::ConnectedPayload;
    use switchboard_core::Role;

    fn agent_reply(content: &str) -> ChatMessage {
        ChatMessage {
            id: format!("msg-{content}"),
            conversation_id: "conv-b".into(),
            sender_id: "agent-1".into(),
            sender_role: Role::Privileged,
            sender_name: None,
            content: content.into(),
            content_kind: "text".into(),
            created_at: 1,
        }
    }

    fn admit_policy() -> GatewayConfig {
        GatewayConfig {
            quota_store_failure: QuotaFailurePolicy::Admit,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_or_bad_credential_is_silent() {
        let h = harness(GatewayConfig::default());
        let (tx, _rx) = mpsc::channel(8);
        let r = h.gateway.admit(None, tx.clone()).await.unwrap_err();
        assert!(matches!(r, Rejection::MissingCredential));
        assert!(r.connection_error().is_none());

        let r = h.gateway.admit(Some("   "), tx.clone()).await.unwrap_err();
        assert!(matches!(r, Rejection::MissingCredential));

        let r = h.gateway.admit(Some("forged.token"), tx).await.unwrap_err();
        assert!(matches!(r, Rejection::InvalidCredential(_)));
        assert!(r.connection_error().is_none());
        assert!(h.gateway.registry().is_empty().await);
    }

    #[tokio::test]
    async fn connected_carries_advisory() {
        let h = harness(GatewayConfig::default());
        let mut c = h.connect("alice", Role::Standard).await;
        let events = c.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ServerEvent::Connected(ConnectedPayload {
                connection_id: c.ctx.conn_id.clone(),
                reconnect_delay_min: 1_000,
                reconnect_delay_max: 30_000,
                max_reconnect_attempts: 10,
            })
        );
    }

    #[tokio::test]
    async fn fourth_standard_connection_is_refused() {
        let h = harness(GatewayConfig::default());
        let _c1 = h.connect("alice", Role::Standard).await;
        let _c2 = h.connect("alice", Role::Standard).await;
        let _c3 = h.connect("alice", Role::Standard).await;

        let r = h.try_connect("alice", Role::Standard).await.err().unwrap();
        assert!(matches!(r, Rejection::QuotaExceeded { current: 3, limit: 3 }));
        match r.connection_error() {
            Some(ServerEvent::ConnectionError(p)) => {
                assert_eq!(p.code, "MAX_CONNECTIONS_EXCEEDED");
                assert!(p.message.contains('3'));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 3);
        assert_eq!(h.gateway.registry().connection_count("alice").await, 3);
    }

    #[tokio::test]
    async fn privileged_identities_are_unbounded() {
        let h = harness(GatewayConfig::default());
        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(h.connect("agent-1", Role::Privileged).await);
        }
        assert_eq!(h.gateway.registry().connection_count("agent-1").await, 5);
        assert_eq!(h.store.get(&quota_key("agent-1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_handshakes_respect_the_limit() {
        let h = harness(GatewayConfig::default());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gw = h.gateway.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(8);
                let ok = gw.admit(Some(&token("alice", Role::Standard)), tx).await.is_ok();
                (ok, rx)
            }));
        }
        let mut admitted = 0;
        let mut keep = Vec::new();
        for t in tasks {
            let (ok, rx) = t.await.unwrap();
            if ok {
                admitted += 1;
            }
            keep.push(rx);
        }
        assert_eq!(admitted, 3);
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn disconnect_decrements_then_resets() {
        let h = harness(GatewayConfig::default());
        let c1 = h.connect("alice", Role::Standard).await;
        let c2 = h.connect("alice", Role::Standard).await;
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 2);

        assert!(h.gateway.on_disconnect(&c1.ctx.conn_id, "client_closed").await);
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 1);

        // Repeated cleanup is a no-op.
        assert!(!h.gateway.on_disconnect(&c1.ctx.conn_id, "client_closed").await);
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 1);

        assert!(h.gateway.on_disconnect(&c2.ctx.conn_id, "client_closed").await);
        assert_eq!(h.store.get(&quota_key("alice")).await.unwrap(), None);
        assert!(!h.gateway.registry().is_online("alice").await);
    }

    #[tokio::test]
    async fn freed_slot_can_be_reused() {
        let h = harness(GatewayConfig::default());
        let c1 = h.connect("alice", Role::Standard).await;
        let _c2 = h.connect("alice", Role::Standard).await;
        let _c3 = h.connect("alice", Role::Standard).await;
        assert!(h.try_connect("alice", Role::Standard).await.is_err());

        h.gateway.on_disconnect(&c1.ctx.conn_id, "client_closed").await;
        assert!(h.try_connect("alice", Role::Standard).await.is_ok());
    }

    #[tokio::test]
    async fn offline_messages_arrive_in_order_after_connected() {
        let h = harness(GatewayConfig::default());
        let queue = h.gateway.queue();
        for (content, at) in [("m2", 200), ("m1", 100), ("m3", 300)] {
            let msg = QueuedMessage {
                conversation_id: Some("conv-b".into()),
                sender_id: "agent-1".into(),
                sender_role: Role::Privileged,
                sender_name: None,
                content: content.into(),
                content_kind: "text".into(),
                enqueued_at: at,
            };
            queue.enqueue("bob", &msg).await.unwrap();
        }

        let mut b = h.connect("bob", Role::Standard).await;
        let events = b.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "connected");
        let ServerEvent::QueuedMessages(batch) = &events[1] else {
            panic!("expected queuedMessages, got {:?}", events[1]);
        };
        assert_eq!(batch.count, 3);
        let stamps: Vec<u64> = batch.messages.iter().map(|m| m.enqueued_at).collect();
        assert_eq!(stamps, [100, 200, 300]);
        assert_eq!(h.store.get(&crate::store::offline_key("bob")).await.unwrap(), None);

        // Reconnecting right away finds nothing more.
        h.gateway.on_disconnect(&b.ctx.conn_id, "client_closed").await;
        let mut again = h.connect("bob", Role::Standard).await;
        assert_eq!(again.event_names(), ["connected"]);
    }

    #[tokio::test]
    async fn failed_batch_is_requeued() {
        let h = harness(GatewayConfig::default());
        let msg = ChatMessage {
            id: "m1".into(),
            conversation_id: "conv-b".into(),
            sender_id: "agent-1".into(),
            sender_role: Role::Privileged,
            sender_name: None,
            content: "hello".into(),
            content_kind: "text".into(),
            created_at: 1,
        };
        assert_eq!(h.gateway.deliver_or_enqueue("bob", &msg).await, Delivery::Queued);

        // Channel with room for `connected` only.
        let (tx, rx) = mpsc::channel(1);
        h.gateway.admit(Some(&token("bob", Role::Standard)), tx).await.unwrap();
        drop(rx);

        assert_eq!(h.gateway.queue().len("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn online_recipient_is_never_queued() {
        let h = harness(GatewayConfig::default());
        let mut b = h.connect("bob", Role::Standard).await;
        b.frames();

        let msg = ChatMessage {
            id: "m1".into(),
            conversation_id: "conv-b".into(),
            sender_id: "agent-1".into(),
            sender_role: Role::Privileged,
            sender_name: None,
            content: "hi".into(),
            content_kind: "text".into(),
            created_at: 1,
        };
        assert_eq!(h.gateway.deliver_or_enqueue("bob", &msg).await, Delivery::Direct(1));
        assert_eq!(b.event_names(), ["newMessage"]);
        assert_eq!(h.gateway.queue().len("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_advises_and_closes_everyone() {
        let h = harness(GatewayConfig::default());
        let mut a = h.connect("alice", Role::Standard).await;
        let mut s = h.connect("agent-1", Role::Privileged).await;
        a.frames();
        s.frames();

        assert_eq!(h.gateway.shutdown().await, 2);
        for client in [&mut a, &mut s] {
            let frames = client.frames();
            assert_eq!(frames.len(), 2);
            match &frames[0] {
                Outbound::Event(ServerEvent::ReconnectRequested(p)) => {
                    assert_eq!(p.reason, "server_shutdown")
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(matches!(frames[1], Outbound::Close { .. }));
        }
    }

    #[tokio::test]
    async fn enqueue_racing_admission_is_drained() {
        let store = Arc::new(FaultyStore::default());
        let h = harness_with(GatewayConfig::default(), store.clone());
        FaultyStore::set(&store.hold_push, true);

        let gw = h.gateway.clone();
        let delivery = tokio::spawn(async move { gw.deliver_or_enqueue("bob", &agent_reply("hi")).await });
        store.push_started.notified().await;

        let gw = h.gateway.clone();
        let (tx, mut rx) = mpsc::channel(8);
        let admission = tokio::spawn(async move {
            gw.admit(Some(&token("bob", Role::Standard)), tx).await.is_ok()
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!admission.is_finished());

        FaultyStore::set(&store.hold_push, false);
        store.push_release.notify_one();
        assert_eq!(delivery.await.unwrap(), Delivery::Queued);
        assert!(admission.await.unwrap());

        let mut names = Vec::new();
        while let Ok(Outbound::Event(e)) = rx.try_recv() {
            names.push(e.name());
        }
        assert_eq!(names, ["connected", "queuedMessages"]);
        assert_eq!(h.gateway.queue().len("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connected_precedes_events_pushed_mid_admission() {
        let store = Arc::new(FaultyStore::default());
        let h = harness_with(GatewayConfig::default(), store.clone());
        FaultyStore::set(&store.hold_incr, true);

        let gw = h.gateway.clone();
        let (tx, mut rx) = mpsc::channel(8);
        let admission = tokio::spawn(async move {
            gw.admit(Some(&token("alice", Role::Standard)), tx).await.is_ok()
        });
        store.incr_started.notified().await;

        // Registered but not yet counted: a live fan-out already reaches it.
        let pushed = h
            .gateway
            .registry()
            .send_to_identity("alice", &ServerEvent::NewMessage(agent_reply("early")))
            .await;
        assert_eq!(pushed, 1);

        FaultyStore::set(&store.hold_incr, false);
        store.incr_release.notify_one();
        assert!(admission.await.unwrap());

        let mut names = Vec::new();
        while let Ok(Outbound::Event(e)) = rx.try_recv() {
            names.push(e.name());
        }
        assert_eq!(names, ["connected", "newMessage"]);
    }

    #[tokio::test]
    async fn quota_read_failure_rejects_by_default() {
        let store = Arc::new(FaultyStore::default());
        let h = harness_with(GatewayConfig::default(), store.clone());
        FaultyStore::set(&store.fail_get, true);

        let r = h.try_connect("alice", Role::Standard).await.err().unwrap();
        assert!(matches!(r, Rejection::QuotaUnavailable(SbError::Store(_))));
        match r.connection_error() {
            Some(ServerEvent::ConnectionError(p)) => assert_eq!(p.code, "QUOTA_UNAVAILABLE"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.gateway.registry().is_empty().await);

        // Privileged identities never touch the counter.
        assert!(h.try_connect("agent-1", Role::Privileged).await.is_ok());
    }

    #[tokio::test]
    async fn quota_read_failure_admits_uncounted_when_configured() {
        let store = Arc::new(FaultyStore::default());
        let h = harness_with(admit_policy(), store.clone());

        FaultyStore::set(&store.fail_get, true);
        let uncounted = h.connect("alice", Role::Standard).await;
        FaultyStore::set(&store.fail_get, false);
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 0);

        let counted = h.connect("alice", Role::Standard).await;
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 1);

        // Closing the uncounted connection leaves the other's increment alone.
        assert!(h.gateway.on_disconnect(&uncounted.ctx.conn_id, "client_closed").await);
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 1);

        assert!(h.gateway.on_disconnect(&counted.ctx.conn_id, "client_closed").await);
        assert_eq!(h.store.get(&quota_key("alice")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_failure_unregisters_under_reject() {
        let store = Arc::new(FaultyStore::default());
        let h = harness_with(GatewayConfig::default(), store.clone());
        FaultyStore::set(&store.fail_incr, true);

        let r = h.try_connect("alice", Role::Standard).await.err().unwrap();
        assert!(matches!(r, Rejection::QuotaUnavailable(_)));
        assert!(!h.gateway.registry().is_online("alice").await);
        assert_eq!(h.store.get(&quota_key("alice")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_failure_admits_uncounted_when_configured() {
        let store = Arc::new(FaultyStore::default());
        let h = harness_with(admit_policy(), store.clone());

        FaultyStore::set(&store.fail_incr, true);
        let mut uncounted = h.connect("alice", Role::Standard).await;
        FaultyStore::set(&store.fail_incr, false);
        assert_eq!(uncounted.event_names(), ["connected"]);
        assert_eq!(h.gateway.registry().connection_count("alice").await, 1);

        let _counted = h.connect("alice", Role::Standard).await;
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 1);

        assert!(h.gateway.on_disconnect(&uncounted.ctx.conn_id, "client_closed").await);
        assert_eq!(h.gateway.quota().current("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_failure_drops_the_message() {
        let store = Arc::new(FaultyStore::default());
        let h = harness_with(GatewayConfig::default(), store.clone());
        FaultyStore::set(&store.fail_push, true);

        assert_eq!(h.gateway.deliver_or_enqueue("bob", &agent_reply("lost")).await, Delivery::Dropped);
        assert_eq!(h.gateway.queue().len("bob").await.unwrap(), 0);

        let mut b = h.connect("bob", Role::Standard).await;
        assert_eq!(b.event_names(), ["connected"]);
    }
}
