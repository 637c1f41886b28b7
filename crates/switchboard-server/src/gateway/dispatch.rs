//! Inbound event table: event name → access rule + handler.
//!
//! Built once when the gateway is constructed. Handlers return the reply for
//! the sending connection (if any) and push everything else through the
//! registry themselves.

use super::{ConnectionContext, Gateway};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use switchboard_core::events::{
    inbound, AdminMarkReadPayload, AdminSendMessagePayload, HeartbeatAckPayload, HeartbeatPayload,
    ReconnectStatePayload, SaveReconnectStatePayload, SendMessagePayload, UnreadCountPayload,
};
use switchboard_core::{now_millis, parse_payload, Role, SbResult, ServerEvent};
use tracing::debug;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = SbResult<Option<ServerEvent>>> + Send + 'a>>;

pub type Handler = for<'a> fn(&'a Gateway, &'a ConnectionContext, Value) -> HandlerFuture<'a>;

/// Which roles may invoke an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Any,
    Standard,
    Privileged,
}

impl Access {
    pub fn permits(self, role: Role) -> bool {
        match self {
            Access::Any => true,
            Access::Standard => role == Role::Standard,
            Access::Privileged => role.is_privileged(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct Route {
    pub access: Access,
    pub handler: Handler,
}

#[derive(Default)]
pub struct EventTable {
    routes: HashMap<&'static str, Route>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gateway's full set of inbound events.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register(inbound::HEARTBEAT, Access::Any, heartbeat);
        table.register(inbound::SEND_MESSAGE, Access::Standard, send_message);
        table.register(inbound::ADMIN_SEND_MESSAGE, Access::Privileged, admin_send_message);
        table.register(inbound::MARK_READ, Access::Standard, mark_read);
        table.register(inbound::ADMIN_MARK_READ, Access::Privileged, admin_mark_read);
        table.register(inbound::GET_RECONNECT_STATE, Access::Any, get_reconnect_state);
        table.register(inbound::SAVE_RECONNECT_STATE, Access::Any, save_reconnect_state);
        table
    }

    pub fn register(&mut self, event: &'static str, access: Access, handler: Handler) {
        self.routes.insert(event, Route { access, handler });
    }

    pub fn lookup(&self, event: &str) -> Option<&Route> {
        self.routes.get(event)
    }

    pub fn events(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.routes.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn unread_event(conversation_id: String, unread_count: u64) -> ServerEvent {
    ServerEvent::UnreadCountUpdated(UnreadCountPayload {
        conversation_id,
        unread_count,
    })
}

fn heartbeat<'a>(gw: &'a Gateway, ctx: &'a ConnectionContext, data: Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        let p: HeartbeatPayload = parse_payload(inbound::HEARTBEAT, data)?;
        gw.registry().heartbeat(&ctx.conn_id).await;
        Ok(Some(ServerEvent::HeartbeatAck(HeartbeatAckPayload {
            timestamp: p.timestamp,
            server_time: now_millis(),
        })))
    })
}

/// A standard identity writes to support: every agent console and every
/// device of the sender sees it.
fn send_message<'a>(gw: &'a Gateway, ctx: &'a ConnectionContext, data: Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        let p: SendMessagePayload = parse_payload(inbound::SEND_MESSAGE, data)?;
        let message = gw
            .messages()
            .save_from_user(&ctx.identity, p.content, p.content_kind)
            .await?;
        let conversation_id = message.conversation_id.clone();

        let event = ServerEvent::NewMessage(message);
        let agents = gw.broadcast_privileged(&event).await;
        gw.registry().send_to_identity(&ctx.identity.id, &event).await;

        let unread = gw
            .messages()
            .unread_count(&conversation_id, Role::Privileged)
            .await?;
        gw.broadcast_privileged(&unread_event(unread.conversation_id, unread.unread_count))
            .await;

        debug!(conn_id = %ctx.conn_id, conversation_id = %conversation_id, agents, "user message routed");
        Ok(None)
    })
}

/// An agent replies into a conversation: the owner gets it live or queued,
/// agent consoles get a copy.
fn admin_send_message<'a>(gw: &'a Gateway, ctx: &'a ConnectionContext, data: Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        let p: AdminSendMessagePayload = parse_payload(inbound::ADMIN_SEND_MESSAGE, data)?;
        let saved = gw
            .messages()
            .save_from_agent(&p.conversation_id, &ctx.identity, p.content, p.content_kind)
            .await?;

        let delivery = gw.deliver_or_enqueue(&saved.recipient_id, &saved.message).await;
        gw.broadcast_privileged(&ServerEvent::NewMessage(saved.message.clone()))
            .await;

        let unread = gw
            .messages()
            .unread_count(&p.conversation_id, Role::Standard)
            .await?;
        gw.registry()
            .send_to_identity(
                &saved.recipient_id,
                &unread_event(unread.conversation_id, unread.unread_count),
            )
            .await;

        debug!(
            conn_id = %ctx.conn_id,
            recipient = %saved.recipient_id,
            ?delivery,
            "agent message routed"
        );
        Ok(None)
    })
}

fn mark_read<'a>(gw: &'a Gateway, ctx: &'a ConnectionContext, _data: Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        let read = gw.messages().mark_read(None, &ctx.identity).await?;
        gw.registry()
            .send_to_identity(
                &ctx.identity.id,
                &unread_event(read.conversation_id, read.unread_count),
            )
            .await;
        Ok(None)
    })
}

fn admin_mark_read<'a>(gw: &'a Gateway, ctx: &'a ConnectionContext, data: Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        let p: AdminMarkReadPayload = parse_payload(inbound::ADMIN_MARK_READ, data)?;
        let read = gw
            .messages()
            .mark_read(Some(&p.conversation_id), &ctx.identity)
            .await?;
        gw.broadcast_privileged(&unread_event(read.conversation_id, read.unread_count))
            .await;
        Ok(None)
    })
}

fn get_reconnect_state<'a>(gw: &'a Gateway, ctx: &'a ConnectionContext, _data: Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        let state = gw.resume().load(&ctx.identity.id).await?;
        Ok(Some(ServerEvent::ReconnectState(ReconnectStatePayload { state })))
    })
}

fn save_reconnect_state<'a>(gw: &'a Gateway, ctx: &'a ConnectionContext, data: Value) -> HandlerFuture<'a> {
    Box::pin(async move {
        let p: SaveReconnectStatePayload = parse_payload(inbound::SAVE_RECONNECT_STATE, data)?;
        gw.resume().save(&ctx.identity.id, &p.state).await?;
        Ok(None)
    })
}
