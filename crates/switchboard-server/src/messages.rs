//! Message persistence collaborator.
//!
//! The gateway hands every chat message to a [`MessageStore`] before routing
//! it, and uses the saved record (id, conversation, server timestamp) as the
//! payload it pushes. [`InMemoryMessageStore`] keeps one conversation per
//! standard identity with an unread counter for each side.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use switchboard_core::{generate_id, now_millis, ChatMessage, Identity, Role, SbError, SbResult};
use tracing::debug;

pub type MessageFuture<'a, T> = Pin<Box<dyn Future<Output = SbResult<T>> + Send + 'a>>;

/// Unread counter of one conversation, as seen by one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCount {
    pub conversation_id: String,
    pub unread_count: u64,
}

/// A saved support reply and the standard identity it is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedReply {
    pub message: ChatMessage,
    pub recipient_id: String,
}

pub trait MessageStore: Send + Sync {
    /// Persist a message from a standard identity into its conversation,
    /// opening one if needed.
    fn save_from_user<'a>(
        &'a self,
        sender: &'a Identity,
        content: String,
        content_kind: String,
    ) -> MessageFuture<'a, ChatMessage>;

    /// Persist a reply from a privileged identity into an existing conversation.
    fn save_from_agent<'a>(
        &'a self,
        conversation_id: &'a str,
        sender: &'a Identity,
        content: String,
        content_kind: String,
    ) -> MessageFuture<'a, SavedReply>;

    /// Mark a conversation read by `reader`. Standard readers always act on
    /// their own conversation; privileged readers must name one.
    fn mark_read<'a>(
        &'a self,
        conversation_id: Option<&'a str>,
        reader: &'a Identity,
    ) -> MessageFuture<'a, UnreadCount>;

    /// Messages in `conversation_id` not yet read by `side`.
    fn unread_count<'a>(&'a self, conversation_id: &'a str, side: Role) -> MessageFuture<'a, UnreadCount>;
}

#[derive(Debug)]
struct Conversation {
    owner: String,
    /// Agent messages the owner has not read.
    unread_by_owner: u64,
    /// Owner messages no agent has read.
    unread_by_agents: u64,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    by_owner: HashMap<String, String>,
}

impl Inner {
    fn open(&mut self, owner: &str) -> String {
        if let Some(id) = self.by_owner.get(owner) {
            return id.clone();
        }
        let id = generate_id();
        self.conversations.insert(
            id.clone(),
            Conversation {
                owner: owner.to_string(),
                unread_by_owner: 0,
                unread_by_agents: 0,
                messages: Vec::new(),
            },
        );
        self.by_owner.insert(owner.to_string(), id.clone());
        debug!(owner, conversation_id = %id, "conversation opened");
        id
    }

    fn get_mut(&mut self, conversation_id: &str) -> SbResult<&mut Conversation> {
        self.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| SbError::NotFound(format!("conversation {conversation_id}")))
    }
}

fn record(conversation_id: &str, sender: &Identity, content: String, content_kind: String) -> ChatMessage {
    ChatMessage {
        id: generate_id(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.id.clone(),
        sender_role: sender.role,
        sender_name: sender.display_name.clone(),
        content,
        content_kind,
        created_at: now_millis(),
    }
}

/// Process-local [`MessageStore`].
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    inner: Mutex<Inner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Conversation id for `owner`, created if it does not exist yet.
    pub fn open_conversation(&self, owner: &str) -> String {
        self.lock().open(owner)
    }

    pub fn conversation_of(&self, owner: &str) -> Option<String> {
        self.lock().by_owner.get(owner).cloned()
    }

    /// Stored history of a conversation, oldest first.
    pub fn history(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.lock()
            .conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn save_from_user<'a>(
        &'a self,
        sender: &'a Identity,
        content: String,
        content_kind: String,
    ) -> MessageFuture<'a, ChatMessage> {
        Box::pin(async move {
            let mut inner = self.lock();
            let conversation_id = inner.open(&sender.id);
            let message = record(&conversation_id, sender, content, content_kind);
            let conv = inner.get_mut(&conversation_id)?;
            conv.unread_by_agents += 1;
            conv.messages.push(message.clone());
            Ok(message)
        })
    }

    fn save_from_agent<'a>(
        &'a self,
        conversation_id: &'a str,
        sender: &'a Identity,
        content: String,
        content_kind: String,
    ) -> MessageFuture<'a, SavedReply> {
        Box::pin(async move {
            let mut inner = self.lock();
            let conv = inner.get_mut(conversation_id)?;
            let message = record(conversation_id, sender, content, content_kind);
            conv.unread_by_owner += 1;
            conv.messages.push(message.clone());
            Ok(SavedReply {
                message,
                recipient_id: conv.owner.clone(),
            })
        })
    }

    fn mark_read<'a>(
        &'a self,
        conversation_id: Option<&'a str>,
        reader: &'a Identity,
    ) -> MessageFuture<'a, UnreadCount> {
        Box::pin(async move {
            let mut inner = self.lock();
            let conversation_id = match (reader.role, conversation_id) {
                (Role::Standard, _) => inner
                    .by_owner
                    .get(&reader.id)
                    .cloned()
                    .ok_or_else(|| SbError::NotFound(format!("no conversation for {}", reader.id)))?,
                (Role::Privileged, Some(id)) => id.to_string(),
                (Role::Privileged, None) => {
                    return Err(SbError::InvalidEvent("conversationId is required".into()))
                }
            };
            let conv = inner.get_mut(&conversation_id)?;
            match reader.role {
                Role::Standard => conv.unread_by_owner = 0,
                Role::Privileged => conv.unread_by_agents = 0,
            }
            Ok(UnreadCount {
                conversation_id,
                unread_count: 0,
            })
        })
    }

    fn unread_count<'a>(&'a self, conversation_id: &'a str, side: Role) -> MessageFuture<'a, UnreadCount> {
        Box::pin(async move {
            let mut inner = self.lock();
            let conv = inner.get_mut(conversation_id)?;
            let unread_count = match side {
                Role::Standard => conv.unread_by_owner,
                Role::Privileged => conv.unread_by_agents,
            };
            Ok(UnreadCount {
                conversation_id: conversation_id.to_string(),
                unread_count,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", Role::Standard)
    }

    fn agent() -> Identity {
        Identity::new("agent-1", Role::Privileged).with_display_name("Support")
    }

    #[tokio::test]
    async fn user_messages_share_one_conversation() {
        let store = InMemoryMessageStore::new();
        let m1 = store.save_from_user(&alice(), "hi".into(), "text".into()).await.unwrap();
        let m2 = store.save_from_user(&alice(), "anyone?".into(), "text".into()).await.unwrap();
        assert_eq!(m1.conversation_id, m2.conversation_id);
        assert_ne!(m1.id, m2.id);
        assert!(m2.created_at >= m1.created_at);

        let unread = store.unread_count(&m1.conversation_id, Role::Privileged).await.unwrap();
        assert_eq!(unread.unread_count, 2);
        assert_eq!(store.history(&m1.conversation_id).len(), 2);
    }

    #[tokio::test]
    async fn agent_reply_targets_owner_and_counts_unread() {
        let store = InMemoryMessageStore::new();
        let conv = store.open_conversation("alice");
        let reply = store
            .save_from_agent(&conv, &agent(), "hello".into(), "text".into())
            .await
            .unwrap();
        assert_eq!(reply.recipient_id, "alice");
        assert_eq!(reply.message.sender_name.as_deref(), Some("Support"));
        assert_eq!(store.unread_count(&conv, Role::Standard).await.unwrap().unread_count, 1);

        let read = store.mark_read(None, &alice()).await.unwrap();
        assert_eq!(read.conversation_id, conv);
        assert_eq!(store.unread_count(&conv, Role::Standard).await.unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = InMemoryMessageStore::new();
        let err = store
            .save_from_agent("nope", &agent(), "x".into(), "text".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SbError::NotFound(_)));
        assert!(matches!(
            store.mark_read(None, &alice()).await,
            Err(SbError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_read(None, &agent()).await,
            Err(SbError::InvalidEvent(_))
        ));
    }
}
