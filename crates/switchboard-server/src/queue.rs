//! Offline queue: messages parked for recipients with no live connection.
//!
//! One list per recipient at `switchboard:offline:{id}`. Every append refreshes
//! the list TTL. Draining reads and deletes the list in one step, so a message
//! is delivered to at most one drain.

use crate::store::{offline_key, KvStore};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{QueuedMessage, SbResult};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Append a message to the recipient's queue. Returns the new length.
    pub async fn enqueue(&self, recipient: &str, message: &QueuedMessage) -> SbResult<u64> {
        let key = offline_key(recipient);
        let encoded = serde_json::to_string(message)?;
        let len = self.store.list_push_with_expiry(&key, encoded, self.ttl).await?;
        debug!(recipient, len, "message queued for offline recipient");
        Ok(len)
    }

    /// Put a batch back, e.g. after its delivery failed.
    pub async fn requeue(&self, recipient: &str, messages: &[QueuedMessage]) -> SbResult<()> {
        for message in messages {
            self.enqueue(recipient, message).await?;
        }
        Ok(())
    }

    /// Queued messages without removing them.
    pub async fn peek(&self, recipient: &str) -> SbResult<Vec<QueuedMessage>> {
        let raw = self.store.list_range(&offline_key(recipient), 0, -1).await?;
        Ok(Self::decode(recipient, raw))
    }

    /// Take every queued message, oldest first, and clear the queue.
    ///
    /// Entries that fail to parse are dropped with a warning.
    pub async fn drain(&self, recipient: &str) -> SbResult<Vec<QueuedMessage>> {
        let raw = self.store.list_take(&offline_key(recipient)).await?;
        let mut messages = Self::decode(recipient, raw);
        // Stable: equal timestamps keep append order.
        messages.sort_by_key(|m| m.enqueued_at);
        Ok(messages)
    }

    pub async fn len(&self, recipient: &str) -> SbResult<usize> {
        Ok(self.peek(recipient).await?.len())
    }

    fn decode(recipient: &str, raw: Vec<String>) -> Vec<QueuedMessage> {
        raw.into_iter()
            .filter_map(|entry| match serde_json::from_str::<QueuedMessage>(&entry) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(recipient, error = %e, "dropping malformed queue entry");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use switchboard_core::Role;

    const WEEK: Duration = Duration::from_secs(7 * 86_400);

    fn msg(content: &str, at: u64) -> QueuedMessage {
        QueuedMessage {
            conversation_id: Some("conv-1".into()),
            sender_id: "agent-1".into(),
            sender_role: Role::Privileged,
            sender_name: None,
            content: content.into(),
            content_kind: "text".into(),
            enqueued_at: at,
        }
    }

    #[tokio::test]
    async fn drain_returns_oldest_first_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let q = OfflineQueue::new(store.clone(), WEEK);
        q.enqueue("alice", &msg("m3", 300)).await.unwrap();
        q.enqueue("alice", &msg("m1", 100)).await.unwrap();
        q.enqueue("alice", &msg("m2", 200)).await.unwrap();

        let drained = q.drain("alice").await.unwrap();
        let order: Vec<_> = drained.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, ["m1", "m2", "m3"]);

        assert!(q.drain("alice").await.unwrap().is_empty());
        assert_eq!(store.get(&offline_key("alice")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_append_order() {
        let q = OfflineQueue::new(Arc::new(MemoryStore::new()), WEEK);
        q.enqueue("alice", &msg("a", 100)).await.unwrap();
        q.enqueue("alice", &msg("b", 100)).await.unwrap();
        let drained = q.drain("alice").await.unwrap();
        assert_eq!(drained[0].content, "a");
        assert_eq!(drained[1].content, "b");
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let q = OfflineQueue::new(store.clone(), WEEK);
        q.enqueue("alice", &msg("ok", 100)).await.unwrap();
        store
            .list_push_with_expiry(&offline_key("alice"), "{not json".into(), WEEK)
            .await
            .unwrap();

        let drained = q.drain("alice").await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].content, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn append_refreshes_ttl() {
        let store = Arc::new(MemoryStore::new());
        let q = OfflineQueue::new(store.clone(), WEEK);
        q.enqueue("alice", &msg("m1", 1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6 * 86_400)).await;
        q.enqueue("alice", &msg("m2", 2)).await.unwrap();
        assert_eq!(store.ttl(&offline_key("alice")).await.unwrap(), Some(WEEK));

        tokio::time::advance(Duration::from_secs(2 * 86_400)).await;
        assert_eq!(q.len("alice").await.unwrap(), 2);
    }
}
