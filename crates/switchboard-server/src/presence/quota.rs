//! Cross-process connection quota.
//!
//! The counter at `switchboard:quota:{identity}` is shared by every gateway
//! process. Within a process, [`AdmissionGate`] serializes check-then-increment
//! per identity so concurrent handshakes cannot both slip under the limit.

use crate::store::{quota_key, KvStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_core::{SbError, SbResult};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    Allowed { current: u64 },
    Exceeded { current: u64, limit: u32 },
}

/// Per-identity connection counter in the shared store.
#[derive(Clone)]
pub struct QuotaCounter {
    store: Arc<dyn KvStore>,
    limit: u32,
    ttl: Duration,
}

impl QuotaCounter {
    pub fn new(store: Arc<dyn KvStore>, limit: u32, ttl: Duration) -> Self {
        Self { store, limit, ttl }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Current count; an absent key counts as zero.
    pub async fn current(&self, identity: &str) -> SbResult<u64> {
        let key = quota_key(identity);
        match self.store.get(&key).await? {
            Some(raw) => {
                let n: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| SbError::Store(format!("quota at {key} is not an integer")))?;
                Ok(n.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    pub async fn check(&self, identity: &str) -> SbResult<QuotaCheck> {
        let current = self.current(identity).await?;
        if current >= u64::from(self.limit) {
            Ok(QuotaCheck::Exceeded {
                current,
                limit: self.limit,
            })
        } else {
            Ok(QuotaCheck::Allowed { current })
        }
    }

    /// Count one more connection. The first one arms the TTL.
    pub async fn acquire(&self, identity: &str) -> SbResult<u64> {
        let n = self
            .store
            .incr_with_expiry(&quota_key(identity), self.ttl)
            .await?;
        debug!(identity, count = n, "quota acquired");
        Ok(n.max(0) as u64)
    }

    /// Give back one connection.
    pub async fn release(&self, identity: &str) -> SbResult<()> {
        let n = self.store.decr(&quota_key(identity)).await?;
        debug!(identity, count = n, "quota released");
        Ok(())
    }

    pub async fn reset(&self, identity: &str) -> SbResult<()> {
        self.store.delete(&quota_key(identity)).await?;
        debug!(identity, "quota reset");
        Ok(())
    }
}

type Slots = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Per-identity admission lock.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    slots: Slots,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other admission for `identity` is in flight.
    pub async fn enter(&self, identity: &str) -> AdmissionPermit<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(identity.to_string()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        AdmissionPermit {
            slots: &self.slots,
            identity: identity.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    /// Identities with a slot currently allocated.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Held for the duration of one identity's admission.
pub struct AdmissionPermit<'g> {
    slots: &'g Slots,
    identity: String,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        // The guard holds its own reference to the slot.
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this permit still reference it: nobody is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn counter(limit: u32) -> (QuotaCounter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            QuotaCounter::new(store.clone(), limit, Duration::from_secs(86_400)),
            store,
        )
    }

    #[tokio::test]
    async fn check_against_limit() {
        let (q, _) = counter(2);
        assert_eq!(q.check("alice").await.unwrap(), QuotaCheck::Allowed { current: 0 });
        q.acquire("alice").await.unwrap();
        q.acquire("alice").await.unwrap();
        assert_eq!(
            q.check("alice").await.unwrap(),
            QuotaCheck::Exceeded { current: 2, limit: 2 }
        );
    }

    #[tokio::test]
    async fn release_decrements_then_resets() {
        let (q, store) = counter(3);
        for _ in 0..3 {
            q.acquire("alice").await.unwrap();
        }
        q.release("alice").await.unwrap();
        assert_eq!(q.current("alice").await.unwrap(), 2);

        q.reset("alice").await.unwrap();
        assert_eq!(q.current("alice").await.unwrap(), 0);
        assert_eq!(store.get(&quota_key("alice")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_counter_is_a_store_error() {
        let (q, store) = counter(3);
        store
            .set_ex(&quota_key("alice"), "many".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(q.current("alice").await, Err(SbError::Store(_))));
    }

    #[tokio::test]
    async fn gate_serializes_same_identity() {
        let gate = Arc::new(AdmissionGate::new());
        let first = gate.enter("alice").await;

        let g = gate.clone();
        let waiter = tokio::spawn(async move {
            let _p = g.enter("alice").await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Other identities are not blocked.
        drop(gate.enter("bob").await);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(gate.in_flight(), 0);
    }
}
