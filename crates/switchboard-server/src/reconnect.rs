//! Reconnect advisory and client resume state.

use crate::config::GatewayConfig;
use crate::store::{reconnect_key, KvStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::events::ConnectedPayload;
use switchboard_core::SbResult;
use tracing::{debug, warn};

/// Backoff parameters handed to every client in `connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAdvisory {
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub max_attempts: u32,
}

impl ReconnectAdvisory {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            delay_min_ms: config.reconnect_delay_min_ms,
            delay_max_ms: config.reconnect_delay_max_ms,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn connected(&self, connection_id: &str) -> ConnectedPayload {
        ConnectedPayload {
            connection_id: connection_id.to_string(),
            reconnect_delay_min: self.delay_min_ms,
            reconnect_delay_max: self.delay_max_ms,
            max_reconnect_attempts: self.max_attempts,
        }
    }
}

/// Opaque per-identity blob a client can stash and fetch after reconnecting.
#[derive(Clone)]
pub struct ResumeStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ResumeStore {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn save(&self, identity: &str, state: &Value) -> SbResult<()> {
        let encoded = serde_json::to_string(state)?;
        self.store
            .set_ex(&reconnect_key(identity), encoded, self.ttl)
            .await?;
        debug!(identity, "resume state saved");
        Ok(())
    }

    /// Stored state, or `None` if absent, expired or unreadable.
    pub async fn load(&self, identity: &str) -> SbResult<Option<Value>> {
        let Some(raw) = self.store.get(&reconnect_key(identity)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(identity, error = %e, "discarding unreadable resume state");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[test]
    fn advisory_uses_configured_bounds() {
        let advisory = ReconnectAdvisory::from_config(&GatewayConfig::default());
        let p = advisory.connected("c1");
        assert_eq!(p.connection_id, "c1");
        assert_eq!(p.reconnect_delay_min, 1_000);
        assert_eq!(p.reconnect_delay_max, 30_000);
        assert_eq!(p.max_reconnect_attempts, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_state_round_trip_and_expiry() {
        let resume = ResumeStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600));
        assert_eq!(resume.load("alice").await.unwrap(), None);

        let state = json!({"lastSeen": "m-42", "draft": "hel"});
        resume.save("alice", &state).await.unwrap();
        assert_eq!(resume.load("alice").await.unwrap(), Some(state));

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(resume.load("alice").await.unwrap(), None);
    }
}
