//! Liveness sweeps.
//!
//! The primary sweep runs every heartbeat interval and evicts connections
//! that were flagged dead or stayed silent past the connection timeout. The
//! reconciliation sweep runs at twice that interval and drops registry
//! entries whose write loop is already gone.

use crate::gateway::Gateway;
use crate::presence::Outbound;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::events::reasons;
use switchboard_core::{now_millis, ServerEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct LivenessMonitor {
    gateway: Arc<Gateway>,
    heartbeat_interval: Duration,
    connection_timeout: Duration,
    reconcile_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let config = gateway.config();
        let heartbeat_interval = config.heartbeat_interval;
        let connection_timeout = config.connection_timeout;
        let reconcile_interval = config.reconcile_interval();
        Self {
            gateway,
            heartbeat_interval,
            connection_timeout,
            reconcile_interval,
        }
    }

    /// Evict every connection that is due at `now`. Returns the evicted ids.
    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        let registry = self.gateway.registry();
        let expired = registry
            .expired(now, self.heartbeat_interval, self.connection_timeout)
            .await;

        for conn_id in &expired {
            let advisory = ServerEvent::reconnect_requested(reasons::HEARTBEAT_TIMEOUT, now_millis());
            registry.send_to(conn_id, Outbound::Event(advisory)).await;
            registry
                .send_to(
                    conn_id,
                    Outbound::Close {
                        reason: reasons::HEARTBEAT_TIMEOUT.to_string(),
                    },
                )
                .await;
            self.gateway
                .on_disconnect(conn_id, reasons::HEARTBEAT_TIMEOUT)
                .await;
        }

        if !expired.is_empty() {
            info!(evicted = expired.len(), "liveness sweep");
        }
        expired
    }

    pub async fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now()).await
    }

    /// Drop entries whose transport vanished without a disconnect.
    pub async fn reconcile(&self) -> Vec<String> {
        let vanished = self.gateway.registry().vanished().await;
        for conn_id in &vanished {
            self.gateway.on_disconnect(conn_id, "transport_vanished").await;
        }
        if !vanished.is_empty() {
            info!(pruned = vanished.len(), "reconciliation sweep");
        }
        vanished
    }

    /// Run both sweeps until `shutdown` fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = Instant::now();
            let mut sweep = tokio::time::interval_at(start + self.heartbeat_interval, self.heartbeat_interval);
            let mut reconcile =
                tokio::time::interval_at(start + self.reconcile_interval, self.reconcile_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(
                interval_ms = self.heartbeat_interval.as_millis() as u64,
                timeout_ms = self.connection_timeout.as_millis() as u64,
                "liveness monitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = sweep.tick() => {
                        self.sweep().await;
                    }
                    _ = reconcile.tick() => {
                        self.reconcile().await;
                    }
                }
            }
            debug!("liveness monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::harness::*;
    use switchboard_core::Role;

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_advised_then_closed() {
        let h = harness(GatewayConfig::default());
        let mut c = h.connect("carol", Role::Standard).await;
        c.frames();
        let monitor = LivenessMonitor::new(h.gateway.clone());

        let start = Instant::now();
        assert!(monitor.sweep_at(start + Duration::from_secs(25)).await.is_empty());
        assert!(monitor.sweep_at(start + Duration::from_secs(50)).await.is_empty());

        let evicted = monitor.sweep_at(start + Duration::from_secs(61)).await;
        assert_eq!(evicted, vec![c.ctx.conn_id.clone()]);

        let frames = c.frames();
        match &frames[0] {
            Outbound::Event(ServerEvent::ReconnectRequested(p)) => {
                assert_eq!(p.reason, "heartbeat_timeout")
            }
            f => panic!("unexpected {f:?}"),
        }
        assert!(matches!(&frames[1], Outbound::Close { reason } if reason == "heartbeat_timeout"));

        assert!(!h.gateway.registry().is_online("carol").await);
        assert_eq!(h.gateway.quota().current("carol").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_a_connection_alive() {
        let h = harness(GatewayConfig::default());
        let c = h.connect("dave", Role::Standard).await;
        let monitor = LivenessMonitor::new(h.gateway.clone());

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(20)).await;
            h.gateway
                .handle_text(&c.ctx, r#"{"event":"heartbeat","data":{}}"#)
                .await;
            assert!(monitor.sweep().await.is_empty());
        }
        assert!(h.gateway.registry().is_online("dave").await);
    }

    #[tokio::test(start_paused = true)]
    async fn running_monitor_evicts_within_timeout_plus_one_sweep() {
        let h = harness(GatewayConfig::default());
        let mut c = h.connect("carol", Role::Standard).await;
        c.frames();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = LivenessMonitor::new(h.gateway.clone()).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_secs(60 + 25 + 1)).await;
        assert!(!h.gateway.registry().is_online("carol").await);
        assert_eq!(c.event_names(), ["reconnectRequested"]);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_prunes_vanished_transports() {
        let h = harness(GatewayConfig::default());
        let c = h.connect("erin", Role::Standard).await;
        let conn_id = c.ctx.conn_id.clone();
        drop(c);

        let monitor = LivenessMonitor::new(h.gateway.clone());
        assert_eq!(monitor.reconcile().await, vec![conn_id]);
        assert!(!h.gateway.registry().is_online("erin").await);
        assert_eq!(h.gateway.quota().current("erin").await.unwrap(), 0);
    }
}
