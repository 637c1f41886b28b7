//! Core server: accepts WebSocket connections and runs one task per socket.
//!
//! Owns the gateway and the liveness monitor, and coordinates graceful
//! shutdown of every open connection.

use crate::gateway::{ConnectionContext, Gateway};
use crate::liveness::LivenessMonitor;
use crate::presence::{Outbound, OUTBOUND_CAPACITY};
use crate::transport::websocket::{self, WebSocketConnection};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{SbError, SbResult};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long open connections get to flush their shutdown advisory.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The switchboard server instance.
pub struct SwitchboardServer {
    gateway: Arc<Gateway>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl SwitchboardServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Listen and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> SbResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let server = Arc::new(self);
        let config = server.gateway.config();

        let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
            .parse()
            .map_err(|e| SbError::Config(format!("invalid bind address: {e}")))?;

        let mut ws_rx = websocket::start_listener(addr).await?;
        let liveness = LivenessMonitor::new(server.gateway.clone()).spawn(server.shutdown_tx.subscribe());

        info!(
            addr = %addr,
            max_connections = config.max_connections_per_identity,
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            "switchboard ready"
        );

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(ws_conn) = ws_rx.recv() => {
                    let srv = server.clone();
                    connections.spawn(async move {
                        if let Err(e) = srv.handle_websocket(ws_conn).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // Advise every client to reconnect elsewhere, then stop the sweeps.
        server.gateway.shutdown().await;
        let _ = server.shutdown_tx.send(());

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "connections still open after grace period");
            connections.shutdown().await;
        }
        let _ = liveness.await;

        info!("switchboard stopped");
        Ok(())
    }

    /// Admit one WebSocket connection and run it to completion.
    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> SbResult<()> {
        let remote = conn.remote_addr;
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let ctx = match self.gateway.admit(conn.credential.as_deref(), tx).await {
            Ok(ctx) => ctx,
            Err(rejection) => {
                info!(remote = %remote, reason = rejection.reason(), "connection rejected");
                if let Some(event) = rejection.connection_error() {
                    let _ = websocket::ws_send_event(&mut conn.ws_stream, &event).await;
                }
                websocket::ws_close(&mut conn.ws_stream).await;
                return Ok(());
            }
        };

        debug!(remote = %remote, conn_id = %ctx.conn_id, "session started");

        let outcome = self.session_loop(&mut conn, &ctx, &mut rx).await;
        let reason = match &outcome {
            Ok(reason) => reason.as_str(),
            Err(_) => "transport_error",
        };
        self.gateway.on_disconnect(&ctx.conn_id, reason).await;
        outcome.map(|_| ())
    }

    /// Pump outbound events and inbound frames until either side closes.
    /// Returns the close reason.
    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        ctx: &ConnectionContext,
        rx: &mut mpsc::Receiver<Outbound>,
    ) -> SbResult<String> {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(Outbound::Event(event)) => {
                        websocket::ws_send_event(&mut conn.ws_stream, &event).await?;
                    }
                    Some(Outbound::Close { reason }) => {
                        websocket::ws_close(&mut conn.ws_stream).await;
                        return Ok(reason);
                    }
                    None => {
                        // Handle dropped from the registry.
                        websocket::ws_close(&mut conn.ws_stream).await;
                        return Ok("unregistered".to_string());
                    }
                },

                inbound = websocket::ws_recv_text(&mut conn.ws_stream) => match inbound {
                    Ok(Some(text)) => {
                        if let Some(reply) = self.gateway.handle_text(ctx, &text).await {
                            websocket::ws_send_event(&mut conn.ws_stream, &reply).await?;
                        }
                    }
                    Ok(None) => {
                        debug!(conn_id = %ctx.conn_id, "WebSocket session ended (peer closed)");
                        return Ok("client_closed".to_string());
                    }
                    Err(e) => {
                        debug!(conn_id = %ctx.conn_id, error = %e, "WebSocket session ended");
                        return Err(e);
                    }
                },
            }
        }
    }
}
