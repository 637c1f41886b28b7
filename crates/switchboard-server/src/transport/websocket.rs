//! WebSocket listener using tokio-tungstenite.
//!
//! The bearer credential is captured from the HTTP upgrade request
//! (`Authorization: Bearer …` or a `token` query parameter) so the gateway can
//! authenticate before the first frame is read.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use switchboard_core::{encode_event, SbError, SbResult, ServerEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Bearer credential presented on the upgrade request, if any.
    pub credential: Option<String>,
}

/// Pull the bearer credential out of an upgrade request.
///
/// The `Authorization` header wins over the `token` query parameter.
pub fn extract_bearer(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        })
        .filter(|t| !t.is_empty());
    if from_header.is_some() {
        return from_header;
    }

    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields upgraded connections.
pub async fn start_listener(bind_addr: SocketAddr) -> SbResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| SbError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut credential = None;
                        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            credential = extract_bearer(req);
                            Ok(resp)
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async(stream, capture).await;
                        match accepted {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, has_credential = credential.is_some(), "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    credential,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Send one event as a JSON text frame.
pub async fn ws_send_event(ws: &mut WebSocketStream<TcpStream>, event: &ServerEvent) -> SbResult<()> {
    let text = encode_event(event)?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| SbError::Transport(format!("WS send failed: {e}")))
}

/// Close the socket, ignoring errors from an already-dead peer.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>) {
    let _ = ws.close(None).await;
}

/// Receive the next text frame.
///
/// Returns `None` when the peer closed. Binary frames are ignored; frame
/// size is checked by the codec.
pub async fn ws_recv_text(ws: &mut WebSocketStream<TcpStream>) -> SbResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(SbError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
