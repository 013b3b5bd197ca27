//! WebSocket server implementation
//!
//! Listens for client connections, greets each with `hello`, and runs
//! one dispatch loop per connection. Streamed events arrive through the
//! connection's outbound channel so subprocess work never blocks the
//! dispatch path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::connection::{dispatch, ConnectionContext};
use super::protocol::ServerMessage;
use crate::config::ManagerConfig;
use crate::session::SessionOrchestrator;
use crate::util::now_ms;

/// WebSocket server handling client connections
pub struct WebSocketServer {
    config: ManagerConfig,
    orchestrator: Arc<SessionOrchestrator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    pub fn new(config: ManagerConfig, orchestrator: Arc<SessionOrchestrator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            orchestrator,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the WebSocket server until a shutdown signal arrives.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let orchestrator = Arc::clone(&self.orchestrator);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let requires_auth = self.config.token.is_some();
                            let heartbeat = self.config.heartbeat_interval();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    stream,
                                    peer_addr,
                                    orchestrator,
                                    requires_auth,
                                    heartbeat,
                                    shutdown_rx,
                                )
                                .await
                                {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handle a single client connection from accept to close.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    orchestrator: Arc<SessionOrchestrator>,
    requires_auth: bool,
    heartbeat: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Greeting precedes all other traffic
    let hello = ServerMessage::hello(requires_auth, now_ms());
    ws_sender.send(Message::Text(hello.to_json()?)).await?;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(256);
    let ctx = ConnectionContext::new(outbound_tx);
    debug!("Connection {} established for {}", ctx.client_id(), peer_addr);

    let mut heartbeat_timer =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&orchestrator, &ctx, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let json = frame.to_json()?;
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat_timer.tick() => {
                // Idle reconciliation: pick up externally created sessions
                if ctx.active_count().await == 0 {
                    let orchestrator = Arc::clone(&orchestrator);
                    tokio::spawn(async move {
                        orchestrator.reconcile_index().await;
                    });
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // Connection-scoped state dies with the connection: every request
    // still in flight here is stopped and will not be resumed.
    let lost = ctx.drain().await;
    if !lost.is_empty() {
        info!(
            "Connection from {} closed with {} in-flight request(s)",
            peer_addr,
            lost.len()
        );
    }
    for request_id in lost {
        orchestrator.stop(&request_id).await;
    }

    info!("Connection from {} closed", peer_addr);
    Ok(())
}
