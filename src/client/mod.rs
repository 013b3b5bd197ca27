//! Manager client with reconnection control
//!
//! Owns one WebSocket connection to the manager. On an unexpected close
//! it schedules exactly one reconnect attempt after a fixed delay; an
//! intentional close disables auto-reconnect entirely. Connection-scoped
//! state (the active request set) is discarded the moment the transport
//! drops — in-flight requests are lost, never resubmitted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

use crate::server::{ClientMessage, ServerMessage};

/// Connection status as observed by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Errors surfaced by the client handle
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,
}

enum Command {
    Send(ClientMessage),
    Close,
}

/// Handle to a managed connection
pub struct ManagerClient {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ClientStatus>,
    active: Arc<Mutex<HashSet<String>>>,
    intentional: Arc<AtomicBool>,
}

impl ManagerClient {
    /// Start the connection driver. Server frames arrive on the returned
    /// receiver.
    pub fn connect(
        url: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = watch::channel(ClientStatus::Connecting);
        let active = Arc::new(Mutex::new(HashSet::new()));
        let intentional = Arc::new(AtomicBool::new(false));

        tokio::spawn(drive_connection(
            url,
            reconnect_delay,
            cmd_rx,
            events_tx,
            status_tx,
            Arc::clone(&active),
            Arc::clone(&intentional),
        ));

        (
            Self {
                cmd_tx,
                status_rx,
                active,
                intentional,
            },
            events_rx,
        )
    }

    /// Queue a message for the server.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Send(msg))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Current connection status
    pub fn status(&self) -> ClientStatus {
        *self.status_rx.borrow()
    }

    /// Watch for status changes
    pub fn status_watch(&self) -> watch::Receiver<ClientStatus> {
        self.status_rx.clone()
    }

    /// Request ids currently in flight on this connection
    pub async fn active_requests(&self) -> Vec<String> {
        self.active.lock().await.iter().cloned().collect()
    }

    /// Close intentionally; no reconnect will be scheduled.
    pub async fn close(&self) {
        self.intentional.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

async fn drive_connection(
    url: String,
    reconnect_delay: Duration,
    mut cmd_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<ServerMessage>,
    status_tx: watch::Sender<ClientStatus>,
    active: Arc<Mutex<HashSet<String>>>,
    intentional: Arc<AtomicBool>,
) {
    loop {
        let _ = status_tx.send(ClientStatus::Connecting);
        match connect_async(&url).await {
            Ok((ws, _)) => {
                run_io(
                    ws,
                    &mut cmd_rx,
                    &events_tx,
                    &status_tx,
                    &active,
                    &intentional,
                )
                .await;
            }
            Err(e) => {
                debug!("Connect to {url} failed: {e}");
            }
        }

        // Connection-scoped state does not survive the transport
        active.lock().await.clear();
        let _ = status_tx.send(ClientStatus::Disconnected);

        if intentional.load(Ordering::SeqCst) {
            break;
        }
        // One scheduled reconnect attempt per close
        tokio::time::sleep(reconnect_delay).await;
        if intentional.load(Ordering::SeqCst) {
            break;
        }
        info!("Reconnecting to {url}");
    }

    let _ = status_tx.send(ClientStatus::Disconnected);
}

async fn run_io(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    cmd_rx: &mut mpsc::Receiver<Command>,
    events_tx: &mpsc::Sender<ServerMessage>,
    status_tx: &watch::Sender<ClientStatus>,
    active: &Arc<Mutex<HashSet<String>>>,
    intentional: &Arc<AtomicBool>,
) {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(msg)) => {
                        if let Some(request_id) = outgoing_request_id(&msg) {
                            active.lock().await.insert(request_id);
                        }
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                debug!("Failed to encode message: {e}");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json)).await.is_err() {
                            return;
                        }
                    }
                    Some(Command::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                    None => {
                        // Handle dropped: treat as an intentional close
                        intentional.store(true, Ordering::SeqCst);
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<ServerMessage>(&text) else {
                            debug!("Dropping malformed server frame");
                            continue;
                        };
                        match &frame {
                            ServerMessage::Hello { .. } => {
                                let _ = status_tx.send(ClientStatus::Connected);
                            }
                            ServerMessage::StreamDone { request_id, .. } => {
                                active.lock().await.remove(request_id);
                            }
                            ServerMessage::Error {
                                request_id: Some(request_id),
                                ..
                            } => {
                                active.lock().await.remove(request_id);
                            }
                            _ => {}
                        }
                        let _ = events_tx.send(frame).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {e}");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Request id a client message puts in flight, if any
fn outgoing_request_id(msg: &ClientMessage) -> Option<String> {
    match msg {
        ClientMessage::SessionCreate { request_id, .. }
        | ClientMessage::SessionSend { request_id, .. } => request_id.clone(),
        _ => None,
    }
}
