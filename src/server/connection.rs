//! Per-connection state and inbound dispatch
//!
//! Each client connection owns a context object carrying its identity,
//! the set of request ids in flight on it, and the outbound frame
//! channel. The context is passed through orchestrator calls; nothing
//! connection-scoped lives in global state.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::session::{CreateParams, SendParams, SessionOrchestrator};
use crate::util::now_ms;

/// Connection-scoped context: transient, fully discarded on disconnect
#[derive(Clone)]
pub struct ConnectionContext {
    client_id: Uuid,
    active: Arc<Mutex<HashSet<String>>>,
    outbound: mpsc::Sender<ServerMessage>,
}

impl ConnectionContext {
    pub fn new(outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            active: Arc::new(Mutex::new(HashSet::new())),
            outbound,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Queue a frame for this connection. Frames for a vanished
    /// connection are dropped silently.
    pub async fn send(&self, msg: ServerMessage) {
        if self.outbound.send(msg).await.is_err() {
            debug!("Connection {} gone, dropping frame", self.client_id);
        }
    }

    pub async fn track(&self, request_id: &str) {
        self.active.lock().await.insert(request_id.to_string());
    }

    pub async fn untrack(&self, request_id: &str) {
        self.active.lock().await.remove(request_id);
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Take every request id still active on this connection.
    pub async fn drain(&self) -> Vec<String> {
        self.active.lock().await.drain().collect()
    }
}

/// Dispatch one inbound frame.
///
/// Malformed frames are dropped; unknown tags are ignored. Work that
/// touches git or the engine is spawned so the dispatch path never
/// blocks on a subprocess.
pub async fn dispatch(
    orchestrator: &Arc<SessionOrchestrator>,
    ctx: &ConnectionContext,
    text: &str,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Dropping malformed frame from {}: {e}", ctx.client_id());
            return;
        }
    };

    if let Err(e) = msg.validate() {
        let request_id = match &msg {
            ClientMessage::SessionCreate { request_id, .. }
            | ClientMessage::SessionSend { request_id, .. } => request_id.clone(),
            ClientMessage::SessionStop { request_id } => Some(request_id.clone()),
            _ => None,
        };
        let frame = match request_id {
            Some(id) => ServerMessage::request_error(id, ErrorCode::Validation, e.to_string()),
            None => ServerMessage::error(ErrorCode::Validation, e.to_string()),
        };
        ctx.send(frame).await;
        return;
    }

    match msg {
        ClientMessage::Ping => {
            ctx.send(ServerMessage::pong(now_ms())).await;
        }

        ClientMessage::SessionCreate {
            request_id,
            prompt,
            cwd,
            title,
            repo_url,
            repo_id,
            branch,
        } => {
            let params = CreateParams {
                request_id,
                prompt,
                cwd,
                title,
                repo_url,
                repo_id,
                branch,
            };
            let orchestrator = Arc::clone(orchestrator);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                orchestrator.create(ctx, params).await;
            });
        }

        ClientMessage::SessionSend {
            request_id,
            session_id,
            encoded_cwd,
            prompt,
        } => {
            let params = SendParams {
                request_id,
                session_id,
                workdir_key: encoded_cwd,
                prompt,
            };
            let orchestrator = Arc::clone(orchestrator);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                orchestrator.send(ctx, params).await;
            });
        }

        ClientMessage::SessionStop { request_id } => {
            orchestrator.stop(&request_id).await;
        }

        ClientMessage::RefreshIndex => {
            let orchestrator = Arc::clone(orchestrator);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                orchestrator.refresh_index(&ctx).await;
            });
        }

        ClientMessage::RepoList => {
            orchestrator.repo_list(ctx).await;
        }

        ClientMessage::Unknown => {
            debug!("Ignoring unknown message tag from {}", ctx.client_id());
        }
    }
}
