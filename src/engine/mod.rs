//! Model execution engine
//!
//! The engine is an external collaborator consumed as an opaque producer
//! of streamed events per request. [`ClaudeEngine`] drives the `claude`
//! CLI; tests use the scripted engine.

mod claude;
#[cfg(test)]
mod scripted;

pub use claude::*;
#[cfg(test)]
pub use scripted::*;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Errors that can occur starting a generation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to start agent: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One streamed event from the engine.
///
/// Events for a single run arrive in strict order; `Completed` or
/// `Failed` is always last.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An ordered text increment
    Delta { text: String },
    /// A raw engine message, passed through to clients
    Message { payload: serde_json::Value },
    /// Generation finished
    Completed { total_cost_usd: f64 },
    /// Generation failed
    Failed { message: String },
}

/// Parameters for one generation run
#[derive(Debug, Clone)]
pub struct EngineRun {
    pub prompt: String,
    pub cwd: PathBuf,
    /// Conversation to resume, when continuing an existing session
    pub resume_session: Option<String>,
}

/// Cancellation signal for a running generation.
///
/// Cancellation is advisory: the producer observes the signal and stops
/// emitting, but termination of the underlying process is best-effort.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: broadcast::Sender<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A live generation: ordered events plus its cancellation handle
pub struct EngineStream {
    pub events: mpsc::Receiver<EngineEvent>,
    cancel: CancelHandle,
}

impl EngineStream {
    pub fn new(events: mpsc::Receiver<EngineEvent>, cancel: CancelHandle) -> Self {
        Self { events, cancel }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

/// Producer of streamed generations
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn start(&self, run: EngineRun) -> Result<EngineStream, EngineError>;
}
