//! Scripted engine for tests
//!
//! Replays queued event scripts, recording every run it is asked to
//! start. A run with no queued script replays the default script.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{AgentEngine, CancelHandle, EngineError, EngineEvent, EngineRun, EngineStream};

pub struct ScriptedEngine {
    default_script: Vec<EngineEvent>,
    scripts: Mutex<VecDeque<Vec<EngineEvent>>>,
    runs: Mutex<Vec<EngineRun>>,
    event_delay: Duration,
}

impl ScriptedEngine {
    /// Engine that answers every run with a single delta and a completion
    pub fn completing(text: &str) -> Self {
        Self::with_default(vec![
            EngineEvent::Delta {
                text: text.to_string(),
            },
            EngineEvent::Completed {
                total_cost_usd: 0.01,
            },
        ])
    }

    /// Engine that never completes: emits one delta then stalls until
    /// cancelled
    pub fn stalling(text: &str) -> Self {
        let mut engine = Self::with_default(vec![EngineEvent::Delta {
            text: text.to_string(),
        }]);
        engine.event_delay = Duration::from_millis(1);
        engine
    }

    pub fn with_default(script: Vec<EngineEvent>) -> Self {
        Self {
            default_script: script,
            scripts: Mutex::new(VecDeque::new()),
            runs: Mutex::new(Vec::new()),
            event_delay: Duration::ZERO,
        }
    }

    /// Queue a script for the next run
    pub async fn push_script(&self, script: Vec<EngineEvent>) {
        self.scripts.lock().await.push_back(script);
    }

    /// Spread scripted events out over time
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Runs started so far
    pub async fn runs(&self) -> Vec<EngineRun> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn start(&self, run: EngineRun) -> Result<EngineStream, EngineError> {
        self.runs.lock().await.push(run);
        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());
        let ends_with_terminal = matches!(
            script.last(),
            Some(EngineEvent::Completed { .. }) | Some(EngineEvent::Failed { .. })
        );

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancelHandle::new();
        let mut cancel_rx = cancel.subscribe();
        let delay = self.event_delay;

        tokio::spawn(async move {
            for event in script {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                tokio::select! {
                    _ = cancel_rx.recv() => return,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            if !ends_with_terminal {
                // Stall until cancelled, like a generation that never ends
                let _ = cancel_rx.recv().await;
            }
        });

        Ok(EngineStream::new(rx, cancel))
    }
}
