//! Claude CLI engine
//!
//! Spawns the `claude` CLI in the session's working directory with
//! `--output-format stream-json` and translates its NDJSON output into
//! ordered engine events.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{AgentEngine, CancelHandle, EngineError, EngineEvent, EngineRun, EngineStream};

/// Engine backed by the `claude` command-line agent
pub struct ClaudeEngine {
    command: String,
}

impl ClaudeEngine {
    pub fn new() -> Self {
        Self {
            command: "claude".to_string(),
        }
    }

    /// Override the agent binary (used by tests)
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for ClaudeEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenate the text blocks of an assistant message's content array.
fn extract_text(content: &serde_json::Value) -> String {
    if let Some(text) = content.as_str() {
        return text.to_string();
    }
    let Some(blocks) = content.as_array() else {
        return String::new();
    };
    blocks
        .iter()
        .filter_map(|block| {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                block.get("text").and_then(|t| t.as_str())
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
impl AgentEngine for ClaudeEngine {
    async fn start(&self, run: EngineRun) -> Result<EngineStream, EngineError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg(&run.prompt)
            .args(["--output-format", "stream-json", "--verbose"])
            .current_dir(&run.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(session) = &run.resume_session {
            cmd.args(["--resume", session]);
        }

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Spawn(std::io::Error::other("agent stdout not captured"))
        })?;

        let (tx, rx) = mpsc::channel(256);
        let cancel = CancelHandle::new();
        let mut cancel_rx = cancel.subscribe();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut finished = false;

            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => {
                        debug!("Generation cancelled, killing agent process");
                        let _ = child.start_kill();
                        return;
                    }
                    line = lines.next_line() => {
                        let line = match line {
                            Ok(Some(line)) => line,
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Failed to read agent output: {e}");
                                break;
                            }
                        };
                        if line.trim().is_empty() {
                            continue;
                        }
                        let payload: serde_json::Value = match serde_json::from_str(&line) {
                            Ok(value) => value,
                            Err(e) => {
                                debug!("Skipping non-JSON agent output line: {e}");
                                continue;
                            }
                        };

                        match payload.get("type").and_then(|t| t.as_str()) {
                            Some("assistant") => {
                                let text = extract_text(&payload["message"]["content"]);
                                if !text.is_empty()
                                    && tx.send(EngineEvent::Delta { text }).await.is_err()
                                {
                                    return;
                                }
                                if tx.send(EngineEvent::Message { payload }).await.is_err() {
                                    return;
                                }
                            }
                            Some("result") => {
                                let cost = payload
                                    .get("total_cost_usd")
                                    .and_then(|c| c.as_f64())
                                    .unwrap_or(0.0);
                                finished = true;
                                let _ = tx
                                    .send(EngineEvent::Completed {
                                        total_cost_usd: cost,
                                    })
                                    .await;
                            }
                            _ => {
                                if tx.send(EngineEvent::Message { payload }).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            let status = child.wait().await;
            if !finished {
                let message = match status {
                    Ok(status) if status.success() => "agent exited without a result".to_string(),
                    Ok(status) => format!("agent exited with {status}"),
                    Err(e) => format!("agent wait failed: {e}"),
                };
                let _ = tx.send(EngineEvent::Failed { message }).await;
            }
        });

        Ok(EngineStream::new(rx, cancel))
    }
}
