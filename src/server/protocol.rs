//! Protocol message definitions
//!
//! Tagged JSON frames exchanged over one persistent connection per
//! client. Each direction is a closed enum; unknown inbound tags decode
//! to an explicit ignore-variant so new message types never break old
//! servers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Repository;

/// Maximum prompt length (1MB)
pub const MAX_PROMPT_LENGTH: usize = 1024 * 1024;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum session title length
pub const MAX_TITLE_LENGTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start a new session and stream the first response
    #[serde(rename = "session.create")]
    SessionCreate {
        /// Client-chosen request id; generated when absent
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Initial prompt
        prompt: String,
        /// Explicit working directory
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// Session title; derived from the prompt when absent
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Repository to clone and check out into a fresh worktree
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_url: Option<String>,
        /// Known repository id to check out into a fresh worktree
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_id: Option<String>,
        /// Target branch within the repository
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },

    /// Send a prompt to an existing session
    #[serde(rename = "session.send")]
    SessionSend {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        encoded_cwd: String,
        prompt: String,
    },

    /// Cancel an in-flight request
    #[serde(rename = "session.stop")]
    SessionStop { request_id: String },

    /// Force a refresh of the external history index
    #[serde(rename = "session.refresh_index")]
    RefreshIndex,

    /// List registered repositories
    #[serde(rename = "repo.list")]
    RepoList,

    /// Connection keepalive
    #[serde(rename = "ping")]
    Ping,

    /// Forward-compatibility: any unrecognized tag decodes here and is
    /// ignored by the dispatcher
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::SessionCreate {
                prompt, cwd, title, ..
            } => {
                if prompt.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "prompt cannot be empty".to_string(),
                    ));
                }
                if prompt.len() > MAX_PROMPT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "prompt exceeds maximum length of {} bytes",
                        MAX_PROMPT_LENGTH
                    )));
                }
                if let Some(cwd) = cwd {
                    if cwd.is_empty() {
                        return Err(ProtocolError::ValidationError(
                            "cwd cannot be empty when specified".to_string(),
                        ));
                    }
                    if cwd.len() > MAX_PATH_LENGTH {
                        return Err(ProtocolError::ValidationError(format!(
                            "cwd exceeds maximum length of {} characters",
                            MAX_PATH_LENGTH
                        )));
                    }
                }
                if let Some(title) = title {
                    if title.len() > MAX_TITLE_LENGTH {
                        return Err(ProtocolError::ValidationError(format!(
                            "title exceeds maximum length of {} characters",
                            MAX_TITLE_LENGTH
                        )));
                    }
                }
                Ok(())
            }

            ClientMessage::SessionSend {
                session_id,
                encoded_cwd,
                prompt,
                ..
            } => {
                if session_id.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "session_id cannot be empty".to_string(),
                    ));
                }
                if encoded_cwd.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "encoded_cwd cannot be empty".to_string(),
                    ));
                }
                if prompt.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "prompt cannot be empty".to_string(),
                    ));
                }
                if prompt.len() > MAX_PROMPT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "prompt exceeds maximum length of {} bytes",
                        MAX_PROMPT_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::SessionStop { request_id } => {
                if request_id.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "request_id cannot be empty".to_string(),
                    ));
                }
                Ok(())
            }

            ClientMessage::RefreshIndex
            | ClientMessage::RepoList
            | ClientMessage::Ping
            | ClientMessage::Unknown => Ok(()),
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Session metadata carried on session-bearing server messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub session_id: String,
    pub encoded_cwd: String,
    pub cwd: String,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_activity_at: u64,
    pub total_cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// A registered repository as exposed on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoEntry {
    pub id: String,
    pub url: String,
    pub slug: String,
    pub default_branch: String,
    pub created_at: u64,
    pub last_fetched_at: u64,
}

impl From<&Repository> for RepoEntry {
    fn from(repo: &Repository) -> Self {
        Self {
            id: repo.id.clone(),
            url: repo.url.clone(),
            slug: repo.slug.clone(),
            default_branch: repo.default_branch.clone(),
            created_at: repo.created_at,
            last_fetched_at: repo.last_fetched_at,
        }
    }
}

/// Request lifecycle status on `session.state` frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Streaming,
    Idle,
    Errored,
}

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Referenced repository is not registered
    RepoNotFound,
    /// Referenced (session_id, encoded_cwd) pair is unknown
    SessionNotFound,
    /// Missing or empty required field
    Validation,
    /// Git or agent subprocess failure
    Upstream,
    /// Internal server error
    Internal,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Greeting; always the first frame on a connection
    #[serde(rename = "hello")]
    Hello {
        requires_auth: bool,
        server_time: u64,
    },

    /// Acknowledges a `session.create`, before any stream traffic
    #[serde(rename = "session.created")]
    SessionCreated {
        request_id: String,
        session_id: String,
        encoded_cwd: String,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionMeta>,
    },

    /// Request/session status change
    #[serde(rename = "session.state")]
    SessionState {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        encoded_cwd: Option<String>,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionMeta>,
    },

    /// An ordered text increment for one request
    #[serde(rename = "stream.delta")]
    StreamDelta { request_id: String, text: String },

    /// Raw engine message passthrough for one request
    #[serde(rename = "stream.message")]
    StreamMessage {
        request_id: String,
        message: serde_json::Value,
    },

    /// Terminal event of a streamed response
    #[serde(rename = "stream.done")]
    StreamDone {
        request_id: String,
        session_id: String,
        encoded_cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionMeta>,
    },

    /// Error response, scoped to a request when one triggered it
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    /// Registered repositories
    #[serde(rename = "repo.list")]
    RepoList { repositories: Vec<RepoEntry> },

    /// Response to `ping`
    #[serde(rename = "pong")]
    Pong { server_time: u64 },
}

impl ServerMessage {
    /// Create the greeting frame
    pub fn hello(requires_auth: bool, server_time: u64) -> Self {
        ServerMessage::Hello {
            requires_auth,
            server_time,
        }
    }

    /// Create a Pong frame
    pub fn pong(server_time: u64) -> Self {
        ServerMessage::Pong { server_time }
    }

    /// Create a StreamDelta frame
    pub fn delta(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        ServerMessage::StreamDelta {
            request_id: request_id.into(),
            text: text.into(),
        }
    }

    /// Create an Error frame scoped to a request
    pub fn request_error(
        request_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            request_id: Some(request_id.into()),
            details: None,
        }
    }

    /// Create an Error frame not tied to a request
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            request_id: None,
            details: None,
        }
    }

    /// Serialize to a JSON frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
