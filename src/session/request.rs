//! Active request tracking
//!
//! A request exists from prompt submission until its single terminal
//! transition: completion, failure, stop, or connection loss. Removal
//! happens exactly once; a second terminal transition is a no-op.

#![allow(dead_code)]

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::engine::CancelHandle;

/// Request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Streaming,
    Done,
    Errored,
}

/// One in-flight prompt/response exchange
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub request_id: String,
    pub session_id: String,
    pub workdir_key: String,
    pub state: RequestState,
    pub accumulated: String,
    cancel: Option<CancelHandle>,
}

/// Registry of in-flight requests
#[derive(Default)]
pub struct RequestTracker {
    inner: Mutex<HashMap<String, ActiveRequest>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request in the `Pending` state.
    pub async fn register(&self, request_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.insert(
            request_id.to_string(),
            ActiveRequest {
                request_id: request_id.to_string(),
                session_id: String::new(),
                workdir_key: String::new(),
                state: RequestState::Pending,
                accumulated: String::new(),
                cancel: None,
            },
        );
    }

    /// Bind a request to its resolved session identity.
    pub async fn bind_session(&self, request_id: &str, session_id: &str, workdir_key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(req) = inner.get_mut(request_id) {
            req.session_id = session_id.to_string();
            req.workdir_key = workdir_key.to_string();
        }
    }

    /// Attach the engine cancellation handle once the generation starts.
    pub async fn attach_cancel(&self, request_id: &str, cancel: CancelHandle) {
        let mut inner = self.inner.lock().await;
        if let Some(req) = inner.get_mut(request_id) {
            req.cancel = Some(cancel);
        }
    }

    /// Append an ordered text increment. Returns false when the request
    /// is no longer tracked (stopped or lost), telling the caller to
    /// stop forwarding.
    pub async fn append_delta(&self, request_id: &str, text: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(request_id) {
            Some(req) => {
                req.state = RequestState::Streaming;
                req.accumulated.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Terminal transition: remove the request exactly once. Returns the
    /// final request on the first call, `None` afterwards.
    pub async fn finish(&self, request_id: &str, state: RequestState) -> Option<ActiveRequest> {
        let mut inner = self.inner.lock().await;
        inner.remove(request_id).map(|mut req| {
            req.state = state;
            req
        })
    }

    /// Stop a request: signal the engine (advisory) and clear the
    /// bookkeeping (mandatory). Returns whether the request was tracked.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.remove(request_id)
        };
        match removed {
            Some(req) => {
                if let Some(cancel) = req.cancel {
                    cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, request_id: &str) -> bool {
        self.inner.lock().await.contains_key(request_id)
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn accumulated(&self, request_id: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .get(request_id)
            .map(|req| req.accumulated.clone())
    }
}
