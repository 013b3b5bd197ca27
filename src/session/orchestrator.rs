//! Session orchestrator
//!
//! Owns session and request state, resolves each session's working
//! directory (existing session, repo-backed worktree, or plain
//! directory), and drives streamed engine output to the connection that
//! asked for it. Workspace provisioning failures end only the triggering
//! request.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{AgentEngine, EngineEvent, EngineRun};
use crate::git::{WorkspaceManager, WorktreeOpts};
use crate::server::{ConnectionContext, ErrorCode, ServerMessage, SessionMeta, SessionStatus};
use crate::store::{HistoryIndexer, RepoStore, Repository};
use crate::util::{encode_workdir, now_ms, truncate};

use super::request::{RequestState, RequestTracker};

/// Maximum derived title length
const TITLE_MAX: usize = 80;

/// Parameters of a `session.create`
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub request_id: Option<String>,
    pub prompt: String,
    pub cwd: Option<String>,
    pub title: Option<String>,
    pub repo_url: Option<String>,
    pub repo_id: Option<String>,
    pub branch: Option<String>,
}

/// Parameters of a `session.send`
#[derive(Debug, Clone)]
pub struct SendParams {
    pub request_id: Option<String>,
    pub session_id: String,
    pub workdir_key: String,
    pub prompt: String,
}

/// A live session. Identity is the `(session_id, workdir_key)` pair.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub workdir_key: String,
    pub cwd: PathBuf,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_activity_at: u64,
    pub total_cost_usd: f64,
    pub repo_id: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
}

impl SessionRecord {
    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            session_id: self.session_id.clone(),
            encoded_cwd: self.workdir_key.clone(),
            cwd: self.cwd.to_string_lossy().into_owned(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_activity_at: self.last_activity_at,
            total_cost_usd: self.total_cost_usd,
            repo_id: self.repo_id.clone(),
            worktree_path: self
                .worktree_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            branch: self.branch.clone(),
        }
    }
}

/// A resolved working directory for a new session
struct ResolvedWorkdir {
    cwd: PathBuf,
    repo_id: Option<String>,
    worktree_path: Option<PathBuf>,
    branch: Option<String>,
}

/// Coordinates sessions, requests, and streamed responses
pub struct SessionOrchestrator {
    workspace: Arc<WorkspaceManager>,
    repos: Arc<dyn RepoStore>,
    indexer: Arc<dyn HistoryIndexer>,
    engine: Arc<dyn AgentEngine>,
    default_cwd: PathBuf,
    sessions: Mutex<HashMap<(String, String), SessionRecord>>,
    requests: RequestTracker,
}

impl SessionOrchestrator {
    pub fn new(
        workspace: Arc<WorkspaceManager>,
        repos: Arc<dyn RepoStore>,
        indexer: Arc<dyn HistoryIndexer>,
        engine: Arc<dyn AgentEngine>,
        default_cwd: PathBuf,
    ) -> Self {
        Self {
            workspace,
            repos,
            indexer,
            engine,
            default_cwd,
            sessions: Mutex::new(HashMap::new()),
            requests: RequestTracker::new(),
        }
    }

    /// Create a session and stream its first response.
    ///
    /// The `session.created` acknowledgment always precedes stream
    /// traffic for the request.
    pub async fn create(self: Arc<Self>, ctx: ConnectionContext, params: CreateParams) {
        let request_id = params
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.requests.register(&request_id).await;
        ctx.track(&request_id).await;

        let resolved = match self.resolve_workdir(&ctx, &request_id, &params).await {
            Some(resolved) => resolved,
            None => {
                self.requests.finish(&request_id, RequestState::Errored).await;
                ctx.untrack(&request_id).await;
                return;
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let workdir_key = encode_workdir(&resolved.cwd.to_string_lossy());
        let now = now_ms();
        let title = params
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| truncate(&params.prompt, TITLE_MAX));

        let record = SessionRecord {
            session_id: session_id.clone(),
            workdir_key: workdir_key.clone(),
            cwd: resolved.cwd.clone(),
            title,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            total_cost_usd: 0.0,
            repo_id: resolved.repo_id,
            worktree_path: resolved.worktree_path,
            branch: resolved.branch,
        };
        let meta = record.meta();
        self.sessions
            .lock()
            .await
            .insert((session_id.clone(), workdir_key.clone()), record);
        self.requests
            .bind_session(&request_id, &session_id, &workdir_key)
            .await;
        info!("Created session {session_id} in {}", resolved.cwd.display());

        ctx.send(ServerMessage::SessionCreated {
            request_id: request_id.clone(),
            session_id: session_id.clone(),
            encoded_cwd: workdir_key.clone(),
            cwd: resolved.cwd.to_string_lossy().into_owned(),
            session: Some(meta),
        })
        .await;

        self.stream_response(
            &ctx,
            request_id,
            session_id,
            workdir_key,
            params.prompt,
            resolved.cwd,
            None,
        )
        .await;
    }

    /// Send a prompt to an existing session and stream the response.
    pub async fn send(self: Arc<Self>, ctx: ConnectionContext, params: SendParams) {
        let request_id = params
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let key = (params.session_id.clone(), params.workdir_key.clone());
        let record = self.sessions.lock().await.get(&key).cloned();
        let Some(record) = record else {
            ctx.send(ServerMessage::request_error(
                request_id,
                ErrorCode::SessionNotFound,
                "Session not found",
            ))
            .await;
            return;
        };

        self.requests.register(&request_id).await;
        self.requests
            .bind_session(&request_id, &record.session_id, &record.workdir_key)
            .await;
        ctx.track(&request_id).await;

        self.stream_response(
            &ctx,
            request_id,
            record.session_id.clone(),
            record.workdir_key.clone(),
            params.prompt,
            record.cwd.clone(),
            Some(record.session_id),
        )
        .await;
    }

    /// Stop an in-flight request. Cancellation is advisory to the
    /// engine; clearing the request bookkeeping is unconditional.
    pub async fn stop(&self, request_id: &str) -> bool {
        let existed = self.requests.cancel(request_id).await;
        if existed {
            debug!("Stopped request {request_id}");
        } else {
            debug!("Stop for unknown request {request_id}");
        }
        existed
    }

    /// Refresh the external history index and signal completion so list
    /// views refetch.
    pub async fn refresh_index(&self, ctx: &ConnectionContext) {
        self.indexer.refresh_index().await;
        ctx.send(ServerMessage::SessionState {
            request_id: None,
            session_id: None,
            encoded_cwd: None,
            status: SessionStatus::Idle,
            session: None,
        })
        .await;
    }

    /// Idle-heartbeat reconciliation: refresh the index without emitting
    /// any frame.
    pub async fn reconcile_index(&self) {
        self.indexer.refresh_index().await;
    }

    /// Send the repository listing to one connection.
    pub async fn repo_list(&self, ctx: &ConnectionContext) {
        let repositories = self
            .repos
            .list_all()
            .await
            .iter()
            .map(Into::into)
            .collect();
        ctx.send(ServerMessage::RepoList { repositories }).await;
    }

    /// Request ids currently in flight (any connection).
    pub async fn active_requests(&self) -> Vec<String> {
        self.requests.active_ids().await
    }

    /// Look up a session by identity pair.
    pub async fn find_session(&self, session_id: &str, workdir_key: &str) -> Option<SessionRecord> {
        self.sessions
            .lock()
            .await
            .get(&(session_id.to_string(), workdir_key.to_string()))
            .cloned()
    }

    /// Resolve the origin of a new session to a working directory.
    ///
    /// Emits the request-scoped error frame itself and returns `None` on
    /// failure; a failed resolution never leaves repository or session
    /// state behind.
    async fn resolve_workdir(
        &self,
        ctx: &ConnectionContext,
        request_id: &str,
        params: &CreateParams,
    ) -> Option<ResolvedWorkdir> {
        if let Some(repo_id) = &params.repo_id {
            let Some(repo) = self.repos.find_by_id(repo_id).await else {
                ctx.send(ServerMessage::request_error(
                    request_id,
                    ErrorCode::RepoNotFound,
                    format!("Unknown repository id: {repo_id}"),
                ))
                .await;
                return None;
            };
            return self
                .provision_worktree(ctx, request_id, &repo, params.branch.clone())
                .await;
        }

        if let Some(url) = &params.repo_url {
            let checkout = match self.workspace.ensure_repo(url).await {
                Ok(checkout) => checkout,
                Err(e) => {
                    warn!("Failed to ensure repo {url}: {e}");
                    ctx.send(ServerMessage::request_error(
                        request_id,
                        ErrorCode::Upstream,
                        e.to_string(),
                    ))
                    .await;
                    return None;
                }
            };
            let repo = match self.repos.find_by_url(url).await {
                Some(existing) => {
                    self.repos.mark_fetched(&existing.id, now_ms()).await;
                    existing
                }
                None => {
                    self.repos
                        .insert(Repository::new(
                            url,
                            checkout.mirror_path.clone(),
                            checkout.default_branch.clone(),
                        ))
                        .await
                }
            };
            return self
                .provision_worktree(ctx, request_id, &repo, params.branch.clone())
                .await;
        }

        let cwd = match &params.cwd {
            Some(cwd) => PathBuf::from(cwd),
            None => self.default_cwd.clone(),
        };
        Some(ResolvedWorkdir {
            cwd,
            repo_id: None,
            worktree_path: None,
            branch: None,
        })
    }

    async fn provision_worktree(
        &self,
        ctx: &ConnectionContext,
        request_id: &str,
        repo: &Repository,
        branch: Option<String>,
    ) -> Option<ResolvedWorkdir> {
        let opts = WorktreeOpts {
            branch,
            worktree_id: Uuid::new_v4().to_string(),
        };
        match self.workspace.create_worktree(&repo.mirror_path, opts).await {
            Ok(wt) => Some(ResolvedWorkdir {
                cwd: wt.worktree_path.clone(),
                repo_id: Some(repo.id.clone()),
                worktree_path: Some(wt.worktree_path),
                branch: Some(wt.branch),
            }),
            Err(e) => {
                warn!("Failed to create worktree for {}: {e}", repo.slug);
                ctx.send(ServerMessage::request_error(
                    request_id,
                    ErrorCode::Upstream,
                    e.to_string(),
                ))
                .await;
                None
            }
        }
    }

    /// Drive one generation to its terminal event, forwarding ordered
    /// increments tagged with the request id.
    #[allow(clippy::too_many_arguments)]
    async fn stream_response(
        &self,
        ctx: &ConnectionContext,
        request_id: String,
        session_id: String,
        workdir_key: String,
        prompt: String,
        cwd: PathBuf,
        resume_session: Option<String>,
    ) {
        let run = EngineRun {
            prompt,
            cwd,
            resume_session,
        };
        let mut stream = match self.engine.start(run).await {
            Ok(stream) => stream,
            Err(e) => {
                if self
                    .requests
                    .finish(&request_id, RequestState::Errored)
                    .await
                    .is_some()
                {
                    ctx.send(ServerMessage::request_error(
                        &request_id,
                        ErrorCode::Upstream,
                        e.to_string(),
                    ))
                    .await;
                }
                ctx.untrack(&request_id).await;
                return;
            }
        };
        self.requests
            .attach_cancel(&request_id, stream.cancel_handle())
            .await;

        ctx.send(ServerMessage::SessionState {
            request_id: Some(request_id.clone()),
            session_id: Some(session_id.clone()),
            encoded_cwd: Some(workdir_key.clone()),
            status: SessionStatus::Streaming,
            session: None,
        })
        .await;

        loop {
            let Some(event) = stream.events.recv().await else {
                // Producer vanished without a terminal event. When the
                // request was already stopped there is nothing to report.
                if self
                    .requests
                    .finish(&request_id, RequestState::Errored)
                    .await
                    .is_some()
                {
                    ctx.send(ServerMessage::request_error(
                        &request_id,
                        ErrorCode::Internal,
                        "generation ended unexpectedly",
                    ))
                    .await;
                }
                break;
            };

            match event {
                EngineEvent::Delta { text } => {
                    if !self.requests.append_delta(&request_id, &text).await {
                        // Stopped mid-stream; stop forwarding
                        break;
                    }
                    ctx.send(ServerMessage::delta(&request_id, text)).await;
                }
                EngineEvent::Message { payload } => {
                    ctx.send(ServerMessage::StreamMessage {
                        request_id: request_id.clone(),
                        message: payload,
                    })
                    .await;
                }
                EngineEvent::Completed { total_cost_usd } => {
                    if self
                        .requests
                        .finish(&request_id, RequestState::Done)
                        .await
                        .is_some()
                    {
                        let session = self
                            .touch_session(&session_id, &workdir_key, total_cost_usd)
                            .await;
                        ctx.send(ServerMessage::StreamDone {
                            request_id: request_id.clone(),
                            session_id: session_id.clone(),
                            encoded_cwd: workdir_key.clone(),
                            session,
                        })
                        .await;
                    }
                    break;
                }
                EngineEvent::Failed { message } => {
                    if self
                        .requests
                        .finish(&request_id, RequestState::Errored)
                        .await
                        .is_some()
                    {
                        ctx.send(ServerMessage::request_error(
                            &request_id,
                            ErrorCode::Upstream,
                            message,
                        ))
                        .await;
                    }
                    break;
                }
            }
        }

        ctx.untrack(&request_id).await;
    }

    /// Record activity on a session and return its updated metadata.
    async fn touch_session(
        &self,
        session_id: &str,
        workdir_key: &str,
        cost: f64,
    ) -> Option<SessionMeta> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(&(session_id.to_string(), workdir_key.to_string()))?;
        let now = now_ms();
        record.updated_at = now;
        record.last_activity_at = now;
        record.total_cost_usd += cost;
        Some(record.meta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::engine::ScriptedEngine;
    use crate::store::{MemoryRepoStore, NullIndexer};

    struct Harness {
        orchestrator: Arc<SessionOrchestrator>,
        engine: Arc<ScriptedEngine>,
        repos: Arc<MemoryRepoStore>,
        ctx: ConnectionContext,
        rx: mpsc::Receiver<ServerMessage>,
        _tmp: tempfile::TempDir,
    }

    fn harness(engine: ScriptedEngine) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine);
        let repos = Arc::new(MemoryRepoStore::new());
        let workspace = Arc::new(WorkspaceManager::new(
            tmp.path().join("projects"),
            Duration::from_secs(60),
        ));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            workspace,
            Arc::clone(&repos) as Arc<dyn RepoStore>,
            Arc::new(NullIndexer),
            Arc::clone(&engine) as Arc<dyn AgentEngine>,
            PathBuf::from("/tmp"),
        ));
        let (tx, rx) = mpsc::channel(256);
        let ctx = ConnectionContext::new(tx);
        Harness {
            orchestrator,
            engine,
            repos,
            ctx,
            rx,
            _tmp: tmp,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    async fn collect_until_done(
        rx: &mut mpsc::Receiver<ServerMessage>,
        request_id: &str,
    ) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        loop {
            let frame = next(rx).await;
            let done = matches!(
                &frame,
                ServerMessage::StreamDone { request_id: id, .. }
                | ServerMessage::Error { request_id: Some(id), .. } if id == request_id
            );
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    fn create_params(request_id: &str, prompt: &str) -> CreateParams {
        CreateParams {
            request_id: Some(request_id.to_string()),
            prompt: prompt.to_string(),
            cwd: None,
            title: None,
            repo_url: None,
            repo_id: None,
            branch: None,
        }
    }

    #[tokio::test]
    async fn test_create_with_cwd_makes_no_git_calls() {
        let mut h = harness(ScriptedEngine::completing("Hello!"));
        let mut params = create_params("req-1", "Hello");
        params.cwd = Some("/tmp".to_string());

        Arc::clone(&h.orchestrator).create(h.ctx.clone(), params).await;

        let created = next(&mut h.rx).await;
        match &created {
            ServerMessage::SessionCreated {
                request_id, cwd, encoded_cwd, ..
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(cwd, "/tmp");
                assert_eq!(encoded_cwd, "-tmp");
            }
            other => panic!("expected session.created first, got {other:?}"),
        }
        collect_until_done(&mut h.rx, "req-1").await;

        // No mirror or worktree was provisioned
        assert!(!h._tmp.path().join("projects").exists());
    }

    #[tokio::test]
    async fn test_create_without_origin_uses_default_cwd() {
        let mut h = harness(ScriptedEngine::completing("ok"));
        Arc::clone(&h.orchestrator)
            .create(h.ctx.clone(), create_params("req-1", "Hello"))
            .await;

        match next(&mut h.rx).await {
            ServerMessage::SessionCreated { cwd, .. } => assert_eq!(cwd, "/tmp"),
            other => panic!("expected session.created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_created_precedes_stream_and_done_terminates() {
        let mut h = harness(ScriptedEngine::completing("Hello!"));
        let mut params = create_params("req-1", "Hi");
        params.cwd = Some("/tmp".to_string());

        Arc::clone(&h.orchestrator).create(h.ctx.clone(), params).await;
        let frames = {
            let mut all = vec![next(&mut h.rx).await];
            all.extend(collect_until_done(&mut h.rx, "req-1").await);
            all
        };

        assert!(matches!(frames[0], ServerMessage::SessionCreated { .. }));
        let delta_pos = frames
            .iter()
            .position(|f| matches!(f, ServerMessage::StreamDelta { .. }))
            .unwrap();
        let done_pos = frames
            .iter()
            .position(|f| matches!(f, ServerMessage::StreamDone { .. }))
            .unwrap();
        assert!(delta_pos < done_pos);

        // Request is gone after its terminal event
        assert!(h.orchestrator.active_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_repo_id_fails_without_git_calls() {
        let mut h = harness(ScriptedEngine::completing("unused"));
        let mut params = create_params("req-bad-id", "Hello");
        params.repo_id = Some("nonexistent-repo".to_string());

        Arc::clone(&h.orchestrator).create(h.ctx.clone(), params).await;

        match next(&mut h.rx).await {
            ServerMessage::Error {
                code, request_id, ..
            } => {
                assert_eq!(code, ErrorCode::RepoNotFound);
                assert_eq!(request_id.as_deref(), Some("req-bad-id"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }

        assert!(h.engine.runs().await.is_empty());
        assert!(h.orchestrator.active_requests().await.is_empty());
        assert!(!h._tmp.path().join("projects").exists());
    }

    #[tokio::test]
    async fn test_send_unknown_session_fails() {
        let mut h = harness(ScriptedEngine::completing("unused"));
        Arc::clone(&h.orchestrator)
            .send(
                h.ctx.clone(),
                SendParams {
                    request_id: Some("req-missing".to_string()),
                    session_id: "no-such-session".to_string(),
                    workdir_key: "-tmp".to_string(),
                    prompt: "hello".to_string(),
                },
            )
            .await;

        match next(&mut h.rx).await {
            ServerMessage::Error {
                code, request_id, ..
            } => {
                assert_eq!(code, ErrorCode::SessionNotFound);
                assert_eq!(request_id.as_deref(), Some("req-missing"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(h.engine.runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_resumes_engine_session() {
        let mut h = harness(ScriptedEngine::completing("ok"));
        let mut params = create_params("req-1", "first");
        params.cwd = Some("/tmp".to_string());
        Arc::clone(&h.orchestrator).create(h.ctx.clone(), params).await;

        let created = next(&mut h.rx).await;
        let (session_id, workdir_key) = match created {
            ServerMessage::SessionCreated {
                session_id,
                encoded_cwd,
                ..
            } => (session_id, encoded_cwd),
            other => panic!("expected session.created, got {other:?}"),
        };
        collect_until_done(&mut h.rx, "req-1").await;

        Arc::clone(&h.orchestrator)
            .send(
                h.ctx.clone(),
                SendParams {
                    request_id: Some("req-2".to_string()),
                    session_id: session_id.clone(),
                    workdir_key,
                    prompt: "second".to_string(),
                },
            )
            .await;
        collect_until_done(&mut h.rx, "req-2").await;

        let runs = h.engine.runs().await;
        assert_eq!(runs.len(), 2);
        assert!(runs[0].resume_session.is_none());
        assert_eq!(runs[1].resume_session.as_deref(), Some(session_id.as_str()));
    }

    #[tokio::test]
    async fn test_cost_accumulates_across_requests() {
        let mut h = harness(ScriptedEngine::completing("ok"));
        let mut params = create_params("req-1", "first");
        params.cwd = Some("/work".to_string());
        Arc::clone(&h.orchestrator).create(h.ctx.clone(), params).await;

        let (session_id, workdir_key) = match next(&mut h.rx).await {
            ServerMessage::SessionCreated {
                session_id,
                encoded_cwd,
                ..
            } => (session_id, encoded_cwd),
            other => panic!("expected session.created, got {other:?}"),
        };
        collect_until_done(&mut h.rx, "req-1").await;

        Arc::clone(&h.orchestrator)
            .send(
                h.ctx.clone(),
                SendParams {
                    request_id: Some("req-2".to_string()),
                    session_id: session_id.clone(),
                    workdir_key: workdir_key.clone(),
                    prompt: "again".to_string(),
                },
            )
            .await;
        collect_until_done(&mut h.rx, "req-2").await;

        let record = h
            .orchestrator
            .find_session(&session_id, &workdir_key)
            .await
            .unwrap();
        // Two completions at 0.01 each
        assert!((record.total_cost_usd - 0.02).abs() < 1e-9);
        assert!(record.last_activity_at >= record.created_at);
    }

    #[tokio::test]
    async fn test_interleaved_streams_stay_separate() {
        let engine = ScriptedEngine::with_default(Vec::new())
            .with_event_delay(Duration::from_millis(2));
        let h = harness(engine);
        h.engine
            .push_script(vec![
                EngineEvent::Delta { text: "A1".into() },
                EngineEvent::Delta { text: "A2".into() },
                EngineEvent::Delta { text: "A3".into() },
                EngineEvent::Completed { total_cost_usd: 0.0 },
            ])
            .await;
        h.engine
            .push_script(vec![
                EngineEvent::Delta { text: "B1".into() },
                EngineEvent::Delta { text: "B2".into() },
                EngineEvent::Delta { text: "B3".into() },
                EngineEvent::Completed { total_cost_usd: 0.0 },
            ])
            .await;

        let mut pa = create_params("req-a", "one");
        pa.cwd = Some("/tmp/a".to_string());
        let mut pb = create_params("req-b", "two");
        pb.cwd = Some("/tmp/b".to_string());

        let ta = tokio::spawn(
            Arc::clone(&h.orchestrator).create(h.ctx.clone(), pa),
        );
        let tb = tokio::spawn(
            Arc::clone(&h.orchestrator).create(h.ctx.clone(), pb),
        );
        ta.await.unwrap();
        tb.await.unwrap();

        // Reassemble per-request text from the emitted frames
        let mut rx = h.rx;
        let mut text_a = String::new();
        let mut text_b = String::new();
        let mut done = 0;
        while done < 2 {
            match next(&mut rx).await {
                ServerMessage::StreamDelta { request_id, text } => {
                    if request_id == "req-a" {
                        text_a.push_str(&text);
                    } else {
                        text_b.push_str(&text);
                    }
                }
                ServerMessage::StreamDone { .. } => done += 1,
                _ => {}
            }
        }
        // Which script answers which request depends on start order, but
        // each accumulation must be one unmixed, ordered sequence.
        let mut texts = vec![text_a, text_b];
        texts.sort();
        assert_eq!(texts, vec!["A1A2A3".to_string(), "B1B2B3".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_clears_active_set_while_streaming() {
        let mut h = harness(ScriptedEngine::stalling("partial"));
        let mut params = create_params("req-stop", "Hello");
        params.cwd = Some("/tmp".to_string());

        let task = tokio::spawn(
            Arc::clone(&h.orchestrator).create(h.ctx.clone(), params),
        );

        // Wait for the first delta so the generation is in flight
        loop {
            if let ServerMessage::StreamDelta { .. } = next(&mut h.rx).await {
                break;
            }
        }

        assert!(h.orchestrator.stop("req-stop").await);
        assert!(h.orchestrator.active_requests().await.is_empty());
        // Stopping twice is a no-op
        assert!(!h.orchestrator.stop("req-stop").await);

        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_index_emits_idle_state() {
        let mut h = harness(ScriptedEngine::completing("unused"));
        h.orchestrator.refresh_index(&h.ctx).await;

        match next(&mut h.rx).await {
            ServerMessage::SessionState { status, .. } => {
                assert_eq!(status, SessionStatus::Idle);
            }
            other => panic!("expected session.state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repo_list_reflects_store() {
        let mut h = harness(ScriptedEngine::completing("unused"));
        h.repos
            .insert(Repository::new(
                "https://github.com/dojoengine/dojo.git",
                PathBuf::from("/fake/repos/dojo.git"),
                "main".to_string(),
            ))
            .await;

        h.orchestrator.repo_list(&h.ctx).await;
        match next(&mut h.rx).await {
            ServerMessage::RepoList { repositories } => {
                assert_eq!(repositories.len(), 1);
                assert_eq!(repositories[0].slug, "github-com-dojoengine-dojo");
            }
            other => panic!("expected repo.list, got {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Repo-backed creates against real git; self-skip without git.
    // ------------------------------------------------------------------

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn create_origin(tmp: &std::path::Path) -> PathBuf {
        let run = |args: &[&str], cwd: &std::path::Path| {
            let out = std::process::Command::new("git")
                .args(args)
                .current_dir(cwd)
                .output()
                .expect("failed to run git");
            assert!(out.status.success(), "git {args:?} failed");
        };
        let origin = tmp.join("origin-repo");
        std::fs::create_dir_all(&origin).unwrap();
        run(&["init"], &origin);
        run(&["checkout", "-b", "main"], &origin);
        run(&["config", "user.email", "test@test.com"], &origin);
        run(&["config", "user.name", "Test"], &origin);
        std::fs::write(origin.join("README.md"), "# test repo\n").unwrap();
        run(&["add", "."], &origin);
        run(&["commit", "-m", "initial commit"], &origin);
        origin
    }

    #[tokio::test]
    async fn test_repo_url_create_registers_once_and_isolates_worktrees() {
        if !git_available() {
            return;
        }
        let mut h = harness(ScriptedEngine::completing("ok"));
        let origin = create_origin(h._tmp.path());
        let url = origin.to_string_lossy().into_owned();

        let mut first = create_params("req-1", "one");
        first.repo_url = Some(url.clone());
        Arc::clone(&h.orchestrator).create(h.ctx.clone(), first).await;
        let frames_one = {
            let mut all = vec![next(&mut h.rx).await];
            all.extend(collect_until_done(&mut h.rx, "req-1").await);
            all
        };

        let mut second = create_params("req-2", "two");
        second.repo_url = Some(url.clone());
        Arc::clone(&h.orchestrator).create(h.ctx.clone(), second).await;
        let frames_two = {
            let mut all = vec![next(&mut h.rx).await];
            all.extend(collect_until_done(&mut h.rx, "req-2").await);
            all
        };

        let wt_path = |frames: &[ServerMessage]| -> String {
            frames
                .iter()
                .find_map(|f| match f {
                    ServerMessage::SessionCreated { cwd, session, .. } => {
                        let meta = session.as_ref().unwrap();
                        assert_eq!(meta.worktree_path.as_deref(), Some(cwd.as_str()));
                        assert_eq!(meta.branch.as_deref(), Some("main"));
                        assert!(meta.repo_id.is_some());
                        Some(cwd.clone())
                    }
                    _ => None,
                })
                .expect("no session.created frame")
        };
        let path_one = wt_path(&frames_one);
        let path_two = wt_path(&frames_two);
        assert_ne!(path_one, path_two);
        assert!(path_one.contains("worktrees"));

        // One registry row, refreshed on reuse
        let rows = h.repos.list_all().await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].last_fetched_at >= rows[0].created_at);
    }

    #[tokio::test]
    async fn test_clone_failure_leaves_no_registry_row() {
        if !git_available() {
            return;
        }
        let mut h = harness(ScriptedEngine::completing("unused"));
        let missing = h._tmp.path().join("missing-origin");

        let mut params = create_params("req-fail", "Hello");
        params.repo_url = Some(missing.to_string_lossy().into_owned());
        Arc::clone(&h.orchestrator).create(h.ctx.clone(), params).await;

        match next(&mut h.rx).await {
            ServerMessage::Error {
                code,
                request_id,
                message,
                ..
            } => {
                assert_eq!(code, ErrorCode::Upstream);
                assert_eq!(request_id.as_deref(), Some("req-fail"));
                assert!(!message.is_empty());
            }
            other => panic!("expected error frame, got {other:?}"),
        }

        assert!(h.repos.list_all().await.is_empty());
        assert!(h.engine.runs().await.is_empty());
    }
}
