//! Repository registry and history indexer contracts

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::git::repo_url_to_slug;
use crate::util::now_ms;

/// A registered repository: one row per normalized URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: String,
    pub url: String,
    pub slug: String,
    pub mirror_path: PathBuf,
    pub default_branch: String,
    pub created_at: u64,
    pub last_fetched_at: u64,
}

/// Registry of known repositories.
///
/// Implementations must guarantee at most one row per normalized URL even
/// under concurrent callers.
#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Look up a repository by URL (normalized internally).
    async fn find_by_url(&self, url: &str) -> Option<Repository>;

    /// Look up a repository by id.
    async fn find_by_id(&self, id: &str) -> Option<Repository>;

    /// Insert a repository if its normalized URL is not yet registered.
    /// Returns the canonical row, which is the existing one when the URL
    /// was already present.
    async fn insert(&self, repo: Repository) -> Repository;

    /// Record a refresh fetch against an existing row.
    async fn mark_fetched(&self, id: &str, at: u64);

    /// All registered repositories.
    async fn list_all(&self) -> Vec<Repository>;
}

/// In-memory registry keyed by slug.
#[derive(Default)]
pub struct MemoryRepoStore {
    rows: RwLock<HashMap<String, Repository>>,
}

impl MemoryRepoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepoStore for MemoryRepoStore {
    async fn find_by_url(&self, url: &str) -> Option<Repository> {
        let slug = repo_url_to_slug(url);
        self.rows.read().await.get(&slug).cloned()
    }

    async fn find_by_id(&self, id: &str) -> Option<Repository> {
        self.rows
            .read()
            .await
            .values()
            .find(|r| r.id == id)
            .cloned()
    }

    async fn insert(&self, repo: Repository) -> Repository {
        let mut rows = self.rows.write().await;
        rows.entry(repo.slug.clone()).or_insert(repo).clone()
    }

    async fn mark_fetched(&self, id: &str, at: u64) {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.values_mut().find(|r| r.id == id) {
            row.last_fetched_at = at;
        }
    }

    async fn list_all(&self) -> Vec<Repository> {
        let mut repos: Vec<Repository> = self.rows.read().await.values().cloned().collect();
        repos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        repos
    }
}

/// One page of session history from the indexer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HistoryPage {
    pub messages: Vec<serde_json::Value>,
    pub next_cursor: Option<u64>,
    pub total_messages: u64,
}

/// External history indexer consumed by the orchestrator.
#[async_trait]
pub trait HistoryIndexer: Send + Sync {
    /// Read one page of history for a session.
    async fn read_history(
        &self,
        session_id: &str,
        workdir_key: &str,
        cursor: Option<u64>,
    ) -> HistoryPage;

    /// Re-scan external session state; returns when the index is current.
    async fn refresh_index(&self);
}

/// Indexer stub for deployments and tests without a history index.
#[derive(Default)]
pub struct NullIndexer;

#[async_trait]
impl HistoryIndexer for NullIndexer {
    async fn read_history(
        &self,
        _session_id: &str,
        _workdir_key: &str,
        _cursor: Option<u64>,
    ) -> HistoryPage {
        HistoryPage::default()
    }

    async fn refresh_index(&self) {}
}

impl Repository {
    /// Build a new row for a freshly cloned mirror.
    pub fn new(url: &str, mirror_path: PathBuf, default_branch: String) -> Self {
        let at = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            slug: repo_url_to_slug(url),
            mirror_path,
            default_branch,
            created_at: at,
            last_fetched_at: at,
        }
    }
}
