//! Git workspace manager
//!
//! Maintains one bare mirror per remote repository under
//! `<projects_dir>/repos/<slug>.git` and provisions isolated worktree
//! checkouts under `<projects_dir>/worktrees/<worktree_id>`.
//!
//! All git operations run as subprocesses with a bounded wait. Mutating
//! operations (clone, fetch) take a per-repository write lock; worktree
//! adds take the read side, so worktree creation against a ready mirror
//! proceeds in parallel while never interleaving with a fetch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Errors that can occur during git operations
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("git {command} timed out after {seconds}s")]
    TimedOut { command: String, seconds: u64 },

    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Captured result of one git subprocess call.
///
/// Non-zero exits are data, not errors, so callers can chain staged
/// fallbacks while keeping the diagnostic output of each stage.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A ready bare mirror
#[derive(Debug, Clone)]
pub struct RepoCheckout {
    /// Path to the bare mirror
    pub mirror_path: PathBuf,
    /// Default branch resolved from the mirror
    pub default_branch: String,
}

/// Options for provisioning a worktree
#[derive(Debug, Clone)]
pub struct WorktreeOpts {
    /// Target branch; resolved to the default branch when absent
    pub branch: Option<String>,
    /// Generated id owning the checkout; also scopes the local branch name
    pub worktree_id: String,
}

/// An isolated worktree checkout
#[derive(Debug, Clone)]
pub struct WorktreeCheckout {
    /// Path to the checkout
    pub worktree_path: PathBuf,
    /// The upstream branch the checkout tracks
    pub branch: String,
}

/// Convert a repository URL into its mirror directory slug.
///
/// Strips the scheme and a trailing `.git`, collapses every other
/// non-alphanumeric run into a single `-`, and lowercases.
pub fn repo_url_to_slug(url: &str) -> String {
    let rest = match url.find("://") {
        Some(idx) if idx > 0 && url[..idx].chars().all(|c| c.is_ascii_alphabetic()) => {
            &url[idx + 3..]
        }
        _ => url,
    };
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    let mut slug = String::with_capacity(rest.len());
    let mut prev_dash = false;
    for c in rest.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            slug.push('-');
            prev_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Manages bare mirrors and worktrees for all repositories owned by this
/// process.
pub struct WorkspaceManager {
    projects_dir: PathBuf,
    timeout: Duration,
    /// Per-mirror exclusion: write = clone/fetch, read = worktree add
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl WorkspaceManager {
    pub fn new(projects_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mirror path for a repository URL
    pub fn mirror_path(&self, url: &str) -> PathBuf {
        let slug = repo_url_to_slug(url);
        self.projects_dir.join("repos").join(format!("{slug}.git"))
    }

    /// Get or create the lock scope for a mirror
    async fn repo_lock(&self, mirror: &Path) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(mirror.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Ensure a bare mirror exists for `url` and is freshly fetched.
    ///
    /// First call clones; every later call refreshes with
    /// `fetch --all --prune`. Clone and fetch failures carry the
    /// subprocess stderr.
    pub async fn ensure_repo(&self, url: &str) -> Result<RepoCheckout, GitError> {
        let mirror = self.mirror_path(url);
        let lock = self.repo_lock(&mirror).await;
        let _guard = lock.write().await;

        if mirror.join("HEAD").exists() {
            debug!("Refreshing mirror {}", mirror.display());
            self.run_git_ok(&["fetch", "--all", "--prune"], Some(&mirror))
                .await?;
        } else {
            if let Some(parent) = mirror.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!("Cloning {} into {}", url, mirror.display());
            let mirror_arg = mirror.to_string_lossy().to_string();
            self.run_git_ok(&["clone", "--bare", url, &mirror_arg], None)
                .await?;
            // A bare clone has no fetch refspec, so remote-tracking refs
            // (refs/remotes/origin/*) stay empty until one is configured.
            self.run_git_ok(
                &[
                    "config",
                    "remote.origin.fetch",
                    "+refs/heads/*:refs/remotes/origin/*",
                ],
                Some(&mirror),
            )
            .await?;
            self.run_git_ok(&["fetch", "--all", "--prune"], Some(&mirror))
                .await?;
        }

        let default_branch = self.default_branch(&mirror).await?;
        Ok(RepoCheckout {
            mirror_path: mirror,
            default_branch,
        })
    }

    /// Provision an isolated worktree from a ready mirror.
    ///
    /// Each worktree checks out a local branch scoped to its id
    /// (`wt/<worktree_id>`); git refuses to check out one branch name into
    /// two worktrees, and sessions commonly target the same upstream
    /// branch. Tries the remote-tracking ref first, then the bare local
    /// ref for mirrors without remote tracking.
    pub async fn create_worktree(
        &self,
        mirror: &Path,
        opts: WorktreeOpts,
    ) -> Result<WorktreeCheckout, GitError> {
        let lock = self.repo_lock(mirror).await;
        let _guard = lock.read().await;

        let branch = match opts.branch {
            Some(b) => b,
            None => self.default_branch(mirror).await?,
        };
        let local_branch = format!("wt/{}", opts.worktree_id);
        let worktree_path = self
            .projects_dir
            .join("worktrees")
            .join(&opts.worktree_id);
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_arg = worktree_path.to_string_lossy().to_string();
        let remote_ref = format!("origin/{branch}");
        let first = self
            .run_git(
                &["worktree", "add", "-b", &local_branch, &path_arg, &remote_ref],
                Some(mirror),
            )
            .await?;
        if !first.success {
            let second = self
                .run_git(
                    &["worktree", "add", "-b", &local_branch, &path_arg, &branch],
                    Some(mirror),
                )
                .await?;
            if !second.success {
                return Err(GitError::CommandFailed {
                    command: "worktree add".to_string(),
                    stderr: second.stderr,
                });
            }
        }

        Ok(WorktreeCheckout {
            worktree_path,
            branch,
        })
    }

    /// Remove a worktree checkout. Best-effort: failures are logged and
    /// swallowed, disk cleanup is not correctness-critical.
    pub async fn remove_worktree(&self, mirror: &Path, worktree_path: &Path) {
        let lock = self.repo_lock(mirror).await;
        let _guard = lock.read().await;

        let path_arg = worktree_path.to_string_lossy().to_string();
        match self
            .run_git(&["worktree", "remove", "--force", &path_arg], Some(mirror))
            .await
        {
            Ok(out) if out.success => {}
            Ok(out) => warn!(
                "Failed to remove worktree {}: {}",
                worktree_path.display(),
                out.stderr
            ),
            Err(e) => warn!(
                "Failed to remove worktree {}: {}",
                worktree_path.display(),
                e
            ),
        }
    }

    /// List local branch names in a mirror. A failed listing yields an
    /// empty list.
    pub async fn list_branches(&self, mirror: &Path) -> Result<Vec<String>, GitError> {
        let out = self
            .run_git(
                &["branch", "--list", "--format=%(refname:short)"],
                Some(mirror),
            )
            .await?;
        if !out.success {
            return Ok(Vec::new());
        }
        Ok(out
            .stdout
            .lines()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect())
    }

    /// Resolve the default branch of a mirror.
    ///
    /// Resolution order: the remote HEAD symbolic ref, then `main` if
    /// present, then `master` if present, then the first listed branch.
    pub async fn default_branch(&self, mirror: &Path) -> Result<String, GitError> {
        let out = self
            .run_git(
                &["symbolic-ref", "refs/remotes/origin/HEAD"],
                Some(mirror),
            )
            .await?;
        if out.success && !out.stdout.is_empty() {
            // refs/remotes/origin/main -> main
            return Ok(out
                .stdout
                .trim_start_matches("refs/remotes/origin/")
                .to_string());
        }

        let branches = self.list_branches(mirror).await?;
        if branches.iter().any(|b| b == "main") {
            return Ok("main".to_string());
        }
        if branches.iter().any(|b| b == "master") {
            return Ok("master".to_string());
        }
        Ok(branches
            .first()
            .cloned()
            .unwrap_or_else(|| "main".to_string()))
    }

    /// Run git, requiring a zero exit
    async fn run_git_ok(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<GitOutput, GitError> {
        let out = self.run_git(args, cwd).await?;
        if !out.success {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    /// Run git with a bounded wait, capturing output
    async fn run_git(&self, args: &[&str], cwd: Option<&Path>) -> Result<GitOutput, GitError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GitError::TimedOut {
                    command: args.join(" "),
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
