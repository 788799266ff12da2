//! Ports onto the three external collaborators.
//!
//! The hosting service, the VCS, and the synthesis agent are consumed through
//! these traits so everything above them runs against in-memory doubles in
//! tests. Real implementations: [`github::GhIssues`], [`git::GitWorkspace`],
//! [`claude::ClaudeAgent`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::issue::Issue;

pub mod claude;
pub mod git;
pub mod github;

/// An open review request ("pull request") on a branch.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    pub url: String,
}

#[async_trait]
pub trait IssueService: Send + Sync {
    /// List up to 50 open issues, optionally filtered by label.
    async fn list_by_label(&self, repo: &str, label: Option<&str>) -> Result<Vec<Issue>>;

    /// Fetch a single issue with its current comments.
    async fn view(&self, repo: &str, number: u64) -> Result<Issue>;

    async fn add_label(&self, repo: &str, number: u64, name: &str) -> Result<()>;

    async fn remove_label(&self, repo: &str, number: u64, name: &str) -> Result<()>;

    /// Create a label; a label that already exists is not an error.
    async fn create_label(&self, repo: &str, name: &str, color: &str, desc: &str) -> Result<()>;

    async fn comment(&self, repo: &str, number: u64, body: &str) -> Result<()>;

    /// At most one result is ever needed by callers.
    async fn list_review_requests(&self, repo: &str, head: &str) -> Result<Vec<ReviewRequest>>;

    /// Returns the URL of the created review request.
    async fn create_review_request(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String>;
}

#[async_trait]
pub trait WorkspaceService: Send + Sync {
    async fn clone_repo(&self, url: &str, dir: &Path) -> Result<()>;

    async fn fetch(&self, dir: &Path) -> Result<()>;

    /// The remote default branch per `refs/remotes/origin/HEAD`, falling back
    /// to `main` when the ref is unreadable.
    async fn default_branch(&self, dir: &Path) -> String;

    async fn remote_branch_exists(&self, dir: &Path, name: &str) -> bool;

    async fn local_branch_exists(&self, dir: &Path, name: &str) -> bool;

    async fn delete_local_branch(&self, dir: &Path, name: &str) -> Result<()>;

    async fn worktree_add(&self, dir: &Path, wt_dir: &Path, branch: &str) -> Result<()>;

    async fn worktree_add_new(
        &self,
        dir: &Path,
        wt_dir: &Path,
        branch: &str,
        from: &str,
    ) -> Result<()>;

    async fn worktree_remove(&self, dir: &Path, wt_dir: &Path) -> Result<()>;

    /// `git status --porcelain` output; empty means a clean tree.
    async fn porcelain(&self, wt_dir: &Path) -> Result<String>;

    async fn stage_all(&self, wt_dir: &Path) -> Result<()>;

    async fn commit(&self, wt_dir: &Path, msg: &str) -> Result<()>;

    async fn push(&self, wt_dir: &Path, remote: &str, branch: &str) -> Result<()>;

    async fn diff_stat(&self, wt_dir: &Path, range: &str) -> Result<String>;
}

/// One synthesis-agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub dir: PathBuf,
    pub prompt: String,
    pub max_turns: u32,
    /// Tool whitelist; empty means the agent gets no tools.
    pub allowed_tools: Vec<String>,
    pub deadline: Duration,
    pub log_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent timed out after {after:?}")]
    DeadlineExceeded { after: Duration },

    #[error("agent exited with {status}")]
    NonZeroExit { status: String },

    #[error("agent run cancelled by shutdown")]
    Cancelled,

    #[error("agent run failed: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SynthAgent: Send + Sync {
    /// Run the agent in `req.dir`, streaming stdout and stderr to
    /// `req.log_path`. Returns the captured stdout on success.
    async fn run(&self, req: AgentRequest) -> Result<String, AgentError>;
}
