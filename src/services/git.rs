//! VCS adapter over the `git` CLI.
//!
//! One shared clone per repository; each issue gets a disjoint worktree, so
//! concurrent pipelines on the same repository never collide on a checkout.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::exec::Runner;
use crate::services::WorkspaceService;

pub struct GitWorkspace {
    runner: Runner,
}

impl GitWorkspace {
    pub fn new(runner: Runner) -> Self {
        Self { runner }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, crate::exec::ExecError> {
        self.runner.run(Some(dir), "git", args).await
    }
}

#[async_trait]
impl WorkspaceService for GitWorkspace {
    async fn clone_repo(&self, url: &str, dir: &Path) -> Result<()> {
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent of {}", dir.display()))?;
        }
        let dir_str = dir.to_string_lossy().into_owned();
        self.runner
            .run(None, "git", &["clone", url, dir_str.as_str()])
            .await?;
        Ok(())
    }

    async fn fetch(&self, dir: &Path) -> Result<()> {
        self.git(dir, &["fetch", "origin"]).await?;
        Ok(())
    }

    async fn default_branch(&self, dir: &Path) -> String {
        match self
            .git(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await
        {
            Ok(out) => out
                .trim()
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("main")
                .to_string(),
            Err(_) => "main".to_string(),
        }
    }

    async fn remote_branch_exists(&self, dir: &Path, name: &str) -> bool {
        let r = format!("refs/remotes/origin/{name}");
        self.git(dir, &["rev-parse", "--verify", r.as_str()]).await.is_ok()
    }

    async fn local_branch_exists(&self, dir: &Path, name: &str) -> bool {
        let r = format!("refs/heads/{name}");
        self.git(dir, &["rev-parse", "--verify", r.as_str()]).await.is_ok()
    }

    async fn delete_local_branch(&self, dir: &Path, name: &str) -> Result<()> {
        self.git(dir, &["branch", "-D", name]).await?;
        Ok(())
    }

    async fn worktree_add(&self, dir: &Path, wt_dir: &Path, branch: &str) -> Result<()> {
        let wt = wt_dir.to_string_lossy().into_owned();
        self.git(dir, &["worktree", "add", wt.as_str(), branch])
            .await?;
        Ok(())
    }

    async fn worktree_add_new(
        &self,
        dir: &Path,
        wt_dir: &Path,
        branch: &str,
        from: &str,
    ) -> Result<()> {
        let wt = wt_dir.to_string_lossy().into_owned();
        self.git(dir, &["worktree", "add", "-b", branch, wt.as_str(), from])
            .await?;
        Ok(())
    }

    async fn worktree_remove(&self, dir: &Path, wt_dir: &Path) -> Result<()> {
        let wt = wt_dir.to_string_lossy().into_owned();
        self.git(dir, &["worktree", "remove", wt.as_str(), "--force"])
            .await?;
        Ok(())
    }

    async fn porcelain(&self, wt_dir: &Path) -> Result<String> {
        Ok(self.git(wt_dir, &["status", "--porcelain"]).await?)
    }

    async fn stage_all(&self, wt_dir: &Path) -> Result<()> {
        self.git(wt_dir, &["add", "-A"]).await?;
        Ok(())
    }

    async fn commit(&self, wt_dir: &Path, msg: &str) -> Result<()> {
        self.git(wt_dir, &["commit", "-m", msg]).await?;
        Ok(())
    }

    async fn push(&self, wt_dir: &Path, remote: &str, branch: &str) -> Result<()> {
        self.git(wt_dir, &["push", "-u", remote, branch]).await?;
        Ok(())
    }

    async fn diff_stat(&self, wt_dir: &Path, range: &str) -> Result<String> {
        Ok(self.git(wt_dir, &["diff", "--stat", range]).await?)
    }
}
