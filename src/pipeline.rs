//! The per-issue pipeline: a linear state machine whose every step probes for
//! its post-condition before mutating, so a re-run after a crash or a retry
//! picks up where the last attempt stopped without duplicating side effects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exec::ExecError;
use crate::issue::{BOT_MARKER, ERROR_SENTINEL, GREETING_SIGNATURE, Issue, branch_name, slugify};
use crate::prompt::build_prompt;
use crate::services::{AgentError, AgentRequest, IssueService, SynthAgent, WorkspaceService};

/// Hard ceiling on one synthesis-agent run.
pub const AGENT_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Paths and names derived from an issue; deterministic in `(repo, number,
/// title)`, so a retry lands on the same branch and worktree.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub branch: String,
    pub repo_dir: PathBuf,
    pub worktree_dir: PathBuf,
    pub log_file: PathBuf,
}

impl WorkContext {
    pub fn derive(cfg: &Config, issue: &Issue) -> Self {
        let branch = branch_name(issue);
        Self {
            repo_dir: cfg.repo_dir.join(&issue.repo),
            worktree_dir: cfg.worktree_dir.join(&issue.repo).join(&branch),
            log_file: cfg
                .log_dir
                .join(format!("{}-{}.log", slugify(&issue.repo), issue.number)),
            branch,
        }
    }
}

fn error_comment(msg: &str) -> String {
    format!("{ERROR_SENTINEL}\n```\n{msg}\n```\nNeeds manual attention.\n\n{BOT_MARKER}")
}

fn greeting_comment(greeting: &str, author: &str) -> String {
    let lead = if author.is_empty() {
        greeting.to_string()
    } else {
        format!("Hey @{author}! {greeting}")
    };
    format!("{lead}{GREETING_SIGNATURE}\n\n{BOT_MARKER}")
}

fn no_change_comment(needs_info_label: &str, ready_label: &str) -> String {
    format!(
        "claude-bot ran but couldn't resolve this issue — no file changes were made.\n\n\
         Please add more context or details as a comment, then replace the \
         `{needs_info_label}` label with `{ready_label}` to retry.\n\n{BOT_MARKER}"
    )
}

fn review_request_body(number: u64, diff_stat: &str, issue_url: &str) -> String {
    format!(
        "Closes #{number}\n\n## What changed\n```\n{diff_stat}\n```\n\n## Issue\n{issue_url}\n\n\
         ---\n*Automated by claude-bot. Review before merging.*\n\n{BOT_MARKER}"
    )
}

pub struct Pipeline {
    cfg: Arc<Config>,
    issues: Arc<dyn IssueService>,
    workspace: Arc<dyn WorkspaceService>,
    agent: Arc<dyn SynthAgent>,
}

impl Pipeline {
    pub fn new(
        cfg: Arc<Config>,
        issues: Arc<dyn IssueService>,
        workspace: Arc<dyn WorkspaceService>,
        agent: Arc<dyn SynthAgent>,
    ) -> Self {
        Self {
            cfg,
            issues,
            workspace,
            agent,
        }
    }

    /// Run the full pipeline for one issue. A failure in any step after the
    /// claim triggers compensation: an error comment (deduplicated against
    /// the most recent comment), labels reset to *ready*, and cleanup.
    pub async fn process(&self, issue: &Issue) -> Result<()> {
        let ctx = WorkContext::derive(&self.cfg, issue);

        // Step 1: claim. Nothing to undo if this fails.
        self.claim(issue).await?;

        // Step 1.5: greeting. Idempotent and never fatal.
        self.greet(issue).await;

        match self.drive(issue, &ctx).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.compensate(issue, &ctx, &err).await;
                Err(err)
            }
        }
    }

    async fn claim(&self, issue: &Issue) -> Result<()> {
        if issue.has_label(&self.cfg.wip_label) {
            return Ok(());
        }
        self.issues
            .add_label(&issue.repo, issue.number, &self.cfg.wip_label)
            .await
            .context("marking in-progress")?;
        if let Err(err) = self
            .issues
            .remove_label(&issue.repo, issue.number, &self.cfg.issue_label)
            .await
        {
            warn!(
                issue = %issue.key(),
                "couldn't remove {} label: {err:#}", self.cfg.issue_label
            );
        }
        Ok(())
    }

    /// Post a friendly note that work has started, recognized on retries by
    /// the greeting signature. The polled snapshot may be stale, so the live
    /// comments are re-checked before posting.
    async fn greet(&self, issue: &Issue) {
        let already_greeted = |i: &Issue| {
            i.comments
                .iter()
                .any(|c| c.body.contains(GREETING_SIGNATURE))
        };
        if already_greeted(issue) {
            return;
        }
        match self.issues.view(&issue.repo, issue.number).await {
            Ok(fresh) if already_greeted(&fresh) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(issue = %issue.key(), "couldn't re-check greeting: {err:#}");
            }
        }
        let body = greeting_comment(&self.cfg.greeting, &issue.author.login);
        if let Err(err) = self.issues.comment(&issue.repo, issue.number, &body).await {
            warn!(issue = %issue.key(), "couldn't post greeting: {err:#}");
        }
    }

    /// Steps 2-12.
    async fn drive(&self, issue: &Issue, ctx: &WorkContext) -> Result<()> {
        // Step 2: clone once per repository.
        if !ctx.repo_dir.join(".git").is_dir() {
            let url = format!("https://github.com/{}.git", issue.repo);
            self.workspace
                .clone_repo(&url, &ctx.repo_dir)
                .await
                .context("cloning repo")?;
        }

        // Step 3: fetch latest.
        self.workspace
            .fetch(&ctx.repo_dir)
            .await
            .context("fetching latest")?;

        // Step 4: worktree on the issue branch.
        self.ensure_worktree(ctx).await.context("creating worktree")?;

        // Step 5: run the agent unless a prior run left uncommitted changes.
        let mut has_changes = self.tree_dirty(ctx, "checking changes").await?;
        if !has_changes {
            self.run_agent(issue, ctx)
                .await
                .context("running synthesis agent")?;
            has_changes = self.tree_dirty(ctx, "checking changes after agent").await?;
        }

        // Step 6: nothing produced — not an error.
        if !has_changes {
            self.finish_needs_info(issue, ctx).await;
            return Ok(());
        }

        // Step 7: commit, re-probing the tree in case a parallel probe raced.
        if self.tree_dirty(ctx, "checking changes before commit").await? {
            self.workspace
                .stage_all(&ctx.worktree_dir)
                .await
                .context("staging changes")?;
            let msg = format!("fix: resolve #{} — {}", issue.number, issue.title);
            self.workspace
                .commit(&ctx.worktree_dir, &msg)
                .await
                .context("committing")?;
        }

        // Step 8: push.
        self.workspace
            .push(&ctx.worktree_dir, "origin", &ctx.branch)
            .await
            .context("pushing")?;

        // Step 9: review request, reusing any that already exists.
        let pr_url = self
            .ensure_review_request(issue, ctx)
            .await
            .context("creating review request")?;

        // Step 10: link the review request on the issue.
        self.ensure_pr_comment(issue, &pr_url)
            .await
            .context("commenting review-request link")?;

        // Step 11: finalize labels.
        if !issue.has_label(&self.cfg.done_label) {
            self.issues
                .add_label(&issue.repo, issue.number, &self.cfg.done_label)
                .await
                .context("marking done")?;
            if let Err(err) = self
                .issues
                .remove_label(&issue.repo, issue.number, &self.cfg.wip_label)
                .await
            {
                warn!(
                    issue = %issue.key(),
                    "couldn't remove {} label: {err:#}", self.cfg.wip_label
                );
            }
        }

        // Step 12: cleanup.
        self.cleanup(ctx).await;

        info!(issue = %issue.key(), pr = %pr_url, "completed");
        Ok(())
    }

    async fn tree_dirty(&self, ctx: &WorkContext, what: &'static str) -> Result<bool> {
        let status = self
            .workspace
            .porcelain(&ctx.worktree_dir)
            .await
            .context(what)?;
        Ok(!status.trim().is_empty())
    }

    async fn ensure_worktree(&self, ctx: &WorkContext) -> Result<()> {
        if ctx.worktree_dir.exists() {
            return Ok(());
        }
        let default_branch = self.workspace.default_branch(&ctx.repo_dir).await;
        self.delete_stale_local_branch(ctx).await;
        if self
            .workspace
            .remote_branch_exists(&ctx.repo_dir, &ctx.branch)
            .await
        {
            // A previous run already pushed this branch; check it out as-is.
            self.workspace
                .worktree_add(&ctx.repo_dir, &ctx.worktree_dir, &ctx.branch)
                .await?;
        } else {
            self.workspace
                .worktree_add_new(
                    &ctx.repo_dir,
                    &ctx.worktree_dir,
                    &ctx.branch,
                    &format!("origin/{default_branch}"),
                )
                .await?;
        }
        Ok(())
    }

    /// A local branch left by a previous failed run blocks worktree creation.
    async fn delete_stale_local_branch(&self, ctx: &WorkContext) {
        if self
            .workspace
            .local_branch_exists(&ctx.repo_dir, &ctx.branch)
            .await
            && let Err(err) = self
                .workspace
                .delete_local_branch(&ctx.repo_dir, &ctx.branch)
                .await
        {
            warn!(branch = %ctx.branch, "couldn't delete stale local branch: {err:#}");
        }
    }

    async fn run_agent(&self, issue: &Issue, ctx: &WorkContext) -> Result<(), AgentError> {
        info!(issue = %issue.key(), log = %ctx.log_file.display(), "running agent");
        let req = AgentRequest {
            dir: ctx.worktree_dir.clone(),
            prompt: build_prompt(issue),
            max_turns: self.cfg.max_turns,
            allowed_tools: ["Bash", "Read", "Write", "Edit"]
                .map(String::from)
                .to_vec(),
            deadline: AGENT_DEADLINE,
            log_path: ctx.log_file.clone(),
        };
        self.agent.run(req).await.map(|_| ())
    }

    /// Terminal branch for an agent run that changed nothing: tell the user
    /// how to retry, park the issue under *needs-info*, clean up.
    async fn finish_needs_info(&self, issue: &Issue, ctx: &WorkContext) {
        let body = no_change_comment(&self.cfg.needs_info_label, &self.cfg.issue_label);
        if let Err(err) = self.issues.comment(&issue.repo, issue.number, &body).await {
            warn!(issue = %issue.key(), "couldn't post no-change comment: {err:#}");
        }
        if let Err(err) = self
            .issues
            .remove_label(&issue.repo, issue.number, &self.cfg.wip_label)
            .await
        {
            warn!(issue = %issue.key(), "couldn't remove {} label: {err:#}", self.cfg.wip_label);
        }
        if let Err(err) = self
            .issues
            .add_label(&issue.repo, issue.number, &self.cfg.needs_info_label)
            .await
        {
            warn!(
                issue = %issue.key(),
                "couldn't add {} label: {err:#}", self.cfg.needs_info_label
            );
        }
        self.cleanup(ctx).await;
        info!(issue = %issue.key(), "no file changes produced, marked needs-info");
    }

    async fn ensure_review_request(&self, issue: &Issue, ctx: &WorkContext) -> Result<String> {
        let existing = self
            .issues
            .list_review_requests(&issue.repo, &ctx.branch)
            .await?;
        if let Some(pr) = existing.first() {
            return Ok(pr.url.clone());
        }

        let diff_stat = self
            .workspace
            .diff_stat(&ctx.worktree_dir, "HEAD~1")
            .await
            .unwrap_or_default();
        let title = format!("fix: resolve #{} — {}", issue.number, issue.title);
        let body = review_request_body(issue.number, diff_stat.trim_end(), &issue.url);
        let base = self.workspace.default_branch(&ctx.repo_dir).await;
        self.issues
            .create_review_request(&issue.repo, &title, &body, &ctx.branch, &base)
            .await
    }

    async fn ensure_pr_comment(&self, issue: &Issue, pr_url: &str) -> Result<()> {
        let fresh = self.issues.view(&issue.repo, issue.number).await?;
        if fresh.comments.iter().any(|c| c.body.contains(pr_url)) {
            return Ok(());
        }
        self.issues
            .comment(
                &issue.repo,
                issue.number,
                &format!("PR ready for review: {pr_url}\n\n{BOT_MARKER}"),
            )
            .await
    }

    /// Compensation for a failed step: error comment (suppressed when the
    /// most recent comment already carries the same message), labels reset to
    /// *ready*, worktree removed. Never propagates its own failures.
    async fn compensate(&self, issue: &Issue, ctx: &WorkContext, err: &anyhow::Error) {
        if is_cancelled(err) {
            // Shutdown, not a pipeline fault; the startup reconciler resets
            // the issue on the next boot.
            info!(issue = %issue.key(), "cancelled mid-pipeline, skipping compensation");
            return;
        }

        let msg = format!("{err:#}");
        warn!(issue = %issue.key(), "pipeline failed: {msg}");

        let duplicate = match self.issues.view(&issue.repo, issue.number).await {
            Ok(fresh) => fresh.comments.last().is_some_and(|c| c.body.contains(&msg)),
            Err(view_err) => {
                warn!(issue = %issue.key(), "couldn't re-check comments: {view_err:#}");
                false
            }
        };
        if duplicate {
            debug!(issue = %issue.key(), "suppressing duplicate error comment");
        } else if let Err(comment_err) = self
            .issues
            .comment(&issue.repo, issue.number, &error_comment(&msg))
            .await
        {
            warn!(issue = %issue.key(), "couldn't post error comment: {comment_err:#}");
        }

        if let Err(err) = self
            .issues
            .remove_label(&issue.repo, issue.number, &self.cfg.wip_label)
            .await
        {
            warn!(issue = %issue.key(), "couldn't remove {} label: {err:#}", self.cfg.wip_label);
        }
        if let Err(err) = self
            .issues
            .add_label(&issue.repo, issue.number, &self.cfg.issue_label)
            .await
        {
            warn!(issue = %issue.key(), "couldn't add {} label: {err:#}", self.cfg.issue_label);
        }
        self.cleanup(ctx).await;
    }

    /// Remove the worktree and its local branch. Idempotent; all errors are
    /// logged and swallowed.
    pub async fn cleanup(&self, ctx: &WorkContext) {
        if !ctx.worktree_dir.exists() {
            return;
        }
        if let Err(err) = self
            .workspace
            .worktree_remove(&ctx.repo_dir, &ctx.worktree_dir)
            .await
        {
            warn!(
                worktree = %ctx.worktree_dir.display(),
                "couldn't remove worktree: {err:#}"
            );
        }
        self.delete_stale_local_branch(ctx).await;
    }
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ExecError>()
            .is_some_and(ExecError::is_cancelled)
            || matches!(cause.downcast_ref::<AgentError>(), Some(AgentError::Cancelled))
    })
}
