//! Hosting-service adapter over the `gh` CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::exec::{ExecError, Runner};
use crate::issue::Issue;
use crate::services::{IssueService, ReviewRequest};

const ISSUE_JSON_FIELDS: &str = "number,title,body,labels,url,comments,author";

pub struct GhIssues {
    runner: Runner,
}

impl GhIssues {
    pub fn new(runner: Runner) -> Self {
        Self { runner }
    }

    async fn gh(&self, args: &[&str]) -> Result<String, ExecError> {
        self.runner.run(None, "gh", args).await
    }
}

#[async_trait]
impl IssueService for GhIssues {
    async fn list_by_label(&self, repo: &str, label: Option<&str>) -> Result<Vec<Issue>> {
        let mut args = vec!["issue", "list", "--repo", repo];
        if let Some(label) = label {
            args.extend(["--label", label]);
        }
        args.extend(["--json", ISSUE_JSON_FIELDS, "--limit", "50"]);

        let out = self.gh(&args).await?;
        let mut issues: Vec<Issue> =
            serde_json::from_str(&out).context("parsing issue list JSON")?;
        for issue in &mut issues {
            issue.repo = repo.to_string();
        }
        Ok(issues)
    }

    async fn view(&self, repo: &str, number: u64) -> Result<Issue> {
        let number = number.to_string();
        let out = self
            .gh(&[
                "issue",
                "view",
                number.as_str(),
                "--repo",
                repo,
                "--json",
                ISSUE_JSON_FIELDS,
            ])
            .await?;
        let mut issue: Issue = serde_json::from_str(&out).context("parsing issue JSON")?;
        issue.repo = repo.to_string();
        Ok(issue)
    }

    async fn add_label(&self, repo: &str, number: u64, name: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(&["issue", "edit", number.as_str(), "--repo", repo, "--add-label", name])
            .await?;
        Ok(())
    }

    async fn remove_label(&self, repo: &str, number: u64, name: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(&[
            "issue",
            "edit",
            number.as_str(),
            "--repo",
            repo,
            "--remove-label",
            name,
        ])
        .await?;
        Ok(())
    }

    async fn create_label(&self, repo: &str, name: &str, color: &str, desc: &str) -> Result<()> {
        let result = self
            .gh(&[
                "label",
                "create",
                name,
                "--repo",
                repo,
                "--color",
                color,
                "--description",
                desc,
            ])
            .await;
        match result {
            Ok(_) => Ok(()),
            // Re-creating an existing label is expected on every boot.
            Err(ExecError::NonZero { output, .. }) if output.contains("already exists") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(&["issue", "comment", number.as_str(), "--repo", repo, "--body", body])
            .await?;
        Ok(())
    }

    async fn list_review_requests(&self, repo: &str, head: &str) -> Result<Vec<ReviewRequest>> {
        let out = self
            .gh(&[
                "pr", "list", "--repo", repo, "--head", head, "--json", "url", "--limit", "1",
            ])
            .await?;
        serde_json::from_str(&out).context("parsing PR list JSON")
    }

    async fn create_review_request(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String> {
        let out = self
            .gh(&[
                "pr", "create", "--repo", repo, "--title", title, "--body", body, "--head", head,
                "--base", base,
            ])
            .await?;
        Ok(out.trim().to_string())
    }
}
