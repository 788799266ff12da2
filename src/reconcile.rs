//! Startup reconciliation, run to completion before any worker starts.
//!
//! Two passes per repository: create any missing lifecycle labels, then
//! resolve issues stranded under *in-progress* by a crash. An issue whose
//! branch already has a review request is finished work; anything else goes
//! back to *ready* for the next poll.

use tracing::{info, warn};

use crate::config::Config;
use crate::issue::branch_name;
use crate::services::IssueService;

pub async fn run(cfg: &Config, issues: &dyn IssueService) {
    ensure_labels(cfg, issues).await;
    recover_stale_issues(cfg, issues).await;
}

/// Fixed colors and descriptions for the six reserved labels.
fn label_specs(cfg: &Config) -> [(&str, &'static str, &'static str); 6] {
    [
        (&cfg.issue_label, "0e8a16", "Queued for claude-bot"),
        (&cfg.wip_label, "fbca04", "claude-bot is working on this"),
        (&cfg.done_label, "5319e7", "claude-bot opened a PR"),
        (&cfg.needs_info_label, "d93f0b", "claude-bot needs more context"),
        (&cfg.failed_label, "b60205", "claude-bot gave up after repeated errors"),
        (&cfg.triage_label, "c5def5", "claude-bot has replied"),
    ]
}

pub async fn ensure_labels(cfg: &Config, issues: &dyn IssueService) {
    for repo in &cfg.repos {
        for (name, color, desc) in label_specs(cfg) {
            if let Err(err) = issues.create_label(repo, name, color, desc).await {
                warn!(repo = %repo, label = name, "couldn't create label: {err:#}");
            }
        }
    }
}

pub async fn recover_stale_issues(cfg: &Config, issues: &dyn IssueService) {
    for repo in &cfg.repos {
        let stale = match issues.list_by_label(repo, Some(&cfg.wip_label)).await {
            Ok(stale) => stale,
            Err(err) => {
                warn!(repo = %repo, "couldn't list in-progress issues: {err:#}");
                continue;
            }
        };

        for issue in stale {
            let branch = branch_name(&issue);
            let has_pr = issues
                .list_review_requests(repo, &branch)
                .await
                .map(|prs| !prs.is_empty())
                .unwrap_or(false);

            if has_pr {
                info!(issue = %issue.key(), branch = %branch, "review request exists, finalizing");
                if let Err(err) = issues.add_label(repo, issue.number, &cfg.done_label).await {
                    warn!(issue = %issue.key(), "couldn't add {} label: {err:#}", cfg.done_label);
                }
                if let Err(err) = issues.remove_label(repo, issue.number, &cfg.wip_label).await {
                    warn!(issue = %issue.key(), "couldn't remove {} label: {err:#}", cfg.wip_label);
                }
            } else {
                info!(issue = %issue.key(), branch = %branch, "no review request, resetting to ready");
                if let Err(err) = issues.remove_label(repo, issue.number, &cfg.wip_label).await {
                    warn!(issue = %issue.key(), "couldn't remove {} label: {err:#}", cfg.wip_label);
                }
                if let Err(err) = issues.add_label(repo, issue.number, &cfg.issue_label).await {
                    warn!(issue = %issue.key(), "couldn't add {} label: {err:#}", cfg.issue_label);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Label;
    use crate::testing::{MockIssues, ready_issue, test_config};

    fn wip_issue(number: u64, title: &str) -> crate::issue::Issue {
        let mut issue = ready_issue("acme/svc", number, title);
        issue.labels = vec![Label {
            name: "in-progress".to_string(),
        }];
        issue
    }

    #[tokio::test]
    async fn test_ensure_labels_creates_all_six() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let issues = MockIssues::default();

        ensure_labels(&cfg, &issues).await;

        let created: Vec<String> = issues
            .created_labels()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        assert_eq!(
            created,
            ["todo", "in-progress", "done", "needs-info", "failed", "triaged"]
        );
    }

    #[tokio::test]
    async fn test_ensure_labels_uses_configured_names() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.issue_label = "ready".to_string();
        cfg.failed_label = "gave-up".to_string();
        let issues = MockIssues::default();

        ensure_labels(&cfg, &issues).await;

        let created: Vec<String> = issues
            .created_labels()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        assert!(created.contains(&"ready".to_string()));
        assert!(created.contains(&"gave-up".to_string()));
        assert!(!created.contains(&"todo".to_string()));
    }

    #[tokio::test]
    async fn test_recovery_resets_issue_without_review_request() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let issues = MockIssues::default();
        issues.seed(wip_issue(5, "Stuck"));

        recover_stale_issues(&cfg, &issues).await;

        let labels = issues.label_log();
        assert!(labels.contains(&"remove:acme/svc#5:in-progress".to_string()));
        assert!(labels.contains(&"add:acme/svc#5:todo".to_string()));
        assert!(!labels.contains(&"add:acme/svc#5:done".to_string()));
    }

    #[tokio::test]
    async fn test_recovery_finalizes_issue_with_review_request() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let issues = MockIssues::default();
        issues.seed(wip_issue(6, "Almost done"));
        issues.seed_pr(
            "acme/svc",
            "issue-6-almost-done",
            "https://github.com/acme/svc/pull/60",
        );

        recover_stale_issues(&cfg, &issues).await;

        let labels = issues.label_log();
        assert!(labels.contains(&"add:acme/svc#6:done".to_string()));
        assert!(labels.contains(&"remove:acme/svc#6:in-progress".to_string()));
        assert!(!labels.contains(&"add:acme/svc#6:todo".to_string()));
    }
}
