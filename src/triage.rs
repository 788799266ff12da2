//! Optional first-response pass over brand-new issues.
//!
//! Runs at the start of each poll tick, before candidate selection. An issue
//! with any lifecycle label is someone else's concern; an issue the bot has
//! already replied to only needs the *triaged* label backfilled.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::issue::{BOT_MARKER, Issue, slugify};
use crate::pipeline::AGENT_DEADLINE;
use crate::prompt::{triage_fallback, triage_prompt};
use crate::services::{AgentRequest, IssueService, SynthAgent};

pub struct Triage {
    cfg: Arc<Config>,
    issues: Arc<dyn IssueService>,
    agent: Arc<dyn SynthAgent>,
}

impl Triage {
    pub fn new(cfg: Arc<Config>, issues: Arc<dyn IssueService>, agent: Arc<dyn SynthAgent>) -> Self {
        Self { cfg, issues, agent }
    }

    /// Reply once to every untouched open issue in `repo`. Failures are
    /// per-issue; the pass never aborts the poll tick.
    pub async fn pass(&self, repo: &str) {
        let issues = match self.issues.list_by_label(repo, None).await {
            Ok(issues) => issues,
            Err(err) => {
                warn!(repo = %repo, "triage: error listing issues: {err:#}");
                return;
            }
        };

        for issue in issues {
            if self
                .cfg
                .reserved_labels()
                .iter()
                .any(|label| issue.has_label(label))
            {
                continue;
            }

            // Replied before a crash, or before the label was configured:
            // just backfill the label.
            if issue.has_bot_comment() {
                self.mark_triaged(&issue).await;
                continue;
            }

            let reply = self.compose_reply(&issue).await;
            let body = format!("{reply}\n\n{BOT_MARKER}");
            match self.issues.comment(repo, issue.number, &body).await {
                Ok(()) => {
                    info!(issue = %issue.key(), "triage reply posted");
                    self.mark_triaged(&issue).await;
                }
                Err(err) => {
                    warn!(issue = %issue.key(), "triage: couldn't post reply: {err:#}");
                }
            }
        }
    }

    /// One agent turn to write a human-sounding reply; any failure falls back
    /// to a fixed greeting.
    async fn compose_reply(&self, issue: &Issue) -> String {
        let req = AgentRequest {
            dir: self.cfg.log_dir.clone(),
            prompt: triage_prompt(issue),
            max_turns: 1,
            allowed_tools: Vec::new(),
            deadline: AGENT_DEADLINE,
            log_path: self.cfg.log_dir.join(format!(
                "{}-{}-triage.log",
                slugify(&issue.repo),
                issue.number
            )),
        };
        match self.agent.run(req).await {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => triage_fallback(&issue.author.login),
            Err(err) => {
                warn!(issue = %issue.key(), "triage: agent failed, using fallback: {err:#}");
                triage_fallback(&issue.author.login)
            }
        }
    }

    async fn mark_triaged(&self, issue: &Issue) {
        if let Err(err) = self
            .issues
            .add_label(&issue.repo, issue.number, &self.cfg.triage_label)
            .await
        {
            warn!(
                issue = %issue.key(),
                "triage: couldn't add {} label: {err:#}", self.cfg.triage_label
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{Comment, Label};
    use crate::testing::{MockAgent, MockIssues, ready_issue, test_config};

    struct Fixture {
        _tmp: tempfile::TempDir,
        issues: Arc<MockIssues>,
        agent: Arc<MockAgent>,
        triage: Triage,
    }

    fn fixture(reply: &str) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Arc::new(test_config(tmp.path()));
        let issues = Arc::new(MockIssues::default());
        let agent = Arc::new(MockAgent::new(reply, None));
        let triage = Triage::new(
            cfg,
            issues.clone() as Arc<dyn IssueService>,
            agent.clone() as Arc<dyn SynthAgent>,
        );
        Fixture {
            _tmp: tmp,
            issues,
            agent,
            triage,
        }
    }

    fn new_issue(number: u64) -> Issue {
        Issue {
            labels: Vec::new(),
            ..ready_issue("acme/svc", number, "Question about config")
        }
    }

    #[tokio::test]
    async fn test_replies_once_and_labels_triaged() {
        let f = fixture("Thanks, looking into it!");
        f.issues.seed(new_issue(9));

        f.triage.pass("acme/svc").await;

        let comments = f.issues.comments();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].1.starts_with("Thanks, looking into it!"));
        assert!(comments[0].1.ends_with(BOT_MARKER));
        assert!(
            f.issues
                .label_log()
                .contains(&"add:acme/svc#9:triaged".to_string())
        );

        // A second pass sees the triaged label and does nothing further.
        f.triage.pass("acme/svc").await;
        assert_eq!(f.issues.comments().len(), 1);
        assert_eq!(f.agent.runs().len(), 1);
    }

    #[tokio::test]
    async fn test_skips_issues_with_reserved_labels() {
        let f = fixture("hello");
        let mut issue = new_issue(1);
        issue.labels.push(Label {
            name: "todo".to_string(),
        });
        f.issues.seed(issue);

        f.triage.pass("acme/svc").await;

        assert!(f.issues.comments().is_empty());
        assert!(f.agent.runs().is_empty());
    }

    #[tokio::test]
    async fn test_existing_bot_comment_backfills_label_without_reply() {
        let f = fixture("hello");
        let mut issue = new_issue(2);
        issue.comments.push(Comment {
            body: format!("Earlier reply\n\n{BOT_MARKER}"),
            ..Default::default()
        });
        f.issues.seed(issue);

        f.triage.pass("acme/svc").await;

        assert!(f.issues.comments().is_empty(), "no new comment");
        assert!(
            f.issues
                .label_log()
                .contains(&"add:acme/svc#2:triaged".to_string())
        );
    }

    #[tokio::test]
    async fn test_agent_failure_falls_back_to_fixed_reply() {
        let f = fixture("unused");
        f.agent.fail_with_exit();
        f.issues.seed(new_issue(3));

        f.triage.pass("acme/svc").await;

        let comments = f.issues.comments();
        assert_eq!(comments.len(), 1);
        assert!(
            comments[0]
                .1
                .starts_with("Hey @alice, thanks for raising this!")
        );
        assert!(comments[0].1.ends_with(BOT_MARKER));
    }

    #[tokio::test]
    async fn test_agent_runs_with_single_turn_and_no_tools() {
        let f = fixture("short reply");
        f.issues.seed(new_issue(4));

        f.triage.pass("acme/svc").await;

        let runs = f.agent.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].max_turns, 1);
        assert!(runs[0].allowed_tools.is_empty());
        assert!(
            runs[0]
                .log_path
                .to_string_lossy()
                .ends_with("acme-svc-4-triage.log")
        );
    }
}
