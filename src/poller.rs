//! Periodic scan of the configured repositories.
//!
//! The poller is the only producer for the job queue. It never blocks on a
//! pipeline: the bounded queue provides backpressure, and a failure in one
//! repository never stops the scan of the next.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::issue::Issue;
use crate::services::IssueService;
use crate::tracker::Tracker;
use crate::triage::Triage;

pub struct Poller {
    cfg: Arc<Config>,
    issues: Arc<dyn IssueService>,
    tracker: Arc<Tracker>,
    jobs: mpsc::Sender<Issue>,
    token: CancellationToken,
    triage: Option<Triage>,
}

impl Poller {
    pub fn new(
        cfg: Arc<Config>,
        issues: Arc<dyn IssueService>,
        tracker: Arc<Tracker>,
        jobs: mpsc::Sender<Issue>,
        token: CancellationToken,
        triage: Option<Triage>,
    ) -> Self {
        Self {
            cfg,
            issues,
            tracker,
            jobs,
            token,
            triage,
        }
    }

    /// Poll until cancelled. The first tick fires immediately.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// One scan over every configured repository, in declared order.
    pub async fn tick(&self) {
        for repo in &self.cfg.repos {
            if self.token.is_cancelled() {
                return;
            }

            if let Some(triage) = &self.triage {
                triage.pass(repo).await;
            }

            let issues = match self
                .issues
                .list_by_label(repo, Some(&self.cfg.issue_label))
                .await
            {
                Ok(issues) => issues,
                Err(err) => {
                    warn!(repo = %repo, "error fetching issues: {err:#}");
                    continue;
                }
            };

            for issue in issues {
                // Hosting filters are advisory; re-check the lifecycle labels.
                if issue.has_label(&self.cfg.wip_label)
                    || issue.has_label(&self.cfg.done_label)
                    || issue.has_label(&self.cfg.failed_label)
                {
                    continue;
                }

                if issue.count_bot_errors() >= self.cfg.max_retries {
                    self.mark_failed(&issue).await;
                    continue;
                }

                let key = issue.key();
                if !self.tracker.try_acquire(&key) {
                    continue;
                }

                let title = issue.title.clone();
                tokio::select! {
                    _ = self.token.cancelled() => {
                        self.tracker.release(&key);
                        return;
                    }
                    sent = self.jobs.send(issue) => {
                        if sent.is_err() {
                            // Queue closed: shutdown already under way.
                            self.tracker.release(&key);
                            return;
                        }
                        info!(issue = %key, title = %title, "queued");
                    }
                }
            }
        }
    }

    /// Retry ceiling reached: park the issue under *failed* without running
    /// the pipeline again.
    async fn mark_failed(&self, issue: &Issue) {
        warn!(
            issue = %issue.key(),
            errors = issue.count_bot_errors(),
            "retry ceiling reached, marking failed"
        );
        if let Err(err) = self
            .issues
            .add_label(&issue.repo, issue.number, &self.cfg.failed_label)
            .await
        {
            warn!(issue = %issue.key(), "couldn't add {} label: {err:#}", self.cfg.failed_label);
        }
        if let Err(err) = self
            .issues
            .remove_label(&issue.repo, issue.number, &self.cfg.issue_label)
            .await
        {
            warn!(issue = %issue.key(), "couldn't remove {} label: {err:#}", self.cfg.issue_label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{Comment, ERROR_SENTINEL, Label};
    use crate::testing::{MockIssues, ready_issue, test_config};

    struct Fixture {
        _tmp: tempfile::TempDir,
        issues: Arc<MockIssues>,
        tracker: Arc<Tracker>,
        rx: mpsc::Receiver<Issue>,
        poller: Poller,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Arc::new(test_config(tmp.path()));
        let issues = Arc::new(MockIssues::default());
        let tracker = Arc::new(Tracker::new());
        let (tx, rx) = mpsc::channel(100);
        let poller = Poller::new(
            Arc::clone(&cfg),
            issues.clone() as Arc<dyn IssueService>,
            Arc::clone(&tracker),
            tx,
            CancellationToken::new(),
            None,
        );
        Fixture {
            _tmp: tmp,
            issues,
            tracker,
            rx,
            poller,
        }
    }

    #[tokio::test]
    async fn test_tick_enqueues_ready_issue() {
        let mut f = fixture();
        f.issues.seed(ready_issue("acme/svc", 42, "Fix it"));

        f.poller.tick().await;

        let queued = f.rx.try_recv().unwrap();
        assert_eq!(queued.key(), "acme/svc#42");
        assert_eq!(f.tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_skips_lifecycle_labels() {
        let mut f = fixture();
        for (number, extra) in [(1, "in-progress"), (2, "done"), (3, "failed")] {
            let mut issue = ready_issue("acme/svc", number, "already handled");
            issue.labels.push(Label {
                name: extra.to_string(),
            });
            f.issues.seed(issue);
        }

        f.poller.tick().await;

        assert!(f.rx.try_recv().is_err(), "nothing should be queued");
        assert_eq!(f.tracker.len(), 0);
    }

    #[tokio::test]
    async fn test_second_tick_does_not_requeue_inflight_issue() {
        let mut f = fixture();
        f.issues.seed(ready_issue("acme/svc", 42, "Fix it"));

        f.poller.tick().await;
        f.poller.tick().await;

        assert!(f.rx.try_recv().is_ok());
        assert!(f.rx.try_recv().is_err(), "issue must be queued exactly once");
    }

    #[tokio::test]
    async fn test_retry_ceiling_marks_failed_without_enqueue() {
        let mut f = fixture();
        let mut issue = ready_issue("acme/svc", 7, "Keeps breaking");
        let error_body = format!("{ERROR_SENTINEL}\n```\nboom\n```\nNeeds manual attention.");
        issue.comments = (0..3)
            .map(|_| Comment {
                body: error_body.clone(),
                ..Default::default()
            })
            .collect();
        f.issues.seed(issue);

        f.poller.tick().await;

        assert!(f.rx.try_recv().is_err(), "must not be enqueued");
        assert_eq!(f.tracker.len(), 0);
        let labels = f.issues.label_log();
        assert!(labels.contains(&"add:acme/svc#7:failed".to_string()));
        assert!(labels.contains(&"remove:acme/svc#7:todo".to_string()));
    }

    #[tokio::test]
    async fn test_below_ceiling_still_enqueues() {
        let mut f = fixture();
        let mut issue = ready_issue("acme/svc", 8, "Flaky");
        issue.comments = vec![Comment {
            body: format!("{ERROR_SENTINEL} once"),
            ..Default::default()
        }];
        f.issues.seed(issue);

        f.poller.tick().await;

        assert!(f.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_queue_releases_tracker_entry() {
        let f = fixture();
        f.issues.seed(ready_issue("acme/svc", 42, "Fix it"));
        drop(f.rx);

        f.poller.tick().await;

        assert_eq!(f.tracker.len(), 0, "key must be released on closed queue");
    }
}
