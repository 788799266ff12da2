//! Fixed-size pool of cooperative consumers draining the job queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::issue::Issue;
use crate::pipeline::Pipeline;
use crate::tracker::Tracker;

pub type SharedJobs = Arc<Mutex<mpsc::Receiver<Issue>>>;

pub fn spawn_workers(
    count: usize,
    jobs: SharedJobs,
    pipeline: Arc<Pipeline>,
    tracker: Arc<Tracker>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let jobs = Arc::clone(&jobs);
            let pipeline = Arc::clone(&pipeline);
            let tracker = Arc::clone(&tracker);
            let token = token.clone();
            tokio::spawn(worker_loop(id, jobs, pipeline, tracker, token))
        })
        .collect()
}

async fn worker_loop(
    id: usize,
    jobs: SharedJobs,
    pipeline: Arc<Pipeline>,
    tracker: Arc<Tracker>,
    token: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                _ = token.cancelled() => return,
                issue = rx.recv() => issue,
            }
        };
        // Queue closed and drained.
        let Some(issue) = next else { return };
        let key = issue.key();

        // Cancellation between dequeue and execution: hand the key back and
        // exit without starting a pipeline that would be interrupted anyway.
        if token.is_cancelled() {
            tracker.release(&key);
            return;
        }

        info!(worker = id, issue = %key, title = %issue.title, "picked up issue");
        if let Err(err) = pipeline.process(&issue).await {
            warn!(worker = id, issue = %key, "error processing: {err:#}");
        }
        tracker.release(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{IssueService, SynthAgent, WorkspaceService};
    use crate::testing::{MockAgent, MockIssues, MockWorkspace, ready_issue, test_config};

    struct Fixture {
        _tmp: tempfile::TempDir,
        issues: Arc<MockIssues>,
        agent: Arc<MockAgent>,
        tracker: Arc<Tracker>,
        pipeline: Arc<Pipeline>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Arc::new(test_config(tmp.path()));
        let issues = Arc::new(MockIssues::default());
        let workspace = Arc::new(MockWorkspace::default());
        let agent = Arc::new(MockAgent::new("ok", Some(Arc::clone(&workspace))));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&cfg),
            issues.clone() as Arc<dyn IssueService>,
            workspace as Arc<dyn WorkspaceService>,
            agent.clone() as Arc<dyn SynthAgent>,
        ));
        Fixture {
            _tmp: tmp,
            issues,
            agent,
            tracker: Arc::new(Tracker::new()),
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_release_keys() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(100);
        let jobs: SharedJobs = Arc::new(Mutex::new(rx));

        for number in [1, 2, 3] {
            let issue = ready_issue("acme/svc", number, "Fix");
            f.issues.seed(issue.clone());
            assert!(f.tracker.try_acquire(&issue.key()));
            tx.send(issue).await.unwrap();
        }
        drop(tx);

        let workers = spawn_workers(
            2,
            jobs,
            Arc::clone(&f.pipeline),
            Arc::clone(&f.tracker),
            CancellationToken::new(),
        );
        for w in workers {
            w.await.unwrap();
        }

        assert_eq!(f.agent.runs().len(), 3, "every issue processed once");
        assert_eq!(f.tracker.len(), 0, "all keys released");
    }

    #[tokio::test]
    async fn test_workers_exit_on_cancellation() {
        let f = fixture();
        let (_tx, rx) = mpsc::channel::<Issue>(100);
        let jobs: SharedJobs = Arc::new(Mutex::new(rx));
        let token = CancellationToken::new();

        let workers = spawn_workers(
            2,
            jobs,
            Arc::clone(&f.pipeline),
            Arc::clone(&f.tracker),
            token.clone(),
        );
        token.cancel();
        for w in workers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_worker_releases_key_even_when_pipeline_fails() {
        let f = fixture();
        f.agent.fail_with_exit();
        let (tx, rx) = mpsc::channel(100);
        let jobs: SharedJobs = Arc::new(Mutex::new(rx));

        let issue = ready_issue("acme/svc", 9, "Will fail");
        f.issues.seed(issue.clone());
        assert!(f.tracker.try_acquire(&issue.key()));
        tx.send(issue).await.unwrap();
        drop(tx);

        let workers = spawn_workers(
            1,
            jobs,
            Arc::clone(&f.pipeline),
            Arc::clone(&f.tracker),
            CancellationToken::new(),
        );
        for w in workers {
            w.await.unwrap();
        }

        assert_eq!(f.tracker.len(), 0);
    }
}
