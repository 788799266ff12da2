//! Process wiring: signals, ports, reconciler, worker pool, poll loop.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::exec::Runner;
use crate::issue::Issue;
use crate::pipeline::Pipeline;
use crate::poller::Poller;
use crate::reconcile;
use crate::services::claude::ClaudeAgent;
use crate::services::git::GitWorkspace;
use crate::services::github::GhIssues;
use crate::services::{IssueService, SynthAgent, WorkspaceService};
use crate::tracker::Tracker;
use crate::triage::Triage;
use crate::worker;

/// Bound on issues queued ahead of the workers; a full queue stalls the
/// poller at its send rather than growing without limit.
const JOB_QUEUE_CAPACITY: usize = 100;

/// Run the orchestrator until SIGINT or SIGTERM.
pub async fn run(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let runner = Runner::new(token.clone());
    let issues: Arc<dyn IssueService> = Arc::new(GhIssues::new(runner.clone()));
    let workspace: Arc<dyn WorkspaceService> = Arc::new(GitWorkspace::new(runner));
    let agent: Arc<dyn SynthAgent> = Arc::new(ClaudeAgent::new(token.clone()));

    // Crash recovery happens before any new work is accepted.
    reconcile::run(&cfg, issues.as_ref()).await;

    let (jobs_tx, jobs_rx) = mpsc::channel::<Issue>(JOB_QUEUE_CAPACITY);
    let tracker = Arc::new(Tracker::new());
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&cfg),
        Arc::clone(&issues),
        workspace,
        Arc::clone(&agent),
    ));
    let workers = worker::spawn_workers(
        cfg.workers,
        Arc::new(Mutex::new(jobs_rx)),
        pipeline,
        Arc::clone(&tracker),
        token.clone(),
    );

    let triage = cfg
        .triage
        .then(|| Triage::new(Arc::clone(&cfg), Arc::clone(&issues), agent));
    let poller = Poller::new(Arc::clone(&cfg), issues, tracker, jobs_tx, token, triage);

    // The poller owns the only sender; when it returns the queue closes and
    // the workers drain what is left.
    poller.run().await;

    info!("waiting for workers to finish");
    for handle in workers {
        if let Err(err) = handle.await {
            warn!("worker task panicked: {err}");
        }
    }
    info!("claude-bot stopped");
    Ok(())
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        token.cancel();
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!("couldn't install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
