//! In-memory doubles for the three ports, shared by the scenario tests.
//!
//! The mocks record every side effect and mirror just enough real behavior
//! for the pipeline's idempotency probes to be meaningful: the workspace
//! double creates and removes real directories (the pipeline checks the
//! filesystem for clone and worktree existence), and the issue double feeds
//! posted comments back through `view`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::config::Config;
use crate::issue::{Author, Comment, Issue, Label};
use crate::services::{
    AgentError, AgentRequest, IssueService, ReviewRequest, SynthAgent, WorkspaceService,
};

/// A config rooted under a temp directory, one repo, default labels.
pub fn test_config(root: &Path) -> Config {
    let cfg = Config {
        repos: vec!["acme/svc".to_string()],
        workers: 2,
        max_turns: 5,
        poll_interval: std::time::Duration::from_millis(10),
        worktree_dir: root.join("trees"),
        repo_dir: root.join("repos"),
        log_dir: root.join("logs"),
        ..Config::default()
    };
    cfg.ensure_directories().unwrap();
    cfg
}

/// An open issue carrying the *ready* label.
pub fn ready_issue(repo: &str, number: u64, title: &str) -> Issue {
    Issue {
        repo: repo.to_string(),
        number,
        title: title.to_string(),
        body: "Something is wrong.".to_string(),
        labels: vec![Label {
            name: "todo".to_string(),
        }],
        url: format!("https://github.com/{repo}/issues/{number}"),
        author: Author {
            login: "alice".to_string(),
        },
        comments: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedPr {
    pub repo: String,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Default)]
struct IssuesState {
    issues: Vec<Issue>,
    label_log: Vec<String>,
    comments: Vec<(String, String)>,
    prs: Vec<(String, String, String)>,
    created_prs: Vec<CreatedPr>,
    created_labels: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MockIssues {
    state: Mutex<IssuesState>,
    fail_add_label: AtomicBool,
}

impl MockIssues {
    pub fn seed(&self, issue: Issue) {
        self.state.lock().unwrap().issues.push(issue);
    }

    /// Register an already-open review request on `head`.
    pub fn seed_pr(&self, repo: &str, head: &str, url: &str) {
        self.state.lock().unwrap().prs.push((
            repo.to_string(),
            head.to_string(),
            url.to_string(),
        ));
    }

    pub fn fail_add_label(&self) {
        self.fail_add_label.store(true, Ordering::SeqCst);
    }

    pub fn get(&self, repo: &str, number: u64) -> Issue {
        self.state
            .lock()
            .unwrap()
            .issues
            .iter()
            .find(|i| i.repo == repo && i.number == number)
            .cloned()
            .unwrap()
    }

    /// Every add/remove as `"add:<key>:<label>"` / `"remove:<key>:<label>"`.
    pub fn label_log(&self) -> Vec<String> {
        self.state.lock().unwrap().label_log.clone()
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    pub fn created_prs(&self) -> Vec<CreatedPr> {
        self.state.lock().unwrap().created_prs.clone()
    }

    pub fn created_labels(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created_labels.clone()
    }
}

#[async_trait]
impl IssueService for MockIssues {
    async fn list_by_label(&self, repo: &str, label: Option<&str>) -> Result<Vec<Issue>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .issues
            .iter()
            .filter(|i| i.repo == repo)
            .filter(|i| label.is_none_or(|l| i.has_label(l)))
            .cloned()
            .collect())
    }

    async fn view(&self, repo: &str, number: u64) -> Result<Issue> {
        let state = self.state.lock().unwrap();
        state
            .issues
            .iter()
            .find(|i| i.repo == repo && i.number == number)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("issue {repo}#{number} not found"))
    }

    async fn add_label(&self, repo: &str, number: u64, name: &str) -> Result<()> {
        if self.fail_add_label.load(Ordering::SeqCst) {
            bail!("label service unavailable");
        }
        let mut state = self.state.lock().unwrap();
        state.label_log.push(format!("add:{repo}#{number}:{name}"));
        if let Some(issue) = state
            .issues
            .iter_mut()
            .find(|i| i.repo == repo && i.number == number)
            && !issue.has_label(name)
        {
            issue.labels.push(Label {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_label(&self, repo: &str, number: u64, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .label_log
            .push(format!("remove:{repo}#{number}:{name}"));
        if let Some(issue) = state
            .issues
            .iter_mut()
            .find(|i| i.repo == repo && i.number == number)
        {
            issue.labels.retain(|l| l.name != name);
        }
        Ok(())
    }

    async fn create_label(&self, repo: &str, name: &str, _color: &str, _desc: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .created_labels
            .push((repo.to_string(), name.to_string()));
        Ok(())
    }

    async fn comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .comments
            .push((format!("{repo}#{number}"), body.to_string()));
        if let Some(issue) = state
            .issues
            .iter_mut()
            .find(|i| i.repo == repo && i.number == number)
        {
            issue.comments.push(Comment {
                author: Author {
                    login: "claude-bot".to_string(),
                },
                body: body.to_string(),
                created_at: "2025-01-01T00:00:00Z".to_string(),
            });
        }
        Ok(())
    }

    async fn list_review_requests(&self, repo: &str, head: &str) -> Result<Vec<ReviewRequest>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .prs
            .iter()
            .filter(|(r, h, _)| r == repo && h == head)
            .map(|(_, _, url)| ReviewRequest { url: url.clone() })
            .collect())
    }

    async fn create_review_request(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let url = format!("https://github.com/{repo}/pull/{}", 100 + state.created_prs.len());
        state.created_prs.push(CreatedPr {
            repo: repo.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            head: head.to_string(),
            base: base.to_string(),
        });
        state
            .prs
            .push((repo.to_string(), head.to_string(), url.clone()));
        Ok(url)
    }
}

#[derive(Default)]
struct WorkspaceState {
    ops: Vec<String>,
    /// Worktree paths with uncommitted changes. Deliberately survives
    /// `worktree_remove`, so a re-created worktree at the same path still
    /// reads as dirty (simulating a branch that already carries the edits).
    dirty_trees: HashSet<std::path::PathBuf>,
    local_branches: HashSet<String>,
    remote_branches: HashSet<String>,
    fail_push: bool,
}

#[derive(Default)]
pub struct MockWorkspace {
    state: Mutex<WorkspaceState>,
}

impl MockWorkspace {
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Mark a worktree as holding uncommitted changes.
    pub fn mark_dirty(&self, wt_dir: &Path) {
        self.state
            .lock()
            .unwrap()
            .dirty_trees
            .insert(wt_dir.to_path_buf());
    }

    pub fn fail_push(&self) {
        self.state.lock().unwrap().fail_push = true;
    }

    pub fn has_local_branch(&self, name: &str) -> bool {
        self.state.lock().unwrap().local_branches.contains(name)
    }

    pub fn add_remote_branch(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .remote_branches
            .insert(name.to_string());
    }

    fn record(&self, op: String) {
        self.state.lock().unwrap().ops.push(op);
    }
}

#[async_trait]
impl WorkspaceService for MockWorkspace {
    async fn clone_repo(&self, url: &str, dir: &Path) -> Result<()> {
        self.record(format!("clone {url}"));
        std::fs::create_dir_all(dir.join(".git"))?;
        Ok(())
    }

    async fn fetch(&self, _dir: &Path) -> Result<()> {
        self.record("fetch".to_string());
        Ok(())
    }

    async fn default_branch(&self, _dir: &Path) -> String {
        "main".to_string()
    }

    async fn remote_branch_exists(&self, _dir: &Path, name: &str) -> bool {
        self.state.lock().unwrap().remote_branches.contains(name)
    }

    async fn local_branch_exists(&self, _dir: &Path, name: &str) -> bool {
        self.has_local_branch(name)
    }

    async fn delete_local_branch(&self, _dir: &Path, name: &str) -> Result<()> {
        self.record(format!("branch -D {name}"));
        self.state.lock().unwrap().local_branches.remove(name);
        Ok(())
    }

    async fn worktree_add(&self, _dir: &Path, wt_dir: &Path, branch: &str) -> Result<()> {
        self.record(format!("worktree add {branch}"));
        std::fs::create_dir_all(wt_dir)?;
        self.state
            .lock()
            .unwrap()
            .local_branches
            .insert(branch.to_string());
        Ok(())
    }

    async fn worktree_add_new(
        &self,
        _dir: &Path,
        wt_dir: &Path,
        branch: &str,
        from: &str,
    ) -> Result<()> {
        self.record(format!("worktree add -b {branch} from {from}"));
        std::fs::create_dir_all(wt_dir)?;
        self.state
            .lock()
            .unwrap()
            .local_branches
            .insert(branch.to_string());
        Ok(())
    }

    async fn worktree_remove(&self, _dir: &Path, wt_dir: &Path) -> Result<()> {
        self.record("worktree remove".to_string());
        std::fs::remove_dir_all(wt_dir)?;
        Ok(())
    }

    async fn porcelain(&self, wt_dir: &Path) -> Result<String> {
        let state = self.state.lock().unwrap();
        Ok(if state.dirty_trees.contains(wt_dir) {
            " M src/main.rs\n".to_string()
        } else {
            String::new()
        })
    }

    async fn stage_all(&self, _wt_dir: &Path) -> Result<()> {
        self.record("add -A".to_string());
        Ok(())
    }

    async fn commit(&self, _wt_dir: &Path, msg: &str) -> Result<()> {
        self.record(format!("commit {msg}"));
        Ok(())
    }

    async fn push(&self, _wt_dir: &Path, remote: &str, branch: &str) -> Result<()> {
        if self.state.lock().unwrap().fail_push {
            bail!("push rejected");
        }
        self.record(format!("push {remote} {branch}"));
        self.state
            .lock()
            .unwrap()
            .remote_branches
            .insert(branch.to_string());
        Ok(())
    }

    async fn diff_stat(&self, _wt_dir: &Path, _range: &str) -> Result<String> {
        Ok(" src/main.rs | 2 +-\n 1 file changed, 1 insertion(+), 1 deletion(-)\n".to_string())
    }
}

enum AgentMode {
    Reply,
    FailTimeout,
    FailExit,
}

pub struct MockAgent {
    reply: String,
    mode: Mutex<AgentMode>,
    edits: Option<std::sync::Arc<MockWorkspace>>,
    runs: Mutex<Vec<AgentRequest>>,
}

impl MockAgent {
    /// `edits`: a workspace the agent dirties on each run, simulating file
    /// modifications.
    pub fn new(reply: &str, edits: Option<std::sync::Arc<MockWorkspace>>) -> Self {
        Self {
            reply: reply.to_string(),
            mode: Mutex::new(AgentMode::Reply),
            edits,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_with_timeout(&self) {
        *self.mode.lock().unwrap() = AgentMode::FailTimeout;
    }

    pub fn fail_with_exit(&self) {
        *self.mode.lock().unwrap() = AgentMode::FailExit;
    }

    pub fn runs(&self) -> Vec<AgentRequest> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthAgent for MockAgent {
    async fn run(&self, req: AgentRequest) -> Result<String, AgentError> {
        let dir = req.dir.clone();
        self.runs.lock().unwrap().push(req);
        match *self.mode.lock().unwrap() {
            AgentMode::FailTimeout => Err(AgentError::DeadlineExceeded {
                after: std::time::Duration::from_secs(600),
            }),
            AgentMode::FailExit => Err(AgentError::NonZeroExit {
                status: "exit status: 1".to_string(),
            }),
            AgentMode::Reply => {
                if let Some(ws) = &self.edits {
                    ws.mark_dirty(&dir);
                }
                Ok(self.reply.clone())
            }
        }
    }
}
