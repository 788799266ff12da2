//! Runtime configuration from `CB_*` environment variables.
//!
//! A `.env` file in the working directory is applied first (only to unset
//! variables), then every recognized key overrides its default. Unparseable
//! values fall back to the default rather than failing startup; the only
//! fatal configuration error is an empty repo list, checked by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Default text of the greeting the pipeline posts when it picks up an issue.
pub const DEFAULT_GREETING: &str = "Hey there! Thanks for opening this issue — I'm on it. \
     I'll have a PR ready for review shortly. Hang tight!";

#[derive(Debug, Clone)]
pub struct Config {
    /// `owner/repo` slugs, polled in declared order.
    pub repos: Vec<String>,
    pub poll_interval: Duration,
    pub workers: usize,
    pub max_retries: usize,
    pub max_turns: u32,
    pub issue_label: String,
    pub wip_label: String,
    pub done_label: String,
    pub needs_info_label: String,
    pub failed_label: String,
    pub triage_label: String,
    pub worktree_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub log_dir: PathBuf,
    pub triage: bool,
    pub greeting: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            poll_interval: Duration::from_secs(30),
            workers: 3,
            max_retries: 3,
            max_turns: 50,
            issue_label: "todo".to_string(),
            wip_label: "in-progress".to_string(),
            done_label: "done".to_string(),
            needs_info_label: "needs-info".to_string(),
            failed_label: "failed".to_string(),
            triage_label: "triaged".to_string(),
            worktree_dir: expand_home("~/.claude-bot/trees"),
            repo_dir: expand_home("~/.claude-bot/repos"),
            log_dir: expand_home("~/.claude-bot/logs"),
            triage: false,
            greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CB_REPOS") {
            cfg.repos = v
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("CB_POLL_INTERVAL")
            && let Ok(d) = humantime::parse_duration(&v)
        {
            cfg.poll_interval = d;
        }
        if let Ok(v) = std::env::var("CB_WORKERS")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            cfg.workers = n;
        }
        if let Ok(v) = std::env::var("CB_MAX_RETRIES")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            cfg.max_retries = n;
        }
        if let Ok(v) = std::env::var("CB_MAX_TURNS")
            && let Ok(n) = v.parse::<u32>()
            && n > 0
        {
            cfg.max_turns = n;
        }
        for (key, field) in [
            ("CB_ISSUE_LABEL", &mut cfg.issue_label),
            ("CB_WIP_LABEL", &mut cfg.wip_label),
            ("CB_DONE_LABEL", &mut cfg.done_label),
            ("CB_NEEDS_INFO_LABEL", &mut cfg.needs_info_label),
            ("CB_FAILED_LABEL", &mut cfg.failed_label),
            ("CB_TRIAGE_LABEL", &mut cfg.triage_label),
        ] {
            if let Ok(v) = std::env::var(key)
                && !v.is_empty()
            {
                *field = v;
            }
        }
        for (key, field) in [
            ("CB_WORKTREE_DIR", &mut cfg.worktree_dir),
            ("CB_REPO_DIR", &mut cfg.repo_dir),
            ("CB_LOG_DIR", &mut cfg.log_dir),
        ] {
            if let Ok(v) = std::env::var(key)
                && !v.is_empty()
            {
                *field = expand_home(&v);
            }
        }
        cfg.triage = std::env::var("CB_TRIAGE").is_ok_and(|v| v == "1");
        if let Ok(v) = std::env::var("CB_GREETING")
            && !v.is_empty()
        {
            cfg.greeting = v;
        }

        cfg
    }

    /// The six reserved lifecycle label names.
    pub fn reserved_labels(&self) -> [&str; 6] {
        [
            &self.issue_label,
            &self.wip_label,
            &self.done_label,
            &self.needs_info_label,
            &self.failed_label,
            &self.triage_label,
        ]
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.worktree_dir, &self.repo_dir, &self.log_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Remove worktrees and logs, preserving repo clones.
    pub fn clean_state(&self) {
        remove_dirs(&[("worktrees", &self.worktree_dir), ("logs", &self.log_dir)]);
        info!(repos = %self.repo_dir.display(), "clean done, repo clones preserved");
    }

    /// Remove all three base directories.
    pub fn clean_everything(&self) {
        remove_dirs(&[
            ("worktrees", &self.worktree_dir),
            ("repos", &self.repo_dir),
            ("logs", &self.log_dir),
        ]);
        info!("clean-all done, full reset");
    }
}

fn remove_dirs(dirs: &[(&str, &PathBuf)]) {
    for (name, path) in dirs {
        if !path.exists() {
            info!("{name}: {} (not found, skipping)", path.display());
            continue;
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => info!("removed {name}: {}", path.display()),
            Err(err) => warn!("error removing {name} ({}): {err}", path.display()),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Apply `KEY=VALUE` lines from `<dir>/.env` to variables that are not
/// already set. Supports single- and double-quoted values; `#` comment lines
/// and blank lines are ignored.
pub fn load_dot_env(dir: &Path) {
    let Ok(content) = std::fs::read_to_string(dir.join(".env")) else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        unsafe { std::env::set_var(key, value) };
    }
}
