//! Startup dependency check.
//!
//! The orchestrator is a thin shell around `git`, `gh`, and `claude`; a
//! missing or unconfigured tool surfaces here as one fatal report instead of
//! as a confusing pipeline failure on the first issue.

use std::process::Stdio;

use anyhow::{Result, bail};
use tokio::process::Command;
use tracing::info;

pub async fn check() -> Result<()> {
    let mut missing: Vec<String> = Vec::new();

    if !run_ok("git", &["--version"]).await {
        missing.push("git (install from https://git-scm.com)".to_string());
    } else {
        let name = run_stdout("git", &["config", "user.name"]).await;
        let email = run_stdout("git", &["config", "user.email"]).await;
        if name.trim().is_empty() || email.trim().is_empty() {
            missing.push(
                "git user identity (run: git config --global user.name 'You' \
                 && git config --global user.email 'you@example.com')"
                    .to_string(),
            );
        }
    }

    if !run_ok("gh", &["--version"]).await {
        missing.push("gh (install from https://cli.github.com)".to_string());
    } else if !run_ok("gh", &["auth", "status"]).await {
        missing.push("gh auth (run: gh auth login)".to_string());
    }

    let claude_cmd = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
    if !run_ok(&claude_cmd, &["--version"]).await {
        missing.push("claude (install: npm install -g @anthropic-ai/claude-code)".to_string());
    }

    if !missing.is_empty() {
        bail!(
            "missing required dependencies:\n  - {}",
            missing.join("\n  - ")
        );
    }

    info!("dependency check passed: git, gh, claude all available");
    Ok(())
}

async fn run_ok(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

async fn run_stdout(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map(|out| String::from_utf8_lossy(&out.stdout).to_string())
        .unwrap_or_default()
}
