use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use claude_bot::config::{self, Config};
use claude_bot::{deps, engine};

#[derive(Parser)]
#[command(name = "claude-bot")]
#[command(version, about = "Watches GitHub repos for todo-labeled issues, runs Claude Code, opens PRs")]
struct Cli {
    /// Remove worktrees and logs; repo clones are preserved
    #[arg(long)]
    clean: bool,

    /// Remove worktrees, repo clones, and logs
    #[arg(long, conflicts_with = "clean")]
    clean_all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The .env file may carry RUST_LOG, so it is applied before the
    // subscriber is installed.
    if let Ok(cwd) = std::env::current_dir() {
        config::load_dot_env(&cwd);
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::load();

    if cli.clean_all {
        cfg.clean_everything();
        return Ok(());
    }
    if cli.clean {
        cfg.clean_state();
        return Ok(());
    }

    if cfg.repos.is_empty() {
        anyhow::bail!(
            "CB_REPOS environment variable is required (comma-separated list of owner/repo)"
        );
    }

    deps::check().await?;
    cfg.ensure_directories()?;

    info!(
        repos = ?cfg.repos,
        workers = cfg.workers,
        poll = %humantime::format_duration(cfg.poll_interval),
        triage = cfg.triage,
        "claude-bot starting"
    );

    engine::run(cfg).await
}
