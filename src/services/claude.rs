//! Synthesis-agent adapter over the Claude Code CLI.

use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::services::{AgentError, AgentRequest, SynthAgent};

pub struct ClaudeAgent {
    token: CancellationToken,
    command: String,
}

impl ClaudeAgent {
    pub fn new(token: CancellationToken) -> Self {
        let command = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
        Self::with_command(token, command)
    }

    pub fn with_command(token: CancellationToken, command: String) -> Self {
        Self { token, command }
    }
}

#[async_trait]
impl SynthAgent for ClaudeAgent {
    async fn run(&self, req: AgentRequest) -> Result<String, AgentError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p").arg(&req.prompt);
        if !req.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(req.allowed_tools.join(","));
        }
        cmd.arg("--max-turns")
            .arg(req.max_turns.to_string())
            .current_dir(&req.dir)
            // The agent must not believe it is running nested under itself.
            .env_remove("CLAUDECODE")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let log = Arc::new(Mutex::new(std::fs::File::create(&req.log_path)?));
        debug!(command = %self.command, log = %req.log_path.display(), "spawning agent");

        let mut child = cmd.spawn()?;
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, Arc::clone(&log), true)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, Arc::clone(&log), false)));

        let status = tokio::select! {
            _ = self.token.cancelled() => {
                let _ = child.kill().await;
                return Err(AgentError::Cancelled);
            }
            waited = tokio::time::timeout(req.deadline, child.wait()) => match waited {
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(AgentError::DeadlineExceeded { after: req.deadline });
                }
                Ok(status) => status?,
            },
        };

        let mut stdout = String::new();
        if let Some(task) = stdout_task {
            stdout = task.await.unwrap_or_default();
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if status.success() {
            Ok(stdout)
        } else {
            Err(AgentError::NonZeroExit {
                status: status.to_string(),
            })
        }
    }
}

/// Copy lines from a child pipe into the shared log file, accumulating them
/// when `keep` is set (stdout carries the agent's reply text).
async fn drain<R>(pipe: R, log: Arc<Mutex<std::fs::File>>, keep: bool) -> String
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(pipe).lines();
    let mut captured = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut file) = log.lock() {
            let _ = writeln!(file, "{line}");
        }
        if keep {
            captured.push_str(&line);
            captured.push('\n');
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    fn fake_agent(dir: &Path, script: &str) -> String {
        let path = dir.join("fake-claude.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn request(dir: &Path, deadline: Duration) -> AgentRequest {
        AgentRequest {
            dir: dir.to_path_buf(),
            prompt: "fix it".to_string(),
            max_turns: 5,
            allowed_tools: vec!["Bash".to_string(), "Read".to_string()],
            deadline,
            log_path: dir.join("agent.log"),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = fake_agent(dir.path(), "echo reply line; echo noise >&2");
        let agent = ClaudeAgent::with_command(CancellationToken::new(), cmd);

        let out = agent
            .run(request(dir.path(), Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.trim(), "reply line");

        let log = std::fs::read_to_string(dir.path().join("agent.log")).unwrap();
        assert!(log.contains("reply line"));
        assert!(log.contains("noise"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = fake_agent(dir.path(), "exit 2");
        let agent = ClaudeAgent::with_command(CancellationToken::new(), cmd);

        let err = agent
            .run(request(dir.path(), Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = fake_agent(dir.path(), "sleep 30");
        let agent = ClaudeAgent::with_command(CancellationToken::new(), cmd);

        let err = agent
            .run(request(dir.path(), Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_run() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = fake_agent(dir.path(), "sleep 30");
        let token = CancellationToken::new();
        let agent = ClaudeAgent::with_command(token.clone(), cmd);

        let req = request(dir.path(), Duration::from_secs(60));
        let handle = tokio::spawn(async move { agent.run(req).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
