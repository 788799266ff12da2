//! Cancellable subprocess runner.
//!
//! Every external command (`git`, `gh`) goes through [`Runner::run`], which
//! observes the process-wide cancellation token and returns a typed error
//! carrying the command line and its captured output, so pipeline steps can
//! wrap it with a one-line "what was being attempted" context tag.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}\n{output}")]
    NonZero {
        command: String,
        status: String,
        output: String,
    },

    #[error("`{command}` cancelled by shutdown")]
    Cancelled { command: String },
}

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled { .. })
    }
}

#[derive(Clone)]
pub struct Runner {
    token: CancellationToken,
}

impl Runner {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Run `program` with `args` (optionally in `dir`) and return its stdout.
    /// Non-zero exit captures stdout and stderr combined into the error. The
    /// child is killed if the cancellation token fires first.
    pub async fn run(
        &self,
        dir: Option<&Path>,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        let command_line = format!("{} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = tokio::select! {
            _ = self.token.cancelled() => {
                return Err(ExecError::Cancelled { command: command_line });
            }
            result = cmd.output() => result.map_err(|source| ExecError::Spawn {
                command: command_line.clone(),
                source,
            })?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut combined = stdout;
        if !stderr.is_empty() {
            combined.push_str(&stderr);
        }
        Err(ExecError::NonZero {
            command: command_line,
            status: output.status.to_string(),
            output: combined.trim_end().to_string(),
        })
    }
}
