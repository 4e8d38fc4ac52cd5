//! Shell-backed command runner for local runs.

use async_trait::async_trait;
use conveyor_core::ports::{CommandOutcome, CommandRequest, CommandRunner};
use conveyor_core::{Error, Result};
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

/// Runs step payloads through `sh -c` in the workspace directory.
pub struct ShellRunner {
    workspace: PathBuf,
}

impl ShellRunner {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        debug!(job = %request.job, step = %request.step, "running shell command");
        let started = Instant::now();

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&request.payload)
            .current_dir(&self.workspace)
            .envs(&request.env)
            .status()
            .await
            .map_err(|e| Error::Runner(format!("failed to spawn command: {}", e)))?;

        Ok(CommandOutcome {
            // A signal-killed process has no code; report it as failure.
            exit_code: status.code().unwrap_or(-1),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
