//! Single-step subprocess execution: spawn, capture stdout/stderr to the
//! per-step log file, and cancel via SIGTERM -> grace period -> SIGKILL.
//!
//! Directly generalizes `ClaudeCodeAdapter`'s process-lifecycle shape: the
//! `Command::new(...).current_dir(...).envs(...).stdout(Stdio::piped())`
//! spawn, the `async_stream::stream!` line-reader wrapper (narrowed here
//! to raw byte capture instead of JSONL parsing), and the
//! `libc::kill(pid, SIGTERM)` / `tokio::time::timeout` / fallback
//! `child.kill()` cancellation sequence all carry over unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::dag::StepKind;

use super::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(i32),
    Cancelled,
}

/// Run one step's subprocess to completion (or cancellation), appending its
/// combined stdout/stderr to `<log_dir>/<step_name>.log`.
pub async fn run_step(
    kind: &StepKind,
    step_name: &str,
    env: &HashMap<String, String>,
    log_dir: &Path,
    grace_period: Duration,
    cancel: &CancellationToken,
) -> Result<StepOutcome, AgentError> {
    let (program, args) = match kind {
        StepKind::Shell { command, args } => ("sh".to_string(), {
            let mut full = vec!["-c".to_string(), command.clone()];
            full.extend(args.iter().cloned());
            full
        }),
        StepKind::SubDag { .. } => {
            // Recursive sub-DAG dispatch needs database access this
            // process-level executor doesn't have; `Agent::run` never
            // routes a `SubDag` step here -- see `agent::run_subdag`.
            return Err(AgentError::NotExecutable(step_name.to_string()));
        }
    };

    let mut cmd = Command::new(&program);
    cmd.args(&args);
    cmd.envs(env);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|source| AgentError::Spawn { step: step_name.to_string(), source })?;

    let log_path = log_file_path(log_dir, step_name);
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut log_file = File::create(&log_path).await?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            line = out_lines.next_line() => {
                match line? {
                    Some(line) => { log_file.write_all(format!("{line}\n").as_bytes()).await?; }
                    None => {}
                }
            }
            line = err_lines.next_line() => {
                match line? {
                    Some(line) => { log_file.write_all(format!("{line}\n").as_bytes()).await?; }
                    None => {}
                }
            }
            status = child.wait() => {
                let status = status?;
                log_file.flush().await?;
                return Ok(match status.code() {
                    Some(0) => StepOutcome::Succeeded,
                    Some(code) => StepOutcome::Failed(code),
                    None => StepOutcome::Failed(-1),
                });
            }
            _ = cancel.cancelled() => {
                terminate(&mut child, grace_period).await;
                log_file.flush().await?;
                return Ok(StepOutcome::Cancelled);
            }
        }
    }
}

/// SIGTERM, wait up to `grace_period`, then SIGKILL. Mirrors
/// `ClaudeCodeAdapter::kill`'s sequence exactly.
async fn terminate(child: &mut tokio::process::Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            // SAFETY: pid is a valid child pid we just spawned and still own.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                tracing::warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(_)) => {}
        _ => {
            let _ = child.kill().await;
        }
    }
}

fn log_file_path(log_dir: &Path, step_name: &str) -> PathBuf {
    log_dir.join(format!("{step_name}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_step_reports_succeeded() {
        let tmp = tempfile::tempdir().unwrap();
        let kind = StepKind::Shell { command: "echo hi".into(), args: vec![] };
        let cancel = CancellationToken::new();
        let outcome = run_step(&kind, "greet", &HashMap::new(), tmp.path(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Succeeded);
        let log = tokio::fs::read_to_string(tmp.path().join("greet.log")).await.unwrap();
        assert!(log.contains("hi"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failed_with_code() {
        let tmp = tempfile::tempdir().unwrap();
        let kind = StepKind::Shell { command: "exit 3".into(), args: vec![] };
        let cancel = CancellationToken::new();
        let outcome = run_step(&kind, "boom", &HashMap::new(), tmp.path(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Failed(3));
    }

    #[tokio::test]
    async fn cancellation_terminates_long_running_step() {
        let tmp = tempfile::tempdir().unwrap();
        let kind = StepKind::Shell { command: "sleep 30".into(), args: vec![] };
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });
        let outcome = run_step(&kind, "sleeper", &HashMap::new(), tmp.path(), Duration::from_millis(200), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);
    }

    /// `run_step` itself never executes a `SubDag` -- that's dispatched
    /// one layer up, in `agent::run_subdag`, which needs a database pool.
    #[tokio::test]
    async fn subdag_step_is_not_directly_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let kind = StepKind::SubDag { dag_name: "child".into(), params: serde_json::json!({}) };
        let cancel = CancellationToken::new();
        let result = run_step(&kind, "call-child", &HashMap::new(), tmp.path(), Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(AgentError::NotExecutable(_))));
    }
}
