//! External tool supervision
//!
//! Shared by the mixdown, vocal-mix, and trim stages: spawn the external
//! mixing tool, wait with a hard deadline, emit coarse progress ticks
//! estimated from the elapsed/timeout ratio (an approximation, not a true
//! percentage), and kill the process on timeout or cancellation. Captured
//! stdout/stderr is surfaced verbatim in failure messages.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Interval between progress ticks while a tool runs
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// External tool errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool binary missing or not responding to a version probe
    #[error("External tool not available: {0}")]
    NotInvocable(String),

    /// A required input file does not exist
    #[error("Missing file: {0}")]
    MissingFile(PathBuf),

    /// Process could not be spawned
    #[error("Failed to start {tool}: {message}")]
    SpawnFailed { tool: String, message: String },

    /// Process exceeded its deadline and was killed
    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    /// Process exited non-zero; carries captured output for diagnosis
    #[error("{tool} exited with code {code:?}: {output}")]
    NonZeroExit {
        tool: String,
        code: Option<i32>,
        output: String,
    },

    /// Process exited zero but the expected output file was not created
    #[error("Output not created: {0}")]
    OutputMissing(PathBuf),

    /// Cancellation was requested while the process ran
    #[error("Cancelled")]
    Cancelled,

    /// Local I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verify the tool responds to `-version` within a short timeout
pub async fn check_invocable(tool: &str) -> Result<(), ToolError> {
    let probe = Command::new(tool)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match tokio::time::timeout(Duration::from_secs(5), probe).await {
        Err(_) => Err(ToolError::NotInvocable(format!(
            "{} -version did not complete within 5s",
            tool
        ))),
        Ok(Err(e)) => Err(ToolError::NotInvocable(format!("{}: {}", tool, e))),
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(ToolError::NotInvocable(format!(
            "{} -version exited with {}",
            tool, status
        ))),
    }
}

/// Fail fast with the first missing input path
pub fn check_inputs_exist(paths: &[&Path]) -> Result<(), ToolError> {
    for path in paths {
        if !path.exists() {
            return Err(ToolError::MissingFile(path.to_path_buf()));
        }
    }
    Ok(())
}

/// Run a tool to completion under a deadline.
///
/// `on_tick` receives `(elapsed/timeout ratio, elapsed seconds)` once per
/// poll interval. On timeout or cancellation the process is killed and
/// reaped, never abandoned; a partially written output file is not treated
/// as valid. Returns the combined stdout+stderr text on success.
pub async fn run_supervised<F>(
    tool: &str,
    args: &[String],
    timeout: Duration,
    expected_output: Option<&Path>,
    cancel: &CancellationToken,
    mut on_tick: F,
) -> Result<String, ToolError>
where
    F: FnMut(f64, u64),
{
    tracing::debug!(tool = %tool, args = ?args, "Spawning external tool");

    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::SpawnFailed {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_pipe(stdout));
    let stderr_task = tokio::spawn(read_pipe(stderr));

    let start = tokio::time::Instant::now();
    let deadline = start + timeout;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately; swallow it so ticks mark elapsed time
    ticker.tick().await;

    let status = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                kill_and_reap(&mut child).await;
                return Err(ToolError::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => {
                kill_and_reap(&mut child).await;
                return Err(ToolError::Timeout { tool: tool.to_string(), timeout });
            }
            result = child.wait() => break result?,
            _ = ticker.tick() => {
                let elapsed = start.elapsed();
                let ratio = (elapsed.as_secs_f64() / timeout.as_secs_f64()).min(1.0);
                on_tick(ratio, elapsed.as_secs());
            }
        }
    };

    let stdout_text = stdout_task.await.unwrap_or_default();
    let stderr_text = stderr_task.await.unwrap_or_default();
    let combined = if stdout_text.is_empty() {
        stderr_text
    } else if stderr_text.is_empty() {
        stdout_text
    } else {
        format!("{}\n{}", stdout_text, stderr_text)
    };

    if !status.success() {
        return Err(ToolError::NonZeroExit {
            tool: tool.to_string(),
            code: status.code(),
            output: combined,
        });
    }

    if let Some(path) = expected_output {
        if !path.exists() {
            return Err(ToolError::OutputMissing(path.to_path_buf()));
        }
    }

    Ok(combined)
}

async fn kill_and_reap(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buffer).await;
    }
    buffer
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_successful_run_captures_output() {
        let cancel = CancellationToken::new();
        let output = run_supervised(
            "/bin/sh",
            &sh("echo mixing done"),
            Duration::from_secs(10),
            None,
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();
        assert!(output.contains("mixing done"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_surfaces_diagnostics() {
        let cancel = CancellationToken::new();
        let result = run_supervised(
            "/bin/sh",
            &sh("echo codec not found >&2; exit 3"),
            Duration::from_secs(10),
            None,
            &cancel,
            |_, _| {},
        )
        .await;

        match result {
            Err(ToolError::NonZeroExit { code, output, .. }) => {
                assert_eq!(code, Some(3));
                assert!(output.contains("codec not found"));
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let result = run_supervised(
            "/bin/sh",
            &sh("sleep 30"),
            Duration::from_millis(500),
            None,
            &cancel,
            |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(ToolError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_kills_within_poll_interval() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = run_supervised(
            "/bin/sh",
            &sh("sleep 30"),
            Duration::from_secs(60),
            None,
            &cancel,
            |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(ToolError::Cancelled)));
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "cancellation must not wait for the full timeout"
        );
    }

    #[tokio::test]
    async fn test_zero_exit_with_missing_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("mix.mp3");
        let cancel = CancellationToken::new();

        let result = run_supervised(
            "/bin/sh",
            &sh("exit 0"),
            Duration::from_secs(10),
            Some(&expected),
            &cancel,
            |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(ToolError::OutputMissing(_))));
    }

    #[tokio::test]
    async fn test_expected_output_verified_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("mix.mp3");
        let cancel = CancellationToken::new();

        let script = format!("echo data > {}", expected.display());
        let result = run_supervised(
            "/bin/sh",
            &sh(&script),
            Duration::from_secs(10),
            Some(&expected),
            &cancel,
            |_, _| {},
        )
        .await;

        assert!(result.is_ok());
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let cancel = CancellationToken::new();
        let result = run_supervised(
            "definitely-not-a-real-binary-xyz",
            &[],
            Duration::from_secs(5),
            None,
            &cancel,
            |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(ToolError::SpawnFailed { .. })));
    }

    #[test]
    fn test_check_inputs_reports_first_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.mp3");
        std::fs::write(&present, b"x").unwrap();
        let missing = dir.path().join("missing.mp3");

        let result = check_inputs_exist(&[&present, &missing]);
        match result {
            Err(ToolError::MissingFile(path)) => assert_eq!(path, missing),
            other => panic!("expected MissingFile, got {:?}", other),
        }
    }
}
