//! Runs blocking work and external commands under an explicit deadline.

use tokio::process::Command;

use std::process::Stdio;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeadlineError {
    #[error("did not complete within {0:?}")]
    Elapsed(Duration),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Status {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("`{command}` produced no output")]
    Empty { command: String },
    #[error("`{command}` did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Runs `f` on the blocking pool. On timeout the result is abandoned, the
/// thread finishes on its own.
pub async fn blocking<T, F>(timeout: Duration, f: F) -> Result<T, DeadlineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DeadlineError::Elapsed(timeout)),
    }
}

/// Runs a command and returns its stdout. A non-zero exit, empty output or
/// exceeding the deadline are all errors. The child is killed when the
/// deadline passes.
pub async fn command(program: &str, args: &[&str], timeout: Duration) -> Result<String, CommandError> {
    let display = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                command: display,
                source,
            })
        }
        Err(_) => {
            return Err(CommandError::Timeout {
                command: display,
                timeout,
            })
        }
    };

    if !output.status.success() {
        return Err(CommandError::Status {
            command: display,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if stdout.trim().is_empty() {
        return Err(CommandError::Empty { command: display });
    }

    Ok(stdout)
}
