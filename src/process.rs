use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::trace;

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum ToolError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    Timeout {
        program: String,
        secs: u64,
    },
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Spawn { program, source } => {
                write!(f, "Failed to execute {}: {}", program, source)
            }
            ToolError::Failed {
                program,
                code: Some(code),
                stderr,
            } => write!(f, "{} exited with status {}: {}", program, code, stderr.trim()),
            ToolError::Failed {
                program, stderr, ..
            } => write!(f, "{} was terminated by a signal: {}", program, stderr.trim()),
            ToolError::Timeout { program, secs } => {
                write!(f, "{} timed out after {} seconds", program, secs)
            }
        }
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ToolError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Run a program to completion, killing it once `timeout` elapses.
///
/// Exit codes outside `ok_codes` are reported as [`ToolError::Failed`].
pub async fn run<S: AsRef<str>>(
    program: &str,
    args: &[S],
    cwd: Option<&Path>,
    timeout: Duration,
    ok_codes: &[i32],
) -> Result<CommandOutput, ToolError> {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(AsRef::as_ref))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Never block on a credential prompt
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    trace!(
        "Running {} {}",
        program,
        args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ")
    );

    let child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    tokio::select! {
        result = child.wait_with_output() => {
            let output = result.map_err(|source| ToolError::Spawn {
                program: program.to_string(),
                source,
            })?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            match output.status.code() {
                Some(code) if ok_codes.contains(&code) => Ok(CommandOutput { code, stdout, stderr }),
                code => Err(ToolError::Failed {
                    program: program.to_string(),
                    code,
                    stderr,
                }),
            }
        }
        // Dropping the child kills it
        _ = &mut deadline => Err(ToolError::Timeout {
            program: program.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_captures_output() {
        let output = run("sh", &["-c", "echo out; echo err >&2"], None, 10 * SECOND, &[0])
            .await
            .unwrap();
        assert_eq!(output.code, 0);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_ok_codes() {
        let output = run("sh", &["-c", "exit 1"], None, 10 * SECOND, &[0, 1])
            .await
            .unwrap();
        assert_eq!(output.code, 1);

        let err = run("sh", &["-c", "echo boom >&2; exit 2"], None, 10 * SECOND, &[0, 1])
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let output = run("ls", &[] as &[&str], Some(dir.path()), 10 * SECOND, &[0])
            .await
            .unwrap();
        assert!(output.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run("sleep", &["5"], None, Duration::from_millis(100), &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run("fixtrail-no-such-program", &["x"], None, SECOND, &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert!(err.to_string().contains("fixtrail-no-such-program"));
    }
}
