//! Local process executor
//!
//! Runs a shell-session command as a child process of the daemon. The
//! command text is split on whitespace and spawned directly, without a
//! shell, so pipes and redirections are passed through as literal
//! arguments. Stdout and stderr are drained together, each against the
//! output cap. The child is killed when the timeout elapses or when either
//! stream grows past the cap, and whatever was captured up to that point is
//! returned.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;

use fc_core::traits::{ExecOutput, ExecRequest, ExecTermination, ProcessExecutor};

const READ_CHUNK: usize = 8192;

/// Executor spawning processes on the control-plane host
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Read until EOF or until `buf` holds `limit` bytes.
///
/// Returns `true` when the cap was hit before EOF.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        let room = limit.saturating_sub(buf.len());
        if n > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok(true);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Drain an optional pipe into `buf`, see [`read_capped`]
async fn read_stream<R: AsyncRead + Unpin>(
    reader: Option<R>,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<bool> {
    match reader {
        Some(mut reader) => read_capped(&mut reader, buf, limit).await,
        None => Ok(false),
    }
}

enum Outcome {
    Exited(Option<i32>),
    Overflow,
    TimedOut,
}

#[async_trait]
impl ProcessExecutor for LocalExecutor {
    async fn execute(&self, request: ExecRequest) -> io::Result<ExecOutput> {
        let mut parts = request.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let started = Instant::now();
        let mut child = Command::new(program)
            .args(parts)
            .current_dir(&request.working_directory)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let limit = request.max_output_bytes;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let outcome = {
            let stdout_read = read_stream(child.stdout.take(), &mut stdout, limit);
            let stderr_read = read_stream(child.stderr.take(), &mut stderr, limit);
            let run = async {
                tokio::pin!(stdout_read, stderr_read);
                let (mut stdout_eof, mut stderr_eof) = (false, false);
                while !(stdout_eof && stderr_eof) {
                    let overflowed = tokio::select! {
                        result = &mut stdout_read, if !stdout_eof => {
                            stdout_eof = true;
                            result?
                        }
                        result = &mut stderr_read, if !stderr_eof => {
                            stderr_eof = true;
                            result?
                        }
                    };
                    if overflowed {
                        return Ok::<_, io::Error>(Outcome::Overflow);
                    }
                }
                let status = child.wait().await?;
                Ok(Outcome::Exited(status.code()))
            };

            tokio::select! {
                result = run => result?,
                () = tokio::time::sleep(request.timeout) => Outcome::TimedOut,
            }
        };

        let (termination, exit_code) = match outcome {
            Outcome::Exited(code) => (ExecTermination::Exited, code),
            Outcome::Overflow => {
                let _ = child.kill().await;
                (ExecTermination::BufferExceeded, None)
            }
            Outcome::TimedOut => {
                let _ = child.kill().await;
                (ExecTermination::TimedOut, None)
            }
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            execution_time_ms: started.elapsed().as_millis() as u64,
            termination,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn request(command: &str) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            working_directory: "/".into(),
            env: HashMap::new(),
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_echo() {
        let output = LocalExecutor.execute(request("echo hello world")).await.unwrap();
        assert_eq!(output.stdout, "hello world\n");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_runs_in_working_directory_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request("pwd");
        req.working_directory = dir.path().to_string_lossy().into_owned();
        let output = LocalExecutor.execute(req).await.unwrap();
        let reported = std::path::PathBuf::from(output.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );

        let mut req = request("printenv FLEET_TEST_VAR");
        req.env.insert("FLEET_TEST_VAR".into(), "42".into());
        let output = LocalExecutor.execute(req).await.unwrap();
        assert_eq!(output.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_success() {
        let output = LocalExecutor.execute(request("false")).await.unwrap();
        assert_eq!(output.termination, ExecTermination::Exited);
        assert_ne!(output.exit_code, Some(0));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut req = request("sleep 5");
        req.timeout = Duration::from_millis(100);
        let output = LocalExecutor.execute(req).await.unwrap();
        assert_eq!(output.termination, ExecTermination::TimedOut);
        assert!(output.exit_code.is_none());
        assert!(output.execution_time_ms < 5000);
    }

    #[tokio::test]
    async fn test_output_cap_kills_process() {
        let mut req = request("yes");
        req.max_output_bytes = 1000;
        let output = LocalExecutor.execute(req).await.unwrap();
        assert_eq!(output.termination, ExecTermination::BufferExceeded);
        assert_eq!(output.stdout.len(), 1000);
    }

    #[tokio::test]
    async fn test_stderr_flood_is_flagged() {
        let mut req = request("sh -c yes>&2");
        req.max_output_bytes = 1000;
        let output = LocalExecutor.execute(req).await.unwrap();
        assert_eq!(output.termination, ExecTermination::BufferExceeded);
        assert_eq!(output.stderr.len(), 1000);
        assert!(output.exit_code.is_none());
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_stderr_within_cap_is_captured() {
        let output = LocalExecutor
            .execute(request("ls /definitely-not-here-xyz"))
            .await
            .unwrap();
        assert_eq!(output.termination, ExecTermination::Exited);
        assert!(!output.stderr.is_empty());
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let err = LocalExecutor
            .execute(request("definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        assert!(LocalExecutor.execute(request("   ")).await.is_err());
    }
}
