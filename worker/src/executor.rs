//! External command execution.
//!
//! Shell collaborators (`rsync`, `ssh`, `in-toto-run`, `in-toto-sign`) are
//! run through the [`CommandExecutor`] trait so that stages can be exercised
//! with a stub in tests.

use crate::error::Result;
use camino::Utf8PathBuf;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Per-invocation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Working directory of the child process.
    pub cwd: Option<Utf8PathBuf>,
    /// Kill the child when it runs longer than this.
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    /// Options running the command in `dir`.
    #[must_use]
    pub fn in_dir(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
            timeout: None,
        }
    }

    /// Options killing the command after `timeout`.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            cwd: None,
            timeout: Some(timeout),
        }
    }
}

/// Abstraction for running external commands.
pub trait CommandExecutor: Send + Sync {
    /// Runs a command with arguments and returns the captured output.
    ///
    /// # Errors
    ///
    /// Returns any I/O errors encountered while spawning or running the
    /// command, including a [`std::io::ErrorKind::TimedOut`] error when the
    /// timeout elapses.
    fn run(&self, cmd: &str, args: &[&str], options: &CommandOptions) -> Result<Output>;
}

/// Executes commands on the host system.
///
/// # Examples
///
/// ```no_run
/// use rebuilder_worker::executor::{CommandExecutor, CommandOptions, SystemCommandExecutor};
///
/// let executor = SystemCommandExecutor;
/// let output = executor.run("rsync", &["--version"], &CommandOptions::default())?;
/// assert!(output.status.success());
/// # Ok::<(), rebuilder_worker::error::StageError>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn run(&self, cmd: &str, args: &[&str], options: &CommandOptions) -> Result<Output> {
        let mut command = Command::new(cmd);
        command.args(args);
        if let Some(dir) = &options.cwd {
            command.current_dir(dir.as_std_path());
        }

        let Some(timeout) = options.timeout else {
            return Ok(command.output()?);
        };

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        match child.wait_timeout(timeout)? {
            Some(status) => Ok(Output {
                status,
                stdout: join_reader(stdout),
                stderr: join_reader(stderr),
            }),
            None => {
                // Reap the child; the readers finish once the pipes close.
                let _ = child.kill();
                let _ = child.wait();
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{cmd} timed out after {} seconds", timeout.as_secs()),
                )
                .into())
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default()
}

/// Returns the trimmed stderr of a failed command, or its exit status when
/// stderr is empty.
#[must_use]
pub fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        format!("exited with {}", output.status)
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{exit_status, failure_output};
    use rstest::rstest;

    #[rstest]
    fn failure_reason_prefers_stderr() {
        assert_eq!(failure_reason(&failure_output("  rsync: connection refused\n")), "rsync: connection refused");
    }

    #[rstest]
    fn failure_reason_falls_back_to_status() {
        let output = Output {
            status: exit_status(23),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert!(failure_reason(&output).contains("23"));
    }

    #[cfg(unix)]
    #[rstest]
    fn system_executor_honours_cwd() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cwd = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf-8 path");
        let output = SystemCommandExecutor
            .run("pwd", &[], &CommandOptions::in_dir(cwd.clone()))
            .expect("pwd runs");
        let printed = String::from_utf8_lossy(&output.stdout);
        let printed = std::fs::canonicalize(printed.trim()).expect("printed path exists");
        let expected = std::fs::canonicalize(cwd.as_std_path()).expect("cwd exists");
        assert_eq!(printed, expected);
    }

    #[cfg(unix)]
    #[rstest]
    fn system_executor_times_out() {
        let result = SystemCommandExecutor.run(
            "sleep",
            &["5"],
            &CommandOptions::with_timeout(Duration::from_millis(100)),
        );
        assert!(result.is_err());
    }
}
