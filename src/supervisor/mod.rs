//! Process supervisor: start the automation script through ordered launch strategies.
//!
//! Strategies are attempted one at a time, in configured order. Each failure
//! is logged with its cause and the next strategy is tried; a failed attempt
//! never leaves a live child behind. When every strategy fails the causes
//! are aggregated into [`LaunchError::LaunchFailed`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use serde::Deserialize;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::runtime::{shell_command, Invocation};

pub mod strategy;

pub use strategy::first_success;

/// Exit code a POSIX shell uses for "command not found".
const SHELL_NOT_FOUND: i32 = 127;

/// Exit code `cmd.exe` uses for "is not recognized as an internal or external command".
const CMD_NOT_FOUND: i32 = 9009;

/// One way of starting the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStrategy {
    /// Delegate to a helper script next to the automation script.
    #[serde(alias = "indirect")]
    IndirectLauncher,
    /// Run the runtime with the script as its argument.
    #[serde(alias = "direct")]
    DirectExec,
    /// Shell exec whose output is only consumed once the process exits.
    #[serde(alias = "buffered")]
    ExecBuffered,
}

impl fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IndirectLauncher => "indirect-launcher",
            Self::DirectExec => "direct-exec",
            Self::ExecBuffered => "exec-buffered",
        };
        f.write_str(name)
    }
}

/// How subprocess output must be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Output is read line by line while the process runs.
    Streaming,
    /// Output is read to the end and decoded after exit.
    Buffered,
}

/// A live subprocess produced by a successful strategy.
#[derive(Debug)]
pub struct ProcessHandle {
    /// The child process.
    pub child: Child,
    /// Its input stream.
    pub stdin: ChildStdin,
    /// Its output stream.
    pub stdout: ChildStdout,
    /// Its error stream.
    pub stderr: ChildStderr,
    /// Strategy that started it.
    pub strategy: LaunchStrategy,
    /// How its output should be read.
    pub output: OutputMode,
}

impl ProcessHandle {
    /// OS process id, if still known.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// A failed strategy and its distinguishing cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    /// Which strategy failed.
    pub strategy: LaunchStrategy,
    /// What went wrong.
    pub cause: String,
    /// Whether the cause was a missing executable or helper.
    pub not_found: bool,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.cause)
    }
}

/// Errors from launching the subprocess.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The automation script does not exist.
    #[error("automation script not found: {}", .0.display())]
    MissingScript(PathBuf),

    /// Every strategy failed.
    #[error("all launch strategies failed ({})", join_failures(.causes))]
    LaunchFailed {
        /// One entry per attempted strategy, in order.
        causes: Vec<StrategyFailure>,
    },
}

impl LaunchError {
    /// Whether a runtime strategy failed because the interpreter itself
    /// could not be found. A missing launcher helper does not count.
    pub fn runtime_not_found(&self) -> bool {
        match self {
            Self::MissingScript(_) => false,
            Self::LaunchFailed { causes } => causes
                .iter()
                .any(|c| c.not_found && c.strategy != LaunchStrategy::IndirectLauncher),
        }
    }
}

fn join_failures(causes: &[StrategyFailure]) -> String {
    if causes.is_empty() {
        return "no strategies configured".to_owned();
    }
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything a strategy needs to start the subprocess.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    /// Selected runtime.
    pub runtime: &'a Invocation,
    /// Automation script path.
    pub script: &'a Path,
    /// Working directory.
    pub work_dir: &'a Path,
    /// Helper file name for the indirect launcher.
    pub launcher: &'a str,
    /// Extra environment.
    pub env: &'a HashMap<String, String>,
}

/// Launches the subprocess through an ordered strategy list.
#[derive(Debug, Clone)]
pub struct Supervisor {
    strategies: Vec<LaunchStrategy>,
}

impl Supervisor {
    /// Create a supervisor that tries `strategies` in order.
    pub fn new(strategies: Vec<LaunchStrategy>) -> Self {
        Self { strategies }
    }

    /// Configured strategy order.
    pub fn strategies(&self) -> &[LaunchStrategy] {
        &self.strategies
    }

    /// Launch the subprocess, reporting each attempted strategy to `on_attempt`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::MissingScript`] if the script does not exist,
    /// or [`LaunchError::LaunchFailed`] when every strategy failed.
    pub async fn launch(
        &self,
        request: &LaunchRequest<'_>,
        mut on_attempt: impl FnMut(LaunchStrategy),
    ) -> Result<ProcessHandle, LaunchError> {
        if !request.script.exists() {
            return Err(LaunchError::MissingScript(request.script.to_path_buf()));
        }

        let outcome = first_success(&self.strategies, |strategy| {
            on_attempt(strategy);
            debug!(%strategy, runtime = %request.runtime, "attempting launch");
            let attempt = spawn_with(strategy, request);
            async move {
                let result = attempt.await;
                if let Err(failure) = &result {
                    warn!(%strategy, cause = %failure.cause, "launch strategy failed");
                }
                result
            }
        })
        .await;

        match outcome {
            Ok((strategy, handle)) => {
                info!(%strategy, pid = ?handle.pid(), "automation process started");
                Ok(handle)
            }
            Err(failures) => Err(LaunchError::LaunchFailed {
                causes: failures.into_iter().map(|(_, failure)| failure).collect(),
            }),
        }
    }
}

fn spawn_with(
    strategy: LaunchStrategy,
    request: &LaunchRequest<'_>,
) -> impl Future<Output = Result<ProcessHandle, StrategyFailure>> {
    let prepared = build_command(strategy, request);
    async move {
        let mut cmd = prepared?;
        start(strategy, &mut cmd)
    }
}

/// Build the command line for `strategy`.
fn build_command(
    strategy: LaunchStrategy,
    request: &LaunchRequest<'_>,
) -> Result<Command, StrategyFailure> {
    let script = request.script.as_os_str().to_owned();
    let mut cmd = match strategy {
        LaunchStrategy::IndirectLauncher => {
            let dir = request.script.parent().unwrap_or_else(|| Path::new("."));
            let helper = dir.join(request.launcher);
            if !helper.is_file() {
                return Err(StrategyFailure {
                    strategy,
                    cause: format!("launcher not found: {}", helper.display()),
                    not_found: true,
                });
            }
            let mut cmd = if cfg!(windows) {
                let mut cmd = Command::new("cmd");
                cmd.arg("/C").arg(helper);
                cmd
            } else {
                let mut cmd = Command::new("sh");
                cmd.arg(helper);
                cmd
            };
            cmd.args(request.runtime.words()).arg(script);
            cmd
        }
        LaunchStrategy::DirectExec => request.runtime.command(&[script]),
        LaunchStrategy::ExecBuffered => {
            let line = request
                .runtime
                .words()
                .iter()
                .map(|w| quote_word(&w.to_string_lossy()))
                .collect::<Vec<_>>()
                .join(" ");
            shell_command(&line, &[script])
        }
    };

    cmd.current_dir(request.work_dir)
        .env("PYTHONIOENCODING", "utf-8")
        .env("PYTHONUNBUFFERED", "1")
        .envs(request.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

fn quote_word(word: &str) -> String {
    if !word.contains(char::is_whitespace) {
        return word.to_owned();
    }
    if cfg!(windows) {
        format!("\"{word}\"")
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Spawn, capture pipes, and confirm the child is still running.
fn start(strategy: LaunchStrategy, cmd: &mut Command) -> Result<ProcessHandle, StrategyFailure> {
    let fail = |cause: String, not_found: bool| StrategyFailure {
        strategy,
        cause,
        not_found,
    };

    let mut child = cmd.spawn().map_err(|e| {
        let not_found = e.kind() == std::io::ErrorKind::NotFound;
        fail(format!("spawn failed: {e}"), not_found)
    })?;

    let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
    let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
        discard(&mut child);
        return Err(fail("failed to capture stdio pipes".to_owned(), false));
    };

    match child.try_wait() {
        Ok(None) => {}
        Ok(Some(status)) => {
            let not_found = exit_means_not_found(status);
            return Err(fail(format!("exited during startup with {status}"), not_found));
        }
        Err(e) => {
            discard(&mut child);
            return Err(fail(format!("failed to confirm startup: {e}"), false));
        }
    }

    let output = match strategy {
        LaunchStrategy::ExecBuffered => OutputMode::Buffered,
        LaunchStrategy::IndirectLauncher | LaunchStrategy::DirectExec => OutputMode::Streaming,
    };

    Ok(ProcessHandle {
        child,
        stdin,
        stdout,
        stderr,
        strategy,
        output,
    })
}

/// Kill a half-started child so no orphan outlives the failed attempt.
fn discard(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "failed to kill discarded child");
    }
}

/// Whether an exit status is the shell's "command not found" code.
pub fn exit_means_not_found(status: ExitStatus) -> bool {
    matches!(status.code(), Some(SHELL_NOT_FOUND) | Some(CMD_NOT_FOUND))
}

/// Whether an exit looks like the runtime executable vanished at spawn time.
///
/// Checks the exit code first, then the tail of the child's stderr.
pub fn is_missing_executable(status: ExitStatus, stderr_tail: &str) -> bool {
    if exit_means_not_found(status) {
        return true;
    }
    if status.success() {
        return false;
    }
    let lower = stderr_tail.to_lowercase();
    lower.contains("command not found")
        || lower.contains("no such file or directory")
        || lower.contains("is not recognized as an internal or external command")
        || stderr_tail.contains("不是内部或外部命令")
}
