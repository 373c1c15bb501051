//! Runtime discovery: find an interpreter that can run the automation script.
//!
//! Candidates are probed in preference order with a bounded `--version`
//! call. The first candidate whose version passes the compatibility policy
//! wins; list order encodes preference, so a later candidate with a
//! "better" version never displaces an earlier compatible one. An explicit
//! override path, when configured and valid, bypasses the search.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub mod version;

use version::{Compatibility, CompatibilityPolicy, RuntimeVersion};

/// Default bound for a single version probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Error types ──

/// Why a single probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The candidate could not be started at all.
    #[error("failed to start probe: {0}")]
    Spawn(#[from] std::io::Error),

    /// The probe ran past its time bound and was killed.
    #[error("probe timed out after {0:?}")]
    TimedOut(Duration),

    /// The probe exited unsuccessfully.
    #[error("probe exited with {status}: {output}")]
    Failed {
        /// Exit status description.
        status: String,
        /// Captured output, trimmed.
        output: String,
    },
}

/// One rejected candidate and the reason it was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Candidate identifier as configured.
    pub candidate: String,
    /// Human-readable reason.
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.candidate, self.reason)
    }
}

/// Errors from runtime discovery.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No candidate produced a compatible version.
    #[error("no compatible runtime found ({})", join_rejections(.rejections))]
    NoCompatibleRuntime {
        /// Every candidate tried, in order, with its rejection reason.
        rejections: Vec<Rejection>,
    },
}

fn join_rejections(rejections: &[Rejection]) -> String {
    if rejections.is_empty() {
        return "no candidates configured".to_owned();
    }
    rejections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Candidates and resolution ──

/// A configured interpreter candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCandidate {
    /// Command name, command with leading arguments (`py -3.12`), or absolute path.
    pub id: String,
    /// Position in the preference list (0 = most preferred).
    pub rank: usize,
}

impl RuntimeCandidate {
    /// Build a ranked candidate list from configured identifiers.
    pub fn ranked(ids: &[String]) -> Vec<Self> {
        ids.iter()
            .enumerate()
            .map(|(rank, id)| Self {
                id: id.clone(),
                rank,
            })
            .collect()
    }

    /// Split the identifier into a program and its leading arguments.
    ///
    /// Absolute paths are kept whole since they may contain spaces.
    pub fn program_and_args(&self) -> (String, Vec<String>) {
        let trimmed = self.id.trim();
        if Path::new(trimmed).is_absolute() {
            return (trimmed.to_owned(), Vec::new());
        }
        let mut parts = trimmed.split_whitespace().map(str::to_owned);
        let program = parts.next().unwrap_or_default();
        (program, parts.collect())
    }

    /// Whether the program part is a bare name rather than a path.
    pub fn is_bare_name(&self) -> bool {
        let (program, _) = self.program_and_args();
        !program.contains('/') && !program.contains('\\')
    }
}

/// How to invoke a selected runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Executable path plus leading arguments, run without a shell.
    Executable {
        /// Absolute (or explicitly configured) program path.
        program: PathBuf,
        /// Leading arguments such as `-3.12`.
        args: Vec<String>,
    },
    /// Bare command line run under the platform shell.
    Shell {
        /// Command text as configured.
        command_line: String,
    },
}

impl Invocation {
    /// Build a command running this runtime with `extra` appended.
    pub fn command(&self, extra: &[OsString]) -> Command {
        match self {
            Self::Executable { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args).args(extra);
                cmd
            }
            Self::Shell { command_line } => shell_command(command_line, extra),
        }
    }

    /// Leading words of the invocation, used by launchers that re-dispatch.
    pub fn words(&self) -> Vec<OsString> {
        match self {
            Self::Executable { program, args } => std::iter::once(program.as_os_str().to_owned())
                .chain(args.iter().map(OsString::from))
                .collect(),
            Self::Shell { command_line } => command_line
                .split_whitespace()
                .map(OsString::from)
                .collect(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executable { program, args } if args.is_empty() => {
                write!(f, "{}", program.display())
            }
            Self::Executable { program, args } => {
                write!(f, "{} {}", program.display(), args.join(" "))
            }
            Self::Shell { command_line } => write!(f, "shell: {command_line}"),
        }
    }
}

/// Build a platform shell command for `command_line` followed by quoted `extra` words.
pub fn shell_command(command_line: &str, extra: &[OsString]) -> Command {
    let mut line = command_line.to_owned();
    for word in extra {
        line.push(' ');
        line.push_str(&quote_for_shell(&word.to_string_lossy()));
    }
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(line);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        cmd
    }
}

fn quote_for_shell(word: &str) -> String {
    if cfg!(windows) {
        format!("\"{}\"", word.replace('"', "\"\""))
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// The runtime chosen by [`RuntimeSelector::detect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRuntime {
    /// The winning candidate.
    pub candidate: RuntimeCandidate,
    /// Version reported by its probe.
    pub version: RuntimeVersion,
    /// Policy verdict (always usable).
    pub compatibility: Compatibility,
    /// How to invoke it.
    pub invocation: Invocation,
}

// ── Probing ──

/// Probing seam: version queries and executable lookup.
#[async_trait]
pub trait RuntimeProbe: Send + Sync {
    /// Run `<candidate> --version` and return its combined output.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] if the probe cannot start, overruns, or fails.
    async fn version(&self, candidate: &RuntimeCandidate) -> Result<String, ProbeError>;

    /// Resolve a bare program name to an absolute executable path.
    async fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Probe implementation that spawns real processes.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    timeout: Duration,
}

impl SystemProbe {
    /// Create a probe with the given per-probe bound.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl RuntimeProbe for SystemProbe {
    async fn version(&self, candidate: &RuntimeCandidate) -> Result<String, ProbeError> {
        let (program, args) = candidate.program_and_args();
        let mut cmd = Command::new(&program);
        cmd.args(&args).arg("--version");
        run_bounded(cmd, self.timeout).await
    }

    async fn locate(&self, program: &str) -> Option<PathBuf> {
        let lookup = if cfg!(windows) { "where" } else { "which" };
        let mut cmd = Command::new(lookup);
        cmd.arg(program);
        let output = match run_bounded(cmd, self.timeout).await {
            Ok(output) => output,
            Err(e) => {
                debug!(program, error = %e, "executable lookup failed");
                return None;
            }
        };
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .find(|path| path.is_absolute() && path.exists())
    }
}

/// Run a short-lived command, killing it if it overruns `bound`.
///
/// Returns stdout followed by stderr on success.
async fn run_bounded(mut cmd: Command, bound: Duration) -> Result<String, ProbeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = tokio::spawn(read_all(stdout));
    let err_task = tokio::spawn(read_all(stderr));

    let status = match tokio::time::timeout(bound, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill overrunning probe");
            }
            out_task.abort();
            err_task.abort();
            return Err(ProbeError::TimedOut(bound));
        }
    };

    let mut output = out_task.await.unwrap_or_default();
    output.push_str(&err_task.await.unwrap_or_default());

    if status.success() {
        Ok(output)
    } else {
        Err(ProbeError::Failed {
            status: status.to_string(),
            output: output.trim().to_owned(),
        })
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "probe output read failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ── Selection ──

/// Picks the first compatible runtime from a ranked candidate list.
pub struct RuntimeSelector {
    candidates: Vec<RuntimeCandidate>,
    override_path: Option<String>,
    policy: CompatibilityPolicy,
    probe: Arc<dyn RuntimeProbe>,
}

impl RuntimeSelector {
    /// Create a selector.
    pub fn new(
        candidates: Vec<RuntimeCandidate>,
        override_path: Option<String>,
        policy: CompatibilityPolicy,
        probe: Arc<dyn RuntimeProbe>,
    ) -> Self {
        Self {
            candidates,
            override_path,
            policy,
            probe,
        }
    }

    /// Select a runtime: override first, then the ranked candidates.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoCompatibleRuntime`] if nothing qualifies.
    pub async fn detect(&self) -> Result<ResolvedRuntime, RuntimeError> {
        let mut rejections = Vec::new();

        if let Some(path) = &self.override_path {
            let candidate = RuntimeCandidate {
                id: path.clone(),
                rank: 0,
            };
            match self.evaluate(&candidate).await {
                Ok(resolved) => {
                    info!(runtime = %resolved.invocation, version = %resolved.version, "using runtime override");
                    return Ok(resolved);
                }
                Err(reason) => {
                    warn!(path = %path, %reason, "runtime override rejected, falling back to search");
                    rejections.push(Rejection {
                        candidate: path.clone(),
                        reason,
                    });
                }
            }
        }

        match self.detect_from(&self.candidates).await {
            Ok(resolved) => Ok(resolved),
            Err(RuntimeError::NoCompatibleRuntime { rejections: more }) => {
                rejections.extend(more);
                Err(RuntimeError::NoCompatibleRuntime { rejections })
            }
        }
    }

    /// Select from an explicit list, ignoring the override.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoCompatibleRuntime`] if nothing qualifies.
    pub async fn detect_from(
        &self,
        candidates: &[RuntimeCandidate],
    ) -> Result<ResolvedRuntime, RuntimeError> {
        let mut rejections = Vec::new();
        for candidate in candidates {
            match self.evaluate(candidate).await {
                Ok(resolved) => {
                    if resolved.compatibility == Compatibility::Supported {
                        warn!(
                            candidate = %candidate.id,
                            version = %resolved.version,
                            preferred = %self.policy.preferred,
                            "runtime is supported but not the preferred version"
                        );
                    }
                    info!(
                        candidate = %candidate.id,
                        runtime = %resolved.invocation,
                        version = %resolved.version,
                        "runtime selected"
                    );
                    return Ok(resolved);
                }
                Err(reason) => {
                    debug!(candidate = %candidate.id, %reason, "runtime candidate rejected");
                    rejections.push(Rejection {
                        candidate: candidate.id.clone(),
                        reason,
                    });
                }
            }
        }
        Err(RuntimeError::NoCompatibleRuntime { rejections })
    }

    async fn evaluate(&self, candidate: &RuntimeCandidate) -> Result<ResolvedRuntime, String> {
        let output = self
            .probe
            .version(candidate)
            .await
            .map_err(|e| e.to_string())?;
        let version = RuntimeVersion::parse(&output)
            .ok_or_else(|| format!("unrecognised version output: {}", output.trim()))?;
        let compatibility = self.policy.evaluate(&version);
        if !compatibility.is_usable() {
            return Err(format!("version {version} is {compatibility:?}"));
        }
        let invocation = self.resolve(candidate).await;
        Ok(ResolvedRuntime {
            candidate: candidate.clone(),
            version,
            compatibility,
            invocation,
        })
    }

    async fn resolve(&self, candidate: &RuntimeCandidate) -> Invocation {
        let (program, args) = candidate.program_and_args();
        if !candidate.is_bare_name() {
            return Invocation::Executable {
                program: PathBuf::from(program),
                args,
            };
        }
        match self.probe.locate(&program).await {
            Some(path) => Invocation::Executable {
                program: path,
                args,
            },
            None => {
                debug!(candidate = %candidate.id, "lookup failed, invoking through the shell");
                Invocation::Shell {
                    command_line: candidate.id.trim().to_owned(),
                }
            }
        }
    }
}
