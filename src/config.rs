//! Configuration loading for the bridge.
//!
//! Loads `bridge.toml` (or `$WXBRIDGE_CONFIG_PATH`) with per-section
//! defaults, so a missing or empty file is valid. Environment variables
//! override file values; file values override defaults.
//!
//! The runtime override lives in a separate small JSON file
//! (`runtime.json`) because it is written by other tooling, not by hand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::runtime::version::PolicyVersion;
use crate::supervisor::LaunchStrategy;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Runtime discovery settings.
    pub runtime: RuntimeConfig,
    /// Subprocess launch settings.
    pub launch: LaunchConfig,
    /// Command channel settings.
    pub commands: CommandsConfig,
    /// Diagnostic line filtering.
    pub diagnostics: DiagnosticsConfig,
}

/// Runtime discovery: candidate order, override file, compatibility policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Candidate commands in preference order (most preferred first).
    pub candidates: Vec<String>,
    /// Reduced list tried when the chosen runtime vanishes at spawn time.
    pub fallback_candidates: Vec<String>,
    /// JSON file holding an explicit interpreter path, if any.
    pub override_file: Option<PathBuf>,
    /// Upper bound for a single version probe, in seconds.
    pub probe_timeout_secs: u64,
    /// Version compatibility table.
    pub policy: PolicyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            fallback_candidates: default_fallback_candidates(),
            override_file: None,
            probe_timeout_secs: 5,
            policy: PolicyConfig::default(),
        }
    }
}

/// Version compatibility table, expressed as `"major.minor"` strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Oldest accepted version.
    pub minimum: PolicyVersion,
    /// The version the automation script is known to work best with.
    pub preferred: PolicyVersion,
    /// First version that is rejected outright.
    pub reject_from: PolicyVersion,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            minimum: PolicyVersion::new(3, 8),
            preferred: PolicyVersion::new(3, 12),
            reject_from: PolicyVersion::new(3, 13),
        }
    }
}

/// Subprocess launch settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Path to the automation script.
    pub script: PathBuf,
    /// Working directory for the subprocess. Derived when absent.
    pub work_dir: Option<PathBuf>,
    /// Resource bundle directory of a packaged build.
    pub resources_dir: Option<PathBuf>,
    /// Launch strategies in the order they are attempted.
    pub strategies: Vec<LaunchStrategy>,
    /// File name of the helper used by the indirect launcher.
    pub launcher: String,
    /// Extra environment passed to the subprocess.
    pub env: HashMap<String, String>,
    /// How long `cleanup` waits for the killed child to be reaped.
    pub shutdown_grace_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("python/wxauto_bridge.py"),
            work_dir: None,
            resources_dir: None,
            strategies: vec![
                LaunchStrategy::IndirectLauncher,
                LaunchStrategy::DirectExec,
                LaunchStrategy::ExecBuffered,
            ],
            launcher: default_launcher(),
            env: HashMap::new(),
            shutdown_grace_ms: 2_000,
        }
    }
}

impl LaunchConfig {
    /// Resolve the automation script path.
    ///
    /// A relative script is looked up inside the resource bundle when one
    /// is configured, otherwise relative to the current directory.
    pub fn resolve_script(&self) -> PathBuf {
        match &self.resources_dir {
            Some(dir) if self.script.is_relative() => dir.join(&self.script),
            _ => self.script.clone(),
        }
    }

    /// Resolve the subprocess working directory.
    ///
    /// Explicit `work_dir` wins. Otherwise a packaged build runs inside its
    /// resource bundle; a development checkout falls back to the directory
    /// containing the script.
    pub fn resolve_work_dir(&self) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        if let Some(dir) = &self.resources_dir {
            return dir.clone();
        }
        match self.resolve_script().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Command channel settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Per-command response timeout, in seconds.
    pub timeout_secs: u64,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            event_buffer: 256,
        }
    }
}

/// Extra patterns for the diagnostic filter. These extend the built-in lists.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Substrings of lines that are expected noise.
    pub noise: Vec<String>,
    /// Substrings that promote a line to an error.
    pub error_markers: Vec<String>,
    /// Substrings that promote a line to a warning.
    pub warning_markers: Vec<String>,
    /// Substrings that mark a line as a success notice.
    pub success_markers: Vec<String>,
}

/// Contents of the runtime override file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeOverride {
    /// Absolute path (or command) of the interpreter to use.
    #[serde(alias = "pythonPath")]
    pub python_path: String,
}

impl BridgeConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path_with(|key| std::env::var(key).ok())?;
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from an explicit TOML file. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading bridge config");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: BridgeConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment overrides through a resolver (avoids `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("WXBRIDGE_SCRIPT") {
            self.launch.script = PathBuf::from(v);
        }
        if let Some(v) = env("WXBRIDGE_WORK_DIR") {
            self.launch.work_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("WXBRIDGE_RESOURCES_DIR") {
            self.launch.resources_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("WXBRIDGE_RUNTIME_OVERRIDE_FILE") {
            self.runtime.override_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env("WXBRIDGE_COMMAND_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.commands.timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "WXBRIDGE_COMMAND_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Override file location: configured path, else `~/.wxbridge/runtime.json`.
    pub fn override_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.runtime.override_file {
            return Some(path.clone());
        }
        config_dir().ok().map(|dir| dir.join("runtime.json"))
    }
}

/// Read the runtime override file. Missing, empty or unparsable files yield `None`.
pub fn load_runtime_override(path: &Path) -> Option<RuntimeOverride> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read runtime override");
            return None;
        }
    };
    match serde_json::from_str::<RuntimeOverride>(&contents) {
        Ok(o) if !o.python_path.trim().is_empty() => Some(o),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed runtime override");
            None
        }
    }
}

/// Resolve the config file path using a custom env resolver.
///
/// # Errors
///
/// Returns an error if no explicit path is set and the home directory
/// cannot be determined.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(p) = env("WXBRIDGE_CONFIG_PATH") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("bridge.toml"))
}

/// Resolve the default config directory (`~/.wxbridge/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".wxbridge"))
}

fn default_candidates() -> Vec<String> {
    [
        "py -3.12",
        "python3.12",
        "python",
        "python3",
        "py -3.11",
        "py -3.10",
        "py",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}

fn default_fallback_candidates() -> Vec<String> {
    ["py -3.12", "python3.12", "py", "python3", "python"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_launcher() -> String {
    if cfg!(windows) {
        "launch.bat".to_owned()
    } else {
        "launch.sh".to_owned()
    }
}
