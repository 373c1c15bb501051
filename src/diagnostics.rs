//! Noise filter for the automation script's free-form log output.
//!
//! The script logs heavily to stdout. Expected chatter is dropped; lines
//! carrying a severity marker are promoted into the host's structured log.
//! This only governs observability, never protocol handling.

use tracing::{error, info, trace, warn};

use crate::config::DiagnosticsConfig;

/// Log target used when re-emitting subprocess output.
pub const SUBPROCESS_TARGET: &str = "wxbridge::subprocess";

const DEFAULT_NOISE: &[&str] = &[
    "[DEBUG]",
    "等待命令输入",
    "监听线程循环执行",
    "跳过重复消息",
    "跳过自己发送的消息",
    "清理消息缓存",
    "comtypes",
    "UIAutomation",
];

const DEFAULT_ERROR_MARKERS: &[&str] = &["[ERROR]", "[CRITICAL]", "Traceback", "Exception"];

const DEFAULT_WARNING_MARKERS: &[&str] = &["[WARNING]", "❌"];

const DEFAULT_SUCCESS_MARKERS: &[&str] = &["✅", "[SUCCESS]", "成功"];

/// What to do with a diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Expected noise or uninteresting output.
    Drop,
    /// Promote as a warning.
    Warn,
    /// Promote as an error.
    Error,
    /// Promote as an informational success notice.
    Info,
}

/// Substring-based classifier for diagnostic lines.
#[derive(Debug, Clone)]
pub struct DiagnosticFilter {
    noise: Vec<String>,
    error_markers: Vec<String>,
    warning_markers: Vec<String>,
    success_markers: Vec<String>,
}

impl Default for DiagnosticFilter {
    fn default() -> Self {
        Self::from_config(&DiagnosticsConfig::default())
    }
}

impl DiagnosticFilter {
    /// Build a filter from the built-in lists extended by `config`.
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self {
            noise: merge(DEFAULT_NOISE, &config.noise),
            error_markers: merge(DEFAULT_ERROR_MARKERS, &config.error_markers),
            warning_markers: merge(DEFAULT_WARNING_MARKERS, &config.warning_markers),
            success_markers: merge(DEFAULT_SUCCESS_MARKERS, &config.success_markers),
        }
    }

    /// Classify a line. Expected noise is checked before severity markers.
    pub fn classify(&self, text: &str) -> Verdict {
        let has = |markers: &[String]| markers.iter().any(|m| text.contains(m.as_str()));
        if has(&self.noise) {
            Verdict::Drop
        } else if has(&self.error_markers) {
            Verdict::Error
        } else if has(&self.warning_markers) {
            Verdict::Warn
        } else if has(&self.success_markers) {
            Verdict::Info
        } else {
            Verdict::Drop
        }
    }

    /// Classify a line and re-emit it on [`SUBPROCESS_TARGET`].
    pub fn emit(&self, stream: &'static str, text: &str) -> Verdict {
        let verdict = self.classify(text);
        match verdict {
            Verdict::Error => error!(target: SUBPROCESS_TARGET, stream, "{text}"),
            Verdict::Warn => warn!(target: SUBPROCESS_TARGET, stream, "{text}"),
            Verdict::Info => info!(target: SUBPROCESS_TARGET, stream, "{text}"),
            Verdict::Drop => trace!(target: SUBPROCESS_TARGET, stream, "{text}"),
        }
        verdict
    }
}

/// Classify with the built-in lists only.
pub fn classify(text: &str) -> Verdict {
    DiagnosticFilter::default().classify(text)
}

fn merge(defaults: &[&str], extra: &[String]) -> Vec<String> {
    defaults
        .iter()
        .map(|s| (*s).to_owned())
        .chain(extra.iter().filter(|s| !s.is_empty()).cloned())
        .collect()
}
