//! Interpreter version parsing and the compatibility policy.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::config::PolicyConfig;

/// Version reported by a runtime probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component (`0` when the probe omitted it).
    pub patch: u32,
}

impl RuntimeVersion {
    /// Build a version from its components.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Extract the first `major.minor[.patch]` group from probe output.
    ///
    /// Accepts `Python 3.12.1`, `Python 3.13.0rc1` and bare `3.8`.
    pub fn parse(probe_output: &str) -> Option<Self> {
        static VERSION_RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = VERSION_RE
            .get_or_init(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok())
            .as_ref()?;
        let caps = re.captures(probe_output)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        let patch = match caps.get(3) {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        Some(Self::new(major, minor, patch))
    }

    /// The `(major, minor)` pair the policy compares against.
    pub fn policy_version(&self) -> PolicyVersion {
        PolicyVersion::new(self.major, self.minor)
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A `major.minor` pair used in the compatibility table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
}

impl PolicyVersion {
    /// Build a policy version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PolicyVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("expected \"major.minor\", got {s:?}"))?;
        let major = major
            .parse()
            .map_err(|_| format!("invalid major version in {s:?}"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("invalid minor version in {s:?}"))?;
        Ok(Self::new(major, minor))
    }
}

impl<'de> Deserialize<'de> for PolicyVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Outcome of applying the compatibility policy to a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Exactly the preferred minor version.
    Preferred,
    /// Inside the accepted range but not the preferred version.
    Supported,
    /// Older than the minimum.
    TooOld,
    /// At or beyond the rejected boundary.
    TooNew,
}

impl Compatibility {
    /// Whether the runtime may be used.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Preferred | Self::Supported)
    }
}

/// Version policy: `minimum <= v < reject_from`, with one preferred minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatibilityPolicy {
    /// Oldest accepted version.
    pub minimum: PolicyVersion,
    /// Known-good version.
    pub preferred: PolicyVersion,
    /// First rejected version.
    pub reject_from: PolicyVersion,
}

impl Default for CompatibilityPolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for CompatibilityPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            minimum: config.minimum,
            preferred: config.preferred,
            reject_from: config.reject_from,
        }
    }
}

impl CompatibilityPolicy {
    /// Classify a probed version.
    pub fn evaluate(&self, version: &RuntimeVersion) -> Compatibility {
        let v = version.policy_version();
        if v < self.minimum {
            Compatibility::TooOld
        } else if v >= self.reject_from {
            Compatibility::TooNew
        } else if v == self.preferred {
            Compatibility::Preferred
        } else {
            Compatibility::Supported
        }
    }
}
