//! Filesystem mount description shared by user data and execution backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A mount to set up inside a service sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount type (`bind`, `cgroup`, `tmpfs`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Source on the host; empty for pseudo filesystems
    #[serde(default)]
    pub source: PathBuf,
    /// Destination inside the sandbox
    pub destination: PathBuf,
    /// Mount options
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// A bind mount of `path` onto the same path inside the sandbox.
    pub fn bind(path: impl Into<PathBuf>, options: &[&str]) -> Self {
        let path = path.into();
        Self {
            kind: "bind".to_string(),
            source: path.clone(),
            destination: path,
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    /// A bind mount with differing source and destination.
    pub fn bind_to(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: &[&str],
    ) -> Self {
        Self {
            kind: "bind".to_string(),
            source: source.into(),
            destination: destination.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    /// A pseudo filesystem mount with no host source.
    pub fn pseudo(kind: &str, destination: impl Into<PathBuf>, options: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            source: PathBuf::new(),
            destination: destination.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={},", self.kind)?;
        if !self.source.as_os_str().is_empty() {
            write!(f, "src={},", self.source.display())?;
        }
        write!(
            f,
            "dst={},options={}",
            self.destination.display(),
            self.options.join(":")
        )
    }
}
