//! Error types for user data operations

use std::path::PathBuf;
use thiserror::Error;

/// User data errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("User data not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported user data version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid user data: {0}")]
    Invalid(String),

    #[error("Invalid kubeadm configuration: {0}")]
    Kubeadm(String),
}

/// Result type alias for user data operations
pub type Result<T> = std::result::Result<T, Error>;
