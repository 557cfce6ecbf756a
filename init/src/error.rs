//! Error types for the nodeos init system.

use thiserror::Error;

/// Result type alias for init system operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init system.
#[derive(Error, Debug)]
pub enum Error {
    /// A blocking operation observed a shutdown request
    #[error("Operation cancelled")]
    Cancelled,

    /// A service lifecycle hook failed
    #[error("{hook} hook failed for {service}: {reason}")]
    Hook {
        service: String,
        hook: &'static str,
        reason: String,
    },

    /// A service could not construct its runner
    #[error("Failed to create runner for {service}: {reason}")]
    RunnerFactory { service: String, reason: String },

    /// A start condition could not be evaluated
    #[error("Condition failed: {0}")]
    Condition(String),

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Process exited abnormally while it was expected to keep running
    #[error("Process {id} exited (code {code:?}, signal {signal:?})")]
    ProcessExited {
        id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// Execution backend error
    #[error("Execution backend error: {0}")]
    Backend(String),

    /// Control API error
    #[error("Control API error: {0}")]
    Control(String),

    /// Control API request carried a wrong token
    #[error("Unauthorized")]
    Unauthorized,

    /// Not running as PID 1
    #[error("Not running as PID 1 (current PID: {0})")]
    NotPid1(u32),

    /// User data error
    #[error("User data error: {0}")]
    UserData(#[from] userdata::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Wrap a hook failure with the service and hook name.
    pub fn hook(service: &str, hook: &'static str, err: impl std::fmt::Display) -> Self {
        Error::Hook {
            service: service.to_string(),
            hook,
            reason: err.to_string(),
        }
    }
}
