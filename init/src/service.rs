//! Service descriptors and service states.

use crate::condition::Condition;
use crate::error::Result;
use crate::events::Event;
use crate::runner::Runner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use userdata::UserData;

/// A system service the supervisor can run.
///
/// Implementations are stateless descriptors; everything node-specific comes
/// from the [`UserData`] passed to each hook.
#[async_trait]
pub trait Service: Send + Sync {
    /// Unique service ID.
    fn id(&self, data: &UserData) -> String;

    /// Invoked before the condition is awaited (create directories, write
    /// configuration files, ...).
    async fn pre(&self, data: &UserData) -> Result<()>;

    /// Gate that must be satisfied before the runner is created. `None`
    /// means the service starts right away.
    fn condition(&self, data: &UserData) -> Option<Box<dyn Condition>>;

    /// Build the runner for this service.
    fn runner(&self, data: &UserData) -> Result<Box<dyn Runner>>;

    /// Invoked after the runner has stopped.
    async fn post(&self, data: &UserData) -> Result<()>;
}

/// Lifecycle state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Registered, not started yet
    Created,
    /// Running the pre-start hook
    PreStartRunning,
    /// Waiting for the start condition
    AwaitingCondition,
    /// Creating and opening the runner
    RunnerStarting,
    /// Runner is running (including restart-policy retries)
    Running,
    /// Runner is being stopped
    Stopping,
    /// Running the post-stop hook
    PostStopRunning,
    /// Finished; never leaves this state
    Terminated,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState::Created
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "created"),
            ServiceState::PreStartRunning => write!(f, "pre-start"),
            ServiceState::AwaitingCondition => write!(f, "waiting"),
            ServiceState::RunnerStarting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::PostStopRunning => write!(f, "post-stop"),
            ServiceState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time view of a supervised service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service ID
    pub id: String,
    /// Current state
    pub state: ServiceState,
    /// Last error recorded on the way to `Terminated`, if any
    pub last_error: Option<String>,
    /// Most recent events, oldest first
    pub events: Vec<Event>,
}
