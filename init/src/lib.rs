//! nodeos init system.
//!
//! Supervises the handful of privileged services that turn a machine into a
//! cluster node: containerd, udevd, kubeadm and kubelet.
//!
//! # Architecture
//!
//! - **Supervisor**: registry of service runners and the two-wave shutdown
//! - **ServiceRunner**: lifecycle of one service (pre hook, start condition,
//!   runner, post hook)
//! - **Runners**: how a service executes (host process or containerd
//!   sandbox), optionally wrapped by a restart policy
//! - **Conditions**: gates a service waits on before it starts
//! - **Control API**: kubeconfig and status for `nodectl`
//!
//! # Example
//!
//! ```no_run
//! use nodeos_init::{Init, InitConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let init = Init::new(InitConfig::default())?;
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod condition;
pub mod constants;
pub mod control;
pub mod error;
pub mod events;
pub mod init;
pub mod runner;
pub mod service;
pub mod service_runner;
pub mod services;
pub mod supervisor;

// Re-export main types
pub use condition::{wait_for_files_to_exist, wait_for_socket, Condition, Endpoint};
pub use constants::{CONTROL_PORT, USER_DATA_PATH};
pub use control::{ControlClient, ControlCommand, ControlResponse, ControlServer};
pub use error::{Error, Result};
pub use events::{Bus, Event, EventSink};
pub use init::{Init, InitConfig};
pub use runner::restart::{BackoffPolicy, Restart, RestartPolicy};
pub use runner::{Args, ExecutionBackend, Options, ProcessSpec, Runner, Sandbox};
pub use service::{Service, ServiceState, ServiceStatus};
pub use service_runner::ServiceRunner;
pub use supervisor::{Supervisor, SupervisorConfig};
