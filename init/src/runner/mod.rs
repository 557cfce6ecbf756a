//! Runners execute one instance of a service.
//!
//! A [`Runner`] knows how to launch its process and how to stop it; it knows
//! nothing about conditions, hooks or restart behaviour. Restarting is
//! layered on top by [`restart::Restart`], which is itself a runner.
//!
//! Two runners exist:
//!
//! - [`process::ProcessRunner`] starts a plain host process.
//! - [`containerd::ContainerdRunner`] hands a [`ProcessSpec`] to an
//!   [`ExecutionBackend`] which starts a sandboxed process.

pub mod containerd;
pub mod process;
pub mod restart;

use crate::error::{Error, Result};
use crate::events::EventSink;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use userdata::Mount;

/// Default time a process gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Execution strategy for a single service instance.
///
/// `run` and `close` may be called concurrently: `close` makes an in-flight
/// `run` return promptly, and every later `run` returns immediately.
#[async_trait]
pub trait Runner: Send + Sync {
    /// ID of the service this runner executes.
    fn id(&self) -> &str;

    /// Prepare for execution (validate arguments, pull images, ...).
    async fn open(&self) -> Result<()>;

    /// Execute until the process exits or the runner is closed.
    async fn run(&self, events: &EventSink) -> Result<()>;

    /// Request stop and release resources.
    async fn close(&self) -> Result<()>;
}

/// Process arguments shared by all runners.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Service ID
    pub id: String,
    /// Executable followed by its arguments
    pub process_args: Vec<String>,
}

impl Args {
    pub fn new(id: impl Into<String>, process_args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            process_args,
        }
    }
}

/// Runner options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Environment as `KEY=VALUE`
    pub env: Vec<String>,
    /// Working directory
    pub working_directory: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL on stop
    pub grace_period: Duration,
    /// Containerd namespace
    pub namespace: String,
    /// Container image reference
    pub image: Option<String>,
    /// Mounts inside the sandbox
    pub mounts: Vec<Mount>,
    /// Share the host PID namespace
    pub host_pid: bool,
    /// Run with all capabilities and devices
    pub privileged: bool,
    /// Parent cgroup path
    pub cgroup_parent: Option<String>,
    /// Root filesystem mount propagation
    pub rootfs_propagation: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            working_directory: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            namespace: crate::constants::SYSTEM_CONTAINERD_NAMESPACE.to_string(),
            image: None,
            mounts: Vec::new(),
            host_pid: false,
            privileged: false,
            cgroup_parent: None,
            rootfs_propagation: None,
        }
    }
}

impl Options {
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_host_pid(mut self) -> Self {
        self.host_pid = true;
        self
    }

    pub fn with_privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_rootfs_propagation(mut self, propagation: impl Into<String>) -> Self {
        self.rootfs_propagation = Some(propagation.into());
        self
    }
}

/// Everything an execution backend needs to create a sandboxed process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub id: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub mounts: Vec<Mount>,
    pub namespace: String,
    pub image: Option<String>,
    pub cgroup_parent: Option<String>,
    pub host_pid: bool,
    pub privileged: bool,
    pub rootfs_propagation: Option<String>,
}

impl ProcessSpec {
    pub fn new(args: &Args, opts: &Options) -> Self {
        Self {
            id: args.id.clone(),
            args: args.process_args.clone(),
            env: opts.env.clone(),
            working_directory: opts.working_directory.clone(),
            mounts: opts.mounts.clone(),
            namespace: opts.namespace.clone(),
            image: opts.image.clone(),
            cgroup_parent: opts.cgroup_parent.clone(),
            host_pid: opts.host_pid,
            privileged: opts.privileged,
            rootfs_propagation: opts.rootfs_propagation.clone(),
        }
    }
}

/// Exit status of a sandboxed or host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A running process created by an [`ExecutionBackend`].
#[async_trait]
pub trait Sandbox: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Ask the process to stop (SIGTERM).
    fn terminate(&mut self) -> Result<()>;

    /// Force the process to stop (SIGKILL), including anything it started
    /// outside its own process tree.
    async fn kill(&mut self) -> Result<()>;
}

/// Creates sandboxed processes from a [`ProcessSpec`].
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make the spec runnable (pull the image, ...). Called on every open.
    async fn prepare(&self, _spec: &ProcessSpec) -> Result<()> {
        Ok(())
    }

    /// Start the process.
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn Sandbox>>;
}

/// Drive a started sandbox until it exits or `stop` fires.
///
/// On stop the process gets SIGTERM, then SIGKILL after `grace`. A stop
/// always yields `Ok`; an unrequested exit is `Ok` only with code 0.
pub(crate) async fn supervise(
    id: &str,
    mut sandbox: Box<dyn Sandbox>,
    stop: &CancellationToken,
    grace: Duration,
    events: &EventSink,
) -> Result<()> {
    let pid = sandbox.pid();
    events.running(match pid {
        Some(pid) => format!("Started process (pid {})", pid),
        None => "Started process".to_string(),
    });

    tokio::select! {
        status = sandbox.wait() => {
            let status = status?;
            events.running(format!(
                "Process exited (code {:?}, signal {:?})",
                status.code, status.signal
            ));
            if status.success() {
                Ok(())
            } else {
                Err(Error::ProcessExited {
                    id: id.to_string(),
                    code: status.code,
                    signal: status.signal,
                })
            }
        }
        _ = stop.cancelled() => {
            debug!(service = %id, pid = ?pid, "Sending SIGTERM");
            if let Err(e) = sandbox.terminate() {
                warn!(service = %id, error = %e, "Failed to send SIGTERM");
            }

            match tokio::time::timeout(grace, sandbox.wait()).await {
                Ok(status) => {
                    let status = status?;
                    events.running(format!(
                        "Process stopped (code {:?}, signal {:?})",
                        status.code, status.signal
                    ));
                }
                Err(_) => {
                    warn!(service = %id, pid = ?pid, "Process didn't exit in time, sending SIGKILL");
                    sandbox.kill().await?;
                    sandbox.wait().await?;
                    events.running("Process killed");
                }
            }
            Ok(())
        }
    }
}
